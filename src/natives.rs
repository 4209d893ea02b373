//! Built-in functions installed as globals in every VM
//!
//! Natives receive a copy of their argument window. The arguments also stay
//! on the operand stack until the native returns, so anything they allocate
//! can safely reference them.

use std::io::{Read, Write};
use std::mem;

use crate::gc::Handle;
use crate::object::{Dict, Enum, List, NativeFn, NativeFnPtr, Object, TABLE_ENTRY_BYTES};
use crate::value::Value;
use crate::vm::Vm;

const NATIVES: [(&str, usize, NativeFnPtr); 19] = [
    ("clock", 0, clock),
    ("exit", 1, exit),
    ("read", 0, read),
    ("printerr", 1, printerr),
    ("utf", 4, utf),
    ("list", 0, list),
    ("append", 2, append),
    ("get", 2, get),
    ("set", 3, set),
    ("length", 1, length),
    ("dict", 0, dict),
    ("dictSet", 3, dict_set),
    ("dictGet", 2, dict_get),
    ("dictDelete", 2, dict_delete),
    ("dictLength", 1, dict_length),
    ("enum", 1, enumeration),
    ("enumAddValue", 3, enum_add_value),
    ("enumGetValue", 2, enum_get_value),
    ("enumLength", 1, enum_length),
];

/// Register every built-in as a global
pub fn install(vm: &mut Vm) {
    for (name, arity, func) in NATIVES {
        vm.define_native(NativeFn::new(name, arity, func));
    }
}

fn list_handle(vm: &Vm, value: Value) -> Option<Handle> {
    value.as_obj().filter(|&h| vm.heap.get_list(h).is_some())
}

fn dict_handle(vm: &Vm, value: Value) -> Option<Handle> {
    value.as_obj().filter(|&h| vm.heap.get_dict(h).is_some())
}

fn enum_handle(vm: &Vm, value: Value) -> Option<Handle> {
    value.as_obj().filter(|&h| vm.heap.get_enum(h).is_some())
}

fn string_handle(vm: &Vm, value: Value) -> Option<Handle> {
    value.as_obj().filter(|&h| vm.heap.get_string(h).is_some())
}

fn clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.clock()))
}

fn exit(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let code = args[0]
        .as_number()
        .ok_or_else(|| "Number expected for exit() parameter.".to_string())?;
    vm.flush();
    std::process::exit(code as i32)
}

/// Next byte of input as a number, nil at end of input
fn read(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let mut byte = [0u8; 1];
    match vm.input.read(&mut byte) {
        Ok(1) => Ok(Value::Number(byte[0] as f64)),
        _ => Ok(Value::Nil),
    }
}

fn printerr(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let text = vm.print_string(args[0]).map_err(|e| e.to_string())?;
    writeln!(vm.err, "{}", text).map_err(|e| e.to_string())?;
    Ok(Value::Nil)
}

/// Build a string from up to four byte values; trailing arguments may be nil
fn utf(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    const MESSAGE: &str = "utf parameter should be a number between 0 and 255.";

    let mut bytes = Vec::with_capacity(4);
    for (i, arg) in args.iter().enumerate() {
        match arg {
            Value::Nil if i > 0 => continue,
            Value::Number(n) if (0.0..=255.0).contains(n) => bytes.push(*n as u8),
            _ => return Err(MESSAGE.to_string()),
        }
    }

    let s = String::from_utf8_lossy(&bytes).into_owned();
    Ok(Value::Obj(vm.intern_owned(s)))
}

fn list(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Obj(vm.alloc(Object::List(List::default()))))
}

fn append(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let handle = list_handle(vm, args[0])
        .ok_or_else(|| "First argument of append must be a list.".to_string())?;
    if let Some(list) = vm.heap.get_list_mut(handle) {
        list.items.push(args[1]);
    }
    vm.heap.charge(handle, mem::size_of::<Value>());
    Ok(Value::Nil)
}

fn get(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (handle, index) = list_handle(vm, args[0])
        .zip(args[1].as_number())
        .ok_or_else(|| "Arguments of get must be (list, index).".to_string())?;
    Ok(vm.heap.get_list(handle).map_or(Value::Nil, |list| list.get(index as i64)))
}

fn set(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (handle, index) = list_handle(vm, args[0])
        .zip(args[1].as_number())
        .ok_or_else(|| "Arguments of set must be (list, index, value).".to_string())?;
    if let Some(list) = vm.heap.get_list_mut(handle) {
        list.set(index as i64, args[2]);
    }
    Ok(Value::Nil)
}

fn length(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    list_handle(vm, args[0])
        .and_then(|h| vm.heap.get_list(h))
        .map(|list| Value::Number(list.items.len() as f64))
        .ok_or_else(|| "Argument of length must be a list.".to_string())
}

fn dict(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Obj(vm.alloc(Object::Dict(Dict::default()))))
}

fn dict_set(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (handle, key) = dict_handle(vm, args[0])
        .zip(string_handle(vm, args[1]))
        .ok_or_else(|| "Arguments of dictSet must be (dict, string key, value).".to_string())?;
    let added = vm
        .heap
        .get_dict_mut(handle)
        .map_or(false, |dict| dict.entries.insert(key, args[2]).is_none());
    if added {
        vm.heap.charge(handle, TABLE_ENTRY_BYTES);
    }
    Ok(Value::Nil)
}

fn dict_get(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (handle, key) = dict_handle(vm, args[0])
        .zip(string_handle(vm, args[1]))
        .ok_or_else(|| "Arguments of dictGet must be (dict, string key).".to_string())?;
    Ok(vm
        .heap
        .get_dict(handle)
        .and_then(|dict| dict.entries.get(&key).copied())
        .unwrap_or(Value::Nil))
}

fn dict_delete(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (handle, key) = dict_handle(vm, args[0])
        .zip(string_handle(vm, args[1]))
        .ok_or_else(|| "Arguments of dictDelete must be (dict, string key).".to_string())?;
    let removed = vm
        .heap
        .get_dict_mut(handle)
        .map_or(false, |dict| dict.entries.remove(&key).is_some());
    if removed {
        vm.heap.discharge(handle, TABLE_ENTRY_BYTES);
    }
    Ok(Value::Bool(removed))
}

fn dict_length(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    dict_handle(vm, args[0])
        .and_then(|h| vm.heap.get_dict(h))
        .map(|dict| Value::Number(dict.entries.len() as f64))
        .ok_or_else(|| "Argument of dictLength must be a dict.".to_string())
}

fn enumeration(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = string_handle(vm, args[0])
        .ok_or_else(|| "Argument of enum must be a string (the enum name).".to_string())?;
    let handle = vm.alloc(Object::Enum(Enum { name, values: Default::default() }));
    Ok(Value::Obj(handle))
}

fn enum_add_value(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (handle, key) = enum_handle(vm, args[0])
        .zip(string_handle(vm, args[1]))
        .ok_or_else(|| "Arguments of enumAddValue must be (enum, string name, value).".to_string())?;
    let added = vm
        .heap
        .get_enum_mut(handle)
        .map_or(false, |e| e.values.insert(key, args[2]).is_none());
    if added {
        vm.heap.charge(handle, TABLE_ENTRY_BYTES);
    }
    Ok(Value::Nil)
}

fn enum_get_value(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (handle, key) = enum_handle(vm, args[0])
        .zip(string_handle(vm, args[1]))
        .ok_or_else(|| "Arguments of enumGetValue must be (enum, string name).".to_string())?;
    Ok(vm
        .heap
        .get_enum(handle)
        .and_then(|e| e.values.get(&key).copied())
        .unwrap_or(Value::Nil))
}

fn enum_length(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    enum_handle(vm, args[0])
        .and_then(|h| vm.heap.get_enum(h))
        .map(|e| Value::Number(e.values.len() as f64))
        .ok_or_else(|| "Argument of enumLength must be an enum.".to_string())
}
