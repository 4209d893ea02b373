//! Heap object variants
//!
//! Every object lives in a [`Heap`](crate::gc::Heap) slot and is referenced
//! by [`Handle`]. The set of variants is closed: the collector and the
//! interpreter dispatch on it with `match`.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::Chunk;
use crate::gc::Handle;
use crate::value::Value;
use crate::vm::Vm;

/// Type tag of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    List,
    Dict,
    Enum,
}

impl ObjectType {
    pub fn name(self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::Function => "function",
            ObjectType::Native => "native function",
            ObjectType::Closure => "closure",
            ObjectType::Upvalue => "upvalue",
            ObjectType::Class => "class",
            ObjectType::Instance => "instance",
            ObjectType::BoundMethod => "method",
            ObjectType::List => "list",
            ObjectType::Dict => "dict",
            ObjectType::Enum => "enum",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interned, immutable string
#[derive(Debug, Clone)]
pub struct StringObj {
    pub chars: Box<str>,
    pub hash: u32,
}

/// Compiled function: the unit a front end hands to the VM
#[derive(Debug, Clone)]
pub struct Function {
    pub arity: usize,
    pub upvalue_count: usize,
    /// `None` for the top-level script
    pub name: Option<Handle>,
    pub chunk: Rc<Chunk>,
}

impl Function {
    pub fn new(name: Option<Handle>, arity: usize, upvalue_count: usize, chunk: Chunk) -> Self {
        Self {
            arity,
            upvalue_count,
            name,
            chunk: Rc::new(chunk),
        }
    }
}

/// Signature of a host function. Natives receive a copy of their argument
/// window and either produce one value or fail with a message.
pub type NativeFnPtr = fn(&mut Vm, &[Value]) -> Result<Value, String>;

/// Native/built-in function
#[derive(Clone)]
pub struct NativeFn {
    pub name: &'static str,
    pub arity: usize,
    pub func: NativeFnPtr,
}

impl NativeFn {
    pub fn new(name: &'static str, arity: usize, func: NativeFnPtr) -> Self {
        Self { name, arity, func }
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

/// Function plus the upvalues it captured
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// State of an upvalue
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Points to a live operand-stack slot
    Open(usize),
    /// Owns the value after its slot went out of scope
    Closed(Value),
}

/// Captured variable shared by every closure that captured the same slot
#[derive(Debug, Clone)]
pub struct Upvalue {
    pub state: UpvalueState,
}

impl Upvalue {
    pub fn new(slot: usize) -> Self {
        Self { state: UpvalueState::Open(slot) }
    }

    /// Stack slot of an open upvalue
    pub fn slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Move the captured value off the stack. Closing is one-way.
    pub fn close(&mut self, value: Value) {
        debug_assert!(matches!(self.state, UpvalueState::Open(_)), "upvalue closed twice");
        self.state = UpvalueState::Closed(value);
    }
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: Handle,
    /// Method name -> closure
    pub methods: HashMap<Handle, Handle>,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub class: Handle,
    pub fields: HashMap<Handle, Value>,
}

/// Receiver paired with one of its class's methods
#[derive(Debug, Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

#[derive(Debug, Clone, Default)]
pub struct List {
    pub items: Vec<Value>,
}

impl List {
    /// Element at `index`, nil when out of range
    pub fn get(&self, index: i64) -> Value {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.items.get(i).copied())
            .unwrap_or(Value::Nil)
    }

    /// Overwrite an existing element; out-of-range writes are ignored
    pub fn set(&mut self, index: i64, value: Value) {
        if let Some(slot) = usize::try_from(index).ok().and_then(|i| self.items.get_mut(i)) {
            *slot = value;
        }
    }
}

/// String-keyed dictionary
#[derive(Debug, Clone, Default)]
pub struct Dict {
    pub entries: HashMap<Handle, Value>,
}

/// Named set of string-keyed values
#[derive(Debug, Clone)]
pub struct Enum {
    pub name: Handle,
    pub values: HashMap<Handle, Value>,
}

/// Bytes charged for one key/value pair of a method, field or dict table
pub const TABLE_ENTRY_BYTES: usize = std::mem::size_of::<Handle>() + std::mem::size_of::<Value>();

pub enum Object {
    String(StringObj),
    Function(Function),
    Native(NativeFn),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    List(List),
    Dict(Dict),
    Enum(Enum),
}

fn push_value(out: &mut Vec<Handle>, value: &Value) {
    if let Value::Obj(handle) = value {
        out.push(*handle);
    }
}

impl Object {
    pub fn obj_type(&self) -> ObjectType {
        match self {
            Object::String(_) => ObjectType::String,
            Object::Function(_) => ObjectType::Function,
            Object::Native(_) => ObjectType::Native,
            Object::Closure(_) => ObjectType::Closure,
            Object::Upvalue(_) => ObjectType::Upvalue,
            Object::Class(_) => ObjectType::Class,
            Object::Instance(_) => ObjectType::Instance,
            Object::BoundMethod(_) => ObjectType::BoundMethod,
            Object::List(_) => ObjectType::List,
            Object::Dict(_) => ObjectType::Dict,
            Object::Enum(_) => ObjectType::Enum,
        }
    }

    /// Objects directly referenced by this one
    pub fn children(&self) -> Vec<Handle> {
        let mut children = Vec::new();
        match self {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(f) => {
                children.extend(f.name);
                for constant in &f.chunk.constants {
                    push_value(&mut children, constant);
                }
            }
            Object::Closure(c) => {
                children.push(c.function);
                children.extend(c.upvalues.iter().copied());
            }
            Object::Upvalue(u) => {
                // Open upvalues point into the stack, which is traced by the VM
                if let UpvalueState::Closed(value) = &u.state {
                    push_value(&mut children, value);
                }
            }
            Object::Class(c) => {
                children.push(c.name);
                for (name, method) in &c.methods {
                    children.push(*name);
                    children.push(*method);
                }
            }
            Object::Instance(i) => {
                children.push(i.class);
                for (name, value) in &i.fields {
                    children.push(*name);
                    push_value(&mut children, value);
                }
            }
            Object::BoundMethod(b) => {
                push_value(&mut children, &b.receiver);
                children.push(b.method);
            }
            Object::List(list) => {
                for value in &list.items {
                    push_value(&mut children, value);
                }
            }
            Object::Dict(dict) => {
                for (key, value) in &dict.entries {
                    children.push(*key);
                    push_value(&mut children, value);
                }
            }
            Object::Enum(e) => {
                children.push(e.name);
                for (key, value) in &e.values {
                    children.push(*key);
                    push_value(&mut children, value);
                }
            }
        }
        children
    }

    /// Approximate footprint charged to the allocation counter
    pub fn size_bytes(&self) -> usize {
        const ENTRY: usize = TABLE_ENTRY_BYTES;
        let base = std::mem::size_of::<Object>();
        match self {
            Object::String(s) => base + s.chars.len(),
            Object::Function(f) => {
                base + f.chunk.code.len()
                    + f.chunk.lines.len() * std::mem::size_of::<usize>()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Object::Native(_) => base,
            Object::Closure(c) => base + c.upvalues.len() * std::mem::size_of::<Handle>(),
            Object::Upvalue(_) => base,
            Object::Class(c) => base + c.methods.len() * ENTRY,
            Object::Instance(i) => base + i.fields.len() * ENTRY,
            Object::BoundMethod(_) => base,
            Object::List(list) => base + list.items.len() * std::mem::size_of::<Value>(),
            Object::Dict(dict) => base + dict.entries.len() * ENTRY,
            Object::Enum(e) => base + e.values.len() * ENTRY,
        }
    }
}
