//! Shared helpers for integration tests: a tiny bytecode assembler and
//! in-memory output sinks.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use cinder::object::Function;
use cinder::{Chunk, Handle, Heap, OpCode, Value, Vm, VmConfig};

/// `Write` sink whose contents can be read back after the VM wrote to it
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// VM with captured stdout and stderr
pub fn vm_with(config: VmConfig) -> (Vm, SharedBuffer, SharedBuffer) {
    let out = SharedBuffer::default();
    let err = SharedBuffer::default();
    let vm = Vm::with_io(config, Box::new(out.clone()), Box::new(err.clone()));
    (vm, out, err)
}

pub fn vm() -> (Vm, SharedBuffer, SharedBuffer) {
    vm_with(VmConfig::default())
}

/// Assembles one function. Every constant goes through a 16-bit operand.
pub struct Asm<'a> {
    heap: &'a mut Heap,
    chunk: Chunk,
    line: usize,
}

impl<'a> Asm<'a> {
    pub fn new(heap: &'a mut Heap) -> Self {
        Self { heap, chunk: Chunk::new(), line: 1 }
    }

    pub fn line(&mut self, line: usize) -> &mut Self {
        self.line = line;
        self
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.chunk.write(op, self.line);
        self
    }

    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.chunk.write_byte(byte, self.line);
        self
    }

    fn constant_index(&mut self, value: Value) -> u16 {
        self.chunk.add_constant(value) as u16
    }

    /// Push any constant
    pub fn constant(&mut self, value: Value) -> &mut Self {
        let idx = self.constant_index(value);
        self.op(OpCode::Constant16);
        self.chunk.write_u16(idx, self.line);
        self
    }

    pub fn number(&mut self, n: f64) -> &mut Self {
        self.constant(Value::Number(n))
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        let handle = self.heap.intern(s);
        self.constant(Value::Obj(handle))
    }

    /// Instruction with a u16 name operand (globals, properties, classes, methods)
    pub fn named(&mut self, op: OpCode, name: &str) -> &mut Self {
        let handle = self.heap.intern(name);
        let idx = self.constant_index(Value::Obj(handle));
        self.op(op);
        self.chunk.write_u16(idx, self.line);
        self
    }

    pub fn slot(&mut self, op: OpCode, slot: u8) -> &mut Self {
        self.op(op).byte(slot)
    }

    pub fn call(&mut self, argc: u8) -> &mut Self {
        self.op(OpCode::Call).byte(argc)
    }

    /// INVOKE or SUPER_INVOKE
    pub fn invoke(&mut self, op: OpCode, name: &str, argc: u8) -> &mut Self {
        self.named(op, name).byte(argc)
    }

    /// CLOSURE over `function`; each upvalue is `(is_local, index)`
    pub fn closure(&mut self, function: Handle, upvalues: &[(bool, u8)]) -> &mut Self {
        let idx = self.constant_index(Value::Obj(function));
        self.op(OpCode::Closure);
        self.chunk.write_u16(idx, self.line);
        for &(is_local, index) in upvalues {
            self.byte(is_local as u8).byte(index);
        }
        self
    }

    /// Current code offset, for loop targets
    pub fn here(&self) -> usize {
        self.chunk.len()
    }

    pub fn jump(&mut self, op: OpCode) -> usize {
        self.chunk.emit_jump(op, self.line)
    }

    pub fn patch(&mut self, jump: usize) -> &mut Self {
        self.chunk.patch_jump(jump).unwrap();
        self
    }

    pub fn loop_to(&mut self, start: usize) -> &mut Self {
        self.chunk.emit_loop(start, self.line).unwrap();
        self
    }

    /// Allocate the assembled function
    pub fn finish(&mut self, name: Option<&str>, arity: usize, upvalue_count: usize) -> Handle {
        let name = name.map(|n| self.heap.intern(n));
        let chunk = std::mem::take(&mut self.chunk);
        self.heap.alloc_function(Function::new(name, arity, upvalue_count, chunk))
    }

    pub fn script(&mut self) -> Handle {
        self.finish(None, 0, 0)
    }
}

/// Class with the given methods, defined as a global. Leaves the stack as it found it.
pub fn define_class(asm: &mut Asm<'_>, name: &str, superclass: Option<&str>, methods: &[(&str, Handle)]) {
    asm.named(OpCode::Class, name).named(OpCode::DefineGlobal, name);
    if let Some(superclass) = superclass {
        asm.named(OpCode::GetGlobal, superclass)
            .named(OpCode::GetGlobal, name)
            .op(OpCode::Inherit);
    }
    asm.named(OpCode::GetGlobal, name);
    for &(method, function) in methods {
        asm.closure(function, &[]).named(OpCode::Method, method);
    }
    asm.op(OpCode::Pop);
    if superclass.is_some() {
        asm.op(OpCode::Pop);
    }
}

pub fn string_value(vm: &Vm, value: Value) -> String {
    match vm.heap.value_str(value) {
        Some(s) => s.to_string(),
        None => panic!("expected a string, got {:?}", value),
    }
}
