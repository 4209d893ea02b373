//! Stack-based virtual machine for cinder
//!
//! Executes compiled functions against a garbage-collected [`Heap`].
//! Every frame shares one operand stack; locals of a frame live in a
//! window starting at its `slots` index.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Instant;

use colored::Colorize;
use tracing::{debug, trace, Level};

use crate::bytecode::{Chunk, OpCode};
use crate::config::VmConfig;
use crate::error::{ErrorKind, InterpretResult, Result, RuntimeError, TraceFrame};
use crate::gc::{Handle, Heap};
use crate::natives;
use crate::object::{
    BoundMethod, Class, Closure, Instance, NativeFn, Object, ObjectType, Upvalue, UpvalueState,
    TABLE_ENTRY_BYTES,
};
use crate::value::{format_number, Value};
use crate::Compile;

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;

/// Operand stack capacity
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Name of the method run when a class is called
pub const INIT_METHOD: &str = "init";

/// Call frame for function calls
#[derive(Debug, Clone)]
struct CallFrame {
    closure: Handle,
    chunk: Rc<Chunk>,
    ip: usize,
    slots: usize,
}

/// Binary operators that fall back to an instance method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Greater,
    Less,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Greater => ">",
            BinaryOp::Less => "<",
        }
    }

    fn method(self) -> &'static str {
        match self {
            BinaryOp::Add => "__add__",
            BinaryOp::Subtract => "__sub__",
            BinaryOp::Multiply => "__mul__",
            BinaryOp::Divide => "__div__",
            BinaryOp::Greater => "__gt__",
            BinaryOp::Less => "__lt__",
        }
    }
}

/// Interned method names the interpreter looks up itself. Kept alive as GC roots.
struct ReservedNames {
    init: Handle,
    to_string: Handle,
    eq: Handle,
    add: Handle,
    sub: Handle,
    mul: Handle,
    div: Handle,
    gt: Handle,
    lt: Handle,
}

impl ReservedNames {
    fn new(heap: &mut Heap) -> Self {
        Self {
            init: heap.intern(INIT_METHOD),
            to_string: heap.intern("toString"),
            eq: heap.intern("__eq__"),
            add: heap.intern(BinaryOp::Add.method()),
            sub: heap.intern(BinaryOp::Subtract.method()),
            mul: heap.intern(BinaryOp::Multiply.method()),
            div: heap.intern(BinaryOp::Divide.method()),
            gt: heap.intern(BinaryOp::Greater.method()),
            lt: heap.intern(BinaryOp::Less.method()),
        }
    }

    fn for_op(&self, op: BinaryOp) -> Handle {
        match op {
            BinaryOp::Add => self.add,
            BinaryOp::Subtract => self.sub,
            BinaryOp::Multiply => self.mul,
            BinaryOp::Divide => self.div,
            BinaryOp::Greater => self.gt,
            BinaryOp::Less => self.lt,
        }
    }

    fn all(&self) -> [Handle; 9] {
        [
            self.init,
            self.to_string,
            self.eq,
            self.add,
            self.sub,
            self.mul,
            self.div,
            self.gt,
            self.lt,
        ]
    }
}

/// The virtual machine
pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Handle, Value>,
    /// Open upvalues, sorted by ascending stack slot
    open_upvalues: Vec<Handle>,
    names: ReservedNames,
    config: VmConfig,
    pub(crate) out: Box<dyn Write>,
    pub(crate) err: Box<dyn Write>,
    /// Byte source for the `read` native
    pub(crate) input: Box<dyn Read>,
    started: Instant,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::with_io(config, Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// Create a VM writing program output to `out` and diagnostics to `err`
    pub fn with_io(config: VmConfig, out: Box<dyn Write>, err: Box<dyn Write>) -> Self {
        let mut heap = Heap::with_thresholds(
            config.gc_initial_threshold,
            config.gc_min_threshold,
            config.gc_heap_grow_factor,
        );
        let names = ReservedNames::new(&mut heap);

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(config.frames_max),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            names,
            config,
            out,
            err,
            input: Box::new(io::stdin()),
            started: Instant::now(),
        };
        natives::install(&mut vm);
        vm
    }

    /// Replace the byte source read by the `read` native (stdin by default)
    pub fn set_input(&mut self, input: Box<dyn Read>) {
        self.input = input;
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Register a host function as a global
    pub fn define_native(&mut self, native: NativeFn) {
        let name = self.intern(native.name);
        self.push_root(Value::Obj(name));
        let handle = self.alloc(Object::Native(native));
        self.stack.pop();
        self.globals.insert(name, Value::Obj(handle));
    }

    /// Read a global by name
    pub fn global(&self, name: &str) -> Option<Value> {
        let handle = self.heap.find_string(name)?;
        self.globals.get(&handle).copied()
    }

    /// Define or overwrite a global
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.push_root(value);
        let name = self.intern(name);
        self.stack.pop();
        self.globals.insert(name, value);
    }

    /// Current operand stack contents, bottom first
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Number of active call frames
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Seconds since the VM was created
    pub fn clock(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn flush(&mut self) {
        let _ = self.out.flush();
        let _ = self.err.flush();
    }

    /// Compile `source` with `compiler` and run the result
    pub fn interpret<C: Compile + ?Sized>(&mut self, compiler: &mut C, source: &str) -> InterpretResult {
        match compiler.compile(source, &mut self.heap) {
            Ok(function) => self.execute(function),
            Err(err) => {
                let _ = writeln!(self.err, "{}", err);
                InterpretResult::CompileError
            }
        }
    }

    /// Run a compiled top-level function
    pub fn execute(&mut self, function: Handle) -> InterpretResult {
        match self.run(function) {
            Ok(_) => InterpretResult::Ok,
            Err(_) => InterpretResult::RuntimeError,
        }
    }

    /// Run a compiled top-level function and return the value it returns.
    ///
    /// On failure the error and its frame walk are written to the
    /// diagnostic sink and the VM is reset to empty stacks.
    pub fn run(&mut self, function: Handle) -> std::result::Result<Value, RuntimeError> {
        self.push_root(Value::Obj(function));
        let closure = self.alloc(Object::Closure(Closure { function, upvalues: Vec::new() }));
        self.stack.pop();

        let result = self
            .push(Value::Obj(closure))
            .and_then(|_| self.call_closure(closure, 0))
            .and_then(|_| self.run_until(0))
            .and_then(|_| self.pop());

        result.map_err(|kind| self.runtime_error(kind))
    }

    // ==================== Allocation ====================

    /// Allocate through the collector: may run a full collection first
    pub fn alloc(&mut self, object: Object) -> Handle {
        self.maybe_collect();
        self.heap.alloc(object)
    }

    pub fn intern(&mut self, s: &str) -> Handle {
        if let Some(handle) = self.heap.find_string(s) {
            return handle;
        }
        self.maybe_collect();
        self.heap.intern(s)
    }

    pub fn intern_owned(&mut self, s: String) -> Handle {
        if let Some(handle) = self.heap.find_string(&s) {
            return handle;
        }
        self.maybe_collect();
        self.heap.intern_owned(s)
    }

    fn maybe_collect(&mut self) {
        if self.config.stress_gc || self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated;
        debug!(bytes = before, "gc begin");

        // 1. Mark roots
        self.mark_roots();

        // 2. Trace references (Blacken)
        self.heap.trace_references();

        // 3. Sweep
        let freed = self.heap.sweep();

        debug!(
            freed,
            before,
            after = self.heap.bytes_allocated,
            next = self.heap.next_gc,
            "gc end"
        );
    }

    fn mark_roots(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }

        for (&name, &value) in &self.globals {
            self.heap.mark(name);
            self.heap.mark_value(value);
        }

        for frame in &self.frames {
            self.heap.mark(frame.closure);
        }

        for &upvalue in &self.open_upvalues {
            self.heap.mark(upvalue);
        }

        for name in self.names.all() {
            self.heap.mark(name);
        }
    }

    // ==================== Errors ====================

    fn runtime_error(&mut self, kind: ErrorKind) -> RuntimeError {
        let trace: Vec<TraceFrame> = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let line = frame.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
                let function = self
                    .heap
                    .get_closure(frame.closure)
                    .and_then(|c| self.heap.get_function(c.function))
                    .and_then(|f| f.name)
                    .and_then(|name| self.heap.get_string(name))
                    .map(str::to_string);
                TraceFrame { line, function }
            })
            .collect();

        debug!(error = %kind, depth = trace.len(), "runtime error");

        let error = RuntimeError::new(kind, trace);
        let header = if self.config.color_diagnostics {
            error.kind.to_string().red().bold().to_string()
        } else {
            error.kind.to_string()
        };
        let _ = writeln!(self.err, "{}", header);
        for frame in &error.trace {
            let _ = writeln!(self.err, "{}", frame);
        }
        let _ = self.err.flush();

        self.reset_stack();
        error
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ==================== Dispatch ====================

    /// Execute until the frame stack shrinks back to `base_depth`
    fn run_until(&mut self, base_depth: usize) -> Result<()> {
        loop {
            if tracing::enabled!(Level::TRACE) {
                let frame = self.frame();
                let (text, _) = frame.chunk.disassemble_instruction(frame.ip, &self.heap);
                trace!(stack = ?self.stack, "{}", text);
            }

            let byte = self.read_byte();
            let op = OpCode::try_from(byte).map_err(ErrorKind::UnknownOpcode)?;

            match op {
                OpCode::Constant => {
                    let idx = self.read_byte() as usize;
                    let value = self.frame().chunk.constants[idx];
                    self.push(value)?;
                }
                OpCode::Constant16 => {
                    let value = self.read_constant_16();
                    self.push(value)?;
                }
                OpCode::Integer => {
                    let n = self.read_byte();
                    self.push(Value::Number(n as f64))?;
                }
                OpCode::Integer16 => {
                    let n = self.read_u16();
                    self.push(Value::Number(n as f64))?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::MinusOne => self.push(Value::Number(-1.0))?,
                OpCode::Zero => self.push(Value::Number(0.0))?,
                OpCode::One => self.push(Value::Number(1.0))?,
                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let index = self.frame().slots + slot;
                    let value = self.peek(0);
                    self.stack[index] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_name();
                    match self.globals.get(&name).copied() {
                        Some(value) => self.push(value)?,
                        None => return Err(ErrorKind::UndefinedVariable(self.name_string(name))),
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_name();
                    let value = self.peek(0);
                    if self.globals.insert(name, value).is_none() {
                        self.globals.remove(&name);
                        return Err(ErrorKind::UndefinedVariable(self.name_string(name)));
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_name();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop()?;
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = match &self.heap[upvalue] {
                        Object::Upvalue(u) => match u.state {
                            UpvalueState::Open(slot) => self.stack[slot],
                            UpvalueState::Closed(value) => value,
                        },
                        other => panic!("{:?} is not an upvalue", other.obj_type()),
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = self.peek(0);
                    match &mut self.heap[upvalue] {
                        Object::Upvalue(u) => match &mut u.state {
                            UpvalueState::Open(slot) => self.stack[*slot] = value,
                            UpvalueState::Closed(closed) => *closed = value,
                        },
                        other => panic!("{:?} is not an upvalue", other.obj_type()),
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_name();
                    let receiver = self.peek(0);
                    let (field, class) = match receiver.as_obj().and_then(|h| self.heap.get_instance(h)) {
                        Some(instance) => (instance.fields.get(&name).copied(), instance.class),
                        None => return Err(ErrorKind::NotAnInstanceProperty),
                    };
                    match field {
                        Some(value) => {
                            self.pop()?;
                            self.push(value)?;
                        }
                        None => self.bind_method(class, name)?,
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_name();
                    let value = self.peek(0);
                    let instance = self
                        .peek(1)
                        .as_obj()
                        .filter(|&h| self.heap.get_instance(h).is_some())
                        .ok_or(ErrorKind::NotAnInstanceProperty)?;

                    let added = self
                        .heap
                        .get_instance_mut(instance)
                        .map_or(false, |i| i.fields.insert(name, value).is_none());
                    if added {
                        self.heap.charge(instance, TABLE_ENTRY_BYTES);
                    }

                    self.pop()?;
                    self.pop()?;
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_name();
                    let superclass = self.pop_class()?;
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => self.equal()?,
                OpCode::Greater => self.binary_op(BinaryOp::Greater)?,
                OpCode::Less => self.binary_op(BinaryOp::Less)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_op(BinaryOp::Subtract)?,
                OpCode::Multiply => self.binary_op(BinaryOp::Multiply)?,
                OpCode::Divide => self.binary_op(BinaryOp::Divide)?,

                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        let top = self.stack.len() - 1;
                        self.stack[top] = Value::Number(-n);
                    }
                    _ => return Err(ErrorKind::OperandNotNumber),
                },

                OpCode::Print => {
                    // Stays on the stack while a toString method runs
                    let value = self.peek(0);
                    let text = self.print_string(value)?;
                    writeln!(self.out, "{}", text)?;
                    self.pop()?;
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_name();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_name();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop_class()?;
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => self.make_closure()?,
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => return Err(ErrorKind::StackUnderflow),
                    };
                    self.close_upvalues(frame.slots);
                    self.stack.truncate(frame.slots);
                    self.push(result)?;

                    if self.frames.len() == base_depth {
                        return Ok(());
                    }
                }

                OpCode::Class => {
                    let name = self.read_name();
                    let class = self.alloc(Object::Class(Class { name, methods: HashMap::new() }));
                    self.push(Value::Obj(class))?;
                }
                OpCode::Inherit => {
                    let superclass = self
                        .peek(1)
                        .as_obj()
                        .and_then(|h| self.heap.get_class(h))
                        .ok_or(ErrorKind::SuperclassNotClass)?;
                    let methods = superclass.methods.clone();
                    let subclass = self.peek(0).as_obj().ok_or(ErrorKind::SuperclassNotClass)?;

                    let count = methods.len();
                    if let Some(class) = self.heap.get_class_mut(subclass) {
                        class.methods.extend(methods);
                    }
                    self.heap.charge(subclass, count * TABLE_ENTRY_BYTES);
                    self.pop()?;
                }
                OpCode::Method => {
                    let name = self.read_name();
                    let method = self.peek(0).as_obj().ok_or(ErrorKind::NotCallable)?;
                    let class = self.peek(1).as_obj().ok_or(ErrorKind::NotCallable)?;
                    let added = self
                        .heap
                        .get_class_mut(class)
                        .map_or(false, |c| c.methods.insert(name, method).is_none());
                    if added {
                        self.heap.charge(class, TABLE_ENTRY_BYTES);
                    }
                    self.pop()?;
                }
            }
        }
    }

    // ==================== Operators ====================

    fn add(&mut self) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);

        if self.heap.is_type(a, ObjectType::String) || self.heap.is_type(b, ObjectType::String) {
            // Operands stay on the stack until the result is interned
            let mut text = self.stringify(a)?;
            text.push_str(&self.stringify(b)?);
            let result = self.intern_owned(text);
            self.pop()?;
            self.pop()?;
            return self.push(Value::Obj(result));
        }

        self.binary_op(BinaryOp::Add)
    }

    fn binary_op(&mut self, op: BinaryOp) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);

        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            let result = match op {
                BinaryOp::Add => Value::Number(x + y),
                BinaryOp::Subtract => Value::Number(x - y),
                BinaryOp::Multiply => Value::Number(x * y),
                BinaryOp::Divide => {
                    if y == 0.0 {
                        return Err(ErrorKind::DivisionByZero);
                    }
                    Value::Number(x / y)
                }
                BinaryOp::Greater => Value::Bool(x > y),
                BinaryOp::Less => Value::Bool(x < y),
            };
            self.pop()?;
            self.pop()?;
            return self.push(result);
        }

        if self.heap.is_type(a, ObjectType::List) || self.heap.is_type(b, ObjectType::List) {
            return Err(ErrorKind::ListOperation(op.symbol()));
        }

        if let Some(class) = self.instance_class(a) {
            return match self.find_method(class, self.names.for_op(op)) {
                // a and b become the receiver and argument
                Some(method) => self.call_closure(method, 1),
                None => Err(ErrorKind::MissingOverload {
                    class: self.class_name(class),
                    op: op.symbol(),
                    method: op.method(),
                }),
            };
        }

        Err(match op {
            BinaryOp::Add => ErrorKind::OperandsNotNumbersOrStrings,
            _ => ErrorKind::OperandsNotNumbers,
        })
    }

    fn equal(&mut self) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);

        if let Some(class) = self.instance_class(a) {
            if let Some(method) = self.find_method(class, self.names.eq) {
                return self.call_closure(method, 1);
            }
        }

        self.pop()?;
        self.pop()?;
        self.push(Value::Bool(a == b))
    }

    // ==================== Stringification ====================

    /// Text used when a value takes part in string concatenation
    fn stringify(&mut self, value: Value) -> Result<String> {
        let handle = match value {
            Value::Number(n) => return Ok(format_number(n)),
            Value::Bool(b) => return Ok(b.to_string()),
            Value::Nil => return Ok("nil".to_string()),
            Value::Obj(handle) => handle,
        };

        let text = match self.heap.get(handle) {
            Some(Object::String(s)) => s.chars.to_string(),
            Some(Object::Instance(_)) => match self.call_to_string(value)? {
                Some(text) => text,
                None => value.display(&self.heap),
            },
            Some(Object::List(_)) => "[list]".to_string(),
            Some(Object::Dict(_)) => "[dict]".to_string(),
            Some(Object::Enum(_)) => value.display(&self.heap),
            _ => "[object]".to_string(),
        };
        Ok(text)
    }

    /// Text written by PRINT: instances go through `toString` when their
    /// class defines it, containers are listed element by element
    pub(crate) fn print_string(&mut self, value: Value) -> Result<String> {
        if self.instance_class(value).is_some() {
            if let Some(text) = self.call_to_string(value)? {
                return Ok(text);
            }
        }
        Ok(value.display(&self.heap))
    }

    /// Run the receiver's `toString` to completion, if its class has one
    fn call_to_string(&mut self, instance: Value) -> Result<Option<String>> {
        let method = match self.instance_class(instance) {
            Some(class) => self.find_method(class, self.names.to_string),
            None => None,
        };
        let Some(method) = method else {
            return Ok(None);
        };

        let depth = self.frames.len();
        self.push(instance)?;
        self.call_closure(method, 0)?;
        self.run_until(depth)?;

        // Returned value stays rooted while it is rendered. An instance
        // result is not sent back through toString.
        let result = self.peek(0);
        let text = if self.instance_class(result).is_some() {
            result.display(&self.heap)
        } else {
            self.stringify(result)?
        };
        self.pop()?;
        Ok(Some(text))
    }

    // ==================== Calls ====================

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<()> {
        let handle = match callee {
            Value::Obj(handle) => handle,
            _ => return Err(ErrorKind::NotCallable),
        };

        match self.heap.get(handle) {
            Some(Object::BoundMethod(bound)) => {
                let BoundMethod { receiver, method } = *bound;
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Some(Object::Class(class)) => {
                let initializer = class.methods.get(&self.names.init).copied();
                let instance = self.alloc(Object::Instance(Instance {
                    class: handle,
                    fields: HashMap::new(),
                }));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = Value::Obj(instance);

                match initializer {
                    Some(init) => self.call_closure(init, argc),
                    None if argc != 0 => Err(ErrorKind::WrongArity { expected: 0, got: argc }),
                    None => Ok(()),
                }
            }
            Some(Object::Closure(_)) => self.call_closure(handle, argc),
            Some(Object::Native(native)) => {
                let native = native.clone();
                if native.arity != argc {
                    return Err(ErrorKind::WrongArity { expected: native.arity, got: argc });
                }

                let args_start = self.stack.len() - argc;
                let args = self.stack[args_start..].to_vec();
                let result = (native.func)(self, &args).map_err(ErrorKind::Native)?;

                self.stack.truncate(args_start - 1);
                self.push(result)
            }
            _ => Err(ErrorKind::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: Handle, argc: usize) -> Result<()> {
        let function = self
            .heap
            .get_closure(closure)
            .and_then(|c| self.heap.get_function(c.function))
            .ok_or(ErrorKind::NotCallable)?;

        if argc != function.arity {
            return Err(ErrorKind::WrongArity { expected: function.arity, got: argc });
        }
        if self.frames.len() >= self.config.frames_max {
            return Err(ErrorKind::StackOverflow);
        }

        let chunk = Rc::clone(&function.chunk);
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: Handle, argc: usize) -> Result<()> {
        let receiver = self.peek(argc);
        let (field, class) = match receiver.as_obj().and_then(|h| self.heap.get_instance(h)) {
            Some(instance) => (instance.fields.get(&name).copied(), instance.class),
            None => return Err(ErrorKind::NotAnInstanceMethod),
        };

        // A field holding a callable shadows a method of the same name
        if let Some(value) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }

        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class: Handle, name: Handle, argc: usize) -> Result<()> {
        match self.find_method(class, name) {
            Some(method) => self.call_closure(method, argc),
            None => Err(ErrorKind::UndefinedProperty(self.name_string(name))),
        }
    }

    /// Replace the receiver on top of the stack with `class.name` bound to it
    fn bind_method(&mut self, class: Handle, name: Handle) -> Result<()> {
        let method = self
            .find_method(class, name)
            .ok_or_else(|| ErrorKind::UndefinedProperty(self.name_string(name)))?;

        let receiver = self.peek(0);
        let bound = self.alloc(Object::BoundMethod(BoundMethod { receiver, method }));
        self.pop()?;
        self.push(Value::Obj(bound))
    }

    fn find_method(&self, class: Handle, name: Handle) -> Option<Handle> {
        self.heap.get_class(class).and_then(|c| c.methods.get(&name).copied())
    }

    fn instance_class(&self, value: Value) -> Option<Handle> {
        value.as_obj().and_then(|h| self.heap.get_instance(h)).map(|i| i.class)
    }

    fn pop_class(&mut self) -> Result<Handle> {
        let value = self.pop()?;
        value
            .as_obj()
            .filter(|&h| self.heap.get_class(h).is_some())
            .ok_or(ErrorKind::SuperclassNotClass)
    }

    // ==================== Closures ====================

    fn make_closure(&mut self) -> Result<()> {
        let function = match self.read_constant_16() {
            Value::Obj(handle) => handle,
            _ => return Err(ErrorKind::NotCallable),
        };
        let upvalue_count = self
            .heap
            .get_function(function)
            .map(|f| f.upvalue_count)
            .ok_or(ErrorKind::NotCallable)?;

        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Obj(closure))?;

        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let slot = self.frame().slots + index;
                self.capture_upvalue(slot)
            } else {
                self.frame_upvalue(index)
            };

            if let Some(c) = self.heap.get_closure_mut(closure) {
                c.upvalues.push(upvalue);
            }
        }
        self.heap.charge(closure, upvalue_count * std::mem::size_of::<Handle>());
        Ok(())
    }

    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut insert_at = self.open_upvalues.len();
        for (i, &handle) in self.open_upvalues.iter().enumerate().rev() {
            match self.heap.get_upvalue(handle).and_then(Upvalue::slot) {
                Some(open) if open == slot => return handle,
                Some(open) if open < slot => break,
                _ => insert_at = i,
            }
        }

        let handle = self.alloc(Object::Upvalue(Upvalue::new(slot)));
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    /// Close every open upvalue at or above stack slot `last`
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&handle) = self.open_upvalues.last() {
            let slot = match self.heap.get_upvalue(handle).and_then(Upvalue::slot) {
                Some(slot) if slot >= last => slot,
                _ => break,
            };

            let value = self.stack[slot];
            if let Some(upvalue) = self.heap.get_upvalue_mut(handle) {
                upvalue.close(value);
            }
            self.open_upvalues.pop();
        }
    }

    fn frame_upvalue(&self, index: usize) -> Handle {
        let closure = self.frame().closure;
        match self.heap.get_closure(closure) {
            Some(c) => c.upvalues[index],
            None => panic!("frame closure {:?} is not a closure", closure),
        }
    }

    // ==================== Stack and decoding ====================

    fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= self.config.stack_max {
            return Err(ErrorKind::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    /// Push a value only to keep it reachable across an allocation
    fn push_root(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(ErrorKind::StackUnderflow)
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let value = frame.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant_16(&mut self) -> Value {
        let idx = self.read_u16() as usize;
        self.frame().chunk.constants[idx]
    }

    /// Read a u16 constant operand naming a global, property or method
    fn read_name(&mut self) -> Handle {
        match self.read_constant_16() {
            Value::Obj(handle) => handle,
            other => panic!("name operand {:?} is not a string", other),
        }
    }

    fn name_string(&self, name: Handle) -> String {
        self.heap.get_string(name).unwrap_or("?").to_string()
    }

    fn class_name(&self, class: Handle) -> String {
        self.heap
            .get_class(class)
            .map_or_else(|| "?".to_string(), |c| self.name_string(c.name))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
