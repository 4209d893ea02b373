//! cinder - a bytecode virtual machine
//!
//! Runs compiled functions with closures, classes with single inheritance,
//! operator overloading through `__add__`-style methods, and a
//! mark-and-sweep collected heap. Turning source text into bytecode is the
//! job of a front end plugged in through [`Compile`].

pub mod bytecode;
pub mod config;
pub mod error;
pub mod gc;
pub mod natives;
pub mod object;
pub mod value;
pub mod vm;

pub use bytecode::{Chunk, OpCode};
pub use config::VmConfig;
pub use error::{CompileError, CompileErrorKind, ErrorKind, InterpretResult, RuntimeError, TraceFrame};
pub use gc::{GcStats, Handle, Heap};
pub use object::{Function, Object, ObjectType};
pub use value::Value;
pub use vm::{Vm, FRAMES_MAX, INIT_METHOD, STACK_MAX};

/// A front end: turns source text into a top-level function allocated on `heap`.
///
/// No collection runs while a front end holds the heap, so intermediate
/// objects need no rooting.
pub trait Compile {
    fn compile(&mut self, source: &str, heap: &mut Heap) -> Result<Handle, CompileError>;
}

/// Version of the cinder VM
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
