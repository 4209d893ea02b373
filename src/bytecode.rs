//! Bytecode instructions for the cinder VM
//!
//! A front end lowers source text into a [`Chunk`] owned by a function
//! object. Operands follow their opcode byte; multi-byte operands are
//! big-endian.

use std::fmt;

use crate::gc::Heap;
use crate::value::Value;

/// Opcodes for the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and literals
    Constant,       // u8 constant index
    Constant16,     // u16 constant index
    Integer,        // u8 literal
    Integer16,      // u16 literal
    Nil,
    True,
    False,
    MinusOne,
    Zero,
    One,

    // Stack manipulation
    Pop,

    // Variables
    GetLocal,       // u8 slot
    SetLocal,       // u8 slot
    GetGlobal,      // u16 name
    SetGlobal,      // u16 name
    DefineGlobal,   // u16 name
    GetUpvalue,     // u8 index
    SetUpvalue,     // u8 index

    // Properties
    GetProperty,    // u16 name
    SetProperty,    // u16 name
    GetSuper,       // u16 name

    // Comparison
    Equal,
    Greater,
    Less,

    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,

    // Unary
    Not,
    Negate,

    Print,

    // Control flow
    Jump,           // u16 forward offset
    JumpIfFalse,    // u16 forward offset, condition stays on the stack
    Loop,           // u16 backward offset

    // Functions
    Call,           // u8 argc
    Invoke,         // u16 name, u8 argc
    SuperInvoke,    // u16 name, u8 argc
    Closure,        // u16 function, then (is_local, index) per upvalue
    CloseUpvalue,
    Return,

    // Classes
    Class,          // u16 name
    Inherit,
    Method,         // u16 name
}

/// Decoding table, indexed by discriminant
const OPCODES: [OpCode; 43] = [
    OpCode::Constant,
    OpCode::Constant16,
    OpCode::Integer,
    OpCode::Integer16,
    OpCode::Nil,
    OpCode::True,
    OpCode::False,
    OpCode::MinusOne,
    OpCode::Zero,
    OpCode::One,
    OpCode::Pop,
    OpCode::GetLocal,
    OpCode::SetLocal,
    OpCode::GetGlobal,
    OpCode::SetGlobal,
    OpCode::DefineGlobal,
    OpCode::GetUpvalue,
    OpCode::SetUpvalue,
    OpCode::GetProperty,
    OpCode::SetProperty,
    OpCode::GetSuper,
    OpCode::Equal,
    OpCode::Greater,
    OpCode::Less,
    OpCode::Add,
    OpCode::Subtract,
    OpCode::Multiply,
    OpCode::Divide,
    OpCode::Not,
    OpCode::Negate,
    OpCode::Print,
    OpCode::Jump,
    OpCode::JumpIfFalse,
    OpCode::Loop,
    OpCode::Call,
    OpCode::Invoke,
    OpCode::SuperInvoke,
    OpCode::Closure,
    OpCode::CloseUpvalue,
    OpCode::Return,
    OpCode::Class,
    OpCode::Inherit,
    OpCode::Method,
];

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match OPCODES.get(byte as usize) {
            Some(&op) if op as u8 == byte => Ok(op),
            _ => Err(byte),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

/// A chunk of bytecode with associated data
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// The bytecode instructions
    pub code: Vec<u8>,

    /// Constant pool
    pub constants: Vec<Value>,

    /// Source line for each byte of `code`
    pub lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an opcode to the chunk
    pub fn write(&mut self, op: OpCode, line: usize) {
        self.write_byte(op as u8, line);
    }

    /// Write a raw byte (operand)
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Write a 16-bit operand
    pub fn write_u16(&mut self, value: u16, line: usize) {
        self.write_byte((value >> 8) as u8, line);
        self.write_byte(value as u8, line);
    }

    /// Add a constant and return its index
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Read a 16-bit value at offset
    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | (self.code[offset + 1] as u16)
    }

    /// Get current code length (for jump patching)
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emit a forward jump with a placeholder offset; returns the operand
    /// position for [`Chunk::patch_jump`]
    pub fn emit_jump(&mut self, op: OpCode, line: usize) -> usize {
        self.write(op, line);
        self.write_u16(u16::MAX, line);
        self.code.len() - 2
    }

    /// Point the jump whose operand sits at `offset` to the current end of code
    pub fn patch_jump(&mut self, offset: usize) -> Result<(), &'static str> {
        let jump = self.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err("Too much code to jump over.");
        }
        self.code[offset] = (jump >> 8) as u8;
        self.code[offset + 1] = jump as u8;
        Ok(())
    }

    /// Emit a LOOP back to `loop_start`
    pub fn emit_loop(&mut self, loop_start: usize, line: usize) -> Result<(), &'static str> {
        self.write(OpCode::Loop, line);
        let offset = self.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err("Loop body too large.");
        }
        self.write_u16(offset as u16, line);
        Ok(())
    }

    /// Disassemble for debugging
    pub fn disassemble(&self, name: &str, heap: &Heap) -> String {
        let mut result = format!("== {} ==\n", name);
        let mut offset = 0;

        while offset < self.code.len() {
            let (s, new_offset) = self.disassemble_instruction(offset, heap);
            result.push_str(&s);
            result.push('\n');
            offset = new_offset;
        }

        result
    }

    pub fn disassemble_instruction(&self, offset: usize, heap: &Heap) -> (String, usize) {
        let line = self.lines.get(offset).copied().unwrap_or(0);
        let line_col = if offset > 0 && self.lines.get(offset - 1) == Some(&line) {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };

        let op = match OpCode::try_from(self.code[offset]) {
            Ok(op) => op,
            Err(byte) => {
                return (format!("{:04} {} <unknown opcode {}>", offset, line_col, byte), offset + 1)
            }
        };

        let constant = |idx: usize| {
            self.constants
                .get(idx)
                .map(|v| v.display(heap))
                .unwrap_or_else(|| "<bad constant>".to_string())
        };

        let (instr, new_offset) = match op {
            OpCode::Constant => {
                let idx = self.code[offset + 1] as usize;
                (format!("{:?} {:04} '{}'", op, idx, constant(idx)), offset + 2)
            }
            OpCode::Constant16
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::DefineGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Class
            | OpCode::Method => {
                let idx = self.read_u16(offset + 1) as usize;
                (format!("{:?} {:04} '{}'", op, idx, constant(idx)), offset + 3)
            }
            OpCode::Integer | OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue
            | OpCode::SetUpvalue | OpCode::Call => {
                let operand = self.code[offset + 1];
                (format!("{:?} {}", op, operand), offset + 2)
            }
            OpCode::Integer16 => {
                let operand = self.read_u16(offset + 1);
                (format!("{:?} {}", op, operand), offset + 3)
            }
            OpCode::Jump | OpCode::JumpIfFalse => {
                let jump = self.read_u16(offset + 1);
                (format!("{:?} {:04} -> {:04}", op, offset, offset + 3 + jump as usize), offset + 3)
            }
            OpCode::Loop => {
                let jump = self.read_u16(offset + 1) as usize;
                let target = (offset + 3).saturating_sub(jump);
                (format!("{:?} {:04} -> {:04}", op, offset, target), offset + 3)
            }
            OpCode::Invoke | OpCode::SuperInvoke => {
                let idx = self.read_u16(offset + 1) as usize;
                let argc = self.code[offset + 3];
                (format!("{:?} ({} args) {:04} '{}'", op, argc, idx, constant(idx)), offset + 4)
            }
            OpCode::Closure => {
                let idx = self.read_u16(offset + 1) as usize;
                let mut s = format!("{:?} {:04} {}", op, idx, constant(idx));
                let upvalue_count = self
                    .constants
                    .get(idx)
                    .and_then(|v| v.as_obj())
                    .and_then(|h| heap.get_function(h))
                    .map_or(0, |f| f.upvalue_count);

                let mut next = offset + 3;
                for _ in 0..upvalue_count {
                    let is_local = self.code.get(next).copied().unwrap_or(0);
                    let index = self.code.get(next + 1).copied().unwrap_or(0);
                    let kind = if is_local != 0 { "local" } else { "upvalue" };
                    s.push_str(&format!("\n{:04}    |                     {} {}", next, kind, index));
                    next += 2;
                }
                (s, next)
            }
            _ => (format!("{:?}", op), offset + 1),
        };

        (format!("{:04} {} {}", offset, line_col, instr), new_offset)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
