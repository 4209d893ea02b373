//! Error types for the cinder VM
//!
//! Inside the engine every fallible step returns `Result<_, ErrorKind>`.
//! When an error escapes the dispatch loop the VM attaches a call-frame walk
//! and reports it as a [`RuntimeError`]. Front ends report a single
//! [`CompileError`].

use std::fmt;

/// Runtime error kinds. The `Display` text is the message shown to users.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("Expected {expected} arguments but got {got}.")]
    WrongArity { expected: usize, got: usize },

    #[error("Stack overflow.")]
    StackOverflow,

    #[error("Can only call functions and classes.")]
    NotCallable,

    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),

    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),

    #[error("Only instances have methods.")]
    NotAnInstanceMethod,

    #[error("Only instances have properties.")]
    NotAnInstanceProperty,

    #[error("Superclass must be a class.")]
    SuperclassNotClass,

    #[error("Division by zero.")]
    DivisionByZero,

    #[error("Operand must be a number.")]
    OperandNotNumber,

    #[error("Operands must be numbers.")]
    OperandsNotNumbers,

    #[error("Operands must be two numbers or two strings.")]
    OperandsNotNumbersOrStrings,

    #[error("Operation '{0}' does not support lists.")]
    ListOperation(&'static str),

    #[error("Class '{class}' does not implement operator '{op}' ({method}).")]
    MissingOverload {
        class: String,
        op: &'static str,
        method: &'static str,
    },

    #[error("Unknown opcode {0}.")]
    UnknownOpcode(u8),

    #[error("Stack exhausted.")]
    StackUnderflow,

    /// Failure signalled by a native function
    #[error("{0}")]
    Native(String),

    /// Writing to an output sink failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(err.to_string())
    }
}

/// One line of a runtime error's frame walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: usize,
    /// `None` for the top-level script
    pub function: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error with the call stack at the point it was raised,
/// innermost frame first
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, trace: Vec<TraceFrame>) -> Self {
        Self { kind, trace }
    }

    /// Line of the innermost frame, if any
    pub fn line(&self) -> Option<usize> {
        self.trace.first().map(|frame| frame.line)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trace {
            write!(f, "\n{}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Category of a front-end error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    Syntax,
    Semantic,
    Type,
    Compile,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompileErrorKind::Syntax => "Syntax Error",
            CompileErrorKind::Semantic => "Semantic Error",
            CompileErrorKind::Type => "Type Error",
            CompileErrorKind::Compile => "Compile Error",
        };
        f.write_str(name)
    }
}

/// The single error record a front end reports when it cannot produce a
/// function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub line: usize,
    pub message: String,
    /// Offending token text, if there is one
    pub token: Option<String>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            message: message.into(),
            token: None,
        }
    }

    pub fn at(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.kind)?;
        if let Some(token) = &self.token {
            write!(f, " at '{}'", token)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// Outcome of running a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ErrorKind>;
