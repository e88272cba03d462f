//! Error types for the compiler.
//!
//! One error type per phase, plus a top-level `CompileError` that the
//! pipeline entry points return. Type errors carry a source line when one
//! is available; errors raised by internal invariants do not.

use thiserror::Error;
use std::fmt;

/// Top-level error type for the compiler.
#[derive(Error, Debug)]
pub enum CompileError {
    /// Error during type and size checking
    #[error("Type error: {0}")]
    Type(#[from] TypeError),

    /// Error while building or analyzing the polyhedral model
    #[error("Polyhedral error: {0}")]
    Polyhedral(#[from] PolyhedralError),

    /// Error during schedule construction
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Error during imperative lowering
    #[error("Emit error: {0}")]
    Emit(#[from] EmitError),
}

/// Error during semantic type and size checking.
#[derive(Error, Debug, Clone)]
pub struct TypeError {
    /// The error message
    pub message: String,
    /// Source line (1-indexed), if known
    pub line: Option<usize>,
    /// The kind of type error
    pub kind: TypeErrorKind,
}

impl TypeError {
    pub fn new(kind: TypeErrorKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), line: None, kind }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {})", self.message, line),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    /// Name not bound in any scope
    UndefinedName,
    /// Callee is not a function
    NotAFunction,
    /// Wrong number of arguments
    WrongArgCount,
    /// No overload accepts the argument types
    InvalidArguments,
    /// More than one overload accepts the argument types
    AmbiguousOverload,
    /// Operand shapes disagree
    SizeMismatch,
    /// A constant was required but not available
    NotConstant,
    /// Index or dimension selector out of bounds
    OutOfBounds,
    /// Invalid iteration size, hop, or coverage
    InvalidIteration,
    /// Invalid reduction domain or result
    InvalidReduction,
    /// Expression kind not valid in this position
    InvalidExpression,
}

/// Error while building or analyzing the polyhedral model.
#[derive(Error, Debug, Clone)]
pub struct PolyhedralError {
    /// The error message
    pub message: String,
    /// The kind of polyhedral error
    pub kind: PolyhedralErrorKind,
}

impl PolyhedralError {
    pub fn new(kind: PolyhedralErrorKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind }
    }
}

impl fmt::Display for PolyhedralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolyhedralErrorKind {
    /// A statement domain is infinite in more than one dimension
    MultipleInfiniteDimensions,
    /// A sink's flow dimension does not map to the source's flow dimension
    FlowDimensionMismatch,
    /// The dataflow rate equations have no one-dimensional solution
    UnbalancedDataflow,
    /// A construct the model cannot represent with affine accesses
    NonAffineAccess,
}

/// Error during schedule construction.
#[derive(Error, Debug, Clone)]
pub struct ScheduleError {
    /// The error message
    pub message: String,
}

impl ScheduleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Error during imperative lowering.
///
/// Raised only when an internal invariant is violated; type and shape
/// mismatches are impossible here because the checker rejected them.
#[derive(Error, Debug, Clone)]
pub struct EmitError {
    /// The error message
    pub message: String,
}

impl EmitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Result type using CompileError.
pub type CompileResult<T> = Result<T, CompileError>;
