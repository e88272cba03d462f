//! Frontend: input AST, semantic types, and the type/size checker.

pub mod ast;
pub mod checker;
pub mod types;

pub use ast::{BinOp, Environment, Node, NodeKind, Symbol, SymbolKind};
pub use checker::{Checker, Session, BUILTINS};
pub use types::{Dim, PrimType, StreamType, Type};
