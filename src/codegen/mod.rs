//! Imperative lowering and kernel assembly.

pub mod ast;
pub mod kernel;
pub mod lower;
pub mod report;

pub use ast::{Builder, CBinOp, CExpr, CStmt, CType, CUnOp, Param, Procedure};
pub use kernel::{generate, ExternDecl, Kernel, StateField};
pub use lower::{floor_rem_f64, floor_rem_i64, Lowering};
pub use report::{Channel, Report};
