//! The polyhedral model: affine maps, statements, arrays, and the
//! builder turning the typed AST into them.

pub mod builder;
pub mod matrix;
pub mod model;

pub use builder::build_model;
pub use matrix::AffineMatrix;
pub use model::{
    AccessRelation, Array, ArrayId, Expr, Model, PrimitiveOp, Statement, StmtId,
};
