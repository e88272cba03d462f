//! Imperative AST for the generated kernel.
//!
//! This is the bridge between the scheduled polyhedral model and the
//! final textual emitter (an external collaborator): block-structured
//! statements and C-family expressions, plus a builder with a block
//! stack and a temp-name counter.

use crate::frontend::types::PrimType;
use serde::{Deserialize, Serialize};

/// Types appearing in the generated code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CType {
    Bool,
    Int,
    Float,
    Double,
    Void,
    Pointer(Box<CType>),
    Named(String),
}

impl CType {
    pub fn from_prim(prim: PrimType) -> Self {
        match prim {
            PrimType::Bool => CType::Bool,
            PrimType::Int => CType::Int,
            PrimType::Real32 => CType::Float,
            PrimType::Real64 => CType::Double,
        }
    }

    pub fn pointer(self) -> Self {
        CType::Pointer(Box::new(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Assign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CUnOp {
    Neg,
    Not,
    AddressOf,
}

/// An expression of the generated code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CExpr {
    IntLit(i64),
    RealLit(f64),
    BoolLit(bool),
    Id(String),
    Binary {
        op: CBinOp,
        lhs: Box<CExpr>,
        rhs: Box<CExpr>,
    },
    Unary {
        op: CUnOp,
        operand: Box<CExpr>,
    },
    Call {
        name: String,
        args: Vec<CExpr>,
    },
    Cast {
        ty: CType,
        expr: Box<CExpr>,
    },
    /// Multi-dimensional element access.
    Index {
        base: Box<CExpr>,
        indices: Vec<CExpr>,
    },
    /// Member through a pointer: `base->field`.
    Arrow {
        base: Box<CExpr>,
        field: String,
    },
    Ternary {
        cond: Box<CExpr>,
        then_value: Box<CExpr>,
        else_value: Box<CExpr>,
    },
}

impl CExpr {
    pub fn id(name: impl Into<String>) -> Self {
        CExpr::Id(name.into())
    }

    pub fn binary(op: CBinOp, lhs: CExpr, rhs: CExpr) -> Self {
        CExpr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn add(self, other: CExpr) -> Self {
        Self::binary(CBinOp::Add, self, other)
    }

    pub fn mul(self, other: CExpr) -> Self {
        Self::binary(CBinOp::Mul, self, other)
    }

    pub fn assign(self, value: CExpr) -> Self {
        Self::binary(CBinOp::Assign, self, value)
    }

    pub fn call(name: impl Into<String>, args: Vec<CExpr>) -> Self {
        CExpr::Call { name: name.into(), args }
    }

    pub fn address_of(self) -> Self {
        CExpr::Unary { op: CUnOp::AddressOf, operand: Box::new(self) }
    }

    pub fn arrow(self, field: impl Into<String>) -> Self {
        CExpr::Arrow { base: Box::new(self), field: field.into() }
    }

    pub fn index(self, indices: Vec<CExpr>) -> Self {
        CExpr::Index { base: Box::new(self), indices }
    }

    /// Fold a constant integer value, if the expression is one.
    pub fn const_int(&self) -> Option<i64> {
        match self {
            CExpr::IntLit(v) => Some(*v),
            CExpr::Binary { op, lhs, rhs } => {
                let (l, r) = (lhs.const_int()?, rhs.const_int()?);
                Some(match op {
                    CBinOp::Add => l + r,
                    CBinOp::Sub => l - r,
                    CBinOp::Mul => l * r,
                    _ => return None,
                })
            }
            _ => None,
        }
    }
}

/// A statement of the generated code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CStmt {
    VarDecl {
        ty: CType,
        name: String,
        /// Array extents; empty for scalars.
        dims: Vec<i64>,
        init: Option<CExpr>,
    },
    Expr(CExpr),
    If {
        cond: CExpr,
        then_body: Vec<CStmt>,
        else_body: Vec<CStmt>,
    },
    For {
        var: String,
        lower: CExpr,
        upper: CExpr,
        step: i64,
        body: Vec<CStmt>,
    },
    Return(CExpr),
}

/// A formal parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub ty: CType,
    pub name: String,
    /// Array extents; an infinite dimension is reported as 0.
    pub dims: Vec<i64>,
}

/// A generated procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: CType,
    pub body: Vec<CStmt>,
}

/// Builder over a stack of statement blocks.
#[derive(Debug)]
pub struct Builder {
    stack: Vec<Vec<CStmt>>,
    temp_counter: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self { stack: vec![Vec::new()], temp_counter: 0 }
    }

    /// Open a nested block; statements go there until `pop`.
    pub fn push(&mut self) {
        self.stack.push(Vec::new());
    }

    /// Close the innermost block and return its statements.
    pub fn pop(&mut self) -> Vec<CStmt> {
        self.stack.pop().expect("unbalanced builder pop")
    }

    pub fn add(&mut self, stmt: CStmt) {
        self.stack.last_mut().expect("builder has a block").push(stmt);
    }

    pub fn add_expr(&mut self, expr: CExpr) {
        self.add(CStmt::Expr(expr));
    }

    /// Declare a fresh scalar temporary and return its name.
    pub fn new_var(&mut self, ty: CType) -> String {
        let name = format!("v{}", self.temp_counter);
        self.temp_counter += 1;
        self.add(CStmt::VarDecl { ty, name: name.clone(), dims: Vec::new(), init: None });
        name
    }

    /// Finish building, returning the outermost block.
    pub fn finish(mut self) -> Vec<CStmt> {
        assert_eq!(self.stack.len(), 1, "unbalanced builder blocks");
        self.stack.pop().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_blocks() {
        let mut b = Builder::new();
        b.add_expr(CExpr::IntLit(1));
        b.push();
        b.add_expr(CExpr::IntLit(2));
        let inner = b.pop();
        b.add(CStmt::If {
            cond: CExpr::BoolLit(true),
            then_body: inner,
            else_body: Vec::new(),
        });
        let stmts = b.finish();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[1], CStmt::If { .. }));
    }

    #[test]
    fn test_new_var_names_are_fresh() {
        let mut b = Builder::new();
        let v0 = b.new_var(CType::Double);
        let v1 = b.new_var(CType::Int);
        assert_ne!(v0, v1);
        assert_eq!(b.finish().len(), 2);
    }

    #[test]
    fn test_const_fold() {
        let e = CExpr::IntLit(2).mul(CExpr::IntLit(3)).add(CExpr::IntLit(1));
        assert_eq!(e.const_int(), Some(7));
        assert_eq!(CExpr::id("x").const_int(), None);
    }
}
