//! The polyhedral model of a compilation unit.
//!
//! Each statement owns an integer iteration domain (a box of intervals,
//! at most one of them infinite) and affine access relations into arrays.
//! Entities reference each other through dense integer handles; there are
//! no back-pointers into the AST.

use crate::frontend::types::{Dim, PrimType};
use crate::polyhedral::matrix::AffineMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a statement in [`Model::statements`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StmtId(pub usize);

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S_{}", self.0)
    }
}

/// Handle of an array in [`Model::arrays`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayId(pub usize);

/// An affine access into an array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRelation {
    pub array: ArrayId,
    /// Maps the statement's iteration coordinates to array coordinates.
    pub matrix: AffineMatrix,
}

/// Scalar operations of the statement expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    DivideInteger,
    Modulo,
    Raise,
    Negate,
    CompareEq,
    CompareNeq,
    CompareL,
    CompareLeq,
    CompareG,
    CompareGeq,
    LogicAnd,
    LogicOr,
    Conditional,
    Abs,
    Max,
    Min,
    Floor,
    Ceil,
    Log,
    Log2,
    Log10,
    Exp,
    Exp2,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
}

/// A statement expression: the scalar computation performed at each point
/// of the statement's iteration domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Primitive {
        op: PrimitiveOp,
        operands: Vec<Expr>,
        ty: PrimType,
    },
    /// The value of one iteration coordinate of the enclosing statement.
    IteratorRead { index: usize },
    /// An element of another array, through an affine access.
    ArrayRead { array: ArrayId, matrix: AffineMatrix },
    /// A call into host code, taking the address of the accessed cell.
    ExternalCall { name: String, source: AccessRelation },
    ConstInt(i64),
    ConstReal(f64),
    ConstBool(bool),
}

impl Expr {
    /// The element type this expression evaluates to.
    pub fn prim_type(&self, model: &Model) -> PrimType {
        match self {
            Expr::Primitive { ty, .. } => *ty,
            Expr::IteratorRead { .. } => PrimType::Int,
            Expr::ArrayRead { array, .. } => model.array(*array).ty,
            Expr::ExternalCall { source, .. } => model.array(source.array).ty,
            Expr::ConstInt(_) => PrimType::Int,
            Expr::ConstReal(_) => PrimType::Real64,
            Expr::ConstBool(_) => PrimType::Bool,
        }
    }

    /// Fold over every array access in the expression tree, in source
    /// order. External call sources are included.
    pub fn for_each_access<F: FnMut(ArrayId, &AffineMatrix)>(&self, f: &mut F) {
        match self {
            Expr::Primitive { operands, .. } => {
                for op in operands {
                    op.for_each_access(f);
                }
            }
            Expr::ArrayRead { array, matrix } => f(*array, matrix),
            Expr::ExternalCall { source, .. } => f(source.array, &source.matrix),
            Expr::IteratorRead { .. }
            | Expr::ConstInt(_)
            | Expr::ConstReal(_)
            | Expr::ConstBool(_) => {}
        }
    }
}

/// One statement of the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    /// Positional name: `S_0`, `S_1`, ...
    pub name: String,
    /// The iteration domain as a box of extents.
    pub domain: Vec<Dim>,
    pub expr: Expr,
    pub write: AccessRelation,
    /// Index of the streaming dimension; `None` for finite statements.
    pub dimension: Option<usize>,
    /// Iterations executed once at start-up (dataflow solve).
    pub init_count: i64,
    /// Iterations executed per steady period (dataflow solve).
    pub steady_count: i64,
    /// Ring-buffer extent along the streaming dimension, once computed.
    pub buffer_size: Option<i64>,
}

impl Statement {
    pub fn is_infinite(&self) -> bool {
        self.dimension.is_some()
    }

    /// The extents of the domain with the streaming dimension zeroed;
    /// used to find the furthest element one iteration touches.
    pub fn bounds_with_zero_stream(&self) -> Vec<i64> {
        self.domain
            .iter()
            .enumerate()
            .map(|(i, d)| {
                if Some(i) == self.dimension {
                    0
                } else {
                    d.extent().unwrap_or(0)
                }
            })
            .collect()
    }
}

/// One array of the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Array {
    pub name: String,
    pub ty: PrimType,
    pub size: Vec<Dim>,
    /// Elements produced along the stream per `process` call.
    pub period: i64,
    /// Elements produced along the stream during `initialize`.
    pub period_offset: i64,
    /// Buffer extents, one per dimension.
    pub buffer_size: Vec<i64>,
    pub is_infinite: bool,
    /// Live values cross a period boundary; forces state residence.
    pub inter_period_dependency: bool,
    /// The statement writing this array.
    pub producer: Option<StmtId>,
    /// Input channel number, for arrays fed by the host.
    pub input_channel: Option<usize>,
}

impl Array {
    /// Flattened buffer element count.
    pub fn buffer_volume(&self) -> i64 {
        if self.buffer_size.is_empty() {
            0
        } else {
            self.buffer_size.iter().product()
        }
    }

    /// A scalar buffer is a single cell.
    pub fn is_scalar_buffer(&self) -> bool {
        self.buffer_size.len() == 1 && self.buffer_size[0] == 1
    }
}

/// The polyhedral model of one compilation unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    pub statements: Vec<Statement>,
    pub arrays: Vec<Array>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement(&self, id: StmtId) -> &Statement {
        &self.statements[id.0]
    }

    pub fn statement_mut(&mut self, id: StmtId) -> &mut Statement {
        &mut self.statements[id.0]
    }

    pub fn array(&self, id: ArrayId) -> &Array {
        &self.arrays[id.0]
    }

    pub fn array_mut(&mut self, id: ArrayId) -> &mut Array {
        &mut self.arrays[id.0]
    }

    pub fn add_array(&mut self, array: Array) -> ArrayId {
        self.arrays.push(array);
        ArrayId(self.arrays.len() - 1)
    }

    pub fn add_statement(&mut self, mut stmt: Statement) -> StmtId {
        let id = StmtId(self.statements.len());
        stmt.name = format!("S_{}", id.0);
        self.statements.push(stmt);
        id
    }

    /// The designated output array: the last one created.
    pub fn output_array(&self) -> Option<ArrayId> {
        if self.arrays.is_empty() {
            None
        } else {
            Some(ArrayId(self.arrays.len() - 1))
        }
    }

    /// Input arrays in channel order.
    pub fn input_arrays(&self) -> Vec<ArrayId> {
        let mut inputs: Vec<(usize, ArrayId)> = self
            .arrays
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.input_channel.map(|ch| (ch, ArrayId(i))))
            .collect();
        inputs.sort_by_key(|(ch, _)| *ch);
        inputs.into_iter().map(|(_, id)| id).collect()
    }

    /// All distinct (sink, array, access) read triples of a statement.
    pub fn reads_of(&self, id: StmtId) -> Vec<(ArrayId, AffineMatrix)> {
        let mut reads = Vec::new();
        self.statement(id).expr.for_each_access(&mut |array, matrix| {
            reads.push((array, matrix.clone()));
        });
        reads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_naming_is_positional() {
        let mut model = Model::new();
        let array = model.add_array(Array {
            name: "x".into(),
            ty: PrimType::Real64,
            size: vec![Dim::Finite(4)],
            period: 0,
            period_offset: 0,
            buffer_size: Vec::new(),
            is_infinite: false,
            inter_period_dependency: false,
            producer: None,
            input_channel: None,
        });
        for _ in 0..2 {
            model.add_statement(Statement {
                name: String::new(),
                domain: vec![Dim::Finite(4)],
                expr: Expr::ConstInt(0),
                write: AccessRelation { array, matrix: AffineMatrix::identity(1) },
                dimension: None,
                init_count: 0,
                steady_count: 1,
                buffer_size: None,
            });
        }
        assert_eq!(model.statements[0].name, "S_0");
        assert_eq!(model.statements[1].name, "S_1");
    }

    #[test]
    fn test_for_each_access_order() {
        let read = |i: usize| Expr::ArrayRead {
            array: ArrayId(i),
            matrix: AffineMatrix::identity(1),
        };
        let expr = Expr::Primitive {
            op: PrimitiveOp::Add,
            operands: vec![read(0), read(1)],
            ty: PrimType::Real64,
        };
        let mut seen = Vec::new();
        expr.for_each_access(&mut |a, _| seen.push(a.0));
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_bounds_with_zero_stream() {
        let stmt = Statement {
            name: "S_0".into(),
            domain: vec![Dim::Infinite, Dim::Finite(4)],
            expr: Expr::ConstInt(0),
            write: AccessRelation {
                array: ArrayId(0),
                matrix: AffineMatrix::identity(2),
            },
            dimension: Some(0),
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        };
        assert_eq!(stmt.bounds_with_zero_stream(), vec![0, 4]);
    }
}
