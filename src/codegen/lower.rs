//! Imperative lowering (stage S5).
//!
//! Walks the loop-nest AST and, for each statement call, emits the
//! statement's expression tree against the buffer-access model: modular
//! ring indexing with floor-remainder semantics, phase offsets on
//! streaming arrays inside `process`, and conditional materialization
//! through temporaries.

use crate::frontend::types::Dim;
use crate::polyhedral::matrix::AffineMatrix;
use crate::polyhedral::model::{Array, ArrayId, Expr, Model, PrimitiveOp, Statement, StmtId};
use crate::codegen::ast::{Builder, CBinOp, CExpr, CStmt, CType, CUnOp};
use crate::transform::buffers::BufferInfo;
use crate::transform::scheduler::LoopNode;
use crate::utils::errors::{CompileResult, EmitError};
use std::collections::HashMap;

/// Name of the state-struct parameter in generated procedures.
pub const STATE_ARG: &str = "s";

/// Floor remainder on integers: the result is non-negative whenever the
/// divisor is positive, so ring indices wrap correctly for the negative
/// positions that phase subtraction produces at initialization.
pub fn floor_rem_i64(x: i64, y: i64) -> i64 {
    let m = x % y;
    if m != 0 && (m < 0) != (y < 0) {
        m + y
    } else {
        m
    }
}

/// Floor remainder on reals: `x - floor(x/y)*y`.
pub fn floor_rem_f64(x: f64, y: f64) -> f64 {
    x - (x / y).floor() * y
}

/// Lowers scheduled statements into imperative code.
pub struct Lowering<'m> {
    model: &'m Model,
    buffers: &'m HashMap<String, BufferInfo>,
    /// Inside the periodic body: phase offsets apply and accesses are
    /// rebased from inner-period coordinates.
    in_period: bool,
}

impl<'m> Lowering<'m> {
    pub fn new(model: &'m Model, buffers: &'m HashMap<String, BufferInfo>) -> Self {
        Self { model, buffers, in_period: false }
    }

    pub fn set_in_period(&mut self, in_period: bool) {
        self.in_period = in_period;
    }

    fn info(&self, array: &Array) -> CompileResult<&BufferInfo> {
        self.buffers
            .get(&array.name)
            .ok_or_else(|| EmitError::new(format!("No buffer info for '{}'.", array.name)).into())
    }

    /// Emit a whole loop-nest tree into the builder.
    pub fn generate_nest(&self, nest: &LoopNode, ctx: &mut Builder) -> CompileResult<()> {
        match nest {
            LoopNode::Block(nodes) => {
                for node in nodes {
                    self.generate_nest(node, ctx)?;
                }
                Ok(())
            }
            LoopNode::For { var, lower, upper, step, body } => {
                ctx.push();
                for node in body {
                    self.generate_nest(node, ctx)?;
                }
                let body = ctx.pop();
                ctx.add(CStmt::For {
                    var: loop_var(*var),
                    lower: CExpr::IntLit(*lower),
                    upper: CExpr::IntLit(*upper),
                    step: *step,
                    body,
                });
                Ok(())
            }
            LoopNode::If { cond, body } => {
                ctx.push();
                for node in body {
                    self.generate_nest(node, ctx)?;
                }
                let body = ctx.pop();
                let cond_expr = CExpr::binary(
                    CBinOp::Ge,
                    row_to_cexpr(cond),
                    CExpr::IntLit(0),
                );
                ctx.add(CStmt::If { cond: cond_expr, then_body: body, else_body: Vec::new() });
                Ok(())
            }
            LoopNode::StmtCall { stmt, index } => {
                let index: Vec<CExpr> = index.iter().map(row_to_cexpr).collect();
                self.generate_statement(*stmt, &index, ctx)
            }
        }
    }

    /// Emit one statement instance at the given index vector.
    pub fn generate_statement(
        &self,
        id: StmtId,
        index: &[CExpr],
        ctx: &mut Builder,
    ) -> CompileResult<()> {
        let stmt = self.model.statement(id);

        // Input statements materialize one element from the host channel
        // into their own cell; host function calls fall through to the
        // general expression path.
        if let Expr::ExternalCall { source, .. } = &stmt.expr {
            if source.array == stmt.write.array {
                if let Some(channel) = self.model.array(source.array).input_channel {
                    let target = self.access_for(stmt, &stmt.write, index, ctx)?;
                    ctx.add_expr(CExpr::call(
                        "input",
                        vec![CExpr::IntLit(channel as i64), target.address_of()],
                    ));
                    return Ok(());
                }
            }
        }

        let value = self.generate_expression(stmt, &stmt.expr, index, ctx)?;
        let target = self.access_for(stmt, &stmt.write, index, ctx)?;
        ctx.add_expr(target.assign(value));
        Ok(())
    }

    fn access_for(
        &self,
        stmt: &Statement,
        access: &crate::polyhedral::model::AccessRelation,
        index: &[CExpr],
        ctx: &mut Builder,
    ) -> CompileResult<CExpr> {
        let matrix = self.rebased(stmt, access.array, &access.matrix);
        let mapped = mapped_index(index, &matrix);
        self.buffer_access(access.array, mapped, ctx)
    }

    fn generate_expression(
        &self,
        stmt: &Statement,
        expr: &Expr,
        index: &[CExpr],
        ctx: &mut Builder,
    ) -> CompileResult<CExpr> {
        match expr {
            Expr::Primitive { .. } => self.generate_primitive(stmt, expr, index, ctx),
            Expr::IteratorRead { index: i } => index
                .get(*i)
                .cloned()
                .ok_or_else(|| EmitError::new("Iterator index out of range.").into()),
            Expr::ArrayRead { array, matrix } => {
                let matrix = self.rebased(stmt, *array, matrix);
                let mapped = mapped_index(index, &matrix);
                self.buffer_access(*array, mapped, ctx)
            }
            Expr::ConstInt(v) => Ok(CExpr::IntLit(*v)),
            Expr::ConstReal(v) => Ok(CExpr::RealLit(*v)),
            Expr::ConstBool(v) => Ok(CExpr::BoolLit(*v)),
            Expr::ExternalCall { name, source } => {
                let matrix = self.rebased(stmt, source.array, &source.matrix);
                let mapped = mapped_index(index, &matrix);
                let cell = self.buffer_access(source.array, mapped, ctx)?;
                Ok(CExpr::call(name.clone(), vec![cell.address_of()]))
            }
        }
    }

    fn generate_primitive(
        &self,
        stmt: &Statement,
        expr: &Expr,
        index: &[CExpr],
        ctx: &mut Builder,
    ) -> CompileResult<CExpr> {
        let Expr::Primitive { op, operands, ty } = expr else {
            return Err(EmitError::new("Expected a primitive expression.").into());
        };

        match op {
            PrimitiveOp::LogicAnd | PrimitiveOp::LogicOr => {
                let lhs = self.generate_expression(stmt, &operands[0], index, ctx)?;
                let rhs = self.generate_expression(stmt, &operands[1], index, ctx)?;
                let op = if *op == PrimitiveOp::LogicAnd { CBinOp::And } else { CBinOp::Or };
                return Ok(CExpr::binary(op, lhs, rhs));
            }
            PrimitiveOp::Conditional => {
                // Materialize a temporary; only the taken arm is
                // evaluated, and each arm assigns its own value.
                let result = ctx.new_var(CType::from_prim(*ty));
                let cond = self.generate_expression(stmt, &operands[0], index, ctx)?;

                ctx.push();
                let then_value = self.generate_expression(stmt, &operands[1], index, ctx)?;
                ctx.add_expr(CExpr::id(&result).assign(then_value));
                let then_body = ctx.pop();

                ctx.push();
                let else_value = self.generate_expression(stmt, &operands[2], index, ctx)?;
                ctx.add_expr(CExpr::id(&result).assign(else_value));
                let else_body = ctx.pop();

                ctx.add(CStmt::If { cond, then_body, else_body });
                return Ok(CExpr::id(result));
            }
            _ => {}
        }

        let mut args = Vec::with_capacity(operands.len());
        for operand in operands {
            args.push(self.generate_expression(stmt, operand, index, ctx)?);
        }
        let operand_ty = |i: usize| operands[i].prim_type(self.model);

        let result = match op {
            PrimitiveOp::Negate => {
                let op = if ty == &crate::frontend::types::PrimType::Bool {
                    CUnOp::Not
                } else {
                    CUnOp::Neg
                };
                CExpr::Unary { op, operand: Box::new(args.remove(0)) }
            }
            PrimitiveOp::Add => CExpr::binary(CBinOp::Add, args.remove(0), args.remove(0)),
            PrimitiveOp::Subtract => CExpr::binary(CBinOp::Sub, args.remove(0), args.remove(0)),
            PrimitiveOp::Multiply => CExpr::binary(CBinOp::Mul, args.remove(0), args.remove(0)),
            PrimitiveOp::CompareG => CExpr::binary(CBinOp::Gt, args.remove(0), args.remove(0)),
            PrimitiveOp::CompareGeq => CExpr::binary(CBinOp::Ge, args.remove(0), args.remove(0)),
            PrimitiveOp::CompareL => CExpr::binary(CBinOp::Lt, args.remove(0), args.remove(0)),
            PrimitiveOp::CompareLeq => CExpr::binary(CBinOp::Le, args.remove(0), args.remove(0)),
            PrimitiveOp::CompareEq => CExpr::binary(CBinOp::Eq, args.remove(0), args.remove(0)),
            PrimitiveOp::CompareNeq => CExpr::binary(CBinOp::Ne, args.remove(0), args.remove(0)),
            PrimitiveOp::Divide => {
                // All-integer division promotes to real first.
                let mut lhs = args.remove(0);
                let rhs = args.remove(0);
                if !operand_ty(0).is_real() && !operand_ty(1).is_real() {
                    lhs = CExpr::Cast { ty: CType::Double, expr: Box::new(lhs) };
                }
                CExpr::binary(CBinOp::Div, lhs, rhs)
            }
            PrimitiveOp::DivideInteger => {
                let division =
                    CExpr::binary(CBinOp::Div, args.remove(0), args.remove(0));
                if !operand_ty(0).is_real() && !operand_ty(1).is_real() {
                    division
                } else {
                    CExpr::Cast { ty: CType::Int, expr: Box::new(division) }
                }
            }
            PrimitiveOp::Modulo => CExpr::call("remainder", args),
            PrimitiveOp::Raise => CExpr::call("pow", args),
            PrimitiveOp::Floor => {
                if operand_ty(0).is_real() {
                    CExpr::call("floor", args)
                } else {
                    args.remove(0)
                }
            }
            PrimitiveOp::Ceil => {
                if operand_ty(0).is_real() {
                    CExpr::call("ceil", args)
                } else {
                    args.remove(0)
                }
            }
            PrimitiveOp::Abs => CExpr::call("abs", args),
            PrimitiveOp::Max => CExpr::call("max", args),
            PrimitiveOp::Min => CExpr::call("min", args),
            PrimitiveOp::Log => CExpr::call("log", args),
            PrimitiveOp::Log2 => CExpr::call("log2", args),
            PrimitiveOp::Log10 => CExpr::call("log10", args),
            PrimitiveOp::Exp => CExpr::call("exp", args),
            PrimitiveOp::Exp2 => CExpr::call("exp2", args),
            PrimitiveOp::Sqrt => CExpr::call("sqrt", args),
            PrimitiveOp::Sin => CExpr::call("sin", args),
            PrimitiveOp::Cos => CExpr::call("cos", args),
            PrimitiveOp::Tan => CExpr::call("tan", args),
            PrimitiveOp::Asin => CExpr::call("asin", args),
            PrimitiveOp::Acos => CExpr::call("acos", args),
            PrimitiveOp::Atan => CExpr::call("atan", args),
            other => {
                return Err(EmitError::new(format!(
                    "Unexpected primitive op: {:?}.",
                    other
                ))
                .into())
            }
        };
        Ok(result)
    }

    /// Rebase an access for the periodic body: the sink's streaming
    /// coordinate is an inner-period index, so each affected row gains
    /// `coef * init_sink`; rings with a rotating phase subtract the
    /// producer's init count, which the phase variable carries instead.
    fn rebased(
        &self,
        stmt: &Statement,
        array: ArrayId,
        matrix: &AffineMatrix,
    ) -> AffineMatrix {
        let array = self.model.array(array);
        if !self.in_period || !array.is_infinite {
            return matrix.clone();
        }
        let Some(sink_dim) = stmt.dimension else {
            return matrix.clone();
        };
        let Some(stream_row) = array.size.iter().position(Dim::is_infinite) else {
            return matrix.clone();
        };

        let mut rebased = matrix.clone();
        for row in 0..rebased.out_dim {
            let coef = rebased.coef(row, sink_dim);
            if coef != 0 {
                let mut c = rebased.constant(row) + coef * stmt.init_count;
                if row == stream_row {
                    let has_phase = self
                        .buffers
                        .get(&array.name)
                        .map(|b| b.has_phase)
                        .unwrap_or(false);
                    if has_phase {
                        let producer_init = array
                            .producer
                            .map(|p| self.model.statement(p).init_count)
                            .unwrap_or(0);
                        c -= producer_init;
                    }
                }
                rebased.set_constant(row, c);
            }
        }
        rebased
    }

    /// An element access into an array's ring buffer.
    fn buffer_access(
        &self,
        id: ArrayId,
        mut index: Vec<CExpr>,
        _ctx: &mut Builder,
    ) -> CompileResult<CExpr> {
        let array = self.model.array(id);
        let info = *self.info(array)?;

        let mut base = CExpr::id(array.name.clone());
        if !info.on_stack {
            base = CExpr::id(STATE_ARG).arrow(array.name.clone());
        }

        if array.is_scalar_buffer() {
            return Ok(base);
        }

        let stream_dim = array.size.iter().position(Dim::is_infinite);

        if self.in_period && info.has_phase {
            let dim = stream_dim.expect("phase implies a streaming dimension");
            let phase = CExpr::id(STATE_ARG).arrow(format!("{}_ph", array.name));
            index[dim] = index[dim].clone().add(phase);
        }

        for (dim, entry) in index.iter_mut().enumerate() {
            let is_streaming = stream_dim == Some(dim);
            let domain_size = if is_streaming {
                array.period
            } else {
                array.size[dim].extent().unwrap_or(0)
            };
            let buffer_size = array.buffer_size[dim];

            if buffer_size == 1 {
                *entry = CExpr::IntLit(0);
                continue;
            }

            let may_wrap = buffer_size < domain_size || is_streaming;
            if may_wrap {
                *entry = CExpr::call(
                    "remainder",
                    vec![entry.clone(), CExpr::IntLit(buffer_size)],
                );
            }
        }

        Ok(base.index(index))
    }
}

/// Index expressions through an affine map: one output component per
/// row, `sum(coef * idx) + constant`.
pub fn mapped_index(index: &[CExpr], map: &AffineMatrix) -> Vec<CExpr> {
    assert_eq!(index.len(), map.in_dim);
    let mut out = Vec::with_capacity(map.out_dim);
    for row in 0..map.out_dim {
        let mut value: Option<CExpr> = None;
        for (col, idx) in index.iter().enumerate() {
            let coef = map.coef(row, col);
            if coef == 0 {
                continue;
            }
            let mut term = idx.clone();
            if coef != 1 {
                term = term.mul(CExpr::IntLit(coef));
            }
            value = Some(match value {
                Some(v) => v.add(term),
                None => term,
            });
        }
        let constant = map.constant(row);
        let expr = match value {
            Some(v) if constant != 0 => v.add(CExpr::IntLit(constant)),
            Some(v) => v,
            None => CExpr::IntLit(constant),
        };
        out.push(expr);
    }
    out
}

fn loop_var(index: usize) -> String {
    format!("i{}", index)
}

/// A 1-row affine map over loop variables as a C expression.
fn row_to_cexpr(row: &AffineMatrix) -> CExpr {
    let vars: Vec<CExpr> = (0..row.in_dim).map(|i| CExpr::id(loop_var(i))).collect();
    mapped_index(&vars, row).remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_rem_i64() {
        assert_eq!(floor_rem_i64(-1, 4), 3);
        assert_eq!(floor_rem_i64(1, -4), -3);
        assert_eq!(floor_rem_i64(7, 4), 3);
        assert_eq!(floor_rem_i64(-8, 4), 0);
        // Sign follows the divisor; range is [0, |y|) for positive y.
        for x in -20..20 {
            for y in [1, 2, 3, 7] {
                let r = floor_rem_i64(x, y);
                assert!((0..y).contains(&r), "rem({}, {}) = {}", x, y, r);
                assert_eq!((x - r) % y, 0);
            }
        }
    }

    #[test]
    fn test_floor_rem_f64() {
        assert!((floor_rem_f64(-7.5, 2.0) - 0.5).abs() < 1e-12);
        assert!((floor_rem_f64(7.5, 2.0) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_mapped_index() {
        let mut map = AffineMatrix::zero(2, 2);
        map.set_coef(0, 0, 2);
        map.set_constant(0, 1);
        map.set_coef(1, 1, 1);
        let idx = vec![CExpr::id("i"), CExpr::id("j")];
        let mapped = mapped_index(&idx, &map);
        assert_eq!(mapped.len(), 2);
        // First component is 2*i + 1.
        match &mapped[0] {
            CExpr::Binary { op: CBinOp::Add, rhs, .. } => {
                assert!(matches!(**rhs, CExpr::IntLit(1)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_mapped_index_constant_row() {
        let map = AffineMatrix::row_constant(5, 1);
        let mapped = mapped_index(&[CExpr::id("i")], &map);
        assert!(matches!(mapped[0], CExpr::IntLit(5)));
    }
}
