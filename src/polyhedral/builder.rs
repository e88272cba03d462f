//! Polyhedral model construction (stage S2).
//!
//! Walks the typed AST and produces one statement plus one array per
//! materialized value: the entry's inputs, every referenced top-level
//! expression symbol, reduction accumulators, and the entry's own result
//! (which becomes the designated output array, created last).
//!
//! Lowering is frame-based: a sub-expression of shape `S` is lowered
//! against an affine map from the enclosing statement's domain
//! coordinates to `S`-coordinates. Slicing and transposition compose
//! offset and permutation maps onto that frame; window iterators bind
//! views whose streaming coordinate is `hop * i + j`. Monomorphized
//! function calls are inlined.

use crate::frontend::ast::{BinOp, Node, NodeKind, SymbolKind};
use crate::frontend::checker::Session;
use crate::frontend::types::{Dim, PrimType, Type};
use crate::polyhedral::matrix::AffineMatrix;
use crate::polyhedral::model::{
    AccessRelation, Array, ArrayId, Expr, Model, PrimitiveOp, Statement, StmtId,
};
use crate::utils::errors::{CompileResult, EmitError, PolyhedralError, PolyhedralErrorKind};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// A stream value viewed through an array: the array coordinate of value
/// element `v`, at domain point `x`, is `base(x) + value_map(v)`.
#[derive(Debug, Clone)]
struct View {
    array: ArrayId,
    base: AffineMatrix,
    value_map: AffineMatrix,
}

impl View {
    /// Whole-array view for a value stored under a layout permutation:
    /// array dimension `r` holds value dimension `perm[r]`. Scalars pass
    /// an empty permutation and a rank-1 array.
    fn of_array(array: ArrayId, rank: usize, perm: &[usize]) -> Self {
        let mut value_map = AffineMatrix::zero(perm.len(), rank);
        for (r, &j) in perm.iter().enumerate() {
            value_map.set_coef(r, j, 1);
        }
        Self { array, base: AffineMatrix::zero(0, rank), value_map }
    }

    /// The access matrix for reading this view under a frame from the
    /// current statement's domain to value coordinates.
    fn read(&self, frame: &AffineMatrix) -> AffineMatrix {
        let base = self.base.pad_inputs(frame.in_dim);
        base.add(&self.value_map.compose(frame))
    }
}

/// A name binding visible while lowering.
#[derive(Debug, Clone)]
enum Binding<'s> {
    /// A stream value backed by an array.
    View(View),
    /// A scalar expression over the domain coordinates of the statement
    /// that created it (a prefix of any statement it is used in).
    Scalar(Expr),
    /// A 1-D integer sequence `v -> row(x) + v` (range iterator values).
    Affine(AffineMatrix),
    /// An unevaluated expression with its captured scope stack.
    Closure { node: &'s Node, env: Rc<Scopes<'s>> },
}

type Scopes<'s> = Vec<HashMap<String, Binding<'s>>>;

/// Builds the polyhedral model for one checked entry point.
pub struct ModelBuilder<'s> {
    session: &'s Session,
    model: Model,
    /// Environment symbol name to its lowered view.
    symbol_views: HashMap<String, View>,
    /// Symbols currently being lowered, to reject cyclic definitions.
    in_progress: HashSet<String>,
    scopes: Scopes<'s>,
    /// Domain of the statement currently being built.
    domain: Vec<Dim>,
    used_names: HashSet<String>,
    temp_counter: usize,
}

/// Build the model for a checked entry symbol (a monomorphized function
/// instance or a plain expression symbol) with the given argument types.
pub fn build_model(
    session: &Session,
    entry: &str,
    output_name: &str,
    args: &[Type],
) -> CompileResult<Model> {
    let mut builder = ModelBuilder {
        session,
        model: Model::new(),
        symbol_views: HashMap::new(),
        in_progress: HashSet::new(),
        scopes: vec![HashMap::new()],
        domain: Vec::new(),
        used_names: HashSet::new(),
        temp_counter: 0,
    };
    builder.build_entry(entry, output_name, args)?;
    Ok(builder.model)
}

impl<'s> ModelBuilder<'s> {
    fn arity(&self) -> usize {
        self.domain.len()
    }

    fn build_entry(
        &mut self,
        entry: &str,
        output_name: &str,
        args: &[Type],
    ) -> CompileResult<()> {
        let session = self.session;
        let symbol = session.env.get(entry).ok_or_else(|| {
            EmitError::new(format!("No such entry symbol: '{}'.", entry))
        })?;
        let source = symbol.source.as_ref().ok_or_else(|| {
            EmitError::new(format!("Entry symbol '{}' has no source.", entry))
        })?;
        let NodeKind::Statement { params, body, .. } = &source.kind else {
            return Err(EmitError::new("Entry symbol source is not a statement.").into());
        };

        if params.len() != args.len() {
            return Err(EmitError::new(format!(
                "Entry '{}' expects {} arguments, got {}.",
                entry,
                params.len(),
                args.len()
            ))
            .into());
        }

        // Inputs become arrays fed by the host, one channel each, with an
        // input statement materializing one element per iteration.
        for (channel, (param, ty)) in params.iter().zip(args).enumerate() {
            let view = self.build_input(param, ty, channel)?;
            self.scopes[0].insert(param.clone(), Binding::View(view));
        }

        let value_type = body.ty.clone().ok_or_else(|| {
            EmitError::new("Entry body is not typed; run the checker first.")
        })?;

        self.build_statement(output_name, &value_type, |builder, frame| {
            builder.lower_block(body, frame)
        })?;
        Ok(())
    }

    // ----- statement construction -----

    /// Canonical array layout for a value shape: the infinite dimension,
    /// if any, is rotated to the front. Returns (array dims, perm) where
    /// `perm[r]` is the value dimension stored at array dimension `r`.
    fn canonical_layout(shape: &[Dim]) -> (Vec<Dim>, Vec<usize>) {
        let infinite = shape.iter().position(Dim::is_infinite);
        let mut perm: Vec<usize> = Vec::with_capacity(shape.len());
        if let Some(k) = infinite {
            perm.push(k);
            perm.extend((0..shape.len()).filter(|&j| j != k));
        } else {
            perm.extend(0..shape.len());
        }
        let dims = perm.iter().map(|&j| shape[j]).collect();
        (dims, perm)
    }

    fn unique_name(&mut self, base: &str) -> String {
        let mut name = base.to_string();
        while !self.used_names.insert(name.clone()) {
            self.temp_counter += 1;
            name = format!("{}_a{}", base, self.temp_counter);
        }
        name
    }

    fn fresh_temp(&mut self, base: &str) -> String {
        self.temp_counter += 1;
        self.unique_name(&format!("{}{}", base, self.temp_counter))
    }

    /// Create an array plus the statement producing it. The callback
    /// lowers the defining expression against the initial frame mapping
    /// domain coordinates to value coordinates.
    fn build_statement<F>(
        &mut self,
        name: &str,
        ty: &Type,
        lower: F,
    ) -> CompileResult<View>
    where
        F: FnOnce(&mut Self, &AffineMatrix) -> CompileResult<Expr>,
    {
        let shape = ty.shape();
        let (dims, perm) = Self::canonical_layout(&shape);
        let domain = if dims.is_empty() { vec![Dim::Finite(1)] } else { dims };
        let rank = domain.len();

        // Frame from domain coordinates to value coordinates: the inverse
        // of the layout permutation; scalars get an empty frame.
        let frame = if shape.is_empty() {
            AffineMatrix::zero(rank, 0)
        } else {
            let mut inverse = vec![0; perm.len()];
            for (r, &j) in perm.iter().enumerate() {
                inverse[j] = r;
            }
            AffineMatrix::permutation(&inverse, rank)
        };

        let saved_domain = std::mem::replace(&mut self.domain, domain.clone());
        let result = lower(self, &frame);
        self.domain = saved_domain;
        let expr = result?;

        let array_name = self.unique_name(name);
        let array = self.model.add_array(Array {
            name: array_name,
            ty: ty.elem_type(),
            size: domain.clone(),
            period: 0,
            period_offset: 0,
            buffer_size: Vec::new(),
            is_infinite: domain.iter().any(Dim::is_infinite),
            inter_period_dependency: false,
            producer: None,
            input_channel: None,
        });
        let stmt = self.model.add_statement(Statement {
            name: String::new(),
            domain,
            expr,
            write: AccessRelation { array, matrix: AffineMatrix::identity(rank) },
            dimension: None,
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        });
        self.model.array_mut(array).producer = Some(stmt);

        let view_perm = if shape.is_empty() { Vec::new() } else { perm };
        Ok(View::of_array(array, rank, &view_perm))
    }

    fn build_input(&mut self, name: &str, ty: &Type, channel: usize) -> CompileResult<View> {
        let shape = ty.shape();
        let (dims, perm) = Self::canonical_layout(&shape);
        let domain = if dims.is_empty() { vec![Dim::Finite(1)] } else { dims };
        let rank = domain.len();

        let array_name = self.unique_name(name);
        let array = self.model.add_array(Array {
            name: array_name,
            ty: ty.elem_type(),
            size: domain.clone(),
            period: 0,
            period_offset: 0,
            buffer_size: Vec::new(),
            is_infinite: domain.iter().any(Dim::is_infinite),
            inter_period_dependency: false,
            producer: None,
            input_channel: Some(channel),
        });
        let stmt = self.model.add_statement(Statement {
            name: String::new(),
            domain: domain.clone(),
            expr: Expr::ExternalCall {
                name: name.to_string(),
                source: AccessRelation { array, matrix: AffineMatrix::identity(rank) },
            },
            write: AccessRelation { array, matrix: AffineMatrix::identity(rank) },
            dimension: None,
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        });
        self.model.array_mut(array).producer = Some(stmt);

        let view_perm = if shape.is_empty() { Vec::new() } else { perm };
        Ok(View::of_array(array, rank, &view_perm))
    }

    // ----- symbols -----

    fn lower_symbol(&mut self, name: &str) -> CompileResult<View> {
        if let Some(view) = self.symbol_views.get(name) {
            return Ok(view.clone());
        }
        if !self.in_progress.insert(name.to_string()) {
            return Err(PolyhedralError::new(
                PolyhedralErrorKind::NonAffineAccess,
                format!("Cyclic definition of '{}'.", name),
            )
            .into());
        }

        let session = self.session;
        let symbol = session.env.get(name).ok_or_else(|| {
            EmitError::new(format!("Unknown symbol '{}'.", name))
        })?;
        if symbol.kind != SymbolKind::Expression {
            self.in_progress.remove(name);
            return Err(EmitError::new(format!(
                "Symbol '{}' cannot be used as a value.",
                name
            ))
            .into());
        }
        let source = symbol.source.as_ref().expect("expression symbol has source");
        let ty = source.ty.clone().ok_or_else(|| {
            EmitError::new(format!("Symbol '{}' is untyped; run the checker first.", name))
        })?;
        let NodeKind::Statement { body, .. } = &source.kind else {
            return Err(EmitError::new("Symbol source is not a statement.").into());
        };

        // Top-level symbols are closed; lower them in a fresh scope.
        let saved_scopes = std::mem::replace(&mut self.scopes, vec![HashMap::new()]);
        let result = self.build_statement(name, &ty, |builder, frame| {
            builder.lower_block(body, frame)
        });
        self.scopes = saved_scopes;
        self.in_progress.remove(name);

        let view = result?;
        self.symbol_views.insert(name.to_string(), view.clone());
        Ok(view)
    }

    // ----- scope helpers -----

    fn find_binding(&self, name: &str) -> Option<Binding<'s>> {
        for scope in self.scopes.iter().rev() {
            if let Some(b) = scope.get(name) {
                return Some(b.clone());
            }
        }
        None
    }

    fn bind(&mut self, name: impl Into<String>, binding: Binding<'s>) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.into(), binding);
    }

    fn snapshot(&self) -> Rc<Scopes<'s>> {
        Rc::new(self.scopes.clone())
    }

    fn with_scopes<R>(
        &mut self,
        scopes: Scopes<'s>,
        f: impl FnOnce(&mut Self) -> CompileResult<R>,
    ) -> CompileResult<R> {
        let saved = std::mem::replace(&mut self.scopes, scopes);
        let result = f(self);
        self.scopes = saved;
        result
    }

    // ----- expression lowering -----

    fn lower_block(&mut self, node: &'s Node, frame: &AffineMatrix) -> CompileResult<Expr> {
        let NodeKind::ExpressionBlock { stmts, value } = &node.kind else {
            return Err(EmitError::new("Expected an expression block.").into());
        };
        self.scopes.push(HashMap::new());
        for stmt in stmts {
            if let NodeKind::Statement { name, params, body } = &stmt.kind {
                if params.is_empty() {
                    // Each local closes over the scopes so far, so later
                    // locals see earlier ones.
                    let env = self.snapshot();
                    self.bind(name.clone(), Binding::Closure { node: &**body, env });
                }
            }
        }
        let result = self.lower_expr(value, frame);
        self.scopes.pop();
        result
    }

    fn lower_expr(&mut self, node: &'s Node, frame: &AffineMatrix) -> CompileResult<Expr> {
        match &node.kind {
            NodeKind::IntNum(v) => Ok(Expr::ConstInt(*v)),
            NodeKind::RealNum(v) => Ok(Expr::ConstReal(*v)),
            NodeKind::Identifier(name) => self.lower_identifier(name, frame),
            NodeKind::Binary(op, lhs, rhs) => self.lower_binary(node, *op, lhs, rhs, frame),
            NodeKind::Negate(operand) => {
                let inner = self.lower_operand(operand, frame)?;
                Ok(Expr::Primitive {
                    op: PrimitiveOp::Negate,
                    operands: vec![inner],
                    ty: node_elem(node),
                })
            }
            NodeKind::Range { .. } => {
                let row = self.range_base_row(node)?;
                let position = frame.row(0);
                Ok(self.affine_row_to_expr(&row.pad_inputs(self.arity()).add(&position)))
            }
            NodeKind::Hash { .. } => match &node.ty {
                Some(Type::Int(Some(v))) => Ok(Expr::ConstInt(*v)),
                _ => Err(EmitError::new("Extent expression lost its constant.").into()),
            },
            NodeKind::Slice { .. } | NodeKind::Transpose { .. } => {
                let view = self.lower_view(node)?;
                Ok(Expr::ArrayRead { array: view.array, matrix: view.read(frame) })
            }
            NodeKind::Call { .. } => self.lower_call(node, frame),
            NodeKind::For { .. } => self.lower_for(node, frame),
            NodeKind::Reduce { .. } => self.lower_reduce(node),
            NodeKind::ExpressionBlock { .. } => self.lower_block(node, frame),
            _ => Err(EmitError::new("Unexpected expression kind in lowering.").into()),
        }
    }

    fn lower_identifier(&mut self, name: &str, frame: &AffineMatrix) -> CompileResult<Expr> {
        if let Some(binding) = self.find_binding(name) {
            return match binding {
                Binding::View(view) => {
                    Ok(Expr::ArrayRead { array: view.array, matrix: view.read(frame) })
                }
                Binding::Scalar(expr) => Ok(expr),
                Binding::Affine(row) => {
                    let row = row.pad_inputs(self.arity()).add(&frame.row(0));
                    Ok(self.affine_row_to_expr(&row))
                }
                Binding::Closure { node, env } => {
                    self.with_scopes((*env).clone(), |b| b.lower_expr(node, frame))
                }
            };
        }
        let view = self.lower_symbol(name)?;
        Ok(Expr::ArrayRead { array: view.array, matrix: view.read(frame) })
    }

    /// Lower one operand of a broadcasting operation: operands of the
    /// result's shape share its frame, scalars get an empty frame.
    fn lower_operand(&mut self, node: &'s Node, frame: &AffineMatrix) -> CompileResult<Expr> {
        let scalar = match &node.ty {
            Some(Type::Stream(_)) | Some(Type::Range(_)) => false,
            _ => true,
        };
        if scalar {
            let empty = AffineMatrix::zero(frame.in_dim, 0);
            self.lower_expr(node, &empty)
        } else {
            self.lower_expr(node, frame)
        }
    }

    fn lower_binary(
        &mut self,
        node: &'s Node,
        op: BinOp,
        lhs: &'s Node,
        rhs: &'s Node,
        frame: &AffineMatrix,
    ) -> CompileResult<Expr> {
        let prim = match op {
            BinOp::Add => PrimitiveOp::Add,
            BinOp::Subtract => PrimitiveOp::Subtract,
            BinOp::Multiply => PrimitiveOp::Multiply,
            BinOp::Divide => PrimitiveOp::Divide,
            BinOp::Raise => PrimitiveOp::Raise,
            BinOp::Lesser => PrimitiveOp::CompareL,
            BinOp::Greater => PrimitiveOp::CompareG,
            BinOp::LesserEqual => PrimitiveOp::CompareLeq,
            BinOp::GreaterEqual => PrimitiveOp::CompareGeq,
            BinOp::Equal => PrimitiveOp::CompareEq,
            BinOp::NotEqual => PrimitiveOp::CompareNeq,
        };
        let lhs = self.lower_operand(lhs, frame)?;
        let rhs = self.lower_operand(rhs, frame)?;
        Ok(Expr::Primitive { op: prim, operands: vec![lhs, rhs], ty: node_elem(node) })
    }

    fn lower_call(&mut self, node: &'s Node, frame: &AffineMatrix) -> CompileResult<Expr> {
        let NodeKind::Call { callee, args } = &node.kind else { unreachable!() };
        let name = callee
            .as_identifier()
            .ok_or_else(|| EmitError::new("Call callee is not an identifier."))?;

        // Host-supplied externals: the call takes the address of the
        // accessed argument cell.
        if let Some(sym) = self.session.env.get(name) {
            if sym.kind == SymbolKind::External {
                let view = self.lower_view(&args[0])?;
                return Ok(Expr::ExternalCall {
                    name: name.to_string(),
                    source: AccessRelation {
                        array: view.array,
                        matrix: view.read(frame),
                    },
                });
            }
        }

        if let Some(op) = builtin_op(name) {
            let mut operands = Vec::with_capacity(args.len());
            for arg in args {
                operands.push(self.lower_operand(arg, frame)?);
            }
            return Ok(Expr::Primitive { op, operands, ty: node_elem(node) });
        }

        // A monomorphized user function: inline its body with parameters
        // bound to closures over the call-site scope.
        let session = self.session;
        let symbol = session.env.get(name).ok_or_else(|| {
            EmitError::new(format!("Unknown function '{}' at lowering.", name))
        })?;
        let source = symbol
            .source
            .as_ref()
            .ok_or_else(|| EmitError::new(format!("Function '{}' has no source.", name)))?;
        let NodeKind::Statement { params, body, .. } = &source.kind else {
            return Err(EmitError::new("Function source is not a statement.").into());
        };

        let env = self.snapshot();
        let mut param_scope: HashMap<String, Binding<'s>> = HashMap::new();
        for (param, arg) in params.iter().zip(args) {
            param_scope.insert(param.clone(), Binding::Closure { node: arg, env: env.clone() });
        }
        self.with_scopes(vec![param_scope], |b| b.lower_block(body, frame))
    }

    // ----- views -----

    /// Lower a node to an array view. Nodes that are not reachable by
    /// view composition are materialized into their own statement when
    /// they are closed over the current scope.
    fn lower_view(&mut self, node: &'s Node) -> CompileResult<View> {
        match &node.kind {
            NodeKind::Identifier(name) => {
                if let Some(binding) = self.find_binding(name) {
                    return match binding {
                        Binding::View(view) => Ok(view),
                        Binding::Closure { node, env } => {
                            self.with_scopes((*env).clone(), |b| b.lower_view(node))
                        }
                        Binding::Scalar(_) | Binding::Affine(_) => Err(PolyhedralError::new(
                            PolyhedralErrorKind::NonAffineAccess,
                            format!("'{}' is not an addressable stream.", name),
                        )
                        .into()),
                    };
                }
                self.lower_symbol(name)
            }
            NodeKind::Slice { object, selectors } => {
                let object_shape = shape_of(object);
                let view = self.lower_view(object)?;
                let map = self.slice_map(&object_shape, selectors)?;
                Ok(View {
                    array: view.array,
                    base: view.base,
                    value_map: view.value_map.compose(&map),
                })
            }
            NodeKind::Transpose { object, dims } => {
                let object_rank = shape_of(object).len();
                let view = self.lower_view(object)?;
                let map = transpose_map(object_rank, dims);
                Ok(View {
                    array: view.array,
                    base: view.base,
                    value_map: view.value_map.compose(&map),
                })
            }
            _ => {
                if self.is_closed(node) {
                    self.materialize_closed(node)
                } else {
                    Err(PolyhedralError::new(
                        PolyhedralErrorKind::NonAffineAccess,
                        "Expression is not addressable as a stream here.",
                    )
                    .into())
                }
            }
        }
    }

    fn materialize_closed(&mut self, node: &'s Node) -> CompileResult<View> {
        let ty = node
            .ty
            .clone()
            .ok_or_else(|| EmitError::new("Untyped expression at lowering."))?;
        let name = self.fresh_temp("tmp");
        let saved_scopes = std::mem::replace(&mut self.scopes, vec![HashMap::new()]);
        let result =
            self.build_statement(&name, &ty, |builder, frame| builder.lower_expr(node, frame));
        self.scopes = saved_scopes;
        result
    }

    /// Map from sliced (reduced) value coordinates to object coordinates.
    fn slice_map(
        &mut self,
        object_shape: &[Dim],
        selectors: &[Node],
    ) -> CompileResult<AffineMatrix> {
        // First work out the kept (post-reduction) dimensions.
        let mut offsets = Vec::with_capacity(object_shape.len());
        let mut kept = Vec::with_capacity(object_shape.len());
        for (dim, extent) in object_shape.iter().enumerate() {
            if let Some(sel) = selectors.get(dim) {
                match &sel.ty {
                    Some(Type::Int(Some(v))) => {
                        offsets.push(v - 1);
                        kept.push(false);
                    }
                    Some(Type::Range(r)) => {
                        let start = r.const_start().unwrap_or(1);
                        let end = r
                            .const_end()
                            .or_else(|| extent.extent())
                            .unwrap_or(start);
                        offsets.push(start - 1);
                        kept.push(end - start + 1 > 1);
                    }
                    _ => {
                        return Err(EmitError::new(
                            "Slice selector lost its constant.",
                        )
                        .into())
                    }
                }
            } else {
                offsets.push(0);
                kept.push(*extent != Dim::Finite(1));
            }
        }

        let in_dim = kept.iter().filter(|&&k| k).count();
        let mut map = AffineMatrix::zero(in_dim, object_shape.len());
        let mut next_input = 0;
        for (dim, &is_kept) in kept.iter().enumerate() {
            map.set_constant(dim, offsets[dim]);
            if is_kept {
                map.set_coef(dim, next_input, 1);
                next_input += 1;
            }
        }
        Ok(map)
    }

    // ----- ranges -----

    /// The base row of an affine 1-D integer sequence: a constant range
    /// literal or a range-valued iterator binding.
    fn range_base_row(&mut self, node: &'s Node) -> CompileResult<AffineMatrix> {
        match &node.kind {
            NodeKind::Range { .. } => match &node.ty {
                Some(Type::Range(r)) => {
                    let start = r.const_start().ok_or_else(|| {
                        EmitError::new("Non-constant range reached lowering.")
                    })?;
                    Ok(AffineMatrix::row_constant(start, self.arity()))
                }
                _ => Err(EmitError::new("Range expression lost its type.").into()),
            },
            NodeKind::Identifier(name) => match self.find_binding(name) {
                Some(Binding::Affine(row)) => Ok(row.pad_inputs(self.arity())),
                Some(Binding::Closure { node, env }) => {
                    self.with_scopes((*env).clone(), |b| b.range_base_row(node))
                }
                _ => Err(PolyhedralError::new(
                    PolyhedralErrorKind::NonAffineAccess,
                    format!("'{}' is not an affine iteration domain.", name),
                )
                .into()),
            },
            _ => Err(PolyhedralError::new(
                PolyhedralErrorKind::NonAffineAccess,
                "Iteration domain is not affine.",
            )
            .into()),
        }
    }

    // ----- iteration -----

    fn lower_for(&mut self, node: &'s Node, frame: &AffineMatrix) -> CompileResult<Expr> {
        let NodeKind::For { iterations, body } = &node.kind else { unreachable!() };

        // The pre-reduction result shape is [count] ++ body shape; the
        // only dimension reduction can drop is a count of one.
        let first_iter_ty = iterator_type(&iterations[0])?;
        let count_kept = first_iter_ty.count != Dim::Finite(1);
        let i_row = if count_kept {
            frame.row(0)
        } else {
            AffineMatrix::row_constant(0, self.arity())
        };
        let body_frame = if count_kept {
            let rows: Vec<usize> = (1..frame.out_dim).collect();
            frame.select_rows(&rows)
        } else {
            frame.clone()
        };

        self.scopes.push(HashMap::new());
        let result = (|builder: &mut Self| -> CompileResult<Expr> {
            for iteration in iterations {
                builder.bind_iterator(iteration, &i_row)?;
            }
            builder.lower_block(body, &body_frame)
        })(self);
        self.scopes.pop();
        result
    }

    fn bind_iterator(&mut self, node: &'s Node, i_row: &AffineMatrix) -> CompileResult<()> {
        let NodeKind::ForIteration { domain, .. } = &node.kind else {
            return Err(EmitError::new("Expected a for iteration.").into());
        };
        let it = iterator_type(node)?;
        let Some(id) = it.id.clone() else { return Ok(()) };
        let hop_i = i_row.scale(it.hop);

        match &domain.ty {
            Some(Type::Stream(domain_stream)) => {
                let view = self.lower_view(domain)?;
                let domain_rank = domain_stream.rank();

                // base' = base + value_map . (e0 * hop * i)
                let mut stream_step = AffineMatrix::zero(self.arity(), domain_rank);
                for j in 0..self.arity() {
                    stream_step.set_coef(0, j, hop_i.coef(0, j));
                }
                stream_step.set_constant(0, hop_i.constant(0));
                let base = view
                    .base
                    .pad_inputs(self.arity())
                    .add(&view.value_map.compose(&stream_step));

                // Window coordinates embed into domain coordinates; the
                // window dimension disappears when the take size is one.
                let window_kept = it.size > 1;
                let in_dim = if window_kept { domain_rank } else { domain_rank - 1 };
                let mut embed = AffineMatrix::zero(in_dim, domain_rank);
                let mut next = 0;
                if window_kept {
                    embed.set_coef(0, next, 1);
                    next += 1;
                }
                for dim in 1..domain_rank {
                    embed.set_coef(dim, next, 1);
                    next += 1;
                }

                let value_map = view.value_map.compose(&embed);
                self.bind(id, Binding::View(View { array: view.array, base, value_map }));
            }
            Some(Type::Range(_)) => {
                let base = self.range_base_row(domain)?;
                let row = base.pad_inputs(self.arity()).add(&hop_i);
                if it.size > 1 {
                    self.bind(id, Binding::Affine(row));
                } else {
                    let expr = self.affine_row_to_expr(&row);
                    self.bind(id, Binding::Scalar(expr));
                }
            }
            _ => {
                return Err(PolyhedralError::new(
                    PolyhedralErrorKind::NonAffineAccess,
                    "Unsupported iteration domain at lowering.",
                )
                .into())
            }
        }
        Ok(())
    }

    // ----- reduction -----

    fn lower_reduce(&mut self, node: &'s Node) -> CompileResult<Expr> {
        let NodeKind::Reduce { accumulator, element, domain, body } = &node.kind else {
            unreachable!()
        };

        let domain_view = self.lower_view(domain)?;
        let length = match &domain.ty {
            Some(Type::Stream(s)) if s.rank() == 1 => s.size[0]
                .extent()
                .ok_or_else(|| EmitError::new("Infinite reduction reached lowering."))?,
            _ => return Err(EmitError::new("Reduction domain is not a 1-D stream.").into()),
        };

        let outer = self.domain.clone();
        let n = outer.len();
        let m = n + 1;

        // Accumulator array over the enclosing domain plus the fold axis.
        let acc_name = self.fresh_temp("acc");
        let mut acc_dims = outer.clone();
        acc_dims.push(Dim::Finite(length));
        let acc = self.model.add_array(Array {
            name: acc_name,
            ty: PrimType::Real64,
            size: acc_dims.clone(),
            period: 0,
            period_offset: 0,
            buffer_size: Vec::new(),
            is_infinite: acc_dims.iter().any(Dim::is_infinite),
            inter_period_dependency: false,
            producer: None,
            input_channel: None,
        });

        let elem_read = |view: &View, fold_row: AffineMatrix| -> Expr {
            let frame = fold_row; // 1-row frame onto the 1-D domain value
            Expr::ArrayRead {
                array: view.array,
                matrix: view.base.pad_inputs(m).add(&view.value_map.compose(&frame)),
            }
        };

        // Seed: acc[o, 0] = elem[o, 0]
        let mut seed_domain = outer.clone();
        seed_domain.push(Dim::Finite(1));
        self.model.add_statement(Statement {
            name: String::new(),
            domain: seed_domain,
            expr: elem_read(&domain_view, AffineMatrix::row_select(n, m)),
            write: AccessRelation { array: acc, matrix: AffineMatrix::identity(m) },
            dimension: None,
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        });

        // Fold: acc[o, k+1] = body(acc[o, k], elem[o, k+1])
        let mut fold_domain = outer.clone();
        fold_domain.push(Dim::Finite(length - 1));
        let mut write = AffineMatrix::identity(m);
        write.set_constant(n, 1);

        let acc_read = Expr::ArrayRead { array: acc, matrix: AffineMatrix::identity(m) };
        let mut elem_row = AffineMatrix::row_select(n, m);
        elem_row.set_constant(0, 1);
        let elem_expr = elem_read(&domain_view, elem_row);

        let saved_domain = std::mem::replace(&mut self.domain, fold_domain.clone());
        self.scopes.push(HashMap::new());
        self.bind(accumulator.clone(), Binding::Scalar(acc_read));
        self.bind(element.clone(), Binding::Scalar(elem_expr));
        let body_frame = AffineMatrix::zero(m, 0);
        let body_expr = self.lower_block(body, &body_frame);
        self.scopes.pop();
        self.domain = saved_domain;
        let body_expr = body_expr?;

        let fold = self.model.add_statement(Statement {
            name: String::new(),
            domain: fold_domain,
            expr: body_expr,
            write: AccessRelation { array: acc, matrix: write },
            dimension: None,
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        });
        self.model.array_mut(acc).producer = Some(fold);

        // The reduction value is the last accumulator element.
        let result = AffineMatrix::identity(n)
            .stack(&AffineMatrix::row_constant(length - 1, n));
        Ok(Expr::ArrayRead { array: acc, matrix: result })
    }

    // ----- misc -----

    fn affine_row_to_expr(&self, row: &AffineMatrix) -> Expr {
        debug_assert_eq!(row.out_dim, 1);
        let mut terms: Vec<Expr> = Vec::new();
        for j in 0..row.in_dim {
            let c = row.coef(0, j);
            if c == 0 {
                continue;
            }
            let read = Expr::IteratorRead { index: j };
            terms.push(if c == 1 {
                read
            } else {
                Expr::Primitive {
                    op: PrimitiveOp::Multiply,
                    operands: vec![Expr::ConstInt(c), read],
                    ty: PrimType::Int,
                }
            });
        }
        let c = row.constant(0);
        if c != 0 || terms.is_empty() {
            terms.push(Expr::ConstInt(c));
        }
        terms
            .into_iter()
            .reduce(|a, b| Expr::Primitive {
                op: PrimitiveOp::Add,
                operands: vec![a, b],
                ty: PrimType::Int,
            })
            .expect("at least one term")
    }

    /// True if the node references no name bound in the current scope
    /// stack (environment symbols and builtins are fine).
    fn is_closed(&self, node: &Node) -> bool {
        let mut local: HashSet<String> = HashSet::new();
        self.is_closed_inner(node, &mut local)
    }

    fn is_closed_inner(&self, node: &Node, local: &mut HashSet<String>) -> bool {
        match &node.kind {
            NodeKind::Identifier(name) => {
                local.contains(name) || self.find_binding(name).is_none()
            }
            NodeKind::IntNum(_) | NodeKind::RealNum(_) => true,
            NodeKind::Binary(_, l, r) => {
                self.is_closed_inner(l, local) && self.is_closed_inner(r, local)
            }
            NodeKind::Negate(x) => self.is_closed_inner(x, local),
            NodeKind::Range { start, end } => {
                start.as_deref().map_or(true, |n| self.is_closed_inner(n, local))
                    && end.as_deref().map_or(true, |n| self.is_closed_inner(n, local))
            }
            NodeKind::Hash { object, dim } => {
                self.is_closed_inner(object, local)
                    && dim.as_deref().map_or(true, |n| self.is_closed_inner(n, local))
            }
            NodeKind::Transpose { object, .. } => self.is_closed_inner(object, local),
            NodeKind::Slice { object, selectors } => {
                self.is_closed_inner(object, local)
                    && selectors.iter().all(|s| self.is_closed_inner(s, local))
            }
            NodeKind::Call { args, .. } => args.iter().all(|a| self.is_closed_inner(a, local)),
            NodeKind::For { iterations, body } => {
                for it in iterations {
                    if let NodeKind::ForIteration { id, size, hop, domain } = &it.kind {
                        if !self.is_closed_inner(domain, local) {
                            return false;
                        }
                        for opt in [size, hop].into_iter().flatten() {
                            if !self.is_closed_inner(opt, local) {
                                return false;
                            }
                        }
                        if let Some(id) = id {
                            local.insert(id.clone());
                        }
                    }
                }
                self.is_closed_inner(body, local)
            }
            NodeKind::Reduce { accumulator, element, domain, body } => {
                if !self.is_closed_inner(domain, local) {
                    return false;
                }
                local.insert(accumulator.clone());
                local.insert(element.clone());
                self.is_closed_inner(body, local)
            }
            NodeKind::ExpressionBlock { stmts, value } => {
                for stmt in stmts {
                    if let NodeKind::Statement { name, params, body } = &stmt.kind {
                        if params.is_empty() && !self.is_closed_inner(body, local) {
                            return false;
                        }
                        local.insert(name.clone());
                    }
                }
                self.is_closed_inner(value, local)
            }
            NodeKind::Statement { body, .. } => self.is_closed_inner(body, local),
            NodeKind::ForIteration { domain, .. } => self.is_closed_inner(domain, local),
            NodeKind::Program(stmts) | NodeKind::StatementList(stmts) => {
                stmts.iter().all(|s| self.is_closed_inner(s, local))
            }
        }
    }
}

fn node_elem(node: &Node) -> PrimType {
    node.ty.as_ref().map(Type::elem_type).unwrap_or(PrimType::Real64)
}

fn shape_of(node: &Node) -> Vec<Dim> {
    node.ty.as_ref().map(Type::shape).unwrap_or_default()
}

fn iterator_type(node: &Node) -> CompileResult<crate::frontend::types::IteratorType> {
    match &node.ty {
        Some(Type::Iterator(it)) => Ok((**it).clone()),
        _ => Err(EmitError::new("For iteration is untyped; run the checker first.").into()),
    }
}

fn transpose_map(object_rank: usize, dims: &[i64]) -> AffineMatrix {
    // Result dimension order: selected dims first, then the rest.
    let mut order: Vec<usize> = dims.iter().map(|&d| d as usize - 1).collect();
    for d in 0..object_rank {
        if !order.contains(&d) {
            order.push(d);
        }
    }
    // Map from result coordinates to object coordinates: object dim
    // order[r] = result coord r.
    let mut map = AffineMatrix::zero(object_rank, object_rank);
    for (r, &obj_dim) in order.iter().enumerate() {
        map.set_coef(obj_dim, r, 1);
    }
    map
}

/// The primitive op implementing a builtin function, if the name is one.
pub fn builtin_op(name: &str) -> Option<PrimitiveOp> {
    Some(match name {
        "log" => PrimitiveOp::Log,
        "log2" => PrimitiveOp::Log2,
        "log10" => PrimitiveOp::Log10,
        "exp" => PrimitiveOp::Exp,
        "exp2" => PrimitiveOp::Exp2,
        "sqrt" => PrimitiveOp::Sqrt,
        "sin" => PrimitiveOp::Sin,
        "cos" => PrimitiveOp::Cos,
        "tan" => PrimitiveOp::Tan,
        "asin" => PrimitiveOp::Asin,
        "acos" => PrimitiveOp::Acos,
        "atan" => PrimitiveOp::Atan,
        "ceil" => PrimitiveOp::Ceil,
        "floor" => PrimitiveOp::Floor,
        "abs" => PrimitiveOp::Abs,
        "max" => PrimitiveOp::Max,
        "pow" => PrimitiveOp::Raise,
        _ => return None,
    })
}
