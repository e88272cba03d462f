//! Type and size checking (stage S1).
//!
//! Given a top-level symbol and argument types, infers the result type,
//! annotates every AST node with its semantic type, resolves builtin
//! overloads, and monomorphizes user functions per call site.
//!
//! Type errors are accumulated within one expression tree and abort that
//! tree through a recoverable `Abort` marker; the boundary of the
//! top-level check converts recorded diagnostics into a `CompileError`.

use crate::frontend::ast::{BinOp, Environment, Node, NodeKind, Symbol, SymbolKind};
use crate::frontend::types::{
    BuiltinGroup, BuiltinInstance, Dim, FunctionType, IteratorType, PrimType, RangeType,
    Signature, StreamType, Tag, Type,
};
use crate::utils::errors::{CompileError, TypeError, TypeErrorKind};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::rc::Rc;

/// Mutable compilation state threaded through the stages: the symbol
/// environment and the monomorphization counter.
#[derive(Debug)]
pub struct Session {
    pub env: Environment,
    func_counter: u64,
}

impl Session {
    pub fn new(env: Environment) -> Self {
        Self { env, func_counter: 0 }
    }

    /// Generate a fresh name for a monomorphized function instance.
    pub fn fresh_name(&mut self, base: &str) -> String {
        self.func_counter += 1;
        format!("{}_{}", base, self.func_counter)
    }
}

/// The builtin function groups of the language.
pub static BUILTINS: Lazy<Vec<BuiltinGroup>> = Lazy::new(|| {
    let mut groups = Vec::new();

    let unary_real = [
        "log", "log2", "log10", "exp", "exp2", "sqrt", "sin", "cos", "tan", "asin", "acos",
        "atan",
    ];
    for name in unary_real {
        groups.push(BuiltinGroup {
            name,
            overloads: vec![Signature { params: vec![Tag::Real], result: Tag::Real }],
        });
    }

    for name in ["ceil", "floor"] {
        groups.push(BuiltinGroup {
            name,
            overloads: vec![Signature { params: vec![Tag::Real], result: Tag::Int }],
        });
    }

    groups.push(BuiltinGroup {
        name: "abs",
        overloads: vec![
            Signature { params: vec![Tag::Int], result: Tag::Int },
            Signature { params: vec![Tag::Real], result: Tag::Real },
        ],
    });

    for name in ["max", "pow"] {
        groups.push(BuiltinGroup {
            name,
            overloads: vec![
                Signature { params: vec![Tag::Int, Tag::Int], result: Tag::Int },
                Signature { params: vec![Tag::Real, Tag::Real], result: Tag::Real },
            ],
        });
    }

    groups
});

/// Resolve a builtin overload against argument tags.
///
/// A candidate matches perfectly when all tags are equal, and with
/// promotion when every mismatch is integer-to-real. A perfect match wins
/// immediately; more than one promotion match is ambiguous.
pub fn overload_resolution(
    overloads: &[Signature],
    args: &[Tag],
) -> Result<Signature, TypeError> {
    let mut selected: Option<&Signature> = None;

    for candidate in overloads {
        if candidate.params.len() != args.len() {
            continue;
        }

        let mut ok = true;
        let mut perfect = true;
        for (&param, &arg) in candidate.params.iter().zip(args) {
            if param == arg {
                continue;
            }
            perfect = false;
            if arg == Tag::Int && param == Tag::Real {
                continue;
            }
            ok = false;
            break;
        }

        if perfect {
            return Ok(candidate.clone());
        }
        if ok {
            if selected.is_some() {
                return Err(TypeError::new(
                    TypeErrorKind::AmbiguousOverload,
                    "Ambiguous overloaded function call.",
                ));
            }
            selected = Some(candidate);
        }
    }

    selected.cloned().ok_or_else(|| {
        TypeError::new(TypeErrorKind::InvalidArguments, "Invalid arguments.")
    })
}

struct Scope {
    map: HashMap<String, Type>,
    parent: Option<usize>,
}

/// Marker for the bounded non-local exit of the checker: the error has
/// already been recorded, unwind to the top-level check boundary.
struct Abort;

type Check<T> = Result<T, Abort>;

const ROOT_SCOPE: usize = 0;

/// The type checker.
pub struct Checker<'s> {
    session: &'s mut Session,
    scopes: Vec<Scope>,
    current: usize,
    errors: Vec<TypeError>,
}

impl<'s> Checker<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        let mut root = Scope { map: HashMap::new(), parent: None };
        for group in BUILTINS.iter() {
            root.map.insert(group.name.to_string(), Type::BuiltinGroup(group.clone()));
        }
        Self { session, scopes: vec![root], current: ROOT_SCOPE, errors: Vec::new() }
    }

    /// Check a top-level symbol applied to the given argument types.
    pub fn check(&mut self, name: &str, args: &[Type]) -> Result<Type, CompileError> {
        self.check_entry(name, args).map(|(t, _)| t)
    }

    /// Check a top-level symbol and also return the name under which the
    /// checked entry is registered: the symbol itself for expressions,
    /// the fresh monomorphized instance for functions.
    pub fn check_entry(
        &mut self,
        name: &str,
        args: &[Type],
    ) -> Result<(Type, String), CompileError> {
        self.errors.clear();

        let line = 0;
        let result = (|| -> Check<(Type, String)> {
            let sym_type = self.symbol_type(name, line)?;
            if sym_type.is_function() {
                let (result, instance) = self.process_function(&sym_type, args, line)?;
                let entry = match &instance {
                    Some(Type::Function(f)) => f.name.clone(),
                    _ => name.to_string(),
                };
                Ok((result, entry))
            } else if args.is_empty() {
                Ok((sym_type, name.to_string()))
            } else {
                Err(self.fail(
                    TypeErrorKind::NotAFunction,
                    format!("'{}' is not a function.", name),
                    None,
                ))
            }
        })();

        match result {
            Ok(t) if self.errors.is_empty() => Ok(t),
            _ => Err(CompileError::Type(self.errors.first().cloned().unwrap_or_else(|| {
                TypeError::new(
                    TypeErrorKind::UndefinedName,
                    format!("Checking '{}' failed.", name),
                )
            }))),
        }
    }

    /// All diagnostics recorded by the last check.
    pub fn diagnostics(&self) -> &[TypeError] {
        &self.errors
    }

    fn report(&mut self, error: TypeError) {
        self.errors.push(error);
    }

    fn fail(
        &mut self,
        kind: TypeErrorKind,
        message: impl Into<String>,
        line: Option<usize>,
    ) -> Abort {
        let mut err = TypeError::new(kind, message);
        err.line = line;
        self.report(err);
        Abort
    }

    fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    // ----- scopes -----

    fn push_scope(&mut self, parent: usize) -> usize {
        self.scopes.push(Scope { map: HashMap::new(), parent: Some(parent) });
        let idx = self.scopes.len() - 1;
        let prev = self.current;
        self.current = idx;
        prev
    }

    fn restore_scope(&mut self, prev: usize) {
        self.current = prev;
    }

    fn bind(&mut self, name: impl Into<String>, ty: Type) {
        self.scopes[self.current].map.insert(name.into(), ty);
    }

    fn lookup(&self, name: &str) -> Option<Type> {
        let mut scope = Some(self.current);
        while let Some(idx) = scope {
            if let Some(t) = self.scopes[idx].map.get(name) {
                return Some(t.clone());
            }
            scope = self.scopes[idx].parent;
        }
        None
    }

    // ----- symbols -----

    /// The type of a top-level symbol, memoized on its source node.
    fn symbol_type(&mut self, name: &str, line: usize) -> Check<Type> {
        let Some(sym) = self.session.env.get(name) else {
            return Err(self.fail(
                TypeErrorKind::UndefinedName,
                format!("Name not in scope: '{}'.", name),
                Some(line),
            ));
        };

        if let Some(src) = &sym.source {
            if let Some(t) = &src.ty {
                return Ok(t.clone());
            }
        }

        match sym.kind {
            SymbolKind::Expression => {
                // Take the symbol out so processing cannot alias the
                // environment, then re-insert with its annotation.
                let mut sym = self.session.env.take(name).expect("symbol vanished");
                let mut source = sym.source.take().expect("expression without source");

                let prev = self.push_scope(ROOT_SCOPE);
                let result = match &mut source.kind {
                    NodeKind::Statement { body, .. } => self.process_block(body),
                    _ => Err(self.fail(
                        TypeErrorKind::InvalidExpression,
                        "Unexpected symbol source.",
                        Some(source.line),
                    )),
                };
                self.restore_scope(prev);

                if let Ok(t) = &result {
                    source.ty = Some(t.clone());
                }
                sym.source = Some(source);
                self.session.env.define(sym);
                result
            }
            SymbolKind::Function => {
                let body = match &sym.source.as_ref().unwrap().kind {
                    NodeKind::Statement { body, .. } => (**body).clone(),
                    _ => {
                        let line = sym.source.as_ref().unwrap().line;
                        return Err(self.fail(
                            TypeErrorKind::InvalidExpression,
                            "Unexpected symbol source.",
                            Some(line),
                        ));
                    }
                };
                let func = Type::Function(FunctionType {
                    name: sym.name.clone(),
                    params: sym.parameter_names.clone(),
                    body: Rc::new(body),
                    scope: ROOT_SCOPE,
                });
                if let Some(sym) = self.session.env.get_mut(name) {
                    if let Some(src) = &mut sym.source {
                        src.ty = Some(func.clone());
                    }
                }
                Ok(func)
            }
            SymbolKind::External => Err(self.fail(
                TypeErrorKind::InvalidExpression,
                format!("External function '{}' used as a value.", name),
                Some(line),
            )),
        }
    }

    // ----- functions -----

    /// Apply a function type to argument types. User functions are
    /// monomorphized: the body is cloned, checked under the bound
    /// parameters, and registered under a fresh name. Returns the result
    /// type and, for user functions, the instance name.
    fn process_function(
        &mut self,
        func: &Type,
        args: &[Type],
        line: usize,
    ) -> Check<(Type, Option<Type>)> {
        match func {
            Type::Function(f) => {
                if args.len() != f.params.len() {
                    return Err(self.fail(
                        TypeErrorKind::WrongArgCount,
                        format!(
                            "Wrong number of arguments (required: {}, actual: {}).",
                            f.params.len(),
                            args.len()
                        ),
                        Some(line),
                    ));
                }

                let instance_name = self.session.fresh_name(&f.name);
                let mut body = (*f.body).clone();

                let prev = self.push_scope(f.scope);
                for (param, arg) in f.params.iter().zip(args) {
                    self.bind(param.clone(), arg.clone());
                }
                let result = self.process_block(&mut body);
                self.restore_scope(prev);
                let result = result?;

                let instance_type = Type::Function(FunctionType {
                    name: instance_name.clone(),
                    params: f.params.clone(),
                    body: f.body.clone(),
                    scope: f.scope,
                });

                // Register the typed clone so downstream stages can find
                // the instance by its unique name.
                let mut source = Node::new(
                    NodeKind::Statement {
                        name: instance_name.clone(),
                        params: f.params.clone(),
                        body: Box::new(body),
                    },
                    line,
                );
                source.ty = Some(instance_type.clone());
                self.session.env.define(Symbol {
                    kind: SymbolKind::Function,
                    name: instance_name,
                    parameter_names: f.params.clone(),
                    source: Some(source),
                });

                Ok((result, Some(instance_type)))
            }
            Type::BuiltinGroup(group) => {
                let (result, instance) = self.process_builtin(group, args, line)?;
                Ok((result, Some(Type::BuiltinInstance(instance))))
            }
            _ => Err(self.fail(
                TypeErrorKind::NotAFunction,
                "Callee not a function.",
                Some(line),
            )),
        }
    }

    fn process_builtin(
        &mut self,
        group: &BuiltinGroup,
        args: &[Type],
        line: usize,
    ) -> Check<(Type, BuiltinInstance)> {
        let mut reduced = Vec::with_capacity(args.len());
        for arg in args {
            reduced.push(self.inner_type(arg, line)?);
        }

        let tags: Vec<Tag> = reduced
            .iter()
            .map(|(scalar, _, _)| scalar.tag().expect("reduced type has a tag"))
            .collect();

        let signature = match overload_resolution(&group.overloads, &tags) {
            Ok(sig) => sig,
            Err(mut e) => {
                e.line = Some(line);
                e.message = format!("In call to '{}': {}", group.name, e.message);
                self.report(e);
                return Err(Abort);
            }
        };

        // All sized arguments must agree; scalars broadcast.
        let mut result_size: Vec<Dim> = Vec::new();
        for (_, size, _) in &reduced {
            if result_size.is_empty() {
                result_size = size.clone();
            } else if !size.is_empty() && *size != result_size {
                return Err(self.fail(
                    TypeErrorKind::SizeMismatch,
                    "Argument size mismatch.",
                    Some(line),
                ));
            }
        }

        let elem = match signature.result {
            Tag::Int => PrimType::Int,
            Tag::Bool => PrimType::Bool,
            Tag::Real => reduced
                .iter()
                .map(|(_, _, e)| *e)
                .filter(|e| e.is_real())
                .fold(None, |acc: Option<PrimType>, e| {
                    Some(match acc {
                        Some(a) => PrimType::promote(a, e),
                        None => e,
                    })
                })
                .unwrap_or(PrimType::Real64),
        };

        let result = if result_size.is_empty() {
            Type::scalar(match signature.result {
                Tag::Int => PrimType::Int,
                Tag::Real => PrimType::Real64,
                Tag::Bool => PrimType::Bool,
            })
        } else {
            Type::Stream(StreamType::new(elem, result_size))
        };

        Ok((result, BuiltinInstance { name: group.name, signature }))
    }

    /// Reduce a value to (scalar type, shape, element type). Constant
    /// ranges reduce to integer streams of their length; streams reduce
    /// to their element scalar.
    fn inner_type(&mut self, t: &Type, line: usize) -> Check<(Type, Vec<Dim>, PrimType)> {
        match t {
            Type::Range(r) => {
                let Some(len) = r.const_size() else {
                    return Err(self.fail(
                        TypeErrorKind::NotConstant,
                        "Non-constant range used where constant range required.",
                        Some(line),
                    ));
                };
                Ok((Type::Int(None), vec![Dim::Finite(len)], PrimType::Int))
            }
            Type::Stream(s) => Ok((Type::scalar(s.elem), s.size.clone(), s.elem)),
            Type::Bool | Type::Int(_) | Type::Real(_) => {
                Ok((t.clone(), Vec::new(), t.elem_type()))
            }
            other => Err(self.fail(
                TypeErrorKind::InvalidExpression,
                format!("Unexpected operand type: {}.", other),
                Some(line),
            )),
        }
    }

    // ----- statements and blocks -----

    fn process_block(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let t = match &mut root.kind {
            NodeKind::ExpressionBlock { stmts, value } => {
                // Split the borrow so statements can be processed while
                // keeping the value expression in place.
                for stmt in stmts.iter_mut() {
                    self.process_stmt(stmt)?;
                }
                self.process_expression(value)?
            }
            _ => {
                return Err(self.fail(
                    TypeErrorKind::InvalidExpression,
                    "Expected an expression block.",
                    Some(line),
                ))
            }
        };
        root.ty = Some(t.clone());
        Ok(t)
    }

    fn process_stmt(&mut self, root: &mut Node) -> Check<()> {
        let line = root.line;
        let (name, result) = match &mut root.kind {
            NodeKind::Statement { name, params, body } => {
                let t = if params.is_empty() {
                    self.process_block(body)?
                } else {
                    Type::Function(FunctionType {
                        name: name.clone(),
                        params: params.clone(),
                        body: Rc::new((**body).clone()),
                        scope: self.current,
                    })
                };
                (name.clone(), t)
            }
            _ => {
                return Err(self.fail(
                    TypeErrorKind::InvalidExpression,
                    "Expected a statement.",
                    Some(line),
                ))
            }
        };
        root.ty = Some(result.clone());
        self.bind(name, result);
        Ok(())
    }

    // ----- expressions -----

    fn process_expression(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let t = match &root.kind {
            NodeKind::IntNum(v) => Type::Int(Some(*v)),
            NodeKind::RealNum(v) => Type::Real(Some(*v)),
            NodeKind::Identifier(_) => self.process_identifier(root)?,
            NodeKind::Negate(_) => self.process_negate(root)?,
            NodeKind::Binary(..) => self.process_binop(root)?,
            NodeKind::Range { .. } => self.process_range(root)?,
            NodeKind::Hash { .. } => self.process_extent(root)?,
            NodeKind::Transpose { .. } => self.process_transpose(root)?,
            NodeKind::Slice { .. } => self.process_slice(root)?,
            NodeKind::Call { .. } => self.process_call(root)?,
            NodeKind::For { .. } => self.process_iteration(root)?,
            NodeKind::Reduce { .. } => self.process_reduction(root)?,
            _ => {
                return Err(self.fail(
                    TypeErrorKind::InvalidExpression,
                    "Unsupported expression.",
                    Some(line),
                ))
            }
        };
        root.ty = Some(t.clone());
        Ok(t)
    }

    fn process_identifier(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let name = root.as_identifier().expect("identifier node").to_string();

        if let Some(t) = self.lookup(&name) {
            return Ok(t);
        }
        if self.session.env.contains(&name) {
            let t = self.symbol_type(&name, line)?;
            self.scopes[ROOT_SCOPE].map.insert(name, t.clone());
            return Ok(t);
        }
        Err(self.fail(
            TypeErrorKind::UndefinedName,
            format!("Name not in scope: '{}'.", name),
            Some(line),
        ))
    }

    fn process_negate(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::Negate(operand) = &mut root.kind else { unreachable!() };
        let operand_type = self.process_expression(operand)?;

        match operand_type {
            Type::Int(v) => Ok(Type::Int(v.map(|x| -x))),
            Type::Real(v) => Ok(Type::Real(v.map(|x| -x))),
            Type::Range(r) => {
                let Some(len) = r.const_size() else {
                    return Err(self.fail(
                        TypeErrorKind::NotConstant,
                        "Non-constant range used where constant range required.",
                        Some(line),
                    ));
                };
                Ok(Type::Stream(StreamType::new(PrimType::Int, vec![Dim::Finite(len)])))
            }
            t @ Type::Stream(_) => Ok(t),
            other => Err(self.fail(
                TypeErrorKind::InvalidExpression,
                format!("Unexpected expression type: {}.", other),
                Some(line),
            )),
        }
    }

    fn process_binop(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::Binary(op, lhs, rhs) = &mut root.kind else { unreachable!() };
        let op = *op;
        let lhs_type = self.process_expression(lhs)?;
        let rhs_type = self.process_expression(rhs)?;

        if op == BinOp::Raise {
            let pow = self.lookup("pow").expect("builtin pow");
            let (result, _) = self.process_function(&pow, &[lhs_type, rhs_type], line)?;
            return Ok(result);
        }

        // Accumulate operand failures, then abort the expression.
        let lhs_inner = self.inner_type(&lhs_type, line);
        let rhs_inner = self.inner_type(&rhs_type, line);
        if self.has_error() {
            return Err(Abort);
        }
        let (lhs_scalar, lhs_size, lhs_elem) = lhs_inner?;
        let (rhs_scalar, rhs_size, rhs_elem) = rhs_inner?;

        if lhs_size.is_empty() && rhs_size.is_empty() {
            if op.is_comparison() {
                return Ok(Type::Bool);
            }
            let both_int =
                matches!(lhs_scalar, Type::Int(_)) && matches!(rhs_scalar, Type::Int(_));
            return Ok(if both_int { Type::Int(None) } else { Type::Real(None) });
        }

        if !lhs_size.is_empty() && !rhs_size.is_empty() && lhs_size != rhs_size {
            return Err(self.fail(
                TypeErrorKind::SizeMismatch,
                "Binary operator: operand size mismatch.",
                Some(line),
            ));
        }

        let size = if lhs_size.is_empty() { rhs_size } else { lhs_size };
        let elem = if op.is_comparison() {
            PrimType::Bool
        } else {
            PrimType::promote(lhs_elem, rhs_elem)
        };
        Ok(Type::Stream(StreamType::new(elem, size)))
    }

    fn process_range(&mut self, root: &mut Node) -> Check<Type> {
        let NodeKind::Range { start, end, .. } = &mut root.kind else { unreachable!() };
        let mut range = RangeType::default();
        let mut abort = false;

        // Both endpoints are processed before aborting, so one bad range
        // reports every offending endpoint.
        let ends = [start.as_deref_mut(), end.as_deref_mut()];
        let mut values = [None, None];
        for (slot, node) in values.iter_mut().zip(ends) {
            let Some(node) = node else { continue };
            let line = node.line;
            let t = self.process_expression(node)?;
            match t {
                Type::Int(v) => *slot = Some(v),
                _ => {
                    self.report(
                        TypeError::new(TypeErrorKind::InvalidExpression, "Range endpoint not an integer.")
                            .at_line(line),
                    );
                    abort = true;
                }
            }
        }
        if abort {
            return Err(Abort);
        }

        range.start = values[0];
        range.end = values[1];
        Ok(Type::Range(range))
    }

    fn process_extent(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::Hash { object, dim } = &mut root.kind else { unreachable!() };

        let object_line = object.line;
        let object_type = self.process_expression(object)?;
        let Type::Stream(stream) = &object_type else {
            return Err(self.fail(
                TypeErrorKind::InvalidExpression,
                "Extent object not a stream.",
                Some(object_line),
            ));
        };
        let size = stream.size.clone();

        let mut dim_index = 1i64;
        if let Some(dim_node) = dim {
            let dim_line = dim_node.line;
            let dim_type = self.process_expression(dim_node)?;
            let Type::Int(value) = dim_type else {
                return Err(self.fail(
                    TypeErrorKind::InvalidExpression,
                    "Dimension not an integer.",
                    Some(dim_line),
                ));
            };
            let Some(value) = value else {
                return Err(self.fail(
                    TypeErrorKind::NotConstant,
                    "Dimension not a constant.",
                    Some(dim_line),
                ));
            };
            dim_index = value;
        }

        if dim_index < 1 || dim_index as usize > size.len() {
            return Err(self.fail(
                TypeErrorKind::OutOfBounds,
                format!("Dimension {} out of bounds.", dim_index),
                Some(line),
            ));
        }

        match size[dim_index as usize - 1] {
            Dim::Finite(n) => Ok(Type::Int(Some(n))),
            Dim::Infinite => Err(self.fail(
                TypeErrorKind::OutOfBounds,
                "Extent in requested dimension is infinite.",
                Some(line),
            )),
        }
    }

    fn process_transpose(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::Transpose { object, dims } = &mut root.kind else { unreachable!() };
        let dims = dims.clone();

        let object_line = object.line;
        let object_type = self.process_expression(object)?;
        let Type::Stream(stream) = object_type else {
            return Err(self.fail(
                TypeErrorKind::InvalidExpression,
                "Transpose object not a stream.",
                Some(object_line),
            ));
        };

        let rank = stream.rank();
        if dims.len() > rank {
            return Err(self.fail(
                TypeErrorKind::OutOfBounds,
                "Transposition has too many dimensions.",
                Some(line),
            ));
        }

        let mut selected = vec![false; rank];
        let mut size = Vec::with_capacity(rank);
        for &d in &dims {
            if d < 1 || d as usize > rank {
                return Err(self.fail(
                    TypeErrorKind::OutOfBounds,
                    "Dimension selector element out of bounds.",
                    Some(line),
                ));
            }
            if selected[d as usize - 1] {
                return Err(self.fail(
                    TypeErrorKind::OutOfBounds,
                    "Duplicate dimension selector element.",
                    Some(line),
                ));
            }
            selected[d as usize - 1] = true;
            size.push(stream.size[d as usize - 1]);
        }
        for (d, taken) in selected.iter().enumerate() {
            if !taken {
                size.push(stream.size[d]);
            }
        }

        Ok(Type::Stream(StreamType::new(stream.elem, size)))
    }

    fn process_slice(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::Slice { object, selectors } = &mut root.kind else { unreachable!() };

        let object_line = object.line;
        let object_type = self.process_expression(object)?;
        let Type::Stream(stream) = object_type else {
            return Err(self.fail(
                TypeErrorKind::InvalidExpression,
                "Slice object not a stream.",
                Some(object_line),
            ));
        };

        if selectors.len() > stream.rank() {
            return Err(self.fail(
                TypeErrorKind::OutOfBounds,
                "Too many slice dimensions.",
                Some(line),
            ));
        }

        let mut result = stream.clone();
        for (dim, selector) in selectors.iter_mut().enumerate() {
            let sel_line = selector.line;
            let Dim::Finite(extent) = stream.size[dim] else {
                return Err(self.fail(
                    TypeErrorKind::OutOfBounds,
                    "Can not slice an infinite dimension.",
                    Some(sel_line),
                ));
            };

            let sel_type = self.process_expression(selector)?;
            match sel_type {
                Type::Int(value) => {
                    let Some(value) = value else {
                        return Err(self.fail(
                            TypeErrorKind::NotConstant,
                            "Non-constant slice index not supported.",
                            Some(sel_line),
                        ));
                    };
                    if value < 1 || value > extent {
                        return Err(self.fail(
                            TypeErrorKind::OutOfBounds,
                            "Invalid slice index: out of bounds.",
                            Some(sel_line),
                        ));
                    }
                    result.size[dim] = Dim::Finite(1);
                }
                Type::Range(r) => {
                    let start = match r.start {
                        None => 1,
                        Some(Some(v)) => v,
                        Some(None) => {
                            return Err(self.fail(
                                TypeErrorKind::NotConstant,
                                "Non-constant slice size not supported.",
                                Some(sel_line),
                            ))
                        }
                    };
                    let end = match r.end {
                        None => extent,
                        Some(Some(v)) => v,
                        Some(None) => {
                            return Err(self.fail(
                                TypeErrorKind::NotConstant,
                                "Non-constant slice size not supported.",
                                Some(sel_line),
                            ))
                        }
                    };
                    let size = end - start + 1;
                    if size < 1 {
                        return Err(self.fail(
                            TypeErrorKind::OutOfBounds,
                            "Invalid slice range: size less than 1.",
                            Some(sel_line),
                        ));
                    }
                    if start < 1 || end > extent {
                        return Err(self.fail(
                            TypeErrorKind::OutOfBounds,
                            "Invalid slice range: out of bounds.",
                            Some(sel_line),
                        ));
                    }
                    result.size[dim] = Dim::Finite(size);
                }
                _ => {
                    return Err(self.fail(
                        TypeErrorKind::InvalidExpression,
                        "Invalid type of slice selector.",
                        Some(sel_line),
                    ))
                }
            }
        }

        Ok(result.reduced())
    }

    fn process_call(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::Call { callee, args } = &mut root.kind else { unreachable!() };

        let Some(callee_name) = callee.as_identifier().map(str::to_string) else {
            return Err(self.fail(
                TypeErrorKind::NotAFunction,
                "Function call object not a function.",
                Some(line),
            ));
        };

        let mut arg_types = Vec::with_capacity(args.len());
        for arg in args.iter_mut() {
            arg_types.push(self.process_expression(arg)?);
        }

        // Host-supplied functions apply element-wise to one argument.
        if self.lookup(&callee_name).is_none() {
            if let Some(sym) = self.session.env.get(&callee_name) {
                if sym.kind == SymbolKind::External {
                    if arg_types.len() != 1 {
                        return Err(self.fail(
                            TypeErrorKind::WrongArgCount,
                            format!(
                                "Wrong number of arguments (required: 1, actual: {}).",
                                arg_types.len()
                            ),
                            Some(line),
                        ));
                    }
                    return Ok(arg_types.into_iter().next().unwrap());
                }
            }
        }

        let func_type = if let Some(t) = self.lookup(&callee_name) {
            t
        } else if self.session.env.contains(&callee_name) {
            let t = self.symbol_type(&callee_name, line)?;
            self.scopes[ROOT_SCOPE].map.insert(callee_name.clone(), t.clone());
            t
        } else {
            return Err(self.fail(
                TypeErrorKind::UndefinedName,
                format!("Name not in scope: '{}'.", callee_name),
                Some(line),
            ));
        };

        if !func_type.is_function() {
            return Err(self.fail(
                TypeErrorKind::NotAFunction,
                format!("Function call object not a function: '{}'.", callee_name),
                Some(line),
            ));
        }

        let (result, instance) = self.process_function(&func_type, &arg_types, line)?;

        // Rewrite the call site to the chosen instance.
        if let Some(instance) = instance {
            if let Type::Function(f) = &instance {
                callee.kind = NodeKind::Identifier(f.name.clone());
            }
            callee.ty = Some(instance);
        }

        Ok(result)
    }

    fn process_iteration(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::For { iterations, body } = &mut root.kind else { unreachable!() };

        let mut iterators = Vec::with_capacity(iterations.len());
        for iter_node in iterations.iter_mut() {
            iterators.push(self.process_iterator_node(iter_node)?);
        }
        assert!(!iterators.is_empty());

        let mut count: Option<Dim> = None;
        for it in &iterators {
            match &count {
                None => count = Some(it.count),
                Some(c) if *c == it.count => {}
                Some(_) => {
                    return Err(self.fail(
                        TypeErrorKind::InvalidIteration,
                        "Iterations with differing counts.",
                        Some(line),
                    ))
                }
            }
        }
        let count = count.unwrap();

        let prev = self.push_scope(self.current);
        for it in &iterators {
            if let Some(id) = &it.id {
                self.bind(id.clone(), (*it.value).clone());
            }
        }
        let result = self.process_block(body);
        self.restore_scope(prev);
        let result_type = result?;

        let mut size = vec![count];
        let elem = match &result_type {
            Type::Stream(s) => {
                size.extend(s.size.iter().copied());
                s.elem
            }
            Type::Int(_) => PrimType::Int,
            Type::Real(_) => PrimType::Real64,
            other => {
                return Err(self.fail(
                    TypeErrorKind::InvalidIteration,
                    format!("Unsupported iteration result type: {}.", other),
                    Some(body.line),
                ))
            }
        };

        Ok(StreamType::new(elem, size).reduced())
    }

    fn process_iterator_node(&mut self, root: &mut Node) -> Check<IteratorType> {
        let line = root.line;
        let NodeKind::ForIteration { id, size, hop, domain } = &mut root.kind else {
            unreachable!()
        };
        let id = id.clone();

        let size = match size {
            Some(node) => self.constant_int(node, "Iteration size")?,
            None => 1,
        };
        if size < 1 {
            return Err(self.fail(
                TypeErrorKind::InvalidIteration,
                "Invalid iteration size.",
                Some(line),
            ));
        }

        let hop = match hop {
            Some(node) => self.constant_int(node, "Iteration hop")?,
            None => 1,
        };
        if hop < 1 {
            return Err(self.fail(
                TypeErrorKind::InvalidIteration,
                "Invalid hop size.",
                Some(line),
            ));
        }

        let domain_line = domain.line;
        let domain_type = self.process_expression(domain)?;

        let (domain_size, value) = match &domain_type {
            Type::Stream(s) => {
                let mut operand = s.clone();
                operand.size[0] = Dim::Finite(size);
                (s.size[0], operand.reduced())
            }
            Type::Range(r) => {
                let Some(len) = r.const_size() else {
                    return Err(self.fail(
                        TypeErrorKind::NotConstant,
                        "Non-constant range not supported as iteration domain.",
                        Some(domain_line),
                    ));
                };
                let value = if size > 1 {
                    Type::Range(RangeType { start: Some(None), end: Some(None) })
                } else {
                    Type::Int(None)
                };
                (Dim::Finite(len), value)
            }
            other => {
                return Err(self.fail(
                    TypeErrorKind::InvalidIteration,
                    format!("Unsupported iteration domain type: {}.", other),
                    Some(line),
                ))
            }
        };

        let count = match domain_size {
            Dim::Infinite => Dim::Infinite,
            Dim::Finite(extent) => {
                let iterable = extent - size;
                if iterable < 0 {
                    return Err(self.fail(
                        TypeErrorKind::InvalidIteration,
                        "Iteration size larger than stream size.",
                        Some(line),
                    ));
                }
                if iterable % hop != 0 {
                    return Err(self.fail(
                        TypeErrorKind::InvalidIteration,
                        "Iteration does not cover stream size.",
                        Some(line),
                    ));
                }
                Dim::Finite(iterable / hop + 1)
            }
        };

        let iterator = IteratorType { id, size, hop, count, value: Box::new(value) };
        root.ty = Some(Type::Iterator(Box::new(iterator.clone())));
        Ok(iterator)
    }

    fn process_reduction(&mut self, root: &mut Node) -> Check<Type> {
        let line = root.line;
        let NodeKind::Reduce { accumulator, element, domain, body } = &mut root.kind else {
            unreachable!()
        };
        let (acc, elem) = (accumulator.clone(), element.clone());

        let domain_type = self.process_expression(domain)?;
        match &domain_type {
            Type::Stream(s) => {
                if s.rank() > 1 {
                    return Err(self.fail(
                        TypeErrorKind::InvalidReduction,
                        "Reduction of streams with more than 1 dimension not supported.",
                        Some(line),
                    ));
                }
                if s.is_infinite() {
                    return Err(self.fail(
                        TypeErrorKind::InvalidReduction,
                        "Reduction of an infinite stream not supported.",
                        Some(line),
                    ));
                }
            }
            _ => {
                return Err(self.fail(
                    TypeErrorKind::InvalidReduction,
                    "Invalid reduction domain type.",
                    Some(line),
                ))
            }
        }

        let prev = self.push_scope(self.current);
        self.bind(acc, Type::Real(None));
        self.bind(elem, Type::Real(None));
        let result = self.process_block(body);
        self.restore_scope(prev);
        let result_type = result?;

        if !matches!(result_type, Type::Real(_)) {
            return Err(self.fail(
                TypeErrorKind::InvalidReduction,
                "Reduction result type must be a real number.",
                Some(line),
            ));
        }

        Ok(Type::Real(None))
    }

    fn constant_int(&mut self, node: &mut Node, what: &str) -> Check<i64> {
        let line = node.line;
        let t = self.process_expression(node)?;
        match t {
            Type::Int(Some(v)) => Ok(v),
            Type::Int(None) => Err(self.fail(
                TypeErrorKind::NotConstant,
                format!("{} not a constant.", what),
                Some(line),
            )),
            _ => Err(self.fail(
                TypeErrorKind::InvalidExpression,
                format!("{} not an integer.", what),
                Some(line),
            )),
        }
    }
}
