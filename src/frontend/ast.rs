//! Input AST and top-level environment.
//!
//! The parser (an external collaborator) produces this tree. Every node
//! carries its source line; the checker annotates nodes with their
//! inferred semantic type in place.

use crate::frontend::types::Type;

/// Binary operators of the surface language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Raise,
    Lesser,
    Greater,
    LesserEqual,
    GreaterEqual,
    Equal,
    NotEqual,
}

impl BinOp {
    /// Comparison operators produce booleans.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Lesser
                | BinOp::Greater
                | BinOp::LesserEqual
                | BinOp::GreaterEqual
                | BinOp::Equal
                | BinOp::NotEqual
        )
    }
}

/// An AST node: kind, source line, and the semantic type filled in by the
/// checker.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub line: usize,
    pub ty: Option<Type>,
}

/// Node kinds, mirroring the parser's tag set.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A whole program: top-level statements in source order.
    Program(Vec<Node>),
    /// Statements local to an expression block.
    StatementList(Vec<Node>),
    /// A named binding: an expression statement, or a function definition
    /// when `params` is non-empty. The body is an `ExpressionBlock`.
    Statement {
        name: String,
        params: Vec<String>,
        body: Box<Node>,
    },
    /// Local statements followed by the block's value expression.
    ExpressionBlock {
        stmts: Vec<Node>,
        value: Box<Node>,
    },
    Identifier(String),
    IntNum(i64),
    RealNum(f64),
    Binary(BinOp, Box<Node>, Box<Node>),
    Negate(Box<Node>),
    Range {
        start: Option<Box<Node>>,
        end: Option<Box<Node>>,
    },
    /// `object # dim`: the extent of one dimension.
    Hash {
        object: Box<Node>,
        dim: Option<Box<Node>>,
    },
    /// Dimension reordering; selectors are 1-based dimension numbers.
    Transpose {
        object: Box<Node>,
        dims: Vec<i64>,
    },
    /// `object[sel, ...]` with integer or range selectors.
    Slice {
        object: Box<Node>,
        selectors: Vec<Node>,
    },
    Call {
        callee: Box<Node>,
        args: Vec<Node>,
    },
    /// Bounded-window iteration over one or more synchronized iterators.
    For {
        iterations: Vec<Node>,
        body: Box<Node>,
    },
    /// One iterator: `id in domain step hop take size`.
    ForIteration {
        id: Option<String>,
        size: Option<Box<Node>>,
        hop: Option<Box<Node>>,
        domain: Box<Node>,
    },
    /// `reduce(acc, elem in domain) body`.
    Reduce {
        accumulator: String,
        element: String,
        domain: Box<Node>,
        body: Box<Node>,
    },
}

impl Node {
    pub fn new(kind: NodeKind, line: usize) -> Self {
        Self { kind, line, ty: None }
    }

    pub fn ident(name: impl Into<String>, line: usize) -> Self {
        Self::new(NodeKind::Identifier(name.into()), line)
    }

    pub fn int(value: i64, line: usize) -> Self {
        Self::new(NodeKind::IntNum(value), line)
    }

    pub fn real(value: f64, line: usize) -> Self {
        Self::new(NodeKind::RealNum(value), line)
    }

    pub fn binary(op: BinOp, lhs: Node, rhs: Node, line: usize) -> Self {
        Self::new(NodeKind::Binary(op, Box::new(lhs), Box::new(rhs)), line)
    }

    pub fn call(callee: Node, args: Vec<Node>, line: usize) -> Self {
        Self::new(
            NodeKind::Call { callee: Box::new(callee), args },
            line,
        )
    }

    /// Wrap an expression in a block with no local statements.
    pub fn block(value: Node, line: usize) -> Self {
        Self::new(
            NodeKind::ExpressionBlock { stmts: Vec::new(), value: Box::new(value) },
            line,
        )
    }

    /// The identifier name, if this node is an identifier.
    pub fn as_identifier(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Identifier(name) => Some(name),
            _ => None,
        }
    }
}

/// How a top-level symbol may be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    /// A named expression.
    Expression,
    /// A user function awaiting monomorphization.
    Function,
    /// A host-supplied function; calls lower to external calls in the
    /// generated kernel.
    External,
}

/// A top-level symbol: a binding the environment knows by name.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub parameter_names: Vec<String>,
    /// The defining statement. Externals have no source.
    pub source: Option<Node>,
}

impl Symbol {
    pub fn expression(name: impl Into<String>, body: Node) -> Self {
        let name = name.into();
        let line = body.line;
        let source = Node::new(
            NodeKind::Statement {
                name: name.clone(),
                params: Vec::new(),
                body: Box::new(body),
            },
            line,
        );
        Self { kind: SymbolKind::Expression, name, parameter_names: Vec::new(), source: Some(source) }
    }

    pub fn function(name: impl Into<String>, params: Vec<String>, body: Node) -> Self {
        let name = name.into();
        let line = body.line;
        let source = Node::new(
            NodeKind::Statement {
                name: name.clone(),
                params: params.clone(),
                body: Box::new(body),
            },
            line,
        );
        Self { kind: SymbolKind::Function, name, parameter_names: params, source: Some(source) }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self {
            kind: SymbolKind::External,
            name: name.into(),
            parameter_names: Vec::new(),
            source: None,
        }
    }
}

/// The top-level environment: name to symbol, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    symbols: Vec<Symbol>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the environment from a parsed `Program` node: one symbol
    /// per top-level statement, an expression or a function depending on
    /// the parameter list.
    pub fn from_program(program: Node) -> Option<Environment> {
        let NodeKind::Program(stmts) = program.kind else { return None };
        let mut env = Environment::new();
        for stmt in stmts {
            let NodeKind::Statement { name, params, body } = stmt.kind else {
                return None;
            };
            if params.is_empty() {
                env.define(Symbol::expression(name, *body));
            } else {
                env.define(Symbol::function(name, params, *body));
            }
        }
        Some(env)
    }

    pub fn define(&mut self, symbol: Symbol) {
        self.symbols.push(symbol);
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.symbols.iter_mut().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove a symbol, returning it. Used by the checker to process a
    /// symbol's source without aliasing the environment.
    pub fn take(&mut self, name: &str) -> Option<Symbol> {
        let idx = self.symbols.iter().position(|s| s.name == name)?;
        Some(self.symbols.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
