//! Semantic types for the stream language.
//!
//! The type algebra is a closed sum: scalars (possibly constant-valued),
//! constant-foldable ranges, multi-dimensional streams with at most one
//! infinite dimension, iterators, and the function flavors the checker
//! needs for overload resolution and monomorphization.

use crate::frontend::ast::Node;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// One dimension of a stream: a positive finite extent or the single
/// permitted infinite (streaming) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    Finite(i64),
    Infinite,
}

impl Dim {
    pub fn is_infinite(&self) -> bool {
        matches!(self, Dim::Infinite)
    }

    /// The extent of a finite dimension.
    pub fn extent(&self) -> Option<i64> {
        match self {
            Dim::Finite(n) => Some(*n),
            Dim::Infinite => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Finite(n) => write!(f, "{}", n),
            Dim::Infinite => write!(f, "~"),
        }
    }
}

/// Primitive element types carried by streams and scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimType {
    Bool,
    Int,
    Real32,
    Real64,
}

impl PrimType {
    pub fn is_real(&self) -> bool {
        matches!(self, PrimType::Real32 | PrimType::Real64)
    }

    /// Arithmetic promotion: int -> real32 -> real64.
    pub fn promote(a: PrimType, b: PrimType) -> PrimType {
        use PrimType::*;
        match (a, b) {
            (Real64, _) | (_, Real64) => Real64,
            (Real32, _) | (_, Real32) => Real32,
            (Int, _) | (_, Int) => Int,
            (Bool, Bool) => Bool,
        }
    }

    /// Size of one element in the generated kernel, in bytes.
    pub fn byte_size(&self) -> i64 {
        match self {
            PrimType::Int => 4,
            PrimType::Real32 => 4,
            PrimType::Real64 => 8,
            PrimType::Bool => 4,
        }
    }
}

/// Scalar tag used for overload resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Bool,
    Int,
    Real,
}

/// One signature of an overloaded builtin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Tag>,
    pub result: Tag,
}

/// An overloaded builtin function group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinGroup {
    pub name: &'static str,
    pub overloads: Vec<Signature>,
}

/// A builtin group with its overload chosen by the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinInstance {
    pub name: &'static str,
    pub signature: Signature,
}

/// A constant-foldable integer range. `start`/`end` are `None` when the
/// endpoint is omitted; an endpoint is `Some(None)` when present but not
/// constant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeType {
    pub start: Option<Option<i64>>,
    pub end: Option<Option<i64>>,
}

impl RangeType {
    pub fn is_constant(&self) -> bool {
        matches!(self.start, Some(Some(_))) && matches!(self.end, Some(Some(_)))
    }

    pub fn const_start(&self) -> Option<i64> {
        self.start.flatten()
    }

    pub fn const_end(&self) -> Option<i64> {
        self.end.flatten()
    }

    /// Number of elements of a constant range (`a..b` is inclusive).
    pub fn const_size(&self) -> Option<i64> {
        Some(self.const_end()? - self.const_start()? + 1)
    }
}

/// A multi-dimensional stream value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamType {
    pub elem: PrimType,
    pub size: Vec<Dim>,
}

impl StreamType {
    pub fn new(elem: PrimType, size: Vec<Dim>) -> Self {
        Self { elem, size }
    }

    pub fn rank(&self) -> usize {
        self.size.len()
    }

    pub fn is_infinite(&self) -> bool {
        self.size.iter().any(Dim::is_infinite)
    }

    /// Drop all size-1 dimensions; a fully reduced stream collapses to a
    /// scalar of its element type.
    pub fn reduced(self) -> Type {
        let size: Vec<Dim> = self
            .size
            .into_iter()
            .filter(|d| *d != Dim::Finite(1))
            .collect();
        if size.is_empty() {
            Type::scalar(self.elem)
        } else {
            Type::Stream(StreamType { elem: self.elem, size })
        }
    }
}

/// One bounded-window iterator of a `for` expression.
#[derive(Debug, Clone)]
pub struct IteratorType {
    pub id: Option<String>,
    pub size: i64,
    pub hop: i64,
    pub count: Dim,
    pub value: Box<Type>,
}

/// An unapplied user function. The body is shared untyped; each
/// application clones and re-checks it (monomorphization).
#[derive(Debug, Clone)]
pub struct FunctionType {
    pub name: String,
    pub params: Vec<String>,
    pub body: Rc<Node>,
    /// Index of the defining scope in the checker's scope table.
    pub scope: usize,
}

/// A semantic type.
#[derive(Debug, Clone)]
pub enum Type {
    Bool,
    /// Integer scalar, possibly with a known constant value.
    Int(Option<i64>),
    /// Real scalar, possibly with a known constant value.
    Real(Option<f64>),
    Range(RangeType),
    Stream(StreamType),
    Iterator(Box<IteratorType>),
    Function(FunctionType),
    BuiltinGroup(BuiltinGroup),
    BuiltinInstance(BuiltinInstance),
}

impl Type {
    pub fn scalar(prim: PrimType) -> Type {
        match prim {
            PrimType::Bool => Type::Bool,
            PrimType::Int => Type::Int(None),
            PrimType::Real32 | PrimType::Real64 => Type::Real(None),
        }
    }

    pub fn stream(size: Vec<Dim>) -> Type {
        Type::Stream(StreamType::new(PrimType::Real64, size))
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self,
            Type::Function(_) | Type::BuiltinGroup(_) | Type::BuiltinInstance(_)
        )
    }

    pub fn const_int(&self) -> Option<i64> {
        match self {
            Type::Int(v) => *v,
            _ => None,
        }
    }

    /// The shape of a value: empty for scalars, the stream size for
    /// streams. Ranges have no shape here; contexts that treat a constant
    /// range as a 1-D stream reduce it explicitly first.
    pub fn shape(&self) -> Vec<Dim> {
        match self {
            Type::Stream(s) => s.size.clone(),
            _ => Vec::new(),
        }
    }

    /// The element type flowing through arithmetic on this value.
    pub fn elem_type(&self) -> PrimType {
        match self {
            Type::Bool => PrimType::Bool,
            Type::Int(_) => PrimType::Int,
            Type::Real(_) => PrimType::Real64,
            Type::Range(_) => PrimType::Int,
            Type::Stream(s) => s.elem,
            _ => PrimType::Real64,
        }
    }

    pub fn tag(&self) -> Option<Tag> {
        match self {
            Type::Bool => Some(Tag::Bool),
            Type::Int(_) => Some(Tag::Int),
            Type::Real(_) => Some(Tag::Real),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "boolean"),
            Type::Int(Some(v)) => write!(f, "integer({})", v),
            Type::Int(None) => write!(f, "integer"),
            Type::Real(Some(v)) => write!(f, "real({})", v),
            Type::Real(None) => write!(f, "real"),
            Type::Range(r) => {
                write!(f, "range(")?;
                match r.const_start() {
                    Some(s) => write!(f, "{}", s)?,
                    None => write!(f, "?")?,
                }
                write!(f, "..")?;
                match r.const_end() {
                    Some(e) => write!(f, "{}", e)?,
                    None => write!(f, "?")?,
                }
                write!(f, ")")
            }
            Type::Stream(s) => {
                write!(f, "stream[")?;
                for (i, d) in s.size.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", d)?;
                }
                write!(f, "]")
            }
            Type::Iterator(it) => write!(f, "iterator({} x {})", it.count, it.size),
            Type::Function(func) => write!(f, "function {}/{}", func.name, func.params.len()),
            Type::BuiltinGroup(g) => write!(f, "builtin {}", g.name),
            Type::BuiltinInstance(b) => write!(f, "builtin instance {}", b.name),
        }
    }
}
