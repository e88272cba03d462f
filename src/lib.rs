//! # arrpc - compiler middle end for the Arrp stream-processing language
//!
//! Arrp programs describe finite and infinite-dimensional arrays
//! (streams) functionally; this crate lowers a typed program to
//! imperative kernel IR with an `initialize` phase and a periodic
//! `process` phase over ring buffers.
//!
//! ## Architecture
//!
//! ```text
//! AST -> Type/Size Checker -> Polyhedral Model -> Dataflow Solve
//!     -> Schedule + Buffers -> Imperative Kernel IR + Channel Report
//! ```
//!
//! The lexer/parser producing the AST and the textual emitter consuming
//! the kernel IR are external collaborators.
//!
//! ## Example
//!
//! ```rust
//! use arrpc::prelude::*;
//!
//! // out(x) = x, over an infinite mono stream.
//! let mut env = Environment::new();
//! env.define(Symbol::function(
//!     "out",
//!     vec!["x".into()],
//!     Node::block(Node::ident("x", 1), 1),
//! ));
//!
//! let input = Type::Stream(StreamType::new(PrimType::Real32, vec![Dim::Infinite]));
//! let output = arrpc::compile(env, "out", &[input]).unwrap();
//! assert_eq!(output.report.outputs[0].period_count, 1);
//! ```

#![warn(clippy::all)]

pub mod analysis;
pub mod codegen;
pub mod frontend;
pub mod polyhedral;
pub mod testdata;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types.

    pub use crate::analysis::dataflow::{Dataflow, DataflowEdge};
    pub use crate::codegen::{Kernel, Report};
    pub use crate::frontend::ast::{BinOp, Environment, Node, NodeKind, Symbol};
    pub use crate::frontend::checker::{Checker, Session};
    pub use crate::frontend::types::{Dim, PrimType, StreamType, Type};
    pub use crate::polyhedral::{AffineMatrix, ArrayId, Expr, Model, StmtId};
    pub use crate::transform::{BufferInfo, LoopNode, Schedule};
    pub use crate::utils::errors::*;
}

use crate::analysis::dataflow::{self, Dataflow};
use crate::codegen::{kernel, report, Kernel, Report};
use crate::frontend::ast::Environment;
use crate::frontend::checker::{Checker, Session};
use crate::frontend::types::Type;
use crate::polyhedral::{build_model, Model};
use crate::transform::buffers::{compute_buffers, BufferInfo, STACK_BUDGET};
use crate::transform::scheduler::{self, Schedule};
use anyhow::Result;
use std::collections::HashMap;

/// Everything the downstream emitters consume.
#[derive(Debug)]
pub struct CompilerOutput {
    /// The inferred type of the compiled symbol.
    pub result_type: Type,
    pub model: Model,
    pub dataflow: Dataflow,
    pub schedule: Schedule,
    /// Placement facts keyed by array name.
    pub buffers: HashMap<String, BufferInfo>,
    pub kernel: Kernel,
    pub report: Report,
}

/// Compile one top-level symbol applied to the given argument types.
///
/// Runs the five stages in order; each consumes the immutable output of
/// the previous one. No partial output is produced on failure.
pub fn compile(env: Environment, name: &str, args: &[Type]) -> Result<CompilerOutput> {
    let mut session = Session::new(env);

    let (result_type, entry) = {
        let mut checker = Checker::new(&mut session);
        checker.check_entry(name, args)?
    };

    let mut model = build_model(&session, &entry, name, args)?;
    let flow = dataflow::analyze(&mut model)?;
    let schedule = scheduler::schedule(&model)?;
    let buffers = compute_buffers(&mut model, &flow, &schedule, STACK_BUDGET);
    let kernel = kernel::generate(name, args, &model, &schedule, &buffers)?;
    let report = report::build(&model, name);

    Ok(CompilerOutput {
        result_type,
        model,
        dataflow: flow,
        schedule,
        buffers,
        kernel,
        report,
    })
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{Node, Symbol};
    use crate::frontend::types::{Dim, PrimType, StreamType};

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_compile_identity() {
        let mut env = Environment::new();
        env.define(Symbol::function(
            "out",
            vec!["x".into()],
            Node::block(Node::ident("x", 1), 1),
        ));
        let input = Type::Stream(StreamType::new(PrimType::Real32, vec![Dim::Infinite]));
        let output = compile(env, "out", &[input]).unwrap();

        assert_eq!(output.model.statements.len(), 2);
        assert_eq!(output.kernel.initialize.name, "initialize");
        assert_eq!(output.kernel.process.name, "process");
        assert_eq!(output.report.inputs.len(), 1);
        assert_eq!(output.report.outputs.len(), 1);
    }
}
