//! Kernel assembly: the `initialize`/`process` pair, the state struct,
//! the output getter, and the host extern declarations.

use crate::frontend::types::{PrimType, Type};
use crate::polyhedral::model::Model;
use crate::codegen::ast::{Builder, CBinOp, CExpr, CStmt, CType, Param, Procedure};
use crate::codegen::lower::{Lowering, STATE_ARG};
use crate::transform::buffers::BufferInfo;
use crate::transform::scheduler::{initialize_nest, process_nest, Schedule};
use crate::utils::errors::CompileResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One field of the persistent state struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateField {
    /// A heap-resident array buffer.
    Buffer {
        name: String,
        ty: PrimType,
        dims: Vec<i64>,
    },
    /// A phase counter, initialized to zero.
    Phase { name: String },
}

/// A host-supplied extern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternDecl {
    pub name: String,
    pub params: Vec<CType>,
    pub ret: CType,
}

/// The assembled kernel IR handed to the textual emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    pub namespace: String,
    pub state: Vec<StateField>,
    pub initialize: Procedure,
    pub process: Procedure,
    pub get_output: Procedure,
    pub externs: Vec<ExternDecl>,
    /// The overloaded floor-remainder helpers emitted into the kernel.
    pub helpers: Vec<Procedure>,
}

/// Assemble the kernel for a scheduled, buffer-analyzed model.
pub fn generate(
    namespace: &str,
    args: &[Type],
    model: &Model,
    schedule: &Schedule,
    buffers: &HashMap<String, BufferInfo>,
) -> CompileResult<Kernel> {
    let mut lowering = Lowering::new(model, buffers);

    let initialize = {
        let mut ctx = Builder::new();
        declare_stack_buffers(model, buffers, &mut ctx);
        lowering.generate_nest(&initialize_nest(model, schedule), &mut ctx)?;
        advance_phases(model, buffers, &mut ctx, true);
        Procedure {
            name: "initialize".into(),
            params: signature_params(args),
            ret: CType::Void,
            body: ctx.finish(),
        }
    };

    let process = {
        lowering.set_in_period(true);
        let mut ctx = Builder::new();
        declare_stack_buffers(model, buffers, &mut ctx);
        lowering.generate_nest(&process_nest(model, schedule), &mut ctx)?;
        advance_phases(model, buffers, &mut ctx, false);
        Procedure {
            name: "process".into(),
            params: signature_params(args),
            ret: CType::Void,
            body: ctx.finish(),
        }
    };

    Ok(Kernel {
        namespace: namespace.to_string(),
        state: state_fields(model, buffers),
        initialize,
        process,
        get_output: output_getter(model),
        externs: extern_decls(),
        helpers: remainder_helpers(),
    })
}

/// Parameters shared by `initialize` and `process`: one per input in
/// channel order, then the state pointer. Infinite extents appear as 0.
fn signature_params(args: &[Type]) -> Vec<Param> {
    let mut params = Vec::with_capacity(args.len() + 1);
    for (i, arg) in args.iter().enumerate() {
        let name = format!("in{}", i);
        match arg {
            Type::Stream(s) => params.push(Param {
                ty: CType::from_prim(s.elem),
                name,
                dims: s.size.iter().map(|d| d.extent().unwrap_or(0)).collect(),
            }),
            Type::Bool => params.push(Param { ty: CType::Bool, name, dims: Vec::new() }),
            Type::Int(_) => params.push(Param { ty: CType::Int, name, dims: Vec::new() }),
            _ => params.push(Param { ty: CType::Double, name, dims: Vec::new() }),
        }
    }
    params.push(Param {
        ty: CType::Named("state".into()).pointer(),
        name: STATE_ARG.into(),
        dims: Vec::new(),
    });
    params
}

fn declare_stack_buffers(
    model: &Model,
    buffers: &HashMap<String, BufferInfo>,
    ctx: &mut Builder,
) {
    for array in &model.arrays {
        let Some(info) = buffers.get(&array.name) else { continue };
        if !info.on_stack {
            continue;
        }
        let dims = if array.is_scalar_buffer() {
            Vec::new()
        } else {
            array.buffer_size.clone()
        };
        ctx.add(CStmt::VarDecl {
            ty: CType::from_prim(array.ty),
            name: array.name.clone(),
            dims,
            init: None,
        });
    }
}

/// Rotate each phase counter: by `period_offset` after initialization,
/// by `period` after each steady period.
fn advance_phases(
    model: &Model,
    buffers: &HashMap<String, BufferInfo>,
    ctx: &mut Builder,
    init: bool,
) {
    for array in &model.arrays {
        let Some(info) = buffers.get(&array.name) else { continue };
        if !info.has_phase {
            continue;
        }
        let offset = if init { array.period_offset } else { array.period };
        let buffer_size = array.buffer_size[0];

        let phase = CExpr::id(STATE_ARG).arrow(format!("{}_ph", array.name));
        let next = CExpr::binary(
            CBinOp::Rem,
            phase.clone().add(CExpr::IntLit(offset)),
            CExpr::IntLit(buffer_size),
        );
        ctx.add_expr(phase.assign(next));
    }
}

fn state_fields(model: &Model, buffers: &HashMap<String, BufferInfo>) -> Vec<StateField> {
    let mut fields = Vec::new();
    for array in &model.arrays {
        let Some(info) = buffers.get(&array.name) else { continue };
        if info.on_stack {
            continue;
        }
        let dims = if array.is_scalar_buffer() {
            Vec::new()
        } else {
            array.buffer_size.clone()
        };
        fields.push(StateField::Buffer { name: array.name.clone(), ty: array.ty, dims });
    }
    for array in &model.arrays {
        let Some(info) = buffers.get(&array.name) else { continue };
        if info.has_phase {
            fields.push(StateField::Phase { name: format!("{}_ph", array.name) });
        }
    }
    fields
}

fn output_getter(model: &Model) -> Procedure {
    let mut body = Vec::new();
    let mut ret = CType::Double.pointer();
    if let Some(id) = model.output_array() {
        let array = model.array(id);
        ret = CType::from_prim(array.ty).pointer();
        let member = CExpr::id(STATE_ARG).arrow(array.name.clone());
        let value = if array.is_scalar_buffer() {
            member.address_of()
        } else {
            CExpr::Cast { ty: ret.clone(), expr: Box::new(member) }
        };
        body.push(CStmt::Return(value));
    }
    Procedure {
        name: "get_output".into(),
        params: vec![Param {
            ty: CType::Named("state".into()).pointer(),
            name: STATE_ARG.into(),
            dims: Vec::new(),
        }],
        ret,
        body,
    }
}

fn extern_decls() -> Vec<ExternDecl> {
    vec![
        ExternDecl {
            name: "input".into(),
            params: vec![CType::Int, CType::Double.pointer()],
            ret: CType::Void,
        },
        ExternDecl {
            name: "output".into(),
            params: vec![CType::Double.pointer()],
            ret: CType::Void,
        },
    ]
}

/// The two overloads of the `remainder` helper. Integer: truncated `%`
/// corrected towards the divisor's sign. Real: `x - floor(x/y)*y`.
fn remainder_helpers() -> Vec<Procedure> {
    let int_version = {
        let x = CExpr::id("x");
        let y = CExpr::id("y");
        let m = CExpr::id("m");
        let body = vec![
            CStmt::VarDecl {
                ty: CType::Int,
                name: "m".into(),
                dims: Vec::new(),
                init: Some(CExpr::binary(CBinOp::Rem, x, y.clone())),
            },
            CStmt::Return(CExpr::Ternary {
                cond: Box::new(CExpr::binary(
                    CBinOp::And,
                    CExpr::binary(CBinOp::Ne, m.clone(), CExpr::IntLit(0)),
                    CExpr::binary(
                        CBinOp::Ne,
                        CExpr::binary(CBinOp::Lt, m.clone(), CExpr::IntLit(0)),
                        CExpr::binary(CBinOp::Lt, y.clone(), CExpr::IntLit(0)),
                    ),
                )),
                then_value: Box::new(m.clone().add(y)),
                else_value: Box::new(m),
            }),
        ];
        Procedure {
            name: "remainder".into(),
            params: vec![
                Param { ty: CType::Int, name: "x".into(), dims: Vec::new() },
                Param { ty: CType::Int, name: "y".into(), dims: Vec::new() },
            ],
            ret: CType::Int,
            body,
        }
    };

    let real_version = {
        let x = CExpr::id("x");
        let y = CExpr::id("y");
        let quotient = CExpr::call(
            "floor",
            vec![CExpr::binary(CBinOp::Div, x.clone(), y.clone())],
        );
        let body = vec![CStmt::Return(CExpr::binary(
            CBinOp::Sub,
            x,
            quotient.mul(y),
        ))];
        Procedure {
            name: "remainder".into(),
            params: vec![
                Param { ty: CType::Double, name: "x".into(), dims: Vec::new() },
                Param { ty: CType::Double, name: "y".into(), dims: Vec::new() },
            ],
            ret: CType::Double,
            body,
        }
    };

    vec![int_version, real_version]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::types::{Dim, StreamType};

    #[test]
    fn test_signature_params() {
        let args = vec![Type::Stream(StreamType::new(
            PrimType::Real32,
            vec![Dim::Infinite, Dim::Finite(4)],
        ))];
        let params = signature_params(&args);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "in0");
        assert_eq!(params[0].dims, vec![0, 4]);
        assert_eq!(params[0].ty, CType::Float);
        assert_eq!(params[1].name, "s");
    }

    #[test]
    fn test_remainder_helpers_are_overloaded() {
        let helpers = remainder_helpers();
        assert_eq!(helpers.len(), 2);
        assert!(helpers.iter().all(|h| h.name == "remainder"));
        assert_eq!(helpers[0].ret, CType::Int);
        assert_eq!(helpers[1].ret, CType::Double);
    }

    #[test]
    fn test_extern_surface() {
        let externs = extern_decls();
        assert_eq!(externs[0].name, "input");
        assert_eq!(externs[0].params.len(), 2);
        assert_eq!(externs[1].name, "output");
    }
}
