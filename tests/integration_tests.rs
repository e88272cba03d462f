//! End-to-end tests over the full compilation pipeline.

use arrpc::codegen::lower::{floor_rem_f64, floor_rem_i64};
use arrpc::codegen::StateField;
use arrpc::frontend::ast::{BinOp, Environment, Node, NodeKind, Symbol};
use arrpc::frontend::types::{Dim, PrimType, StreamType, Type};
use arrpc::prelude::*;
use arrpc::{compile, CompilerOutput};

fn stream_of(elem: PrimType, dims: &[i64]) -> Type {
    Type::Stream(StreamType::new(
        elem,
        dims.iter()
            .map(|&d| if d < 0 { Dim::Infinite } else { Dim::Finite(d) })
            .collect(),
    ))
}

fn slice(object: Node, selectors: Vec<Node>, line: usize) -> Node {
    Node::new(NodeKind::Slice { object: Box::new(object), selectors }, line)
}

fn range(start: i64, end: i64, line: usize) -> Node {
    Node::new(
        NodeKind::Range {
            start: Some(Box::new(Node::int(start, line))),
            end: Some(Box::new(Node::int(end, line))),
        },
        line,
    )
}

fn compile_fn(body: Node, args: &[Type]) -> anyhow::Result<CompilerOutput> {
    let params: Vec<String> = (0..args.len()).map(|i| format!("x{}", i)).collect();
    let mut env = Environment::new();
    env.define(Symbol::function("out", params, Node::block(body, 1)));
    compile(env, "out", args)
}

fn producer_of<'a>(out: &'a CompilerOutput, array: &str) -> &'a arrpc::polyhedral::Statement {
    let arr = out
        .model
        .arrays
        .iter()
        .find(|a| a.name == array)
        .unwrap_or_else(|| panic!("no array '{}'", array));
    out.model.statement(arr.producer.expect("array has a producer"))
}

fn array_named<'a>(out: &'a CompilerOutput, name: &str) -> &'a arrpc::polyhedral::Array {
    out.model
        .arrays
        .iter()
        .find(|a| a.name == name)
        .unwrap_or_else(|| panic!("no array '{}'", name))
}

// ---------------------------------------------------------------- E1

#[test]
fn e1_identity_stream() {
    let out = compile_fn(Node::ident("x0", 1), &[stream_of(PrimType::Real32, &[-1])]).unwrap();

    let producer = producer_of(&out, "out");
    assert_eq!(producer.steady_count, 1);
    assert_eq!(producer.init_count, 0);

    let input = array_named(&out, "x0");
    assert_eq!(input.buffer_size, vec![1]);
    assert!(!out.buffers["x0"].has_phase);
    assert!(!out.buffers["out"].has_phase);

    // real32 element type flows through to the report.
    assert_eq!(out.report.inputs[0].type_name, "real32");
    assert_eq!(out.report.outputs[0].type_name, "real32");
    assert!(out.report.outputs[0].is_stream);
    assert_eq!(out.report.outputs[0].period_count, 1);
}

// ---------------------------------------------------------------- E2

#[test]
fn e2_delay_by_two() {
    // out[t] = in[t-2]: the consumer's smallest read offset is -2, so
    // the producer is primed two tokens ahead and the ring keeps three
    // live values. The surface language has no negative subscripts, so
    // the delay semantics are driven at the model level.
    let mut model = Model::new();
    let a = model.add_array(arrpc::polyhedral::Array {
        name: "in".into(),
        ty: PrimType::Real64,
        size: vec![Dim::Infinite],
        period: 0,
        period_offset: 0,
        buffer_size: Vec::new(),
        is_infinite: true,
        inter_period_dependency: false,
        producer: None,
        input_channel: Some(0),
    });
    let b = model.add_array(arrpc::polyhedral::Array {
        name: "out".into(),
        ty: PrimType::Real64,
        size: vec![Dim::Infinite],
        period: 0,
        period_offset: 0,
        buffer_size: Vec::new(),
        is_infinite: true,
        inter_period_dependency: false,
        producer: None,
        input_channel: None,
    });
    let s0 = model.add_statement(arrpc::polyhedral::Statement {
        name: String::new(),
        domain: vec![Dim::Infinite],
        expr: Expr::ExternalCall {
            name: "in".into(),
            source: arrpc::polyhedral::AccessRelation {
                array: a,
                matrix: AffineMatrix::identity(1),
            },
        },
        write: arrpc::polyhedral::AccessRelation { array: a, matrix: AffineMatrix::identity(1) },
        dimension: None,
        init_count: 0,
        steady_count: 1,
        buffer_size: None,
    });
    model.array_mut(a).producer = Some(s0);

    let mut access = AffineMatrix::identity(1);
    access.set_constant(0, -2);
    let s1 = model.add_statement(arrpc::polyhedral::Statement {
        name: String::new(),
        domain: vec![Dim::Infinite],
        expr: Expr::ArrayRead { array: a, matrix: access },
        write: arrpc::polyhedral::AccessRelation { array: b, matrix: AffineMatrix::identity(1) },
        dimension: None,
        init_count: 0,
        steady_count: 1,
        buffer_size: None,
    });
    model.array_mut(b).producer = Some(s1);

    let flow = arrpc::analysis::dataflow::analyze(&mut model).unwrap();
    let edge = &flow.edges[0];
    assert_eq!((edge.push, edge.pop, edge.peek), (1, 1, 1));
    assert_eq!(model.statement(s0).steady_count, 1);
    assert_eq!(model.statement(s0).init_count, 2);

    let sched = arrpc::transform::scheduler::schedule(&model).unwrap();
    let buffers =
        arrpc::transform::buffers::compute_buffers(&mut model, &flow, &sched, 1024);
    assert!(model.array(a).buffer_size[0] >= 3);
    // has_phase depends on period: period 1 never divides by the ring.
    assert!(buffers["in"].has_phase);
}

// ---------------------------------------------------------------- E3

#[test]
fn e3_downsample_by_two() {
    // out = for w in x0 step 2 take 2: w[1] + w[2]
    let iteration = Node::new(
        NodeKind::ForIteration {
            id: Some("w".into()),
            size: Some(Box::new(Node::int(2, 1))),
            hop: Some(Box::new(Node::int(2, 1))),
            domain: Box::new(Node::ident("x0", 1)),
        },
        1,
    );
    let body = Node::new(
        NodeKind::For {
            iterations: vec![iteration],
            body: Box::new(Node::block(
                Node::binary(
                    BinOp::Add,
                    slice(Node::ident("w", 1), vec![Node::int(1, 1)], 1),
                    slice(Node::ident("w", 1), vec![Node::int(2, 1)], 1),
                    1,
                ),
                1,
            )),
        },
        1,
    );
    let out = compile_fn(body, &[stream_of(PrimType::Real64, &[-1])]).unwrap();

    let edges = &out.dataflow.edges;
    assert_eq!(edges.len(), 2);
    for edge in edges {
        assert_eq!(edge.push, 1);
        assert_eq!(edge.pop, 2);
    }
    assert_eq!(edges.iter().map(|e| e.peek).max(), Some(2));

    let input = producer_of(&out, "x0");
    let output = producer_of(&out, "out");
    assert_eq!(input.steady_count, 2);
    assert_eq!(output.steady_count, 1);

    // Production and consumption rates balance on every edge.
    for edge in edges {
        let ra = out.model.statement(edge.source).steady_count;
        let rb = out.model.statement(edge.sink).steady_count;
        assert_eq!(edge.push * ra, edge.pop * rb);
    }

    // The input channel carries two tokens per period.
    assert_eq!(out.report.inputs[0].period_count, 2);
    assert_eq!(out.report.inputs[0].size, 2);
}

// ---------------------------------------------------------------- E4

#[test]
fn e4_overload_resolution() {
    let abs_of = |arg: Node| {
        let mut env = Environment::new();
        env.define(Symbol::expression(
            "x",
            Node::block(Node::call(Node::ident("abs", 1), vec![arg], 1), 1),
        ));
        let mut session = Session::new(env);
        let mut checker = Checker::new(&mut session);
        checker.check("x", &[])
    };

    assert!(matches!(abs_of(Node::int(3, 1)), Ok(Type::Int(_))));
    assert!(matches!(abs_of(Node::real(3.0, 1)), Ok(Type::Real(_))));

    // abs of a boolean is rejected.
    let bad = abs_of(Node::binary(BinOp::Equal, Node::int(1, 1), Node::int(1, 1), 1));
    match bad {
        Err(CompileError::Type(e)) => assert_eq!(e.kind, TypeErrorKind::InvalidArguments),
        other => panic!("expected invalid-arguments error, got {:?}", other),
    }

    // Wrong arity is rejected.
    let mut env = Environment::new();
    env.define(Symbol::expression(
        "x",
        Node::block(
            Node::call(Node::ident("abs", 1), vec![Node::int(1, 1), Node::int(2, 1)], 1),
            1,
        ),
    ));
    let mut session = Session::new(env);
    let mut checker = Checker::new(&mut session);
    match checker.check("x", &[]) {
        Err(CompileError::Type(e)) => assert_eq!(e.kind, TypeErrorKind::InvalidArguments),
        other => panic!("expected arity error, got {:?}", other),
    }
}

// ---------------------------------------------------------------- E5

#[test]
fn e5_slicing() {
    let ok = compile_fn(
        slice(
            Node::ident("x0", 1),
            vec![range(3, 7, 1), Node::int(2, 1)],
            1,
        ),
        &[stream_of(PrimType::Real64, &[10, 4])],
    )
    .unwrap();
    match &ok.result_type {
        Type::Stream(s) => assert_eq!(s.size, vec![Dim::Finite(5)]),
        other => panic!("expected stream, got {:?}", other),
    }

    let err = compile_fn(
        slice(
            Node::ident("x0", 1),
            vec![range(3, 7, 1), Node::int(5, 1)],
            1,
        ),
        &[stream_of(PrimType::Real64, &[10, 4])],
    );
    assert!(err.is_err());
}

// ---------------------------------------------------------------- E6

#[test]
fn e6_floor_remainder() {
    assert_eq!(floor_rem_i64(-1, 4), 3);
    assert_eq!(floor_rem_i64(1, -4), -3);
    assert!((floor_rem_f64(-7.5, 2.0) - 0.5).abs() < 1e-12);
}

// --------------------------------------------------- finite round trip

#[test]
fn finite_program_has_no_periodic_part() {
    // out = reduce(a, b in 1.0 * (1..4)) a + b  -- all finite.
    // Simpler: out = x0[1..4] + x0[5..8] over a finite input.
    let body = Node::binary(
        BinOp::Add,
        slice(Node::ident("x0", 1), vec![range(1, 4, 1)], 1),
        slice(Node::ident("x0", 1), vec![range(5, 8, 1)], 1),
        1,
    );
    let out = compile_fn(body, &[stream_of(PrimType::Real64, &[8])]).unwrap();

    assert!(out.model.statements.iter().all(|s| !s.is_infinite()));
    // Everything runs in initialize; process only declares stack arrays.
    let has_loops = |stmts: &[arrpc::codegen::CStmt]| {
        stmts.iter().any(|s| matches!(s, arrpc::codegen::CStmt::For { .. }))
    };
    assert!(has_loops(&out.kernel.initialize.body));
    assert!(!has_loops(&out.kernel.process.body));
    assert!(!out.report.outputs[0].is_stream);
    assert_eq!(out.report.outputs[0].period_count, 0);
}

// ------------------------------------------------------- invariants

#[test]
fn invariant_access_arity_and_canonical_stream_dim() {
    let iteration = Node::new(
        NodeKind::ForIteration {
            id: Some("w".into()),
            size: Some(Box::new(Node::int(4, 1))),
            hop: Some(Box::new(Node::int(4, 1))),
            domain: Box::new(Node::ident("x0", 1)),
        },
        1,
    );
    let reduce = Node::new(
        NodeKind::Reduce {
            accumulator: "a".into(),
            element: "b".into(),
            domain: Box::new(Node::ident("w", 1)),
            body: Box::new(Node::block(
                Node::binary(BinOp::Add, Node::ident("a", 1), Node::ident("b", 1), 1),
                1,
            )),
        },
        1,
    );
    let body = Node::new(
        NodeKind::For {
            iterations: vec![iteration],
            body: Box::new(Node::block(reduce, 1)),
        },
        1,
    );
    let out = compile_fn(body, &[stream_of(PrimType::Real64, &[-1])]).unwrap();

    for (i, stmt) in out.model.statements.iter().enumerate() {
        // Every access has as many inputs as its statement has dims.
        for (_, matrix) in out.model.reads_of(StmtId(i)) {
            assert_eq!(matrix.in_dim, stmt.domain.len());
        }
        // At most one infinite dimension, always outermost.
        let infinite: Vec<usize> = stmt
            .domain
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_infinite())
            .map(|(i, _)| i)
            .collect();
        assert!(infinite.len() <= 1);
        if let Some(&k) = infinite.first() {
            assert_eq!(k, 0);
        }
    }
}

#[test]
fn invariant_schedule_respects_dependencies() {
    let body = Node::binary(
        BinOp::Multiply,
        Node::ident("x0", 1),
        Node::ident("gain", 1),
        1,
    );
    let mut env = Environment::new();
    env.define(Symbol::expression("gain", Node::block(Node::real(0.5, 1), 1)));
    env.define(Symbol::function("out", vec!["x0".into()], Node::block(body, 1)));
    let out = compile(env, "out", &[stream_of(PrimType::Real64, &[-1])]).unwrap();

    for (producer, consumer) in
        arrpc::transform::scheduler::dependence_pairs(&out.model)
    {
        assert!(out.schedule.position(producer) < out.schedule.position(consumer));
    }

    // A finite constant read by the periodic phase must live in state.
    let gain = array_named(&out, "gain");
    assert!(gain.inter_period_dependency);
    assert!(!out.buffers["gain"].on_stack);
}

#[test]
fn invariant_state_struct_and_phase_fields() {
    let iteration = Node::new(
        NodeKind::ForIteration {
            id: Some("w".into()),
            size: Some(Box::new(Node::int(3, 1))),
            hop: Some(Box::new(Node::int(1, 1))),
            domain: Box::new(Node::ident("x0", 1)),
        },
        1,
    );
    // Sliding window sum: out[t] = x0[t] + x0[t+1] + x0[t+2].
    let body = Node::new(
        NodeKind::For {
            iterations: vec![iteration],
            body: Box::new(Node::block(
                Node::binary(
                    BinOp::Add,
                    slice(Node::ident("w", 1), vec![Node::int(1, 1)], 1),
                    Node::binary(
                        BinOp::Add,
                        slice(Node::ident("w", 1), vec![Node::int(2, 1)], 1),
                        slice(Node::ident("w", 1), vec![Node::int(3, 1)], 1),
                        1,
                    ),
                    1,
                ),
            1,
            )),
        },
        1,
    );
    let out = compile_fn(body, &[stream_of(PrimType::Real64, &[-1])]).unwrap();

    // peek 3, pop 1: the input ring holds the lookahead.
    assert_eq!(out.dataflow.edges.iter().map(|e| e.peek).max(), Some(3));
    let input = array_named(&out, "x0");
    assert!(input.buffer_size[0] >= 3);

    // Phase bookkeeping: every phased array has a state field and the
    // phase advance is congruent with the period.
    for array in &out.model.arrays {
        let info = out.buffers[&array.name];
        if info.has_phase {
            let field = format!("{}_ph", array.name);
            assert!(out.kernel.state.iter().any(|f| matches!(
                f,
                StateField::Phase { name } if *name == field
            )));
            // The phase advance is congruent with the ring size.
            let b = array.buffer_size[0];
            let mut phase = array.period_offset % b;
            for _ in 0..8 {
                assert!((0..b).contains(&phase));
                phase = (phase + array.period) % b;
            }
        }
    }

    // Stack arrays together stay within the byte budget.
    let stack_bytes: i64 = out
        .model
        .arrays
        .iter()
        .filter(|a| out.buffers[&a.name].on_stack)
        .map(|a| a.buffer_volume() * a.ty.byte_size())
        .sum();
    assert!(stack_bytes <= arrpc::transform::STACK_BUDGET);
}

#[test]
fn invariant_monomorphization_idempotent() {
    let g_body = Node::block(
        Node::binary(BinOp::Add, Node::ident("a", 1), Node::real(1.0, 1), 1),
        1,
    );
    let x_body = Node::block(
        Node::call(Node::ident("g", 2), vec![Node::real(2.0, 2)], 2),
        2,
    );
    let mut env = Environment::new();
    env.define(Symbol::function("g", vec!["a".into()], g_body));
    env.define(Symbol::expression("x", x_body));

    let mut session = Session::new(env);
    let mut checker = Checker::new(&mut session);
    let first = checker.check("x", &[]).unwrap();
    let count = session.env.len();

    // Re-checking the expanded program creates no clones
    // and infers the same type.
    let mut checker = Checker::new(&mut session);
    let second = checker.check("x", &[]).unwrap();
    assert_eq!(session.env.len(), count);
    assert_eq!(format!("{}", first), format!("{}", second));
}

// ------------------------------------------------------- kernel shape

#[test]
fn kernel_carries_helpers_and_externs() {
    let out = compile_fn(Node::ident("x0", 1), &[stream_of(PrimType::Real64, &[-1])]).unwrap();

    assert_eq!(out.kernel.helpers.len(), 2);
    assert!(out.kernel.helpers.iter().all(|h| h.name == "remainder"));
    assert_eq!(out.kernel.externs[0].name, "input");
    assert_eq!(out.kernel.externs[1].name, "output");
    assert_eq!(out.kernel.get_output.name, "get_output");

    // Both entry points take the inputs plus the state pointer.
    assert_eq!(out.kernel.initialize.params.len(), 2);
    assert_eq!(out.kernel.process.params.len(), 2);
    assert_eq!(out.kernel.initialize.params[1].name, "s");
}

#[test]
fn report_serializes_to_expected_shape() {
    let out = compile_fn(Node::ident("x0", 1), &[stream_of(PrimType::Real32, &[-1])]).unwrap();
    let json = serde_json::to_value(&out.report).unwrap();
    let input = &json["inputs"][0];
    assert_eq!(input["type"], "real32");
    assert_eq!(input["is_stream"], true);
    assert_eq!(input["period_count"], 1);
    assert_eq!(json["namespace"], "out");
}

// ------------------------------------------------------ user functions

#[test]
fn user_functions_monomorphize_per_call_site() {
    // g(a) = a * 2.0 applied to a stream and to a scalar.
    let g_body = Node::block(
        Node::binary(BinOp::Multiply, Node::ident("a", 1), Node::real(2.0, 1), 1),
        1,
    );
    let out_body = Node::binary(
        BinOp::Add,
        Node::call(Node::ident("g", 2), vec![Node::ident("x0", 2)], 2),
        Node::call(Node::ident("g", 2), vec![Node::real(1.0, 2)], 2),
        2,
    );
    let mut env = Environment::new();
    env.define(Symbol::function("g", vec!["a".into()], g_body));
    env.define(Symbol::function("out", vec!["x0".into()], Node::block(out_body, 2)));

    let out = compile(env, "out", &[stream_of(PrimType::Real64, &[-1])]).unwrap();

    // Two g instances plus the entry instance were registered.
    assert!(matches!(out.result_type, Type::Stream(_)));
    let compute = producer_of(&out, "out");
    match &compute.expr {
        Expr::Primitive { op, operands, .. } => {
            assert_eq!(*op, arrpc::polyhedral::PrimitiveOp::Add);
            assert!(matches!(operands[0], Expr::Primitive { .. }));
        }
        other => panic!("expected inlined add, got {:?}", other),
    }
}
