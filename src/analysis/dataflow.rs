//! Dataflow analysis on the streaming dimension (stage S3).
//!
//! Detects each statement's streaming dimension, extracts the dataflow
//! graph from the affine reads, balances production and consumption
//! rates through an integer nullspace, and computes the initialization
//! counts that prime the buffers.

use crate::polyhedral::matrix::AffineMatrix;
use crate::polyhedral::model::{Model, StmtId};
use crate::utils::errors::{CompileResult, PolyhedralError, PolyhedralErrorKind};
use crate::utils::matrix::{primitive_integer_vector, RationalMatrix};

/// A producer-consumer pair with per-iteration rates.
#[derive(Debug, Clone)]
pub struct DataflowEdge {
    pub source: StmtId,
    pub sink: StmtId,
    /// Tokens produced per source iteration along its streaming axis.
    pub push: i64,
    /// Tokens consumed per sink iteration along the streaming axis.
    pub pop: i64,
    /// Tokens that must exist for one sink iteration to run.
    pub peek: i64,
    /// How far into the past the sink reads: the priming depth.
    pub delay: i64,
    /// Smallest source index read by the sink iteration at the origin.
    pub min_offset: i64,
}

/// The solved dataflow graph.
#[derive(Debug, Clone, Default)]
pub struct Dataflow {
    pub edges: Vec<DataflowEdge>,
}

impl Dataflow {
    /// Edges consuming the given statement's output.
    pub fn consumers_of(&self, source: StmtId) -> impl Iterator<Item = &DataflowEdge> {
        self.edges.iter().filter(move |e| e.source == source)
    }
}

/// Run the dataflow analysis, annotating each statement with its
/// streaming dimension, steady count, and init count.
pub fn analyze(model: &mut Model) -> CompileResult<Dataflow> {
    detect_streaming_dimensions(model)?;
    let edges = collect_edges(model)?;
    if !edges.is_empty() {
        compute_counts(model, &edges)?;
    }
    Ok(Dataflow { edges })
}

fn detect_streaming_dimensions(model: &mut Model) -> CompileResult<()> {
    let mut invalid = Vec::new();
    for stmt in &mut model.statements {
        let infinite: Vec<usize> = stmt
            .domain
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_infinite())
            .map(|(i, _)| i)
            .collect();
        match infinite.len() {
            0 => stmt.dimension = None,
            1 => stmt.dimension = Some(infinite[0]),
            _ => invalid.push(stmt.name.clone()),
        }
    }
    if !invalid.is_empty() {
        return Err(PolyhedralError::new(
            PolyhedralErrorKind::MultipleInfiniteDimensions,
            format!(
                "The following statements are infinite in more than 1 dimension: {}",
                invalid.join(", ")
            ),
        )
        .into());
    }
    Ok(())
}

fn collect_edges(model: &Model) -> CompileResult<Vec<DataflowEdge>> {
    let mut edges = Vec::new();

    for (idx, stmt) in model.statements.iter().enumerate() {
        let sink = StmtId(idx);
        let Some(sink_dim) = stmt.dimension else { continue };

        for (array, matrix) in model.reads_of(sink) {
            let Some(source) = model.array(array).producer else { continue };
            if source == sink {
                continue;
            }
            let source_stmt = model.statement(source);
            let Some(source_dim) = source_stmt.dimension else {
                // Finite producers are fully materialized during
                // initialization; they impose no rate constraint.
                continue;
            };

            let edge = extract_edge(stmt, sink, sink_dim, source, source_dim, &matrix)?;
            edges.push(edge);
        }
    }
    Ok(edges)
}

fn extract_edge(
    sink_stmt: &crate::polyhedral::model::Statement,
    sink: StmtId,
    sink_dim: usize,
    source: StmtId,
    source_dim: usize,
    matrix: &AffineMatrix,
) -> CompileResult<DataflowEdge> {
    let mut flow_row = None;
    for out in 0..matrix.out_dim {
        if matrix.coef(out, sink_dim) != 0 {
            flow_row = Some(out);
            break;
        }
    }
    let Some(flow_row) = flow_row else {
        return Err(PolyhedralError::new(
            PolyhedralErrorKind::FlowDimensionMismatch,
            "Sink flow dimension does not map to any source dimension.",
        )
        .into());
    };
    if flow_row != source_dim {
        return Err(PolyhedralError::new(
            PolyhedralErrorKind::FlowDimensionMismatch,
            "Sink flow dimension does not map to source flow dimension.",
        )
        .into());
    }

    let pop = matrix.coef(flow_row, sink_dim);
    if pop <= 0 {
        return Err(PolyhedralError::new(
            PolyhedralErrorKind::FlowDimensionMismatch,
            "Streaming access must advance with the stream.",
        )
        .into());
    }

    // The furthest source token one sink iteration touches: evaluate the
    // flow row at the origin of the stream with every other coordinate at
    // its last point.
    let far_point: Vec<i64> = sink_stmt
        .domain
        .iter()
        .enumerate()
        .map(|(i, d)| {
            if i == sink_dim {
                0
            } else {
                d.extent().map(|e| e - 1).unwrap_or(0)
            }
        })
        .collect();
    let furthest = matrix.row(flow_row).apply(&far_point)[0];
    let peek = (furthest + 1).max(1);

    // The nearest token: negative offsets read into the past and must be
    // primed by the producer.
    let min_offset = matrix.row(flow_row).constant(0);
    let delay = (-min_offset).max(0);

    Ok(DataflowEdge { source, sink, push: 1, pop, peek, delay, min_offset })
}

fn compute_counts(model: &mut Model, edges: &[DataflowEdge]) -> CompileResult<()> {
    // Statements involved in at least one edge, in first-seen order.
    let mut involved: Vec<StmtId> = Vec::new();
    for edge in edges {
        for id in [edge.source, edge.sink] {
            if !involved.contains(&id) {
                involved.push(id);
            }
        }
    }
    let column = |id: StmtId| involved.iter().position(|&s| s == id).unwrap();

    // Steady counts: F r = 0 with +push on the producer column and -pop
    // on the consumer column.
    let mut flow = RationalMatrix::zeros(edges.len(), involved.len());
    for (row, edge) in edges.iter().enumerate() {
        flow.set_int(row, column(edge.source), edge.push);
        flow.set_int(row, column(edge.sink), -edge.pop);
    }

    let nullspace = flow.nullspace();
    if nullspace.len() != 1 {
        return Err(PolyhedralError::new(
            PolyhedralErrorKind::UnbalancedDataflow,
            format!(
                "Dataflow graph is unbalanced: rate nullspace is {}-dimensional.",
                nullspace.len()
            ),
        )
        .into());
    }
    let steady = primitive_integer_vector(&nullspace[0]);
    if steady.iter().any(|&r| r <= 0) {
        return Err(PolyhedralError::new(
            PolyhedralErrorKind::UnbalancedDataflow,
            "Dataflow graph has no positive rate vector.",
        )
        .into());
    }

    // Initialization counts: the least non-negative fixpoint of
    //   push*i_src >= pop*i_sink + peek - pop + delay - (push*r_src - pop*r_sink)
    // computed by monotone relaxation. Each constraint lower-bounds a
    // producer by a monotone function of its consumer, so the fixpoint is
    // componentwise least.
    let mut init = vec![0i64; involved.len()];
    let limit = involved.len() * edges.len() + 8;
    let mut rounds = 0;
    loop {
        let mut changed = false;
        for edge in edges {
            let src = column(edge.source);
            let snk = column(edge.sink);
            let balance = edge.push * steady[src] - edge.pop * steady[snk];
            let needed = edge.pop * init[snk] + edge.peek - edge.pop + edge.delay - balance;
            let required = div_ceil(needed, edge.push);
            if init[src] < required {
                init[src] = required;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        rounds += 1;
        if rounds > limit {
            return Err(PolyhedralError::new(
                PolyhedralErrorKind::UnbalancedDataflow,
                "Initialization counts do not converge.",
            )
            .into());
        }
    }

    for (pos, &id) in involved.iter().enumerate() {
        let stmt = model.statement_mut(id);
        stmt.steady_count = steady[pos];
        stmt.init_count = init[pos];
    }
    Ok(())
}

fn div_ceil(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    a.div_euclid(b) + i64::from(a.rem_euclid(b) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::types::{Dim, PrimType};
    use crate::polyhedral::model::{AccessRelation, Array, ArrayId, Expr, Statement};

    fn array(name: &str, size: Vec<Dim>) -> Array {
        Array {
            name: name.into(),
            ty: PrimType::Real64,
            size: size.clone(),
            period: 0,
            period_offset: 0,
            buffer_size: Vec::new(),
            is_infinite: size.iter().any(Dim::is_infinite),
            inter_period_dependency: false,
            producer: None,
            input_channel: None,
        }
    }

    fn stmt(domain: Vec<Dim>, expr: Expr, write: ArrayId) -> Statement {
        let rank = domain.len();
        Statement {
            name: String::new(),
            domain,
            expr,
            write: AccessRelation { array: write, matrix: AffineMatrix::identity(rank) },
            dimension: None,
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        }
    }

    /// producer -> consumer reading with the given 1-D access row.
    fn chain_model(coef: i64, constant: i64) -> Model {
        let mut model = Model::new();
        let a = model.add_array(array("a", vec![Dim::Infinite]));
        let b = model.add_array(array("b", vec![Dim::Infinite]));

        let s0 = model.add_statement(stmt(
            vec![Dim::Infinite],
            Expr::ExternalCall {
                name: "a".into(),
                source: AccessRelation { array: a, matrix: AffineMatrix::identity(1) },
            },
            a,
        ));
        model.array_mut(a).producer = Some(s0);

        let mut access = AffineMatrix::zero(1, 1);
        access.set_coef(0, 0, coef);
        access.set_constant(0, constant);
        let s1 = model.add_statement(stmt(
            vec![Dim::Infinite],
            Expr::ArrayRead { array: a, matrix: access },
            b,
        ));
        model.array_mut(b).producer = Some(s1);
        model
    }

    #[test]
    fn test_identity_counts() {
        let mut model = chain_model(1, 0);
        let flow = analyze(&mut model).unwrap();
        assert_eq!(flow.edges.len(), 1);
        let e = &flow.edges[0];
        assert_eq!((e.push, e.pop, e.peek, e.delay), (1, 1, 1, 0));
        assert_eq!(model.statements[0].steady_count, 1);
        assert_eq!(model.statements[0].init_count, 0);
        assert_eq!(model.statements[1].init_count, 0);
    }

    #[test]
    fn test_delay_primes_the_producer() {
        // b[t] = a[t - 2]
        let mut model = chain_model(1, -2);
        let flow = analyze(&mut model).unwrap();
        let e = &flow.edges[0];
        assert_eq!((e.push, e.pop, e.peek, e.delay), (1, 1, 1, 2));
        assert_eq!(model.statements[0].init_count, 2);
        assert_eq!(model.statements[1].init_count, 0);
        assert_eq!(model.statements[0].steady_count, 1);
        assert_eq!(model.statements[1].steady_count, 1);
    }

    #[test]
    fn test_downsample_rates() {
        // b[t] = a[2t + 1]: pop 2, peek 2, steady (2, 1).
        let mut model = chain_model(2, 1);
        let flow = analyze(&mut model).unwrap();
        let e = &flow.edges[0];
        assert_eq!((e.push, e.pop, e.peek), (1, 2, 2));
        assert_eq!(model.statements[0].steady_count, 2);
        assert_eq!(model.statements[1].steady_count, 1);
        assert_eq!(model.statements[0].init_count, 0);
    }

    #[test]
    fn test_rate_balance_invariant() {
        let mut model = chain_model(3, 0);
        let flow = analyze(&mut model).unwrap();
        for e in &flow.edges {
            let ra = model.statement(e.source).steady_count;
            let rb = model.statement(e.sink).steady_count;
            assert_eq!(e.push * ra, e.pop * rb);
        }
    }

    #[test]
    fn test_two_infinite_dimensions_rejected() {
        let mut model = Model::new();
        let a = model.add_array(array("a", vec![Dim::Infinite, Dim::Infinite]));
        let s = model.add_statement(stmt(
            vec![Dim::Infinite, Dim::Infinite],
            Expr::ConstInt(0),
            a,
        ));
        model.array_mut(a).producer = Some(s);
        let err = analyze(&mut model).unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("more than 1 dimension"));
    }

    #[test]
    fn test_flow_dimension_mismatch() {
        // Consumer's access does not touch the source's stream dimension.
        let mut model = Model::new();
        let a = model.add_array(array("a", vec![Dim::Infinite, Dim::Finite(4)]));
        let b = model.add_array(array("b", vec![Dim::Infinite]));
        let s0 = model.add_statement(stmt(
            vec![Dim::Infinite, Dim::Finite(4)],
            Expr::ConstInt(0),
            a,
        ));
        model.array_mut(a).producer = Some(s0);

        // b[t] reads a[0, t]: the sink stream maps to a finite source dim.
        let mut access = AffineMatrix::zero(1, 2);
        access.set_coef(1, 0, 1);
        let s1 = model.add_statement(stmt(
            vec![Dim::Infinite],
            Expr::ArrayRead { array: a, matrix: access },
            b,
        ));
        model.array_mut(b).producer = Some(s1);

        let err = analyze(&mut model).unwrap_err();
        assert!(format!("{}", err).contains("source flow dimension"));
    }

    #[test]
    fn test_windowed_peek_uses_window_extent() {
        // Sink domain [~, 4] reading a[4t + j]: peek = 4.
        let mut model = Model::new();
        let a = model.add_array(array("a", vec![Dim::Infinite]));
        let b = model.add_array(array("b", vec![Dim::Infinite, Dim::Finite(4)]));
        let s0 = model.add_statement(stmt(
            vec![Dim::Infinite],
            Expr::ExternalCall {
                name: "a".into(),
                source: AccessRelation { array: a, matrix: AffineMatrix::identity(1) },
            },
            a,
        ));
        model.array_mut(a).producer = Some(s0);

        let mut access = AffineMatrix::zero(2, 1);
        access.set_coef(0, 0, 4);
        access.set_coef(0, 1, 1);
        let s1 = model.add_statement(stmt(
            vec![Dim::Infinite, Dim::Finite(4)],
            Expr::ArrayRead { array: a, matrix: access },
            b,
        ));
        model.array_mut(b).producer = Some(s1);

        let flow = analyze(&mut model).unwrap();
        let e = &flow.edges[0];
        assert_eq!(e.pop, 4);
        assert_eq!(e.peek, 4);
        assert_eq!(model.statements[0].steady_count, 4);
        assert_eq!(model.statements[1].steady_count, 1);
    }

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(7, 2), 4);
        assert_eq!(div_ceil(6, 2), 3);
        assert_eq!(div_ceil(-3, 2), -1);
        assert_eq!(div_ceil(0, 5), 0);
    }
}
