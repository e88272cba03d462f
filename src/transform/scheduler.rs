//! Schedule construction (stage S4, scheduling half).
//!
//! Rebases every infinite statement into a two-level dataflow domain
//! with a leading period index (`i_orig = p * steady + i_inner + init`),
//! places statements in dependence-topological order, and exposes both
//! the affine schedule maps and the loop-nest AST that the imperative
//! lowerer walks.
//!
//! Any legal topological embedding is acceptable; ties are broken by
//! statement index so identical inputs schedule identically.

use crate::frontend::types::Dim;
use crate::polyhedral::matrix::AffineMatrix;
use crate::polyhedral::model::{Model, StmtId};
use crate::utils::errors::{CompileResult, ScheduleError};
use std::collections::{HashMap, HashSet, VecDeque};

/// One statement's affine map into the shared time space.
///
/// Infinite statements map from their dataflow domain `[p, i...]`; finite
/// statements map from their original domain. The time space is
/// `[period, position, inner...]`, padded with zeros to a common depth.
#[derive(Debug, Clone)]
pub struct ScheduleMap {
    pub stmt: StmtId,
    pub map: AffineMatrix,
}

/// The computed schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Statements in execution order within one period.
    pub order: Vec<StmtId>,
    /// Dimensionality of the shared time space.
    pub time_dim: usize,
    pub maps: Vec<ScheduleMap>,
}

impl Schedule {
    pub fn position(&self, stmt: StmtId) -> usize {
        self.order.iter().position(|&s| s == stmt).expect("scheduled statement")
    }

    pub fn map_for(&self, stmt: StmtId) -> &AffineMatrix {
        &self.maps.iter().find(|m| m.stmt == stmt).expect("scheduled statement").map
    }
}

/// The loop-nest AST exposed to the imperative lowerer: a perfect nest
/// of integer loops per scheduled statement.
#[derive(Debug, Clone)]
pub enum LoopNode {
    Block(Vec<LoopNode>),
    For {
        /// Loop variable index within the enclosing nest.
        var: usize,
        lower: i64,
        /// Exclusive upper bound.
        upper: i64,
        step: i64,
        body: Vec<LoopNode>,
    },
    /// Guard on an affine condition over the loop variables (`row >= 0`).
    If {
        cond: AffineMatrix,
        body: Vec<LoopNode>,
    },
    /// Invoke a statement at an index vector of affine expressions over
    /// the loop variables in scope.
    StmtCall {
        stmt: StmtId,
        index: Vec<AffineMatrix>,
    },
}

/// Compute the schedule for an analyzed model.
pub fn schedule(model: &Model) -> CompileResult<Schedule> {
    let order = topological_order(model)?;
    let max_rank = model
        .statements
        .iter()
        .map(|s| s.domain.len())
        .max()
        .unwrap_or(0);
    let time_dim = 2 + max_rank;

    let mut maps = Vec::with_capacity(order.len());
    for (position, &id) in order.iter().enumerate() {
        let stmt = model.statement(id);
        let rank = stmt.domain.len();
        let infinite = stmt.is_infinite();
        let in_dim = if infinite { rank + 1 } else { rank };

        let mut map = AffineMatrix::zero(in_dim, time_dim);
        if infinite {
            // Time dim 0 tracks the period index.
            map.set_coef(0, 0, 1);
        }
        map.set_constant(1, position as i64);
        for d in 0..rank {
            let src = if infinite { d + 1 } else { d };
            map.set_coef(2 + d, src, 1);
        }
        maps.push(ScheduleMap { stmt: id, map });
    }

    Ok(Schedule { order, time_dim, maps })
}

/// Dependence-topological statement order (Kahn's algorithm, determinist
/// tie-breaks by statement index).
fn topological_order(model: &Model) -> CompileResult<Vec<StmtId>> {
    let n = model.statements.len();
    let mut in_degree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut seen: HashSet<(usize, usize)> = HashSet::new();

    for idx in 0..n {
        for (array, _) in model.reads_of(StmtId(idx)) {
            let Some(producer) = model.array(array).producer else { continue };
            if producer.0 == idx {
                continue;
            }
            if seen.insert((producer.0, idx)) {
                successors[producer.0].push(idx);
                in_degree[idx] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> =
        (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut result = Vec::with_capacity(n);
    while let Some(next) = queue.pop_front() {
        result.push(StmtId(next));
        for &succ in &successors[next] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                // Keep the queue sorted so ties resolve by index.
                let pos = queue
                    .iter()
                    .position(|&q| q > succ)
                    .unwrap_or(queue.len());
                queue.insert(pos, succ);
            }
        }
    }

    if result.len() != n {
        return Err(ScheduleError::new(
            "No legal schedule: cyclic dependencies between statements.",
        )
        .into());
    }
    Ok(result)
}

/// Extents driving the initialization slice: finite statements run their
/// whole domain, infinite statements run the init prefix plus the first
/// steady period along the stream.
fn initialize_extents(model: &Model, id: StmtId) -> Vec<i64> {
    let stmt = model.statement(id);
    stmt.domain
        .iter()
        .enumerate()
        .map(|(d, dim)| match dim {
            Dim::Finite(e) => *e,
            Dim::Infinite => {
                debug_assert_eq!(stmt.dimension, Some(d));
                stmt.init_count + stmt.steady_count
            }
        })
        .collect()
}

/// Extents of one steady period.
fn process_extents(model: &Model, id: StmtId) -> Vec<i64> {
    let stmt = model.statement(id);
    stmt.domain
        .iter()
        .map(|dim| match dim {
            Dim::Finite(e) => *e,
            Dim::Infinite => stmt.steady_count,
        })
        .collect()
}

fn nest_for(id: StmtId, extents: &[i64]) -> LoopNode {
    let rank = extents.len();
    let index: Vec<AffineMatrix> =
        (0..rank).map(|d| AffineMatrix::row_select(d, rank)).collect();
    let mut node = LoopNode::StmtCall { stmt: id, index };
    for (var, &extent) in extents.iter().enumerate().rev() {
        node = LoopNode::For { var, lower: 0, upper: extent, step: 1, body: vec![node] };
    }
    node
}

/// The loop-nest AST of the `initialize` procedure.
pub fn initialize_nest(model: &Model, schedule: &Schedule) -> LoopNode {
    let mut nodes = Vec::new();
    for &id in &schedule.order {
        let extents = initialize_extents(model, id);
        if extents.iter().any(|&e| e == 0) {
            continue;
        }
        nodes.push(nest_for(id, &extents));
    }
    LoopNode::Block(nodes)
}

/// The loop-nest AST of one steady period (the `process` procedure).
/// Finite statements have no periodic part.
pub fn process_nest(model: &Model, schedule: &Schedule) -> LoopNode {
    let mut nodes = Vec::new();
    for &id in &schedule.order {
        if !model.statement(id).is_infinite() {
            continue;
        }
        let extents = process_extents(model, id);
        if extents.iter().any(|&e| e == 0) {
            continue;
        }
        nodes.push(nest_for(id, &extents));
    }
    LoopNode::Block(nodes)
}

/// Evaluate a schedule map at a dataflow-domain point; used by tests to
/// compare logical times.
pub fn time_of(schedule: &Schedule, stmt: StmtId, point: &[i64]) -> Vec<i64> {
    schedule.map_for(stmt).apply(point)
}

/// Lexicographic comparison of two time vectors.
pub fn time_leq(a: &[i64], b: &[i64]) -> bool {
    a <= b
}

/// Dependence edges as (producer, consumer) pairs; exposed for tests.
pub fn dependence_pairs(model: &Model) -> Vec<(StmtId, StmtId)> {
    let mut pairs = Vec::new();
    let mut seen = HashMap::new();
    for idx in 0..model.statements.len() {
        for (array, _) in model.reads_of(StmtId(idx)) {
            if let Some(producer) = model.array(array).producer {
                if producer.0 != idx && seen.insert((producer.0, idx), true).is_none() {
                    pairs.push((producer, StmtId(idx)));
                }
            }
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::types::PrimType;
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

    /// in -> mid -> out chain on an infinite stream, declared backwards
    /// so the topological order has to reorder nothing (insertion order
    /// already respects deps here, but positions are still asserted).
    fn chain() -> Model {
        let mut model = Model::new();
        let mut prev: Option<ArrayId> = None;
        for name in ["a", "b", "c"] {
            let arr = model.add_array(array(name, vec![Dim::Infinite]));
            let expr = match prev {
                None => Expr::ConstReal(0.0),
                Some(src) => Expr::ArrayRead { array: src, matrix: AffineMatrix::identity(1) },
            };
            let stmt = model.add_statement(Statement {
                name: String::new(),
                domain: vec![Dim::Infinite],
                expr,
                write: AccessRelation { array: arr, matrix: AffineMatrix::identity(1) },
                dimension: Some(0),
                init_count: 0,
                steady_count: 1,
                buffer_size: None,
            });
            model.array_mut(arr).producer = Some(stmt);
            prev = Some(arr);
        }
        model
    }

    #[test]
    fn test_topological_positions_respect_deps() {
        let model = chain();
        let sched = schedule(&model).unwrap();
        for (producer, consumer) in dependence_pairs(&model) {
            assert!(sched.position(producer) < sched.position(consumer));
        }
    }

    #[test]
    fn test_schedule_map_shape() {
        let model = chain();
        let sched = schedule(&model).unwrap();
        // Infinite statement: [p, i] -> [p, pos, i].
        let t = time_of(&sched, StmtId(0), &[3, 7]);
        assert_eq!(t, vec![3, 0, 7]);
        let t = time_of(&sched, StmtId(2), &[3, 7]);
        assert_eq!(t, vec![3, 2, 7]);
    }

    #[test]
    fn test_schedule_orders_within_period() {
        let model = chain();
        let sched = schedule(&model).unwrap();
        // Same period, same inner index: producer strictly earlier.
        let a = time_of(&sched, StmtId(0), &[1, 0]);
        let b = time_of(&sched, StmtId(1), &[1, 0]);
        assert!(time_leq(&a, &b) && a != b);
        // Earlier period always earlier.
        let c = time_of(&sched, StmtId(2), &[0, 9]);
        assert!(time_leq(&c, &a));
    }

    #[test]
    fn test_process_nest_covers_steady_counts() {
        let mut model = chain();
        model.statements[0].steady_count = 2;
        let sched = schedule(&model).unwrap();
        let nest = process_nest(&model, &sched);
        let LoopNode::Block(nodes) = nest else { panic!("expected block") };
        assert_eq!(nodes.len(), 3);
        let LoopNode::For { upper, .. } = &nodes[0] else { panic!("expected loop") };
        assert_eq!(*upper, 2);
    }

    #[test]
    fn test_initialize_nest_includes_init_prefix() {
        let mut model = chain();
        model.statements[0].init_count = 2;
        let sched = schedule(&model).unwrap();
        let nest = initialize_nest(&model, &sched);
        let LoopNode::Block(nodes) = nest else { panic!("expected block") };
        let LoopNode::For { upper, .. } = &nodes[0] else { panic!("expected loop") };
        // init prefix (2) plus first period (1)
        assert_eq!(*upper, 3);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut model = Model::new();
        let a = model.add_array(array("a", vec![Dim::Finite(4)]));
        let b = model.add_array(array("b", vec![Dim::Finite(4)]));
        let s0 = model.add_statement(Statement {
            name: String::new(),
            domain: vec![Dim::Finite(4)],
            expr: Expr::ArrayRead { array: b, matrix: AffineMatrix::identity(1) },
            write: AccessRelation { array: a, matrix: AffineMatrix::identity(1) },
            dimension: None,
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        });
        let s1 = model.add_statement(Statement {
            name: String::new(),
            domain: vec![Dim::Finite(4)],
            expr: Expr::ArrayRead { array: a, matrix: AffineMatrix::identity(1) },
            write: AccessRelation { array: b, matrix: AffineMatrix::identity(1) },
            dimension: None,
            init_count: 0,
            steady_count: 1,
            buffer_size: None,
        });
        model.array_mut(a).producer = Some(s0);
        model.array_mut(b).producer = Some(s1);
        assert!(schedule(&model).is_err());
    }
}
