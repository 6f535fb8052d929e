//! Stage scheduling.

use super::error::{PlannerError, PlannerResult};
use super::graph::ElementGraph;
use super::partition::StagePlan;
use crate::tap::same_instance;
use std::collections::VecDeque;

fn writes_into(graph: &ElementGraph, writer: &StagePlan, reader: &StagePlan) -> bool {
    writer.sinks.iter().any(|sink| {
        reader.sources.iter().any(|source| {
            if sink == source {
                return true;
            }
            let tap_of = |id| graph.element(id).and_then(|e| e.kind.tap());
            match (tap_of(*sink), tap_of(*source)) {
                (Some(a), Some(b)) => same_instance(a, b),
                _ => false,
            }
        })
    })
}

/// Order stages so every stage runs after the stages whose output it
/// reads. Ties keep discovery order.
///
/// Returns the ordered plans and the dependency edges between their new
/// positions.
pub(crate) fn schedule(
    graph: &ElementGraph,
    plans: Vec<StagePlan>,
) -> PlannerResult<(Vec<StagePlan>, Vec<(usize, usize)>)> {
    let n = plans.len();
    let mut fwd_adj = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    let mut dependencies = Vec::new();

    for (a, writer) in plans.iter().enumerate() {
        for (b, reader) in plans.iter().enumerate() {
            if !writes_into(graph, writer, reader) {
                continue;
            }
            if a == b {
                return Err(PlannerError::Internal(format!(
                    "stage '{}' reads its own output",
                    writer.label(graph)
                )));
            }
            fwd_adj[a].push(b);
            in_degree[b] += 1;
            dependencies.push((a, b));
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(stage) = queue.pop_front() {
        order.push(stage);
        for &next in &fwd_adj[stage] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != n {
        return Err(PlannerError::Internal("cycle detected between stages".to_string()));
    }

    let mut new_position = vec![0usize; n];
    for (position, &old) in order.iter().enumerate() {
        new_position[old] = position;
    }
    let mut dependencies: Vec<(usize, usize)> = dependencies
        .into_iter()
        .map(|(a, b)| (new_position[a], new_position[b]))
        .collect();
    dependencies.sort_unstable();
    dependencies.dedup();

    let mut slots: Vec<Option<StagePlan>> = plans.into_iter().map(Some).collect();
    let ordered = order.into_iter().filter_map(|i| slots[i].take()).collect();
    Ok((ordered, dependencies))
}
