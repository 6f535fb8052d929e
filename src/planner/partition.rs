//! Stage partitioning.
//!
//! Cuts the normalized graph into stages:
//!
//! - one stage per grouping: everything upstream of it back to taps is the
//!   mapper side, everything downstream of it forward to taps is the
//!   reducer side;
//! - one map-only stage per connected set of grouping-free elements that
//!   write to a tap, where elements reading the same input tap share a stage.
//!
//! A safe map-side prefix feeding several destinations is simply part of
//! several stages.

use super::error::{PlannerError, PlannerResult};
use super::graph::{ElementGraph, ElementKind};
use super::normalize::{compute_origins, Origin};
use crate::id::ElementId;
use crate::tap::same_instance;
use std::collections::BTreeMap;

/// A stage before it is scheduled and named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagePlan {
    pub grouping: Option<ElementId>,
    /// Taps read, in topological order.
    pub sources: Vec<ElementId>,
    /// Taps written, in topological order.
    pub sinks: Vec<ElementId>,
    pub mapper: Vec<ElementId>,
    pub reducer: Vec<ElementId>,
    /// Indices into the graph's edge list.
    pub edges: Vec<usize>,
    /// Topological position of the earliest member, for discovery order.
    pub anchor: usize,
}

impl StagePlan {
    fn new(
        graph: &ElementGraph,
        position: &[usize],
        grouping: Option<ElementId>,
        mut sources: Vec<ElementId>,
        mut sinks: Vec<ElementId>,
        mut mapper: Vec<ElementId>,
        mut reducer: Vec<ElementId>,
    ) -> Self {
        let by_position = |v: &mut Vec<ElementId>| {
            v.sort_by_key(|id| position[id.index()]);
            v.dedup();
        };
        by_position(&mut sources);
        by_position(&mut sinks);
        by_position(&mut mapper);
        by_position(&mut reducer);

        let mut from_set = vec![false; graph.capacity()];
        let mut to_set = vec![false; graph.capacity()];
        for id in sources.iter().chain(&mapper).chain(&reducer).chain(grouping.iter()) {
            from_set[id.index()] = true;
        }
        for id in sinks.iter().chain(&mapper).chain(&reducer).chain(grouping.iter()) {
            to_set[id.index()] = true;
        }
        let edges = graph
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| from_set[e.from.index()] && to_set[e.to.index()])
            .map(|(i, _)| i)
            .collect();

        let anchor = sources
            .iter()
            .chain(&mapper)
            .chain(grouping.iter())
            .chain(&reducer)
            .chain(&sinks)
            .map(|id| position[id.index()])
            .min()
            .unwrap_or(usize::MAX);

        Self {
            grouping,
            sources,
            sinks,
            mapper,
            reducer,
            edges,
            anchor,
        }
    }

    pub fn is_map_only(&self) -> bool {
        self.grouping.is_none()
    }

    /// Stage label built from what it writes.
    pub fn label(&self, graph: &ElementGraph) -> String {
        self.sinks
            .iter()
            .filter_map(|&id| graph.element(id))
            .map(|e| match &e.kind {
                ElementKind::Intermediate { tap } => tap.identifier().to_string(),
                _ => e.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Simple union-find over element slots.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower slot wins so roots are deterministic.
            let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[high] = low;
        }
    }
}

/// Partition a normalized graph into unscheduled stages.
pub(crate) fn partition(graph: &ElementGraph) -> PlannerResult<Vec<StagePlan>> {
    let order = graph.topological_order()?;
    let mut position = vec![usize::MAX; graph.capacity()];
    for (i, id) in order.iter().enumerate() {
        position[id.index()] = i;
    }
    let origins = compute_origins(graph, &order);
    let mut plans = Vec::new();

    for &id in &order {
        let Some(element) = graph.element(id) else {
            continue;
        };
        if !element.kind.is_grouping() {
            continue;
        }
        let (mut sources, mut mapper) = (Vec::new(), Vec::new());
        for up in graph.upstream_to_taps(id).into_iter().filter(|&u| u != id) {
            let Some(e) = graph.element(up) else { continue };
            if e.kind.is_grouping() {
                return Err(PlannerError::Internal(format!(
                    "grouping '{}' reaches grouping '{}' without a tap",
                    e.name, element.name
                )));
            }
            if e.is_tap() {
                sources.push(up);
            } else {
                mapper.push(up);
            }
        }
        let (mut sinks, mut reducer) = (Vec::new(), Vec::new());
        for down in graph.downstream_to_taps(id).into_iter().filter(|&d| d != id) {
            let Some(e) = graph.element(down) else { continue };
            if e.kind.is_grouping() {
                return Err(PlannerError::Internal(format!(
                    "grouping '{}' feeds grouping '{}' without a tap",
                    element.name, e.name
                )));
            }
            if e.is_tap() {
                sinks.push(down);
            } else {
                reducer.push(down);
            }
        }
        plans.push(StagePlan::new(graph, &position, Some(id), sources, sinks, mapper, reducer));
    }

    plans.extend(map_only_stages(graph, &order, &position, &origins));
    plans.sort_by_key(|p| p.anchor);
    Ok(plans)
}

fn map_only_stages(
    graph: &ElementGraph,
    order: &[ElementId],
    position: &[usize],
    origins: &[Origin],
) -> Vec<StagePlan> {
    let n = graph.capacity();

    // Map-side elements with a grouping-free path to an output tap.
    let mut reaches_output = vec![false; n];
    for &id in order.iter().rev() {
        let Some(element) = graph.element(id) else { continue };
        if element.is_tap() || element.kind.is_grouping() || origins[id.index()] != Origin::Map {
            continue;
        }
        reaches_output[id.index()] = graph.successors(id).iter().any(|&next| {
            graph.element(next).is_some_and(|e| {
                matches!(e.kind, ElementKind::Sink { .. } | ElementKind::Intermediate { .. })
                    || reaches_output[next.index()]
            })
        });
    }

    let is_input = |id: ElementId| {
        graph
            .element(id)
            .is_some_and(|e| matches!(e.kind, ElementKind::Source { .. } | ElementKind::Intermediate { .. }))
    };
    let mut member = vec![false; n];
    for element in graph.elements() {
        let id = element.id;
        member[id.index()] = match element.kind {
            ElementKind::Sink { .. } => graph
                .predecessors(id)
                .iter()
                .any(|&p| is_input(p) || reaches_output[p.index()]),
            _ => reaches_output[id.index()],
        };
    }

    let mut sets = DisjointSet::new(n);
    for edge in graph.edges() {
        if member[edge.from.index()] && member[edge.to.index()] {
            sets.union(edge.from.index(), edge.to.index());
        }
    }
    for &id in order {
        if !is_input(id) {
            continue;
        }
        let consumers: Vec<ElementId> = graph
            .successors(id)
            .into_iter()
            .filter(|c| member[c.index()])
            .collect();
        for pair in consumers.windows(2) {
            sets.union(pair[0].index(), pair[1].index());
        }
    }

    let mut components: BTreeMap<usize, Vec<ElementId>> = BTreeMap::new();
    for &id in order {
        if member[id.index()] {
            components.entry(sets.find(id.index())).or_default().push(id);
        }
    }

    components
        .into_values()
        .map(|members| {
            let mut sources = Vec::new();
            let mut sinks = Vec::new();
            let mut mapper = Vec::new();
            for &id in &members {
                let Some(element) = graph.element(id) else { continue };
                if matches!(element.kind, ElementKind::Sink { .. }) {
                    sinks.push(id);
                } else {
                    mapper.push(id);
                    for next in graph.successors(id) {
                        if graph
                            .element(next)
                            .is_some_and(|e| matches!(e.kind, ElementKind::Intermediate { .. }))
                        {
                            sinks.push(next);
                        }
                    }
                }
                for prev in graph.predecessors(id) {
                    if is_input(prev) {
                        sources.push(prev);
                    }
                }
            }
            StagePlan::new(graph, position, None, sources, sinks, mapper, Vec::new())
        })
        .collect()
}

/// Reject a stage that reads one tap instance under several head names.
pub(crate) fn check_duplicate_sources(graph: &ElementGraph, plan: &StagePlan) -> PlannerResult<()> {
    let sources: Vec<_> = plan
        .sources
        .iter()
        .filter_map(|&id| graph.element(id))
        .filter_map(|e| match &e.kind {
            ElementKind::Source { tap } => Some((e.name.as_str(), tap)),
            _ => None,
        })
        .collect();

    for (i, (_, tap)) in sources.iter().enumerate() {
        let mut names: Vec<String> = sources[i..]
            .iter()
            .filter(|(_, other)| same_instance(tap, other))
            .map(|(name, _)| name.to_string())
            .collect();
        if names.len() > 1 {
            names.sort();
            return Err(PlannerError::DuplicateSource {
                tap: tap.identifier().to_string(),
                names,
                stage: plan.label(graph),
            });
        }
    }
    Ok(())
}
