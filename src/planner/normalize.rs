//! Graph normalization.
//!
//! Rewrites the resolved element graph until every grouping can be cut
//! into its own stage:
//!
//! ```text
//!  N0  merge isomorphic map-side Each siblings
//!
//!        ┌─► Each(f) ─► …            ┌─► …
//!   x ───┤                  ==>  x ─► Each(f)
//!        └─► Each(f) ─► …            └─► …
//!
//!  N1  materialize reducer output that feeds another grouping
//!
//!   G1 ─► Every ─► G2        ==>  G1 ─► Every ─► [tmp] ─► G2
//!
//!  N2  materialize an unsafe map-side split with divergent destinations
//!
//!            ┌─► G1                          ┌─► G1
//!   unsafe ──┤               ==>  unsafe ─► [tmp]
//!            └─► G2                          └─► G2
//! ```
//!
//! The rules are applied one rewrite at a time until none applies.

use super::error::{PlannerError, PlannerResult};
use super::graph::{ElementGraph, ElementKind, Resolution};
use crate::id::ElementId;
use crate::tap::{TapRef, TemporaryTapFactory};
use crate::tuple::Fields;
use std::collections::BTreeSet;

/// Which side of a grouping boundary an element runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Fed by taps without crossing a grouping.
    Map,
    /// Downstream of this grouping.
    Group(ElementId),
    /// Fed from more than one side.
    Mixed,
}

/// Where a branch of a split ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Destination {
    Grouping(ElementId),
    MapOutput,
}

/// Creates intermediate taps with stable identifiers.
pub struct IntermediateNamer<'a> {
    factory: &'a dyn TemporaryTapFactory,
    prefix: String,
    flow: String,
    seq: usize,
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

impl<'a> IntermediateNamer<'a> {
    pub fn new(factory: &'a dyn TemporaryTapFactory, temporary_dir: &str, flow: &str) -> Self {
        Self {
            factory,
            prefix: temporary_dir.trim_end_matches('/').to_string(),
            flow: sanitize(flow),
            seq: 0,
        }
    }

    pub fn identifier(&self, branch: &str) -> String {
        format!("{}/{}/{}_{}", self.prefix, self.flow, sanitize(branch), self.seq)
    }

    fn create(&mut self, branch: &str, fields: &Fields) -> TapRef {
        let identifier = self.identifier(branch);
        self.seq += 1;
        self.factory.create(&identifier, fields)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub merged: usize,
    pub intermediates: usize,
}

/// Apply N0, N1 and N2 until the graph no longer changes.
pub fn normalize(graph: &mut ElementGraph, namer: &mut IntermediateNamer<'_>) -> PlannerResult<NormalizeStats> {
    let mut stats = NormalizeStats::default();
    let limit = 4 * graph.capacity() + 16;

    for _ in 0..limit {
        let order = graph.topological_order()?;
        let origins = compute_origins(graph, &order);

        let merged = merge_isomorphic(graph, &order, &origins);
        if merged > 0 {
            stats.merged += merged;
            continue;
        }
        let inserted = insert_reducer_taps(graph, &order, &origins, namer)?;
        if inserted > 0 {
            stats.intermediates += inserted;
            continue;
        }
        let inserted = insert_split_taps(graph, &order, &origins, namer)?;
        if inserted > 0 {
            stats.intermediates += inserted;
            continue;
        }
        return Ok(stats);
    }

    Err(PlannerError::Internal("normalization did not converge".to_string()))
}

/// Origin of every slot, indexed by element id.
pub(crate) fn compute_origins(graph: &ElementGraph, order: &[ElementId]) -> Vec<Origin> {
    let mut origins = vec![Origin::Map; graph.capacity()];
    for &id in order {
        let Some(element) = graph.element(id) else {
            continue;
        };
        origins[id.index()] = match &element.kind {
            ElementKind::Source { .. } | ElementKind::Intermediate { .. } => Origin::Map,
            kind if kind.is_grouping() => Origin::Group(id),
            _ => {
                let mut acc: Option<Origin> = None;
                for prev in graph.predecessors(id) {
                    let origin = if graph.element(prev).is_some_and(|p| p.is_tap()) {
                        Origin::Map
                    } else {
                        origins[prev.index()]
                    };
                    acc = match acc {
                        None => Some(origin),
                        Some(seen) if seen == origin => Some(seen),
                        Some(_) => Some(Origin::Mixed),
                    };
                }
                acc.unwrap_or(Origin::Map)
            }
        };
    }
    origins
}

/// Put a new intermediate tap between `from` and the given edges.
fn insert_intermediate(
    graph: &mut ElementGraph,
    from: ElementId,
    edge_indices: &[usize],
    namer: &mut IntermediateNamer<'_>,
) -> PlannerResult<ElementId> {
    let (name, trace, fields) = match graph.element(from) {
        Some(e) => (e.name.clone(), e.trace, e.outgoing.clone()),
        None => return Err(PlannerError::Internal(format!("no element {}", from))),
    };
    let tap = namer.create(&name, &fields);
    tracing::debug!("Inserting intermediate tap {} after '{}'", tap.identifier(), name);

    let intermediate = graph.add_element(&name, ElementKind::Intermediate { tap }, trace);
    if let Some(element) = graph.element_mut(intermediate) {
        element.outgoing = fields.clone();
        element.resolution = Resolution::Pass;
    }
    for &index in edge_indices {
        if let Some(edge) = graph.edges_mut().get_mut(index) {
            edge.from = intermediate;
        }
    }
    let index = graph.add_edge(from, intermediate, 0);
    if let Some(edge) = graph.edges_mut().get_mut(index) {
        edge.fields = fields;
    }
    Ok(intermediate)
}

/// N0. Returns the number of elements merged away.
fn merge_isomorphic(graph: &mut ElementGraph, order: &[ElementId], origins: &[Origin]) -> usize {
    for &id in order {
        let Some(element) = graph.element(id) else {
            continue;
        };
        if !element.is_tap() && origins[id.index()] != Origin::Map {
            continue;
        }
        if matches!(element.kind, ElementKind::Sink { .. }) {
            continue;
        }

        let children: Vec<(usize, ElementId)> = graph
            .outgoing(id)
            .iter()
            .map(|e| (e.ordinal, e.to))
            .collect();

        let mut pairs: Vec<(ElementId, ElementId)> = Vec::new();
        for (i, &(ordinal_a, a)) in children.iter().enumerate() {
            for &(ordinal_b, b) in &children[i + 1..] {
                if a == b || ordinal_a != ordinal_b {
                    continue;
                }
                if pairs.iter().any(|&(_, dup)| dup == a || dup == b) {
                    continue;
                }
                let (Some(left), Some(right)) = (graph.element(a), graph.element(b)) else {
                    continue;
                };
                let isomorphic = match (&left.kind, &right.kind) {
                    (
                        ElementKind::Each {
                            arguments: args_a,
                            operation: op_a,
                            output: out_a,
                        },
                        ElementKind::Each {
                            arguments: args_b,
                            operation: op_b,
                            output: out_b,
                        },
                    ) => op_a.same_instance(op_b) && args_a == args_b && out_a == out_b,
                    _ => false,
                };
                if isomorphic {
                    pairs.push((a.min(b), a.max(b)));
                }
            }
        }

        if pairs.is_empty() {
            continue;
        }
        for &(keep, dup) in &pairs {
            tracing::debug!("Merging isomorphic element {} into {}", dup, keep);
            for edge in graph.edges_mut().iter_mut().filter(|e| e.from == dup) {
                edge.from = keep;
            }
            graph.remove_element(dup);
        }
        return pairs.len();
    }
    0
}

/// N1. Returns the number of taps inserted.
fn insert_reducer_taps(
    graph: &mut ElementGraph,
    order: &[ElementId],
    origins: &[Origin],
    namer: &mut IntermediateNamer<'_>,
) -> PlannerResult<usize> {
    // (from, affected edge indices), in topological order of `from`.
    let mut marked: Vec<(ElementId, Vec<usize>)> = Vec::new();

    for &from in order {
        let Some(element) = graph.element(from) else {
            continue;
        };
        if element.is_tap() || !matches!(origins[from.index()], Origin::Group(_)) {
            continue;
        }
        let affected: Vec<usize> = graph
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.from == from)
            .filter(|(_, e)| {
                graph.element(e.to).is_some_and(|to| {
                    to.kind.is_grouping()
                        || (matches!(to.kind, ElementKind::Merge) && origins[e.to.index()] == Origin::Mixed)
                })
            })
            .map(|(i, _)| i)
            .collect();
        if !affected.is_empty() {
            marked.push((from, affected));
        }
    }

    for (from, affected) in &marked {
        insert_intermediate(graph, *from, affected, namer)?;
    }
    Ok(marked.len())
}

/// Destinations reachable from every slot, indexed by element id.
fn compute_destinations(graph: &ElementGraph, order: &[ElementId]) -> Vec<BTreeSet<Destination>> {
    let mut destinations = vec![BTreeSet::new(); graph.capacity()];
    for &id in order.iter().rev() {
        let Some(element) = graph.element(id) else {
            continue;
        };
        let set = if element.kind.is_grouping() {
            BTreeSet::from([Destination::Grouping(id)])
        } else if matches!(element.kind, ElementKind::Sink { .. } | ElementKind::Intermediate { .. }) {
            BTreeSet::from([Destination::MapOutput])
        } else {
            let mut set = BTreeSet::new();
            for next in graph.successors(id) {
                set.extend(destinations[next.index()].iter().copied());
            }
            set
        };
        destinations[id.index()] = set;
    }
    destinations
}

/// N2. Returns the number of taps inserted.
fn insert_split_taps(
    graph: &mut ElementGraph,
    order: &[ElementId],
    origins: &[Origin],
    namer: &mut IntermediateNamer<'_>,
) -> PlannerResult<usize> {
    let destinations = compute_destinations(graph, order);

    for &split in order {
        let Some(element) = graph.element(split) else {
            continue;
        };
        if element.is_tap() || origins[split.index()] != Origin::Map {
            continue;
        }
        let branches: Vec<(usize, ElementId)> = graph
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.from == split)
            .map(|(i, e)| (i, e.to))
            .collect();
        if branches.len() < 2 {
            continue;
        }

        let reached: BTreeSet<Destination> = branches
            .iter()
            .flat_map(|&(_, to)| destinations[to.index()].iter().copied())
            .collect();
        if reached.len() < 2 {
            continue;
        }

        let safe = graph
            .upstream_to_taps(split)
            .into_iter()
            .filter_map(|id| graph.element(id))
            .all(|e| e.kind.is_safe());
        if safe {
            continue;
        }

        let affected: Vec<usize> = branches
            .iter()
            .filter(|&&(_, to)| {
                destinations[to.index()]
                    .iter()
                    .any(|d| matches!(d, Destination::Grouping(_)))
            })
            .map(|&(i, _)| i)
            .collect();
        if affected.is_empty() {
            continue;
        }
        insert_intermediate(graph, split, &affected, namer)?;
        return Ok(1);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Count, Function, Identity, Operation, OperationCall, OperationResult, OutputCollector};
    use crate::pipe::{GroupBy, PipeAssembly};
    use crate::planner::scope::resolve;
    use crate::process::FlowProcess;
    use crate::tap::{MemoryStore, Scheme};
    use crate::tuple::TupleEntry;
    use std::collections::BTreeMap;

    struct Unsafe;

    impl Operation for Unsafe {
        fn field_declaration(&self) -> Fields {
            Fields::args()
        }

        fn is_safe(&self) -> bool {
            false
        }
    }

    impl Function for Unsafe {
        fn operate(
            &self,
            _process: &dyn FlowProcess,
            _call: &mut OperationCall,
            arguments: TupleEntry<'_>,
            output: &mut OutputCollector,
        ) -> OperationResult<()> {
            output.add(arguments.tuple().clone());
            Ok(())
        }
    }

    fn normalized(assembly: &PipeAssembly) -> (ElementGraph, NormalizeStats) {
        let store = MemoryStore::new();
        let sources: BTreeMap<String, TapRef> = assembly
            .head_names()
            .into_iter()
            .map(|n| {
                let tap = store.tap(&n, Scheme::new(Fields::from(["a", "b"])));
                (n, tap)
            })
            .collect();
        let sinks: BTreeMap<String, TapRef> = assembly
            .tail_names()
            .into_iter()
            .map(|n| {
                let tap = store.tap(&n, Scheme::default());
                (n, tap)
            })
            .collect();
        let mut graph = ElementGraph::from_assembly(assembly, &sources, &sinks).unwrap();
        resolve(&mut graph).unwrap();
        let mut namer = IntermediateNamer::new(&store, "tmp", "flow");
        let stats = normalize(&mut graph, &mut namer).unwrap();
        (graph, stats)
    }

    fn split_to_two_groupings(function_is_safe: bool) -> PipeAssembly {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let each = if function_is_safe {
            assembly.each_function(head, Fields::all(), Identity::new(), Fields::results())
        } else {
            assembly.each_function(head, Fields::all(), Unsafe, Fields::results())
        };
        let left = assembly.group_by(GroupBy::new(each, "a").named("left"));
        assembly.every_aggregator(left, Fields::all(), Count::new(), Fields::all());
        let right = assembly.group_by(GroupBy::new(each, "b").named("right"));
        assembly.every_aggregator(right, Fields::all(), Count::new(), Fields::all());
        assembly
    }

    #[test]
    fn test_safe_split_is_duplicated() {
        let (_, stats) = normalized(&split_to_two_groupings(true));
        assert_eq!(stats.intermediates, 0);
    }

    #[test]
    fn test_unsafe_split_is_materialized_once() {
        let (graph, stats) = normalized(&split_to_two_groupings(false));
        assert_eq!(stats.intermediates, 1);
        let tap = graph
            .elements()
            .find(|e| matches!(e.kind, ElementKind::Intermediate { .. }))
            .unwrap();
        assert_eq!(graph.successors(tap.id).len(), 2);
        assert_eq!(tap.kind.tap().unwrap().identifier(), "tmp/flow/in_0");
    }

    #[test]
    fn test_chained_groupings_get_reducer_tap() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let first = assembly.group_by(GroupBy::new(head, "a"));
        let count = assembly.every_aggregator(first, Fields::all(), Count::new(), Fields::all());
        let second = assembly.group_by(GroupBy::new(count, "count"));
        assembly.every_aggregator(second, Fields::all(), Count::as_field("n"), Fields::all());

        let (graph, stats) = normalized(&assembly);
        assert_eq!(stats.intermediates, 1);
        let order = graph.topological_order().unwrap();
        let origins = compute_origins(&graph, &order);
        assert!(graph
            .elements()
            .filter(|e| e.kind.is_grouping())
            .all(|g| graph
                .predecessors(g.id)
                .iter()
                .all(|&p| graph.element(p).unwrap().is_tap() || origins[p.index()] == Origin::Map)));
    }

    #[test]
    fn test_isomorphic_siblings_merge() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let op = crate::operation::EachOperation::function(Identity::new());
        let left = assembly.each(head, Fields::all(), op.clone(), Fields::results());
        let right = assembly.each(head, Fields::all(), op, Fields::results());
        assembly.branch(left, "left");
        assembly.branch(right, "right");

        let (graph, stats) = normalized(&assembly);
        assert_eq!(stats.merged, 1);
        let source = ElementId(0);
        assert_eq!(graph.successors(source).len(), 1);
        let each = graph.successors(source)[0];
        assert_eq!(graph.successors(each).len(), 2);
    }

    #[test]
    fn test_sanitized_identifier() {
        let store = MemoryStore::new();
        let namer = IntermediateNamer::new(&store, "tmp/", "a flow");
        assert_eq!(namer.identifier("x*y"), "tmp/a_flow/x_y_0");
    }
}
