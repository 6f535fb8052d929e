//! Structural validation of the element graph.
//!
//! Runs before any field resolution so that a malformed assembly is
//! reported as a structural error rather than as a confusing schema
//! mismatch further down.

use super::error::{PlannerError, PlannerResult, StructuralViolation};
use super::graph::{Element, ElementGraph, ElementKind};
use crate::id::ElementId;

fn violation(element: &Element, violation: StructuralViolation) -> PlannerError {
    PlannerError::Structural {
        element: element.name.clone(),
        trace: element.trace,
        violation,
    }
}

/// Validate input arities, aggregation placement and buffer exclusivity.
pub fn validate(graph: &ElementGraph) -> PlannerResult<()> {
    for element in graph.elements() {
        check_arity(graph, element)?;
    }
    for element in graph.elements() {
        if element.kind.is_every() {
            check_aggregation_placement(graph, element)?;
        }
    }
    for element in graph.elements() {
        if element.kind.is_grouping() {
            check_aggregation_chain(graph, element)?;
        }
    }
    Ok(())
}

fn check_arity(graph: &ElementGraph, element: &Element) -> PlannerResult<()> {
    let actual = graph.incoming(element.id).len();
    let (ok, expected) = match &element.kind {
        ElementKind::Source { .. } => (actual == 0, "0"),
        ElementKind::Each { .. }
        | ElementKind::Every { .. }
        | ElementKind::Sink { .. }
        | ElementKind::Intermediate { .. } => (actual == 1, "exactly 1"),
        ElementKind::GroupBy { .. } => (actual >= 1, "at least 1"),
        ElementKind::CoGroup { group_fields, .. } => (actual >= 2 && group_fields.len() == actual, "at least 2"),
        ElementKind::Merge => (actual >= 2, "at least 2"),
    };
    if ok {
        Ok(())
    } else {
        Err(violation(element, StructuralViolation::InputArity { expected, actual }))
    }
}

/// An `Every` must sit directly after a grouping or another `Every`.
fn check_aggregation_placement(graph: &ElementGraph, element: &Element) -> PlannerResult<()> {
    let Some(&prev) = graph.predecessors(element.id).first() else {
        return Err(violation(element, StructuralViolation::AggregationWithoutGrouping));
    };
    let prev_kind = graph.element(prev).map(|e| &e.kind);
    if prev_kind.is_some_and(|k| k.is_grouping() || k.is_every()) {
        return Ok(());
    }

    // Decide which way the assembly is wrong by walking up the single-input
    // chain: meeting a split first means the aggregation sits on one side of
    // a fan-out.
    let mut cursor: ElementId = prev;
    loop {
        if graph.successors(cursor).len() > 1 {
            return Err(violation(element, StructuralViolation::SplitBeforeAggregation));
        }
        let Some(current) = graph.element(cursor) else {
            break;
        };
        if current.is_tap() || current.kind.is_grouping() {
            break;
        }
        let preds = graph.predecessors(cursor);
        match preds.as_slice() {
            [single] => cursor = *single,
            _ => break,
        }
    }
    Err(violation(element, StructuralViolation::AggregationWithoutGrouping))
}

/// The aggregation chain hanging off a grouping must be linear, and a
/// buffer must be alone in it.
fn check_aggregation_chain(graph: &ElementGraph, grouping: &Element) -> PlannerResult<()> {
    let mut chain: Vec<&Element> = Vec::new();
    let mut cursor = grouping.id;
    loop {
        let everies: Vec<&Element> = graph
            .successors(cursor)
            .into_iter()
            .filter_map(|id| graph.element(id))
            .filter(|e| e.kind.is_every())
            .collect();
        match everies.as_slice() {
            [] => break,
            [next] => {
                chain.push(next);
                cursor = next.id;
            }
            [_, second, ..] => {
                return Err(violation(second, StructuralViolation::SplitAggregationChain));
            }
        }
    }

    if chain.len() > 1 {
        let buffer = chain
            .iter()
            .find(|e| matches!(&e.kind, ElementKind::Every { operation, .. } if operation.is_buffer()));
        if let Some(buffer) = buffer {
            return Err(violation(buffer, StructuralViolation::BufferWithOtherAggregators));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Count, FirstN, Identity};
    use crate::pipe::{CoGroup, GroupBy, PipeAssembly};
    use crate::tap::{MemoryStore, Scheme, TapRef};
    use crate::tuple::Fields;
    use std::collections::BTreeMap;

    fn graph_for(assembly: &PipeAssembly) -> ElementGraph {
        let store = MemoryStore::new();
        let bind = |names: Vec<String>| -> BTreeMap<String, TapRef> {
            names
                .into_iter()
                .map(|n| {
                    let tap = store.tap(&n, Scheme::default());
                    (n, tap)
                })
                .collect()
        };
        ElementGraph::from_assembly(assembly, &bind(assembly.head_names()), &bind(assembly.tail_names())).unwrap()
    }

    #[test]
    fn test_buffer_with_count_rejected() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let group = assembly.group_by(GroupBy::new(head, "a"));
        let buffer = assembly.every_buffer(group, Fields::all(), FirstN::new(1), Fields::results());
        assembly.every_aggregator(buffer, Fields::all(), Count::new(), Fields::all());

        let err = validate(&graph_for(&assembly)).unwrap_err();
        assert_eq!(err.violation(), Some(&StructuralViolation::BufferWithOtherAggregators));
    }

    #[test]
    fn test_every_without_grouping() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let each = assembly.each_function(head, Fields::all(), Identity::new(), Fields::results());
        assembly.every_aggregator(each, Fields::all(), Count::new(), Fields::all());

        let err = validate(&graph_for(&assembly)).unwrap_err();
        assert_eq!(err.violation(), Some(&StructuralViolation::AggregationWithoutGrouping));
    }

    #[test]
    fn test_every_after_split() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let each = assembly.each_function(head, Fields::all(), Identity::new(), Fields::results());
        let left = assembly.branch(each, "left");
        let right = assembly.branch(each, "right");
        assembly.every_aggregator(left, Fields::all(), Count::new(), Fields::all());
        let _ = right;

        let err = validate(&graph_for(&assembly)).unwrap_err();
        assert_eq!(err.violation(), Some(&StructuralViolation::SplitBeforeAggregation));
        assert_eq!(err.element(), Some("left"));
    }

    #[test]
    fn test_split_aggregation_chain() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let group = assembly.group_by(GroupBy::new(head, "a"));
        let left = assembly.branch(group, "left");
        let right = assembly.branch(group, "right");
        assembly.every_aggregator(left, Fields::all(), Count::new(), Fields::all());
        assembly.every_aggregator(right, Fields::all(), Count::new(), Fields::all());

        let err = validate(&graph_for(&assembly)).unwrap_err();
        assert_eq!(err.violation(), Some(&StructuralViolation::SplitAggregationChain));
    }

    #[test]
    fn test_cogroup_needs_two_inputs() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        assembly.co_group(CoGroup::new().input(head, "a").named("out"));

        let err = validate(&graph_for(&assembly)).unwrap_err();
        assert!(matches!(
            err.violation(),
            Some(StructuralViolation::InputArity { actual: 1, .. })
        ));
    }

    #[test]
    fn test_valid_chain() {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let group = assembly.group_by(GroupBy::new(head, "a"));
        let count = assembly.every_aggregator(group, Fields::all(), Count::new(), Fields::all());
        assembly.every_aggregator(count, Fields::all(), Count::as_field("again"), Fields::all());
        assert!(validate(&graph_for(&assembly)).is_ok());
    }
}
