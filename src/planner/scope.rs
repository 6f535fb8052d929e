//! Scope resolution.
//!
//! Propagates field schemas from the sources to the sinks in topological
//! order, resolving every element once. The results are stored on the
//! elements (`outgoing` plus a [`Resolution`]) and on the edges, so the
//! stack never resolves a field name while records flow.

use super::error::{PlannerError, PlannerResult};
use super::graph::{Element, ElementGraph, ElementKind, GroupingResolution, Resolution};
use crate::id::ElementId;
use crate::tuple::resolve::check_num_args;
use crate::tuple::{resolve_each, resolve_every, Fields, FieldsError, Selector};

/// Resolve every element and edge of `graph`.
pub fn resolve(graph: &mut ElementGraph) -> PlannerResult<()> {
    for id in graph.topological_order()? {
        let (outgoing, resolution) = {
            let Some(element) = graph.element(id) else {
                continue;
            };
            resolve_element(graph, element).map_err(|source| PlannerError::FieldResolution {
                element: element.name.clone(),
                trace: element.trace,
                source,
            })?
        };
        if let Some(element) = graph.element_mut(id) {
            element.outgoing = outgoing.clone();
            element.resolution = resolution;
        }
        for edge in graph.edges_mut().iter_mut().filter(|e| e.from == id) {
            edge.fields = outgoing.clone();
        }
    }
    Ok(())
}

fn input_fields(graph: &ElementGraph, id: ElementId) -> Vec<Fields> {
    graph.incoming(id).into_iter().map(|e| e.fields.clone()).collect()
}

fn first_input(inputs: &[Fields]) -> Result<Fields, FieldsError> {
    inputs
        .first()
        .cloned()
        .ok_or_else(|| FieldsError::Incompatible("element has no input".to_string()))
}

fn require_equal(inputs: &[Fields], what: &str) -> Result<Fields, FieldsError> {
    let first = first_input(inputs)?;
    if let Some(other) = inputs.iter().find(|f| **f != first) {
        return Err(FieldsError::Incompatible(format!(
            "{} requires identical input fields, found {} and {}",
            what, first, other
        )));
    }
    Ok(first)
}

/// The grouping at the head of the aggregation chain `id` belongs to.
fn chain_grouping(graph: &ElementGraph, id: ElementId) -> Option<&Element> {
    let mut cursor = id;
    loop {
        let prev = *graph.predecessors(cursor).first()?;
        let element = graph.element(prev)?;
        if element.kind.is_grouping() {
            return Some(element);
        }
        cursor = prev;
    }
}

fn resolve_element(graph: &ElementGraph, element: &Element) -> Result<(Fields, Resolution), FieldsError> {
    let inputs = input_fields(graph, element.id);
    match &element.kind {
        ElementKind::Source { tap } => Ok((tap.source_fields(), Resolution::Pass)),
        ElementKind::Intermediate { .. } => Ok((first_input(&inputs)?, Resolution::Pass)),
        ElementKind::Merge => Ok((require_equal(&inputs, "Merge")?, Resolution::Pass)),
        ElementKind::Sink { tap } => {
            let incoming = first_input(&inputs)?;
            let selector = tap.sink_fields().positions_in(&incoming)?;
            let fields = tap.sink_fields().select_from(&incoming)?;
            Ok((fields, Resolution::Sink { selector }))
        }
        ElementKind::Each {
            arguments,
            operation,
            output,
        } => {
            let incoming = first_input(&inputs)?;
            let resolution = resolve_each(
                &incoming,
                arguments,
                &operation.field_declaration(),
                output,
                operation.is_filter(),
            )?;
            check_num_args(operation.num_args(), &resolution.argument_fields)?;
            Ok((resolution.outgoing.clone(), Resolution::Each(resolution)))
        }
        ElementKind::Every {
            arguments,
            operation,
            output,
        } => {
            let grouping = chain_grouping(graph, element.id)
                .ok_or_else(|| FieldsError::Incompatible("aggregation has no grouping".to_string()))?;
            let Resolution::Grouping(group) = &grouping.resolution else {
                return Err(FieldsError::Incompatible("grouping is not resolved".to_string()));
            };
            let prev = graph
                .predecessors(element.id)
                .first()
                .and_then(|&p| graph.element(p))
                .ok_or_else(|| FieldsError::Incompatible("aggregation has no input".to_string()))?;
            let previous = if prev.kind.is_grouping() {
                group.key_fields.clone()
            } else {
                prev.outgoing.clone()
            };
            let resolution = resolve_every(
                &group.values,
                &previous,
                arguments,
                &operation.field_declaration(),
                output,
            )?;
            check_num_args(operation.num_args(), &resolution.argument_fields)?;
            Ok((resolution.outgoing.clone(), Resolution::Every(resolution)))
        }
        ElementKind::GroupBy {
            group_fields,
            sort_fields,
            reverse,
        } => {
            let incoming = require_equal(&inputs, "GroupBy")?;
            let key_selector = group_fields.positions_in(&incoming)?;
            let key_fields = group_fields.select_from(&incoming)?;
            let (sort_selector, sort_comparators) = match sort_fields {
                Some(sort) => (
                    Some(sort.positions_in(&incoming)?),
                    sort.select_from(&incoming)?.comparators(),
                ),
                None => (None, Vec::new()),
            };
            let resolution = GroupingResolution {
                key_selectors: vec![key_selector; inputs.len()],
                sort_selectors: vec![sort_selector; inputs.len()],
                key_comparators: key_fields.comparators(),
                key_fields,
                sort_comparators,
                reverse: *reverse,
                input_fields: inputs.clone(),
                input_arities: inputs.iter().map(Fields::arity).collect(),
                values: incoming.clone(),
                joiner: Default::default(),
            };
            Ok((incoming, Resolution::Grouping(resolution)))
        }
        ElementKind::CoGroup {
            group_fields,
            declared,
            joiner,
        } => {
            let mut key_selectors = Vec::with_capacity(inputs.len());
            let mut key_arity: Option<usize> = None;
            for (incoming, fields) in inputs.iter().zip(group_fields) {
                let selector = fields.positions_in(incoming)?;
                let arity = match &selector {
                    Selector::Positions(p) => Some(p.len()),
                    Selector::All => incoming.arity(),
                };
                if let (Some(expected), Some(actual)) = (key_arity, arity) {
                    if expected != actual {
                        return Err(FieldsError::ArityMismatch {
                            context: "CoGroup key fields".to_string(),
                            expected,
                            actual,
                        });
                    }
                }
                key_arity = key_arity.or(arity);
                key_selectors.push(selector);
            }

            let first = first_input(&inputs)?;
            let first_keys = group_fields
                .first()
                .ok_or_else(|| FieldsError::Incompatible("CoGroup has no key fields".to_string()))?;
            let key_fields = first_keys.select_from(&first)?;

            let arities: Vec<Option<usize>> = inputs.iter().map(Fields::arity).collect();
            if joiner.pads(inputs.len()) && arities.iter().any(Option::is_none) {
                return Err(FieldsError::Unresolvable {
                    kind: crate::tuple::FieldsKind::Unknown,
                    usage: "an outer join input".to_string(),
                });
            }

            let values = match declared {
                Some(declared) => {
                    let total: Option<usize> = arities.iter().copied().sum();
                    if let (Some(expected), Some(actual)) = (total, declared.arity()) {
                        if expected != actual {
                            return Err(FieldsError::ArityMismatch {
                                context: "CoGroup declared fields".to_string(),
                                expected,
                                actual,
                            });
                        }
                    }
                    declared.clone()
                }
                None => {
                    let mut values = first.clone();
                    for incoming in &inputs[1..] {
                        values = values.append(incoming)?;
                    }
                    values
                }
            };

            let resolution = GroupingResolution {
                key_selectors,
                sort_selectors: vec![None; inputs.len()],
                key_comparators: key_fields.comparators(),
                key_fields,
                sort_comparators: Vec::new(),
                reverse: false,
                input_fields: inputs.clone(),
                input_arities: arities,
                values: values.clone(),
                joiner: joiner.clone(),
            };
            Ok((values, Resolution::Grouping(resolution)))
        }
    }
}
