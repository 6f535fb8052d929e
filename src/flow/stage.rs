//! One physical unit of work inside a flow.

use super::{dot, Flow};
use crate::id::{ElementId, StageId};
use crate::planner::graph::{ElementEdge, ElementGraph};
use crate::tap::TapRef;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// A map side reading one or more taps, an optional grouping, and a reduce
/// side writing one or more taps.
///
/// ```text
///   sources ──► mapper ──► [grouping] ──► reducer ──► sinks
/// ```
///
/// Map-only stages have no grouping and an empty reducer. Stages are built
/// once by the planner and never change afterwards.
#[derive(Debug, Clone)]
pub struct Stage {
    pub(crate) id: StageId,
    pub(crate) name: String,
    pub(crate) sources: Vec<ElementId>,
    pub(crate) sinks: Vec<ElementId>,
    pub(crate) grouping: Option<ElementId>,
    pub(crate) mapper: Vec<ElementId>,
    pub(crate) reducer: Vec<ElementId>,
    pub(crate) edges: Vec<ElementEdge>,
    /// Trap taps keyed by the branch name they guard.
    pub(crate) traps: BTreeMap<String, TapRef>,
}

/// Serializable summary of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDescription {
    pub id: u32,
    pub name: String,
    pub sources: Vec<String>,
    pub sinks: Vec<String>,
    pub grouping: Option<String>,
    pub mapper: Vec<String>,
    pub reducer: Vec<String>,
    pub traps: Vec<String>,
}

impl Stage {
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tap elements read by this stage.
    pub fn sources(&self) -> &[ElementId] {
        &self.sources
    }

    /// Tap elements written by this stage.
    pub fn sinks(&self) -> &[ElementId] {
        &self.sinks
    }

    pub fn grouping(&self) -> Option<ElementId> {
        self.grouping
    }

    pub fn mapper(&self) -> &[ElementId] {
        &self.mapper
    }

    pub fn reducer(&self) -> &[ElementId] {
        &self.reducer
    }

    pub fn edges(&self) -> &[ElementEdge] {
        &self.edges
    }

    pub fn traps(&self) -> &BTreeMap<String, TapRef> {
        &self.traps
    }

    pub fn trap_for(&self, branch: &str) -> Option<&TapRef> {
        self.traps.get(branch)
    }

    pub fn is_map_only(&self) -> bool {
        self.grouping.is_none()
    }

    /// Every element of the stage: sources, mapper, grouping, reducer, sinks.
    pub fn elements(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.sources
            .iter()
            .chain(&self.mapper)
            .chain(self.grouping.iter())
            .chain(&self.reducer)
            .chain(&self.sinks)
            .copied()
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.elements().any(|e| e == id)
    }

    /// Number of elements strictly between `from` and `to` on the shortest
    /// path through this stage, or `None` if `to` is unreachable.
    pub fn distance(&self, from: ElementId, to: ElementId) -> Option<usize> {
        if from == to {
            return Some(0);
        }
        let mut adjacency: HashMap<ElementId, Vec<ElementId>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.from).or_default().push(edge.to);
        }

        let mut hops: HashMap<ElementId, usize> = HashMap::from([(from, 0)]);
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            let depth = hops[&current];
            for &next in adjacency.get(&current).map(Vec::as_slice).unwrap_or_default() {
                if next == to {
                    return Some(depth);
                }
                if !hops.contains_key(&next) {
                    hops.insert(next, depth + 1);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    pub fn describe(&self, flow: &Flow) -> StageDescription {
        let graph = flow.graph();
        let tap_names = |ids: &[ElementId]| -> Vec<String> {
            ids.iter()
                .filter_map(|&id| graph.element(id))
                .filter_map(|e| e.kind.tap().map(|t| t.identifier().to_string()))
                .collect()
        };
        let labels = |ids: &[ElementId]| -> Vec<String> {
            ids.iter()
                .filter_map(|&id| graph.element(id))
                .map(|e| e.to_string())
                .collect()
        };
        StageDescription {
            id: self.id.0,
            name: self.name.clone(),
            sources: tap_names(&self.sources),
            sinks: tap_names(&self.sinks),
            grouping: self
                .grouping
                .and_then(|id| graph.element(id))
                .map(|e| e.to_string()),
            mapper: labels(&self.mapper),
            reducer: labels(&self.reducer),
            traps: self.traps.keys().cloned().collect(),
        }
    }

    /// DOT rendering of this stage alone.
    pub fn to_dot(&self, flow: &Flow) -> String {
        self.render(flow.graph())
    }

    pub(crate) fn render(&self, graph: &ElementGraph) -> String {
        let mut ids: Vec<ElementId> = self.elements().collect();
        ids.sort();
        ids.dedup();
        dot::render(
            &self.name,
            ids.into_iter().filter_map(|id| graph.element(id)),
            &self.edges,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Fields;

    fn edge(from: u32, to: u32) -> ElementEdge {
        ElementEdge {
            from: ElementId(from),
            to: ElementId(to),
            ordinal: 0,
            fields: Fields::unknown(),
        }
    }

    fn stage(edges: Vec<ElementEdge>) -> Stage {
        Stage {
            id: StageId(0),
            name: "(1/1) out".to_string(),
            sources: vec![ElementId(0)],
            sinks: vec![ElementId(3)],
            grouping: Some(ElementId(1)),
            mapper: Vec::new(),
            reducer: vec![ElementId(2)],
            edges,
            traps: BTreeMap::new(),
        }
    }

    #[test]
    fn test_distance_counts_elements_between() {
        let stage = stage(vec![edge(0, 1), edge(1, 2), edge(2, 3)]);
        assert_eq!(stage.distance(ElementId(0), ElementId(1)), Some(0));
        assert_eq!(stage.distance(ElementId(1), ElementId(3)), Some(1));
        assert_eq!(stage.distance(ElementId(0), ElementId(3)), Some(2));
        assert_eq!(stage.distance(ElementId(3), ElementId(0)), None);
    }

    #[test]
    fn test_distance_takes_shortest_path() {
        let stage = stage(vec![edge(0, 1), edge(1, 2), edge(2, 3), edge(1, 3)]);
        assert_eq!(stage.distance(ElementId(0), ElementId(3)), Some(1));
    }

    #[test]
    fn test_elements_in_stage_order() {
        let stage = stage(Vec::new());
        let ids: Vec<u32> = stage.elements().map(|e| e.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(stage.contains(ElementId(2)));
        assert!(!stage.is_map_only());
    }
}
