//! The typed element graph the planner works on.
//!
//! Built from a [`PipeAssembly`] plus tap bindings. Branch pipes collapse
//! into their predecessor, every distinct head name becomes one `Source`
//! element and every tail gets its own `Sink` element. Edges carry the
//! input ordinal of their target so a self-join shows up as two parallel
//! edges.
//!
//! Normalization edits the graph in place. Removed elements keep their slot
//! (and therefore their id) with `removed` set, so ids stay stable for the
//! whole planning run.

use super::error::{PlannerError, PlannerResult};
use crate::id::ElementId;
use crate::operation::{EachOperation, EveryOperation};
use crate::pipe::{CallSite, Joiner, PipeAssembly, PipeKind};
use crate::tap::TapRef;
use crate::tuple::{Comparator, EachResolution, EveryResolution, Fields, Selector};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

/// What an element does.
#[derive(Debug, Clone)]
pub enum ElementKind {
    Source {
        tap: TapRef,
    },
    Sink {
        tap: TapRef,
    },
    /// Planner-inserted materialization point.
    Intermediate {
        tap: TapRef,
    },
    Each {
        arguments: Fields,
        operation: EachOperation,
        output: Fields,
    },
    Every {
        arguments: Fields,
        operation: EveryOperation,
        output: Fields,
    },
    GroupBy {
        group_fields: Fields,
        sort_fields: Option<Fields>,
        reverse: bool,
    },
    CoGroup {
        group_fields: Vec<Fields>,
        declared: Option<Fields>,
        joiner: Joiner,
    },
    Merge,
}

impl ElementKind {
    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::Source { .. } => "Source",
            ElementKind::Sink { .. } => "Sink",
            ElementKind::Intermediate { .. } => "Intermediate",
            ElementKind::Each { .. } => "Each",
            ElementKind::Every { .. } => "Every",
            ElementKind::GroupBy { .. } => "GroupBy",
            ElementKind::CoGroup { .. } => "CoGroup",
            ElementKind::Merge => "Merge",
        }
    }

    pub fn is_tap(&self) -> bool {
        self.tap().is_some()
    }

    pub fn tap(&self) -> Option<&TapRef> {
        match self {
            ElementKind::Source { tap } | ElementKind::Sink { tap } | ElementKind::Intermediate { tap } => Some(tap),
            _ => None,
        }
    }

    pub fn is_grouping(&self) -> bool {
        matches!(self, ElementKind::GroupBy { .. } | ElementKind::CoGroup { .. })
    }

    pub fn is_every(&self) -> bool {
        matches!(self, ElementKind::Every { .. })
    }

    /// Whether re-running this element on the same input is harmless.
    pub fn is_safe(&self) -> bool {
        match self {
            ElementKind::Each { operation, .. } => operation.is_safe(),
            ElementKind::Every { operation, .. } => operation.is_safe(),
            _ => true,
        }
    }
}

/// Key and sort wiring of a grouping, resolved per input ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingResolution {
    pub key_selectors: Vec<Selector>,
    pub sort_selectors: Vec<Option<Selector>>,
    pub key_fields: Fields,
    pub key_comparators: Vec<Comparator>,
    pub sort_comparators: Vec<Comparator>,
    pub reverse: bool,
    pub input_fields: Vec<Fields>,
    /// Arity of each input, used to pad missing outer-join sides.
    pub input_arities: Vec<Option<usize>>,
    /// Fields of the joined member tuples.
    pub values: Fields,
    pub joiner: Joiner,
}

/// Plan-time results stored on an element.
#[derive(Debug, Clone, Default)]
pub enum Resolution {
    #[default]
    Unresolved,
    /// Sources, intermediates and merges pass their input through.
    Pass,
    Each(EachResolution),
    Every(EveryResolution),
    Grouping(GroupingResolution),
    Sink { selector: Selector },
}

#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    /// Branch name; the binding name for sources and sinks.
    pub name: String,
    pub kind: ElementKind,
    pub trace: CallSite,
    /// Scope fields flowing out of this element.
    pub outgoing: Fields,
    pub resolution: Resolution,
    pub removed: bool,
}

impl Element {
    pub fn is_tap(&self) -> bool {
        self.kind.is_tap()
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ElementKind::Source { tap } | ElementKind::Sink { tap } | ElementKind::Intermediate { tap } => {
                write!(f, "{}['{}']['{}']", self.kind.label(), self.name, tap.identifier())
            }
            ElementKind::Each { operation, .. } => write!(f, "Each('{}')[{}]", self.name, operation.name()),
            ElementKind::Every { operation, .. } => write!(f, "Every('{}')[{}]", self.name, operation.name()),
            kind => write!(f, "{}('{}')", kind.label(), self.name),
        }
    }
}

/// A directed edge with the scope it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementEdge {
    pub from: ElementId,
    pub to: ElementId,
    /// Input position at `to`.
    pub ordinal: usize,
    pub fields: Fields,
}

#[derive(Debug, Clone, Default)]
pub struct ElementGraph {
    elements: Vec<Element>,
    edges: Vec<ElementEdge>,
}

impl ElementGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for an assembly whose bindings were already checked.
    pub fn from_assembly(
        assembly: &PipeAssembly,
        sources: &BTreeMap<String, TapRef>,
        sinks: &BTreeMap<String, TapRef>,
    ) -> PlannerResult<Self> {
        let mut graph = Self::new();
        let mut by_pipe: Vec<ElementId> = Vec::with_capacity(assembly.len());
        let mut source_elements: HashMap<&str, ElementId> = HashMap::new();

        for node in assembly.nodes() {
            let element = match &node.kind {
                PipeKind::Head => {
                    if let Some(&existing) = source_elements.get(node.name.as_str()) {
                        existing
                    } else {
                        let tap = sources.get(&node.name).cloned().ok_or_else(|| {
                            PlannerError::Internal(format!("head '{}' has no source binding", node.name))
                        })?;
                        let id = graph.add_element(&node.name, ElementKind::Source { tap }, node.trace);
                        source_elements.insert(node.name.as_str(), id);
                        id
                    }
                }
                PipeKind::Branch => {
                    let prev = node.previous.first().copied().ok_or_else(|| PlannerError::InvalidAssembly {
                        element: node.name.clone(),
                        trace: node.trace,
                        message: "branch has no predecessor".to_string(),
                    })?;
                    by_pipe[prev.index()]
                }
                kind => {
                    let kind = match kind {
                        PipeKind::Each {
                            arguments,
                            operation,
                            output,
                        } => ElementKind::Each {
                            arguments: arguments.clone(),
                            operation: operation.clone(),
                            output: output.clone(),
                        },
                        PipeKind::Every {
                            arguments,
                            operation,
                            output,
                        } => ElementKind::Every {
                            arguments: arguments.clone(),
                            operation: operation.clone(),
                            output: output.clone(),
                        },
                        PipeKind::GroupBy {
                            group_fields,
                            sort_fields,
                            reverse,
                        } => ElementKind::GroupBy {
                            group_fields: group_fields.clone(),
                            sort_fields: sort_fields.clone(),
                            reverse: *reverse,
                        },
                        PipeKind::CoGroup {
                            group_fields,
                            declared,
                            joiner,
                        } => ElementKind::CoGroup {
                            group_fields: group_fields.clone(),
                            declared: declared.clone(),
                            joiner: joiner.clone(),
                        },
                        _ => ElementKind::Merge,
                    };
                    let id = graph.add_element(&node.name, kind, node.trace);
                    for (ordinal, prev) in node.previous.iter().enumerate() {
                        graph.add_edge(by_pipe[prev.index()], id, ordinal);
                    }
                    id
                }
            };
            by_pipe.push(element);
        }

        for tail in assembly.tails() {
            let node = &assembly.nodes()[tail.index()];
            let tap = sinks.get(&node.name).cloned().ok_or_else(|| {
                PlannerError::Internal(format!("tail '{}' has no sink binding", node.name))
            })?;
            let sink = graph.add_element(&node.name, ElementKind::Sink { tap }, node.trace);
            graph.add_edge(by_pipe[tail.index()], sink, 0);
        }

        Ok(graph)
    }

    // ==================== Mutation ====================

    pub fn add_element(&mut self, name: &str, kind: ElementKind, trace: CallSite) -> ElementId {
        let id = ElementId::from_index(self.elements.len());
        self.elements.push(Element {
            id,
            name: name.to_string(),
            kind,
            trace,
            outgoing: Fields::unknown(),
            resolution: Resolution::Unresolved,
            removed: false,
        });
        id
    }

    pub fn add_edge(&mut self, from: ElementId, to: ElementId, ordinal: usize) -> usize {
        self.edges.push(ElementEdge {
            from,
            to,
            ordinal,
            fields: Fields::unknown(),
        });
        self.edges.len() - 1
    }

    pub(crate) fn element_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.get_mut(id.index())
    }

    pub(crate) fn edges_mut(&mut self) -> &mut Vec<ElementEdge> {
        &mut self.edges
    }

    /// Mark an element removed and drop every edge touching it.
    pub(crate) fn remove_element(&mut self, id: ElementId) {
        if let Some(element) = self.elements.get_mut(id.index()) {
            element.removed = true;
        }
        self.edges.retain(|e| e.from != id && e.to != id);
    }

    // ==================== Queries ====================

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(id.index()).filter(|e| !e.removed)
    }

    /// Live elements in id order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| !e.removed)
    }

    /// Number of slots, including removed elements.
    pub fn capacity(&self) -> usize {
        self.elements.len()
    }

    pub fn len(&self) -> usize {
        self.elements().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn edges(&self) -> &[ElementEdge] {
        &self.edges
    }

    /// Incoming edges of `id` sorted by ordinal.
    pub fn incoming(&self, id: ElementId) -> Vec<&ElementEdge> {
        let mut edges: Vec<&ElementEdge> = self.edges.iter().filter(|e| e.to == id).collect();
        edges.sort_by_key(|e| e.ordinal);
        edges
    }

    /// Outgoing edges of `id` in insertion order.
    pub fn outgoing(&self, id: ElementId) -> Vec<&ElementEdge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Distinct successors in edge order.
    pub fn successors(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        for edge in self.edges.iter().filter(|e| e.from == id) {
            if !out.contains(&edge.to) {
                out.push(edge.to);
            }
        }
        out
    }

    /// Distinct predecessors in ordinal order.
    pub fn predecessors(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        for edge in self.incoming(id) {
            if !out.contains(&edge.from) {
                out.push(edge.from);
            }
        }
        out
    }

    /// Forward and backward adjacency over slot indices.
    pub fn build_adjacency(&self) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
        let n = self.elements.len();
        let mut fwd_adj = vec![Vec::new(); n];
        let mut bwd_adj = vec![Vec::new(); n];

        for edge in &self.edges {
            let from = edge.from.index();
            let to = edge.to.index();
            if from >= n || to >= n || self.elements[from].removed || self.elements[to].removed {
                continue;
            }
            fwd_adj[from].push(to);
            bwd_adj[to].push(from);
        }

        (fwd_adj, bwd_adj)
    }

    /// Kahn's algorithm; ties resolve to the lowest id first.
    pub fn topological_order(&self) -> PlannerResult<Vec<ElementId>> {
        let (fwd_adj, _) = self.build_adjacency();
        let n = self.elements.len();
        let mut in_degree = vec![0usize; n];
        for targets in &fwd_adj {
            for &to in targets {
                in_degree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..n)
            .filter(|&i| !self.elements[i].removed && in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            order.push(ElementId::from_index(node));
            for &next in &fwd_adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.len() {
            return Err(PlannerError::Internal("cycle detected in element graph".to_string()));
        }
        Ok(order)
    }

    /// Elements reachable from `start` against the edge direction, stopping
    /// at (and including) taps.
    pub fn upstream_to_taps(&self, start: ElementId) -> Vec<ElementId> {
        let mut seen = vec![false; self.elements.len()];
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(id) = stack.pop() {
            if seen[id.index()] {
                continue;
            }
            seen[id.index()] = true;
            out.push(id);
            let is_tap = self.element(id).is_some_and(Element::is_tap);
            if id == start || !is_tap {
                stack.extend(self.predecessors(id));
            }
        }
        out
    }

    /// Elements reachable from `start` along the edge direction, stopping
    /// at (and including) taps.
    pub fn downstream_to_taps(&self, start: ElementId) -> Vec<ElementId> {
        let mut seen = vec![false; self.elements.len()];
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(id) = stack.pop() {
            if seen[id.index()] {
                continue;
            }
            seen[id.index()] = true;
            out.push(id);
            let is_tap = self.element(id).is_some_and(Element::is_tap);
            if id == start || !is_tap {
                stack.extend(self.successors(id));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Count, Identity};
    use crate::pipe::{GroupBy, PipeAssembly};
    use crate::tap::{MemoryStore, Scheme};

    fn bindings(store: &MemoryStore, names: &[&str]) -> BTreeMap<String, TapRef> {
        names
            .iter()
            .map(|n| (n.to_string(), store.tap(n, Scheme::default())))
            .collect()
    }

    #[test]
    fn test_branches_collapse_and_heads_share() {
        let store = MemoryStore::new();
        let mut assembly = PipeAssembly::new();
        let a = assembly.head("in");
        let b = assembly.head("in");
        let left = assembly.branch(a, "left");
        let right = assembly.each_function(b, Fields::all(), Identity::new(), Fields::results());
        let right = assembly.branch(right, "right");
        let _ = (left, right);

        let graph =
            ElementGraph::from_assembly(&assembly, &bindings(&store, &["in"]), &bindings(&store, &["left", "right"]))
                .unwrap();
        // Source, Each, two sinks.
        assert_eq!(graph.len(), 4);
        let source = ElementId(0);
        assert_eq!(graph.successors(source).len(), 2);
        assert!(graph.elements().filter(|e| matches!(e.kind, ElementKind::Source { .. })).count() == 1);
    }

    #[test]
    fn test_topological_order_and_removal() {
        let store = MemoryStore::new();
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let group = assembly.group_by(GroupBy::new(head, "a"));
        assembly.every_aggregator(group, Fields::all(), Count::new(), Fields::all());

        let mut graph =
            ElementGraph::from_assembly(&assembly, &bindings(&store, &["in"]), &bindings(&store, &["in"])).unwrap();
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![ElementId(0), ElementId(1), ElementId(2), ElementId(3)]);

        graph.remove_element(ElementId(3));
        assert_eq!(graph.len(), 3);
        assert!(graph.element(ElementId(3)).is_none());
        assert!(graph.outgoing(ElementId(2)).is_empty());
    }

    #[test]
    fn test_self_join_parallel_edges() {
        let store = MemoryStore::new();
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        assembly.co_group(crate::pipe::CoGroup::self_join(head, "a", 2).named("out"));
        let graph =
            ElementGraph::from_assembly(&assembly, &bindings(&store, &["in"]), &bindings(&store, &["out"])).unwrap();
        let incoming = graph.incoming(ElementId(1));
        assert_eq!(incoming.len(), 2);
        assert_eq!(incoming[1].ordinal, 1);
        assert_eq!(graph.predecessors(ElementId(1)), vec![ElementId(0)]);
    }

    #[test]
    fn test_upstream_stops_at_taps() {
        let store = MemoryStore::new();
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let each = assembly.each_function(head, Fields::all(), Identity::new(), Fields::results());
        assembly.group_by(GroupBy::new(each, "a").named("out"));
        let graph =
            ElementGraph::from_assembly(&assembly, &bindings(&store, &["in"]), &bindings(&store, &["out"])).unwrap();
        let mut up = graph.upstream_to_taps(ElementId(2));
        up.sort();
        assert_eq!(up, vec![ElementId(0), ElementId(1), ElementId(2)]);
        let mut down = graph.downstream_to_taps(ElementId(0));
        down.sort();
        assert_eq!(down, vec![ElementId(0), ElementId(1), ElementId(2), ElementId(3)]);
    }
}
