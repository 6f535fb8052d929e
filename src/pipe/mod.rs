//! Logical pipe assembly.
//!
//! Users describe a flow as an assembly of pipes: heads that will be bound
//! to source taps, operator pipes, grouping and merge points, and tails that
//! will be bound to sink taps.
//!
//! # Architecture
//!
//! ```text
//!   head("words") ──► each(tokenize) ──► group_by(word) ──► every(count) ──► tail
//!        PipeId(0)        PipeId(1)          PipeId(2)          PipeId(3)
//! ```
//!
//! The assembly is an arena: every builder call appends a [`PipeNode`] and
//! returns its [`PipeId`]. Predecessors must exist before a node is added,
//! so ids are already a topological order and the assembly cannot contain
//! a cycle.
//!
//! Every builder is `#[track_caller]`; the captured [`CallSite`] is carried
//! into planner errors so a failure points at the assembly code that built
//! the offending pipe.

pub mod grouping;

pub use grouping::{CoGroup, GroupBy, Joiner, Merge};

pub use crate::id::PipeId;
use crate::operation::{Aggregator, Buffer, EachOperation, EveryOperation, Filter, Function, Identity};
use crate::planner::PlannerError;
use crate::tuple::Fields;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;

/// Source location of the builder call that created a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallSite(Option<&'static Location<'static>>);

impl CallSite {
    #[track_caller]
    pub fn caller() -> Self {
        Self(Some(Location::caller()))
    }

    pub fn unknown() -> Self {
        Self(None)
    }

    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.0
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(location) => write!(f, "{}:{}", location.file(), location.line()),
            None => f.write_str("<unknown>"),
        }
    }
}

/// What a pipe does.
#[derive(Debug, Clone)]
pub enum PipeKind {
    /// Start of a branch, bound to a source tap by name.
    Head,
    /// Renames the branch; passes records through untouched.
    Branch,
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
        /// Key fields, one per input ordinal.
        group_fields: Vec<Fields>,
        declared: Option<Fields>,
        joiner: Joiner,
    },
    Merge,
}

impl PipeKind {
    pub fn label(&self) -> &'static str {
        match self {
            PipeKind::Head => "Head",
            PipeKind::Branch => "Branch",
            PipeKind::Each { .. } => "Each",
            PipeKind::Every { .. } => "Every",
            PipeKind::GroupBy { .. } => "GroupBy",
            PipeKind::CoGroup { .. } => "CoGroup",
            PipeKind::Merge => "Merge",
        }
    }

    pub fn is_grouping(&self) -> bool {
        matches!(self, PipeKind::GroupBy { .. } | PipeKind::CoGroup { .. })
    }
}

/// One pipe in an assembly.
#[derive(Debug, Clone)]
pub struct PipeNode {
    pub id: PipeId,
    pub name: String,
    pub kind: PipeKind,
    /// Inputs in ordinal order. The same id may appear more than once.
    pub previous: Vec<PipeId>,
    pub trace: CallSite,
}

/// An arena of pipes forming an acyclic graph.
#[derive(Debug, Clone, Default)]
pub struct PipeAssembly {
    nodes: Vec<PipeNode>,
}

impl PipeAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[PipeNode] {
        &self.nodes
    }

    pub fn node(&self, id: PipeId) -> Option<&PipeNode> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Name of `id`, or an empty string for an id from another assembly.
    pub fn name_of(&self, id: PipeId) -> &str {
        self.node(id).map(|n| n.name.as_str()).unwrap_or("")
    }

    fn push(&mut self, name: String, kind: PipeKind, previous: Vec<PipeId>, trace: CallSite) -> PipeId {
        let id = PipeId::from_index(self.nodes.len());
        self.nodes.push(PipeNode {
            id,
            name,
            kind,
            previous,
            trace,
        });
        id
    }

    fn joined_name(&self, inputs: &[PipeId]) -> String {
        let mut names: Vec<&str> = Vec::new();
        for &input in inputs {
            let name = self.name_of(input);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.join("*")
    }

    // ==================== Builders ====================

    #[track_caller]
    pub fn head(&mut self, name: impl Into<String>) -> PipeId {
        self.push(name.into(), PipeKind::Head, Vec::new(), CallSite::caller())
    }

    #[track_caller]
    pub fn branch(&mut self, previous: PipeId, name: impl Into<String>) -> PipeId {
        self.push(name.into(), PipeKind::Branch, vec![previous], CallSite::caller())
    }

    #[track_caller]
    pub fn each(
        &mut self,
        previous: PipeId,
        arguments: impl Into<Fields>,
        operation: EachOperation,
        output: impl Into<Fields>,
    ) -> PipeId {
        let kind = PipeKind::Each {
            arguments: arguments.into(),
            operation,
            output: output.into(),
        };
        let name = self.name_of(previous).to_string();
        self.push(name, kind, vec![previous], CallSite::caller())
    }

    #[track_caller]
    pub fn each_function<F: Function + 'static>(
        &mut self,
        previous: PipeId,
        arguments: impl Into<Fields>,
        function: F,
        output: impl Into<Fields>,
    ) -> PipeId {
        self.each(previous, arguments, EachOperation::function(function), output)
    }

    #[track_caller]
    pub fn each_filter<F: Filter + 'static>(
        &mut self,
        previous: PipeId,
        arguments: impl Into<Fields>,
        filter: F,
    ) -> PipeId {
        self.each(previous, arguments, EachOperation::filter(filter), Fields::all())
    }

    #[track_caller]
    pub fn every(
        &mut self,
        previous: PipeId,
        arguments: impl Into<Fields>,
        operation: EveryOperation,
        output: impl Into<Fields>,
    ) -> PipeId {
        let kind = PipeKind::Every {
            arguments: arguments.into(),
            operation,
            output: output.into(),
        };
        let name = self.name_of(previous).to_string();
        self.push(name, kind, vec![previous], CallSite::caller())
    }

    #[track_caller]
    pub fn every_aggregator<A: Aggregator + 'static>(
        &mut self,
        previous: PipeId,
        arguments: impl Into<Fields>,
        aggregator: A,
        output: impl Into<Fields>,
    ) -> PipeId {
        self.every(previous, arguments, EveryOperation::aggregator(aggregator), output)
    }

    #[track_caller]
    pub fn every_buffer<B: Buffer + 'static>(
        &mut self,
        previous: PipeId,
        arguments: impl Into<Fields>,
        buffer: B,
        output: impl Into<Fields>,
    ) -> PipeId {
        self.every(previous, arguments, EveryOperation::buffer(buffer), output)
    }

    #[track_caller]
    pub fn group_by(&mut self, spec: GroupBy) -> PipeId {
        let name = spec.name.unwrap_or_else(|| self.joined_name(&spec.inputs));
        let kind = PipeKind::GroupBy {
            group_fields: spec.group_fields,
            sort_fields: spec.sort_fields,
            reverse: spec.reverse,
        };
        self.push(name, kind, spec.inputs, CallSite::caller())
    }

    #[track_caller]
    pub fn co_group(&mut self, spec: CoGroup) -> PipeId {
        let (inputs, group_fields): (Vec<PipeId>, Vec<Fields>) = spec.inputs.into_iter().unzip();
        let name = spec.name.unwrap_or_else(|| self.joined_name(&inputs));
        let kind = PipeKind::CoGroup {
            group_fields,
            declared: spec.declared,
            joiner: spec.joiner,
        };
        self.push(name, kind, inputs, CallSite::caller())
    }

    #[track_caller]
    pub fn merge(&mut self, spec: Merge) -> PipeId {
        let name = spec.name.unwrap_or_else(|| self.joined_name(&spec.inputs));
        self.push(name, PipeKind::Merge, spec.inputs, CallSite::caller())
    }

    /// Rename `from` to `to`, keeping every other field in place.
    #[track_caller]
    pub fn rename(
        &mut self,
        previous: PipeId,
        from: impl Into<Fields>,
        to: impl Into<Fields>,
    ) -> Result<PipeId, PlannerError> {
        let (from, to) = (from.into(), to.into());
        if from.arity() != to.arity() || !from.is_defined() {
            return Err(PlannerError::InvalidAssembly {
                element: self.name_of(previous).to_string(),
                trace: CallSite::caller(),
                message: format!("rename requires equal field counts, got {} and {}", from, to),
            });
        }
        Ok(self.each(previous, from, EachOperation::function(Identity::as_fields(to)), Fields::swap()))
    }

    // ==================== Queries ====================

    /// Successors of every node, by id, in insertion order.
    pub fn successors(&self) -> Vec<Vec<PipeId>> {
        let mut successors = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for &prev in &node.previous {
                if let Some(list) = successors.get_mut(prev.index()) {
                    if !list.contains(&node.id) {
                        list.push(node.id);
                    }
                }
            }
        }
        successors
    }

    pub fn heads(&self) -> Vec<PipeId> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, PipeKind::Head))
            .map(|n| n.id)
            .collect()
    }

    /// Nodes nothing consumes.
    pub fn tails(&self) -> Vec<PipeId> {
        self.successors()
            .iter()
            .enumerate()
            .filter(|(_, succ)| succ.is_empty())
            .map(|(i, _)| PipeId::from_index(i))
            .collect()
    }

    /// Distinct head names, sorted.
    pub fn head_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.heads().into_iter().map(|id| self.name_of(id).to_string()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Tail names, sorted.
    pub fn tail_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tails().into_iter().map(|id| self.name_of(id).to_string()).collect();
        names.sort();
        names
    }

    /// Check references and naming.
    ///
    /// Every predecessor must precede its consumer. Two tails may not share
    /// a name; two heads may, since that binds one tap to both.
    pub fn validate_names(&self) -> Result<(), PlannerError> {
        for node in &self.nodes {
            if let Some(bad) = node.previous.iter().find(|p| p.index() >= node.id.index()) {
                return Err(PlannerError::InvalidAssembly {
                    element: node.name.clone(),
                    trace: node.trace,
                    message: format!("predecessor {} is not part of this assembly", bad),
                });
            }
        }

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for id in self.tails() {
            *counts.entry(self.name_of(id)).or_default() += 1;
        }
        let duplicates: Vec<String> = counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(name, _)| name.to_string())
            .collect();
        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(PlannerError::DuplicateName {
                kind: "tail",
                names: duplicates,
            })
        }
    }
}
