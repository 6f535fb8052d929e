//! Planned flows.
//!
//! A [`Flow`] is what [`FlowConnector::connect`](crate::planner::FlowConnector::connect)
//! returns: the normalized element graph, the tap bindings and the stages in
//! schedule order. It is immutable once built; the runner and the cascade
//! only read it.
//!
//! # Architecture
//!
//! ```text
//!  Flow "wordcount"
//!   ├── (1/2) tmp/pipeflow/wordcount/words_0    Source ─► Each ─► GroupBy ─► Every ─► [tmp]
//!   └── (2/2) counts                            [tmp] ─► GroupBy ─► Every ─► Sink
//!
//!  stage_dependencies: [(0, 1)]
//! ```

pub mod dot;
pub mod stage;

pub use stage::{Stage, StageDescription};

use crate::id::StageId;
use crate::planner::graph::{ElementGraph, ElementKind};
use crate::process::FlowProcess;
use crate::tap::{TapRef, TapResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Statistics about a planning run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanStats {
    /// Live elements after normalization
    pub elements: usize,

    /// Edges after normalization
    pub edges: usize,

    pub stages: usize,

    /// Stages without a grouping
    pub map_only_stages: usize,

    /// Intermediate taps inserted by normalization
    pub intermediates: usize,

    /// Map-side elements merged into an isomorphic sibling
    pub merged: usize,

    /// Planning time in microseconds
    pub plan_time_us: u64,
}

/// Serializable summary of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowDescription {
    pub name: String,
    pub sources: BTreeMap<String, String>,
    pub sinks: BTreeMap<String, String>,
    pub traps: BTreeMap<String, String>,
    pub stages: Vec<StageDescription>,
    pub dependencies: Vec<(u32, u32)>,
    pub stats: PlanStats,
}

/// A planned flow: stages in schedule order plus the graph they cut.
#[derive(Debug, Clone)]
pub struct Flow {
    pub(crate) name: String,
    pub(crate) graph: ElementGraph,
    pub(crate) stages: Vec<Stage>,
    pub(crate) sources: BTreeMap<String, TapRef>,
    pub(crate) sinks: BTreeMap<String, TapRef>,
    pub(crate) traps: BTreeMap<String, TapRef>,
    pub(crate) dependencies: Vec<(StageId, StageId)>,
    pub(crate) stats: PlanStats,
}

fn identifiers(taps: &BTreeMap<String, TapRef>) -> BTreeMap<String, String> {
    taps.iter()
        .map(|(name, tap)| (name.clone(), tap.identifier().to_string()))
        .collect()
}

impl Flow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &ElementGraph {
        &self.graph
    }

    /// Stages in schedule order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(id.index())
    }

    pub fn sources(&self) -> &BTreeMap<String, TapRef> {
        &self.sources
    }

    pub fn sinks(&self) -> &BTreeMap<String, TapRef> {
        &self.sinks
    }

    pub fn traps(&self) -> &BTreeMap<String, TapRef> {
        &self.traps
    }

    pub fn stats(&self) -> &PlanStats {
        &self.stats
    }

    /// `(writer, reader)` pairs between stages.
    pub fn stage_dependencies(&self) -> &[(StageId, StageId)] {
        &self.dependencies
    }

    /// Intermediate taps inserted by the planner, in element order.
    pub fn intermediates(&self) -> Vec<&TapRef> {
        self.graph
            .elements()
            .filter_map(|e| match &e.kind {
                ElementKind::Intermediate { tap } => Some(tap),
                _ => None,
            })
            .collect()
    }

    /// Whether the flow has to run: some sink is missing, or some source
    /// changed after the oldest sink was written.
    pub fn is_stale(&self, process: &dyn FlowProcess) -> TapResult<bool> {
        let mut oldest_sink: Option<DateTime<Utc>> = None;
        for tap in self.sinks.values() {
            match tap.modified_time(process)? {
                None => return Ok(true),
                Some(time) => oldest_sink = Some(oldest_sink.map_or(time, |oldest| oldest.min(time))),
            }
        }
        let Some(oldest_sink) = oldest_sink else {
            return Ok(true);
        };
        for tap in self.sources.values() {
            match tap.modified_time(process)? {
                Some(time) if time <= oldest_sink => {}
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    pub fn describe(&self) -> FlowDescription {
        FlowDescription {
            name: self.name.clone(),
            sources: identifiers(&self.sources),
            sinks: identifiers(&self.sinks),
            traps: identifiers(&self.traps),
            stages: self.stages.iter().map(|s| s.describe(self)).collect(),
            dependencies: self.dependencies.iter().map(|(a, b)| (a.0, b.0)).collect(),
            stats: self.stats.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.describe())
    }

    /// DOT rendering of the whole flow, one cluster per stage.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", dot::escape(&self.name));
        let mut clustered = vec![false; self.graph.capacity()];

        for stage in &self.stages {
            let _ = writeln!(out, "  subgraph cluster_{} {{", stage.id.0);
            let _ = writeln!(out, "    label=\"{}\";", dot::escape(&stage.name));
            let mut members: Vec<_> = stage
                .elements()
                .filter(|id| !clustered[id.index()])
                .filter(|id| self.graph.element(*id).is_some_and(|e| !e.is_tap()))
                .collect();
            members.sort();
            members.dedup();
            for id in members {
                if let Some(element) = self.graph.element(id) {
                    dot::write_node(&mut out, "    ", element);
                    clustered[id.index()] = true;
                }
            }
            out.push_str("  }\n");
        }
        for element in self.graph.elements().filter(|e| !clustered[e.id.index()]) {
            dot::write_node(&mut out, "  ", element);
        }
        for edge in self.graph.edges() {
            dot::write_edge(&mut out, "  ", edge);
        }
        out.push_str("}\n");
        out
    }
}
