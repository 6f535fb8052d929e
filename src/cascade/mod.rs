//! Cascades: several flows run in dependency order.
//!
//! Flows are linked through their bound taps. A flow that writes a tap
//! another flow reads must run first.
//!
//! ```text
//!  [logs] ──import──► [parsed] ──count──► [counts]
//!                        │
//!                        └────rank──────► [ranked]
//!
//!  run order: import, count, rank
//! ```

use crate::flow::dot;
use crate::flow::Flow;
use crate::runner::{FlowError, FlowStats, LocalFlowRunner};
use crate::tap::TapRef;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt::Write;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("all flow names must be unique, found duplicate: {0}")]
    DuplicateFlowName(String),

    #[error("cascade '{cascade}' has a cycle through flows: {}", .flows.join(", "))]
    Cycle { cascade: String, flows: Vec<String> },

    #[error("flow '{flow}' failed: {source}")]
    Flow {
        flow: String,
        #[source]
        source: FlowError,
    },
}

/// Builds cascades from planned flows.
#[derive(Debug, Clone, Default)]
pub struct CascadeConnector;

/// Index of `tap` in `taps`, adding it when no known tap addresses the
/// same resource.
fn intern(taps: &mut Vec<TapRef>, tap: &TapRef) -> usize {
    if let Some(index) = taps.iter().position(|known| known.is_same_resource(tap.as_ref())) {
        return index;
    }
    taps.push(tap.clone());
    taps.len() - 1
}

impl CascadeConnector {
    pub fn new() -> Self {
        Self
    }

    /// Link `flows` through their taps and fix a run order. Without a
    /// name the cascade is named after its flows.
    pub fn connect(&self, name: Option<&str>, flows: Vec<Flow>) -> Result<Cascade, CascadeError> {
        let mut seen = HashSet::new();
        for flow in &flows {
            if !seen.insert(flow.name()) {
                return Err(CascadeError::DuplicateFlowName(flow.name().to_string()));
            }
        }
        let name = name.map_or_else(
            || flows.iter().map(Flow::name).collect::<Vec<_>>().join("+"),
            str::to_string,
        );

        // Tap graph: taps are vertices, each flow links its sources to its sinks.
        let mut taps = Vec::new();
        let mut reads = Vec::with_capacity(flows.len());
        let mut writes = Vec::with_capacity(flows.len());
        for flow in &flows {
            let sources: BTreeSet<usize> = flow.sources().values().map(|t| intern(&mut taps, t)).collect();
            let sinks: BTreeSet<usize> = flow.sinks().values().map(|t| intern(&mut taps, t)).collect();
            reads.push(sources);
            writes.push(sinks);
        }

        // Flow graph: writer -> reader, labelled with the number of shared taps.
        let mut edges: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for (writer, sinks) in writes.iter().enumerate() {
            for (reader, sources) in reads.iter().enumerate() {
                let shared = sinks.intersection(sources).count();
                if shared == 0 {
                    continue;
                }
                if writer == reader {
                    return Err(CascadeError::Cycle {
                        cascade: name,
                        flows: vec![flows[writer].name().to_string()],
                    });
                }
                *edges.entry((writer, reader)).or_insert(0) += shared;
            }
        }

        // Kahn's algorithm, ties broken by the order flows were given.
        let mut in_degree = vec![0usize; flows.len()];
        let mut successors = vec![Vec::new(); flows.len()];
        for &(writer, reader) in edges.keys() {
            in_degree[reader] += 1;
            successors[writer].push(reader);
        }
        let mut queue: VecDeque<usize> = (0..flows.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(flows.len());
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &next in &successors[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if order.len() != flows.len() {
            let mut stuck: Vec<String> = (0..flows.len())
                .filter(|i| !order.contains(i))
                .map(|i| flows[i].name().to_string())
                .collect();
            stuck.sort();
            return Err(CascadeError::Cycle { cascade: name, flows: stuck });
        }

        let mut position = vec![0usize; flows.len()];
        for (at, &index) in order.iter().enumerate() {
            position[index] = at;
        }
        let edges = edges
            .into_iter()
            .map(|((writer, reader), shared)| ((position[writer], position[reader]), shared))
            .collect();
        let reads = order.iter().map(|&i| reads[i].clone()).collect();
        let writes = order.iter().map(|&i| writes[i].clone()).collect();
        let mut slots: Vec<Option<Flow>> = flows.into_iter().map(Some).collect();
        let flows: Vec<Flow> = order.iter().filter_map(|&i| slots[i].take()).collect();

        tracing::info!("Connected cascade '{}' with {} flows", name, flows.len());
        for flow in &flows {
            tracing::debug!("  {}", flow.name());
        }
        Ok(Cascade {
            name,
            flows,
            taps,
            reads,
            writes,
            edges,
        })
    }
}

/// Flows in a fixed run order.
#[derive(Debug, Clone)]
pub struct Cascade {
    name: String,
    flows: Vec<Flow>,
    taps: Vec<TapRef>,
    reads: Vec<BTreeSet<usize>>,
    writes: Vec<BTreeSet<usize>>,
    /// `(writer, reader)` positions in run order to the number of shared taps.
    edges: BTreeMap<(usize, usize), usize>,
}

impl Cascade {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flows_in_order(&self) -> &[Flow] {
        &self.flows
    }

    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.name() == name)
    }

    /// `(writer, reader)` flow names.
    pub fn dependencies(&self) -> Vec<(&str, &str)> {
        self.edges
            .keys()
            .map(|&(writer, reader)| (self.flows[writer].name(), self.flows[reader].name()))
            .collect()
    }

    /// Distinct taps the flows are bound to.
    pub fn taps(&self) -> &[TapRef] {
        &self.taps
    }

    /// Run every flow in order. Flows whose sinks are newer than their
    /// sources are skipped when the runner is configured to.
    pub fn run(&self, runner: &LocalFlowRunner) -> Result<Vec<FlowStats>, CascadeError> {
        tracing::info!("Starting cascade '{}'", self.name);
        let skip_up_to_date = runner.config().skip_up_to_date_flows;
        let mut stats = Vec::with_capacity(self.flows.len());
        for flow in &self.flows {
            let failed = |source: FlowError| CascadeError::Flow {
                flow: flow.name().to_string(),
                source,
            };
            if skip_up_to_date {
                let process = runner.process();
                let stale = flow.is_stale(&process).map_err(|source| {
                    failed(FlowError::Tap {
                        tap: flow.name().to_string(),
                        source,
                    })
                })?;
                if !stale {
                    tracing::info!("Skipping up-to-date flow '{}'", flow.name());
                    stats.push(FlowStats::skipped(flow));
                    continue;
                }
            }
            stats.push(runner.run(flow).map_err(failed)?);
        }
        tracing::info!("Finished cascade '{}'", self.name);
        Ok(stats)
    }

    /// DOT rendering of the tap graph: taps as boxes, flows as ellipses.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", dot::escape(&self.name));
        for (index, tap) in self.taps.iter().enumerate() {
            let _ = writeln!(out, "  t{} [label=\"{}\", shape=box];", index, dot::escape(tap.identifier()));
        }
        for (index, flow) in self.flows.iter().enumerate() {
            let _ = writeln!(out, "  f{} [label=\"{}\", shape=ellipse];", index, dot::escape(flow.name()));
            for tap in &self.reads[index] {
                let _ = writeln!(out, "  t{} -> f{};", tap, index);
            }
            for tap in &self.writes[index] {
                let _ = writeln!(out, "  f{} -> t{};", index, tap);
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;
    use crate::operation::Identity;
    use crate::pipe::PipeAssembly;
    use crate::planner::{FlowConnector, FlowDef};
    use crate::tap::{MemoryStore, Scheme};
    use crate::tuple::Fields;

    fn copy(store: &MemoryStore, name: &str, from: &str, to: &str) -> Flow {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("copy");
        assembly.each_function(head, Fields::all(), Identity::new(), Fields::results());
        let def = FlowDef::new(assembly)
            .named(name)
            .source("copy", store.tap(from, Scheme::new(Fields::from("line"))))
            .sink("copy", store.tap(to, Scheme::default()));
        FlowConnector::new(FlowConfig::default()).unwrap().connect(def).unwrap()
    }

    #[test]
    fn test_orders_by_tap_dependencies() {
        let store = MemoryStore::new();
        let flows = vec![copy(&store, "second", "mid", "out"), copy(&store, "first", "in", "mid")];
        let cascade = CascadeConnector::new().connect(None, flows).unwrap();

        let names: Vec<&str> = cascade.flows_in_order().iter().map(Flow::name).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(cascade.dependencies(), vec![("first", "second")]);
        assert_eq!(cascade.name(), "second+first");
        assert_eq!(cascade.taps().len(), 3);
    }

    #[test]
    fn test_independent_flows_keep_given_order() {
        let store = MemoryStore::new();
        let flows = vec![copy(&store, "b", "in1", "out1"), copy(&store, "a", "in2", "out2")];
        let cascade = CascadeConnector::new().connect(Some("pair"), flows).unwrap();
        let names: Vec<&str> = cascade.flows_in_order().iter().map(Flow::name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(cascade.dependencies().is_empty());
    }

    #[test]
    fn test_duplicate_flow_names() {
        let store = MemoryStore::new();
        let flows = vec![copy(&store, "same", "a", "b"), copy(&store, "same", "c", "d")];
        let err = CascadeConnector::new().connect(None, flows).unwrap_err();
        assert_eq!(err.to_string(), "all flow names must be unique, found duplicate: same");
    }

    #[test]
    fn test_cycle_between_flows() {
        let store = MemoryStore::new();
        let flows = vec![copy(&store, "ping", "a", "b"), copy(&store, "pong", "b", "a")];
        let err = CascadeConnector::new().connect(None, flows).unwrap_err();
        assert!(matches!(err, CascadeError::Cycle { ref flows, .. } if flows == &["ping", "pong"]));
    }

    #[test]
    fn test_to_dot_lists_taps_and_flows() {
        let store = MemoryStore::new();
        let cascade = CascadeConnector::new()
            .connect(Some("c"), vec![copy(&store, "only", "in", "out")])
            .unwrap();
        let dot = cascade.to_dot();
        assert!(dot.starts_with("digraph \"c\" {"));
        assert!(dot.contains("t0 [label=\"in\", shape=box];"));
        assert!(dot.contains("t0 -> f0;"));
        assert!(dot.contains("f0 -> t1;"));
    }
}
