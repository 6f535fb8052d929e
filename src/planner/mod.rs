//! Flow planner.
//!
//! Turns a [`PipeAssembly`] plus tap bindings into a [`Flow`]: a list of
//! stages in schedule order, each a map side, an optional grouping and a
//! reduce side.
//!
//! # Architecture
//!
//! ```text
//!  FlowDef ──► bindings ──► ElementGraph ──► validate ──► resolve
//!                                                            │
//!   Flow ◄── stages ◄── schedule ◄── partition ◄── normalize ◄┘
//! ```
//!
//! # Design
//!
//! - **Fail fast**: every error is raised before a stage exists, and
//!   binding errors list all unmatched names at once.
//! - **Pure**: planning never touches storage. Intermediate taps are only
//!   described here; the runner creates and deletes their resources.
//! - **Deterministic**: element ids, discovery order and intermediate names
//!   depend only on the assembly, so replanning yields an identical flow.

pub mod error;
pub mod graph;
pub mod normalize;
pub mod partition;
pub mod schedule;
pub mod scope;
pub mod validate;

pub use error::{PlannerError, PlannerResult, StructuralViolation, TapRole};
pub use graph::{Element, ElementEdge, ElementGraph, ElementKind};

use crate::config::{ConfigError, FlowConfig, SerializationTokens};
use crate::flow::{Flow, PlanStats, Stage};
use crate::id::StageId;
use crate::pipe::PipeAssembly;
use crate::tap::{MemoryStore, TapRef, TemporaryTapFactory};
use normalize::IntermediateNamer;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

/// An assembly together with the taps bound to its heads, tails and traps.
pub struct FlowDef {
    name: Option<String>,
    assembly: PipeAssembly,
    sources: BTreeMap<String, TapRef>,
    sinks: BTreeMap<String, TapRef>,
    traps: BTreeMap<String, TapRef>,
}

impl FlowDef {
    pub fn new(assembly: PipeAssembly) -> Self {
        Self {
            name: None,
            assembly,
            sources: BTreeMap::new(),
            sinks: BTreeMap::new(),
            traps: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind a head name to a source tap.
    pub fn source(mut self, name: impl Into<String>, tap: TapRef) -> Self {
        self.sources.insert(name.into(), tap);
        self
    }

    /// Bind a tail name to a sink tap.
    pub fn sink(mut self, name: impl Into<String>, tap: TapRef) -> Self {
        self.sinks.insert(name.into(), tap);
        self
    }

    /// Bind a branch name to a trap tap.
    pub fn trap(mut self, name: impl Into<String>, tap: TapRef) -> Self {
        self.traps.insert(name.into(), tap);
        self
    }

    pub fn assembly(&self) -> &PipeAssembly {
        &self.assembly
    }

    /// The explicit name, or the sink names joined with `+`.
    pub fn flow_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.sinks.keys().cloned().collect::<Vec<_>>().join("+")
        })
    }
}

fn missing<'a>(names: impl IntoIterator<Item = &'a String>, known: &BTreeSet<&str>) -> Vec<String> {
    let mut out: Vec<String> = names
        .into_iter()
        .filter(|n| !known.contains(n.as_str()))
        .cloned()
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Check bindings against the assembly. Every unmatched name of one kind is
/// reported together.
fn check_bindings(def: &FlowDef) -> PlannerResult<()> {
    let heads = def.assembly.head_names();
    let tails = def.assembly.tail_names();
    let head_set: BTreeSet<&str> = heads.iter().map(String::as_str).collect();
    let tail_set: BTreeSet<&str> = tails.iter().map(String::as_str).collect();
    let source_set: BTreeSet<&str> = def.sources.keys().map(String::as_str).collect();
    let sink_set: BTreeSet<&str> = def.sinks.keys().map(String::as_str).collect();
    let branch_set: BTreeSet<&str> = def.assembly.nodes().iter().map(|n| n.name.as_str()).collect();

    let names = missing(&heads, &source_set);
    if !names.is_empty() {
        return Err(PlannerError::UnboundTap {
            role: TapRole::Source,
            names,
        });
    }
    let names = missing(def.sources.keys(), &head_set);
    if !names.is_empty() {
        return Err(PlannerError::DanglingPipe {
            role: TapRole::Source,
            names,
        });
    }
    let names = missing(def.sinks.keys(), &tail_set);
    if !names.is_empty() {
        return Err(PlannerError::DanglingPipe {
            role: TapRole::Sink,
            names,
        });
    }
    let names = missing(&tails, &sink_set);
    if !names.is_empty() {
        return Err(PlannerError::UnboundTap {
            role: TapRole::Sink,
            names,
        });
    }
    let names = missing(def.traps.keys(), &branch_set);
    if !names.is_empty() {
        return Err(PlannerError::DanglingPipe {
            role: TapRole::Trap,
            names,
        });
    }
    for (source_name, source) in &def.sources {
        if let Some((sink_name, _)) = def
            .sinks
            .iter()
            .find(|(_, sink)| sink.is_same_resource(source.as_ref()))
        {
            return Err(PlannerError::SourceIsSink {
                tap: source.identifier().to_string(),
                source_name: source_name.clone(),
                sink_name: sink_name.clone(),
            });
        }
    }
    Ok(())
}

/// Plans flows with a fixed configuration.
pub struct FlowConnector {
    config: FlowConfig,
    tokens: SerializationTokens,
    temporaries: Arc<dyn TemporaryTapFactory>,
}

impl FlowConnector {
    /// Fails if the configuration or its serialization tokens are invalid.
    pub fn new(config: FlowConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tokens = config.serialization_tokens()?;
        Ok(Self {
            config,
            tokens,
            temporaries: Arc::new(MemoryStore::new()),
        })
    }

    /// Use `factory` for intermediate taps instead of a private memory store.
    pub fn with_temporary_factory(mut self, factory: Arc<dyn TemporaryTapFactory>) -> Self {
        self.temporaries = factory;
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn tokens(&self) -> &SerializationTokens {
        &self.tokens
    }

    /// Plan `def` into a flow.
    pub fn connect(&self, def: FlowDef) -> PlannerResult<Flow> {
        let start_time = Instant::now();
        let name = def.flow_name();
        tracing::debug!("Planning flow '{}' with {} pipes", name, def.assembly.len());

        def.assembly.validate_names()?;
        check_bindings(&def)?;

        let mut graph = ElementGraph::from_assembly(&def.assembly, &def.sources, &def.sinks)?;
        validate::validate(&graph)?;
        scope::resolve(&mut graph)?;

        let mut namer = IntermediateNamer::new(self.temporaries.as_ref(), &self.config.temporary_dir, &name);
        let normalized = normalize::normalize(&mut graph, &mut namer)?;

        let plans = partition::partition(&graph)?;
        for plan in &plans {
            partition::check_duplicate_sources(&graph, plan)?;
        }
        let (plans, dependencies) = schedule::schedule(&graph, plans)?;

        let total = plans.len();
        let stages: Vec<Stage> = plans
            .into_iter()
            .enumerate()
            .map(|(i, plan)| {
                let label = plan.label(&graph);
                let edges = plan
                    .edges
                    .iter()
                    .filter_map(|&index| graph.edges().get(index).cloned())
                    .collect();
                let mut stage = Stage {
                    id: StageId::from_index(i),
                    name: format!("({}/{}) {}", i + 1, total, label),
                    sources: plan.sources,
                    sinks: plan.sinks,
                    grouping: plan.grouping,
                    mapper: plan.mapper,
                    reducer: plan.reducer,
                    edges,
                    traps: BTreeMap::new(),
                };
                let guarded: Vec<String> = stage
                    .elements()
                    .filter_map(|id| graph.element(id))
                    .map(|e| e.name.clone())
                    .collect();
                for branch in guarded {
                    if let Some(tap) = def.traps.get(&branch) {
                        stage.traps.insert(branch, tap.clone());
                    }
                }
                stage
            })
            .collect();

        let stats = PlanStats {
            elements: graph.len(),
            edges: graph.edges().len(),
            stages: stages.len(),
            map_only_stages: stages.iter().filter(|s| s.is_map_only()).count(),
            intermediates: normalized.intermediates,
            merged: normalized.merged,
            plan_time_us: start_time.elapsed().as_micros() as u64,
        };
        tracing::info!(
            "Planned flow '{}': {} stages ({} map-only), {} intermediates in {}us",
            name,
            stats.stages,
            stats.map_only_stages,
            stats.intermediates,
            stats.plan_time_us
        );
        for stage in &stages {
            tracing::debug!("  {}", stage.name());
        }

        let FlowDef {
            sources, sinks, traps, ..
        } = def;
        Ok(Flow {
            name,
            graph,
            stages,
            sources,
            sinks,
            traps,
            dependencies: dependencies
                .into_iter()
                .map(|(a, b)| (StageId::from_index(a), StageId::from_index(b)))
                .collect(),
            stats,
        })
    }
}
