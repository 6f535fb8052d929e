//! In-process flow runner.
//!
//! Drives the stacks of every stage of a [`Flow`] on local threads. It is
//! the execution substrate used by the tests and the demo binary; a
//! distributed substrate would implement [`FlowProcess`] and drive
//! [`MapperStack`]/[`ReducerStack`] the same way.
//!
//! # Architecture
//!
//! ```text
//!                       ┌─► worker 0 (MapperStack) ──┐
//!  source taps ──feed──┼─► worker 1 (MapperStack) ──┼──► sinks (map-only)
//!   round-robin         └─► worker n (MapperStack) ──┘
//!                                      │ GroupedTuple
//!                                      ▼
//!                                 shuffle thread ──► ReducerStack ──► sinks
//! ```
//!
//! Stages run one after another in schedule order, so every intermediate
//! tap is complete before a later stage reads it.

pub mod shuffle;

pub use shuffle::Shuffle;

use crate::config::FlowConfig;
use crate::flow::{Flow, Stage};
use crate::id::ElementId;
use crate::process::{counters, FlowProcess};
use crate::stack::{ExecutionError, GroupedTuple, MapperStack, ReducerStack};
use crate::tap::{SinkMode, TapError, TapRef, TapResult, TupleCollector, TupleIter};
use crate::tuple::Tuple;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use thiserror::Error;

/// Capacity of the channels between the feeder, workers and the shuffle.
const CHANNEL_CAPACITY: usize = 1024;

/// Errors raised while running a flow.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: ExecutionError,
    },

    #[error("sink '{0}' already exists, bind it with SinkMode::Replace or SinkMode::Append")]
    SinkExists(String),

    #[error("unable to access tap '{tap}': {source}")]
    Tap {
        tap: String,
        #[source]
        source: TapError,
    },

    #[error("a worker of stage {0} panicked")]
    WorkerPanicked(String),
}

impl FlowError {
    fn tap(tap: &TapRef, source: TapError) -> Self {
        Self::Tap {
            tap: tap.identifier().to_string(),
            source,
        }
    }

    /// The execution error behind a stage failure, if any.
    pub fn execution(&self) -> Option<&ExecutionError> {
        match self {
            Self::Stage { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// [`FlowProcess`] backed by local counters.
#[derive(Debug, Default)]
pub struct LocalFlowProcess {
    counters: Mutex<BTreeMap<String, u64>>,
    keep_alives: AtomicU64,
    status: Mutex<String>,
    properties: BTreeMap<String, String>,
}

impl LocalFlowProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: BTreeMap<String, String>) -> Self {
        Self {
            properties,
            ..Self::default()
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn keep_alives(&self) -> u64 {
        self.keep_alives.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> String {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl FlowProcess for LocalFlowProcess {
    fn open_tap_for_read(&self, tap: &TapRef) -> TapResult<TupleIter> {
        tap.open_for_read(self)
    }

    fn open_tap_for_write(&self, tap: &TapRef) -> TapResult<Box<dyn TupleCollector>> {
        tap.open_for_write(self)
    }

    fn keep_alive(&self) {
        self.keep_alives.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_counter(&self, name: &str, amount: u64) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(0) += amount;
    }

    fn set_status(&self, status: &str) {
        tracing::debug!("Status: {}", status);
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.to_string();
    }

    fn property(&self, key: &str) -> Option<String> {
        self.properties.get(key).cloned()
    }
}

/// Outcome of one flow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    pub flow: String,
    pub stages: usize,
    pub counters: BTreeMap<String, u64>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// The flow was up to date and did not run.
    pub skipped: bool,
}

impl FlowStats {
    pub(crate) fn skipped(flow: &Flow) -> Self {
        let now = Utc::now();
        Self {
            flow: flow.name().to_string(),
            stages: 0,
            counters: BTreeMap::new(),
            started: now,
            finished: now,
            skipped: true,
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn tuples_read(&self) -> u64 {
        self.counter(counters::TUPLES_READ)
    }

    pub fn tuples_written(&self) -> u64 {
        self.counter(counters::TUPLES_WRITTEN)
    }

    pub fn tuples_trapped(&self) -> u64 {
        self.counter(counters::TUPLES_TRAPPED)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished - self.started
    }
}

/// Runs flows on local threads.
#[derive(Debug, Clone, Default)]
pub struct LocalFlowRunner {
    config: FlowConfig,
}

impl LocalFlowRunner {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// A fresh process carrying the configured properties.
    pub fn process(&self) -> LocalFlowProcess {
        LocalFlowProcess::with_properties(self.config.properties.clone())
    }

    /// Run every stage of `flow` in schedule order.
    pub fn run(&self, flow: &Flow) -> Result<FlowStats, FlowError> {
        let process = self.process();
        self.run_with(flow, &process)
    }

    /// Run `flow` against a caller-supplied process.
    pub fn run_with(&self, flow: &Flow, process: &LocalFlowProcess) -> Result<FlowStats, FlowError> {
        let started = Utc::now();
        tracing::info!("Starting flow '{}' with {} stages", flow.name(), flow.stages().len());

        self.prepare_outputs(flow, process)?;
        let outcome = flow
            .stages()
            .iter()
            .try_for_each(|stage| self.run_stage(flow, stage, process));
        let removed = self.remove_intermediates(flow, process);
        outcome?;
        removed?;

        let stats = FlowStats {
            flow: flow.name().to_string(),
            stages: flow.stages().len(),
            counters: process.counters(),
            started,
            finished: Utc::now(),
            skipped: false,
        };
        tracing::info!(
            "Finished flow '{}': read {}, wrote {}, trapped {} in {}ms",
            flow.name(),
            stats.tuples_read(),
            stats.tuples_written(),
            stats.tuples_trapped(),
            stats.duration().num_milliseconds()
        );
        Ok(stats)
    }

    /// Apply each sink's mode before anything is written. Intermediates
    /// are always replaced.
    fn prepare_outputs(&self, flow: &Flow, process: &dyn FlowProcess) -> Result<(), FlowError> {
        let intermediates = flow.intermediates();
        let outputs = flow.sinks().values().chain(flow.traps().values());
        for tap in outputs.chain(intermediates.iter().copied()) {
            let mode = if tap.is_temporary() {
                SinkMode::Replace
            } else {
                tap.sink_mode()
            };
            match mode {
                SinkMode::Replace => {
                    if tap.delete_resource(process).map_err(|e| FlowError::tap(tap, e))? {
                        tracing::debug!("Deleted existing resource {}", tap.identifier());
                    }
                }
                SinkMode::Keep => {
                    if tap.resource_exists(process).map_err(|e| FlowError::tap(tap, e))? {
                        return Err(FlowError::SinkExists(tap.identifier().to_string()));
                    }
                }
                SinkMode::Append => {}
            }
        }
        Ok(())
    }

    fn remove_intermediates(&self, flow: &Flow, process: &dyn FlowProcess) -> Result<(), FlowError> {
        if self.config.keep_intermediates {
            return Ok(());
        }
        for tap in flow.intermediates() {
            tap.delete_resource(process).map_err(|e| FlowError::tap(tap, e))?;
        }
        Ok(())
    }

    fn run_stage(&self, flow: &Flow, stage: &Stage, process: &LocalFlowProcess) -> Result<(), FlowError> {
        process.set_status(&format!("running stage {}", stage.name()));
        tracing::debug!("Running stage {}", stage.name());
        let failed = |source: ExecutionError| FlowError::Stage {
            stage: stage.name().to_string(),
            source,
        };

        if stage.is_map_only() {
            return self.run_map_side(flow, stage, process, None);
        }

        let interval = self.config.keep_alive_interval;
        let mut reducer = ReducerStack::new(flow, stage, process, interval).map_err(failed)?;
        let grouping = stage
            .grouping()
            .and_then(|id| flow.graph().element(id))
            .map_or_else(|| stage.name().to_string(), |e| e.name.clone());
        let shuffle = Shuffle::new(
            &grouping,
            reducer.resolution(),
            reducer.bucket_count(),
            self.config.max_group_tuples,
        );

        let (tx, rx) = bounded::<GroupedTuple>(CHANNEL_CAPACITY);
        let shuffled = thread::scope(|scope| {
            let collector = scope.spawn(move || fill(shuffle, rx));
            let mapped = self.run_map_side(flow, stage, process, Some(tx));
            let shuffled = collector
                .join()
                .map_err(|_| FlowError::WorkerPanicked(stage.name().to_string()))?;
            // A shuffle failure makes the workers fail too; report the cause.
            let shuffle = shuffled.map_err(failed)?;
            mapped.map(|()| shuffle)
        })?;

        let groups = shuffled.into_groups();
        let outcome = reducer
            .prepare()
            .and_then(|()| groups.into_iter().try_for_each(|group| reducer.operate_group(group)));
        reducer.finish(outcome).map_err(failed)
    }

    /// Feed every source of the stage round-robin to `map_partitions`
    /// workers, each with its own mapper stack.
    fn run_map_side(
        &self,
        flow: &Flow,
        stage: &Stage,
        process: &dyn FlowProcess,
        grouped: Option<Sender<GroupedTuple>>,
    ) -> Result<(), FlowError> {
        let partitions = self.config.map_partitions.max(1);
        let interval = self.config.keep_alive_interval;
        let rendezvous = Rendezvous::new(partitions);

        thread::scope(|scope| {
            let mut senders = Vec::with_capacity(partitions);
            let mut workers = Vec::with_capacity(partitions);
            for _ in 0..partitions {
                let (tx, rx) = bounded::<(ElementId, Tuple)>(CHANNEL_CAPACITY);
                let grouped = grouped.clone();
                let rendezvous = &rendezvous;
                workers.push(scope.spawn(move || map_worker(flow, stage, process, interval, rx, grouped, rendezvous)));
                senders.push(tx);
            }
            drop(grouped);

            let fed = feed(flow, stage, process, &senders);
            if fed.is_err() {
                rendezvous.abort();
            }
            drop(senders);

            let mut first = None;
            for worker in workers {
                let outcome = match worker.join() {
                    Ok(outcome) => outcome.map_err(|source| FlowError::Stage {
                        stage: stage.name().to_string(),
                        source,
                    }),
                    Err(_) => Err(FlowError::WorkerPanicked(stage.name().to_string())),
                };
                if let Err(e) = outcome {
                    first.get_or_insert(e);
                }
            }
            fed?;
            first.map_or(Ok(()), Err)
        })
    }
}

/// Read every source of `stage` and deal its records to the workers.
fn feed(
    flow: &Flow,
    stage: &Stage,
    process: &dyn FlowProcess,
    senders: &[Sender<(ElementId, Tuple)>],
) -> Result<(), FlowError> {
    let mut next = 0usize;
    for &source in stage.sources() {
        let Some(tap) = flow.graph().element(source).and_then(|e| e.kind.tap()) else {
            continue;
        };
        let records = process.open_tap_for_read(tap).map_err(|e| FlowError::tap(tap, e))?;
        for record in records {
            let tuple = record.map_err(|e| FlowError::tap(tap, e))?;
            if senders[next % senders.len()].send((source, tuple)).is_err() {
                // The worker stopped early; its error is reported on join.
                return Ok(());
            }
            next += 1;
        }
    }
    Ok(())
}

/// Holds every partition of a map side until all of them have drained
/// their records, so sinks are committed by all partitions or by none.
struct Rendezvous {
    remaining: Mutex<usize>,
    drained: Condvar,
    aborted: AtomicBool,
}

impl Rendezvous {
    fn new(partitions: usize) -> Self {
        Self {
            remaining: Mutex::new(partitions),
            drained: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Mark one partition as drained without waiting for the others.
    fn depart(&self) {
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.drained.notify_all();
        }
    }

    /// Mark one partition as drained and wait for the rest. Returns whether
    /// every partition succeeded.
    fn arrive(&self, succeeded: bool) -> bool {
        if !succeeded {
            self.abort();
        }
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.drained.notify_all();
        }
        while *remaining > 0 {
            remaining = self.drained.wait(remaining).unwrap_or_else(PoisonError::into_inner);
        }
        !self.aborted.load(Ordering::SeqCst)
    }
}

/// A partition's place in the [`Rendezvous`]. Dropping it before arriving,
/// on an early error or a panic, aborts the map side.
struct Arrival<'r> {
    rendezvous: &'r Rendezvous,
    arrived: bool,
}

impl<'r> Arrival<'r> {
    fn new(rendezvous: &'r Rendezvous) -> Self {
        Self {
            rendezvous,
            arrived: false,
        }
    }

    fn arrive(mut self, succeeded: bool) -> bool {
        self.arrived = true;
        self.rendezvous.arrive(succeeded)
    }
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        if !self.arrived {
            self.rendezvous.abort();
            self.rendezvous.depart();
        }
    }
}

fn map_worker(
    flow: &Flow,
    stage: &Stage,
    process: &dyn FlowProcess,
    interval: u64,
    records: Receiver<(ElementId, Tuple)>,
    grouped: Option<Sender<GroupedTuple>>,
    rendezvous: &Rendezvous,
) -> Result<(), ExecutionError> {
    let arrival = Arrival::new(rendezvous);
    let mut stack = MapperStack::new(flow, stage, process, interval)?;
    if let Some(sender) = grouped {
        stack = stack.with_grouping_collector(sender);
    }
    let mut outcome = stack.prepare();
    if outcome.is_ok() {
        outcome = records
            .iter()
            .try_for_each(|(source, tuple)| stack.operate(source, tuple));
    }
    // Unblock the feeder before waiting on the other partitions.
    drop(records);

    let commit = arrival.arrive(outcome.is_ok());
    let finished = if outcome.is_ok() && !commit {
        // Another partition failed; tear down without committing sinks.
        let aborted = ExecutionError::internal(stage.name(), "another partition failed");
        if let Err(e) = stack.finish(Err(aborted)) {
            tracing::warn!("Tore down partition of '{}' without committing: {}", stage.name(), e);
        }
        Ok(())
    } else {
        stack.finish(outcome)
    };
    // Release the shuffle channel before the stage waits on it.
    drop(stack.take_grouping_collector());
    finished
}

fn fill(mut shuffle: Shuffle, grouped: Receiver<GroupedTuple>) -> Result<Shuffle, ExecutionError> {
    for tuple in grouped {
        shuffle.push(tuple)?;
    }
    Ok(shuffle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Count, FilterNull, Identity};
    use crate::pipe::{GroupBy, PipeAssembly};
    use crate::planner::{FlowConnector, FlowDef};
    use crate::tap::{MemoryStore, MemoryTap, Scheme};
    use crate::tuple;
    use crate::tuple::Fields;
    use std::sync::Arc;

    fn word_count(store: &MemoryStore) -> Flow {
        let mut assembly = PipeAssembly::new();
        let head = assembly.head("words");
        let group = assembly.group_by(GroupBy::new(head, "word"));
        assembly.every_aggregator(group, Fields::all(), Count::as_field("count"), Fields::all());
        let def = FlowDef::new(assembly)
            .source("words", store.tap("in", Scheme::new(Fields::from("word"))))
            .sink("words", store.tap("out", Scheme::default()));
        FlowConnector::new(FlowConfig::default()).unwrap().connect(def).unwrap()
    }

    #[test]
    fn test_rendezvous_commits_only_when_all_succeed() {
        let rendezvous = Rendezvous::new(2);
        let committed = thread::scope(|scope| {
            let other = scope.spawn(|| Arrival::new(&rendezvous).arrive(true));
            let mine = Arrival::new(&rendezvous).arrive(true);
            (mine, other.join().unwrap())
        });
        assert_eq!(committed, (true, true));

        let rendezvous = Rendezvous::new(2);
        let committed = thread::scope(|scope| {
            let other = scope.spawn(|| Arrival::new(&rendezvous).arrive(false));
            Arrival::new(&rendezvous).arrive(true) || other.join().unwrap()
        });
        assert!(!committed);
    }

    #[test]
    fn test_dropped_arrival_aborts_the_rendezvous() {
        let rendezvous = Rendezvous::new(2);
        drop(Arrival::new(&rendezvous));
        assert!(!Arrival::new(&rendezvous).arrive(true));
    }

    #[test]
    fn test_local_process_counters() {
        let process = LocalFlowProcess::new();
        process.increment_counter("a", 2);
        process.increment_counter("a", 3);
        process.keep_alive();
        process.set_status("busy");
        assert_eq!(process.counter("a"), 5);
        assert_eq!(process.counter("missing"), 0);
        assert_eq!(process.keep_alives(), 1);
        assert_eq!(process.status(), "busy");
    }

    #[test]
    fn test_properties_from_config() {
        let config = FlowConfig::default().with_property("region", "eu");
        let process = LocalFlowRunner::new(config).process();
        assert_eq!(process.property("region").as_deref(), Some("eu"));
        assert_eq!(process.property("zone"), None);
    }

    #[test]
    fn test_word_count_runs() {
        let store = MemoryStore::new();
        store.insert("in", vec![tuple!["b"], tuple!["a"], tuple!["b"]]);
        let flow = word_count(&store);

        let stats = LocalFlowRunner::default().run(&flow).unwrap();
        assert_eq!(store.read("out"), Some(vec![tuple!["a", 1], tuple!["b", 2]]));
        assert_eq!(stats.tuples_read(), 3);
        assert_eq!(stats.tuples_written(), 2);
        assert_eq!(stats.counter(counters::GROUPS), 2);
        assert!(!stats.skipped);
    }

    #[test]
    fn test_parallel_partitions_match_sequential() {
        let store = MemoryStore::new();
        let words: Vec<Tuple> = (0..200).map(|i| tuple![format!("w{}", i % 7)]).collect();
        store.insert("in", words);
        let flow = word_count(&store);

        let mut config = FlowConfig::default();
        config.map_partitions = 4;
        LocalFlowRunner::new(config).run(&flow).unwrap();
        let out = store.read("out").unwrap();
        assert_eq!(out.len(), 7);
        let total: i64 = out.iter().filter_map(|t| t.get(1).and_then(|v| v.as_i64())).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn test_keep_mode_refuses_existing_sink() {
        let store = MemoryStore::new();
        store.insert("in", vec![tuple!["a"]]);
        store.insert("out", vec![tuple!["old"]]);
        let flow = word_count(&store);

        let err = LocalFlowRunner::default().run(&flow).unwrap_err();
        assert!(matches!(err, FlowError::SinkExists(ref id) if id == "out"));
        assert_eq!(store.read("out"), Some(vec![tuple!["old"]]));
    }

    #[test]
    fn test_replace_and_append_modes() {
        let store = MemoryStore::new();
        store.insert("in", vec![tuple![1], tuple![None::<i64>]]);
        store.insert("replaced", vec![tuple!["old"]]);
        store.insert("appended", vec![tuple!["old"]]);

        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let kept = assembly.each_filter(head, Fields::all(), FilterNull);
        let left = assembly.branch(kept, "left");
        assembly.each_function(left, Fields::all(), Identity::new(), Fields::results());
        let right = assembly.branch(kept, "right");
        assembly.each_function(right, Fields::all(), Identity::new(), Fields::results());

        let replaced: TapRef =
            Arc::new(MemoryTap::new(&store, "replaced", Scheme::default()).with_sink_mode(SinkMode::Replace));
        let appended: TapRef =
            Arc::new(MemoryTap::new(&store, "appended", Scheme::default()).with_sink_mode(SinkMode::Append));
        let def = FlowDef::new(assembly)
            .source("in", store.tap("in", Scheme::new(Fields::from("n"))))
            .sink("left", replaced)
            .sink("right", appended);
        let flow = FlowConnector::new(FlowConfig::default()).unwrap().connect(def).unwrap();

        LocalFlowRunner::default().run(&flow).unwrap();
        assert_eq!(store.read("replaced"), Some(vec![tuple![1]]));
        assert_eq!(store.read("appended"), Some(vec![tuple!["old"], tuple![1]]));
    }

    #[test]
    fn test_intermediates_removed_unless_kept() {
        let store = MemoryStore::new();
        store.insert("in", vec![tuple!["a"], tuple!["a"]]);

        let mut assembly = PipeAssembly::new();
        let head = assembly.head("in");
        let first = assembly.group_by(GroupBy::new(head, "word"));
        let counted = assembly.every_aggregator(first, Fields::all(), Count::as_field("count"), Fields::all());
        let second = assembly.group_by(GroupBy::new(counted, "count").named("by_count"));
        assembly.every_aggregator(second, Fields::all(), Count::as_field("words"), Fields::all());
        let def = || {
            FlowDef::new(assembly.clone())
                .source("in", store.tap("in", Scheme::new(Fields::from("word"))))
                .sink("by_count", store.tap("out", Scheme::default()))
        };

        let connector = FlowConnector::new(FlowConfig::default())
            .unwrap()
            .with_temporary_factory(Arc::new(store.clone()));
        let flow = connector.connect(def()).unwrap();
        assert_eq!(flow.stages().len(), 2);
        LocalFlowRunner::default().run(&flow).unwrap();
        assert_eq!(store.read("out"), Some(vec![tuple![2, 1]]));
        assert!(flow.intermediates().iter().all(|tap| !store.contains(tap.identifier())));

        store.remove("out");
        let mut config = FlowConfig::default();
        config.keep_intermediates = true;
        LocalFlowRunner::new(config).run(&flow).unwrap();
        assert!(flow.intermediates().iter().all(|tap| store.contains(tap.identifier())));
    }
}
