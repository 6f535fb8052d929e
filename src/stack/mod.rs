//! Streaming stack interpreter.
//!
//! Executes one side of a [`Stage`] record by record. The planner already
//! resolved every selector, so pushing a tuple through the stack never looks
//! a field up by name.
//!
//! # Architecture
//!
//! ```text
//!  MapperStack                             ReducerStack
//!  ───────────                             ────────────
//!  Source ─► Each ─► Each ─► Sink          Group ─► JoinIterator ─► Every ─► Every ─► Each ─► Sink
//!                     └────► GroupingCollector          │
//!                                                       └─► (members) Each ─► Sink
//! ```
//!
//! Both stacks share a [`Chain`]: an arena of slots in topological order,
//! each holding its operation, its own [`OperationCall`] and the slots it
//! feeds. A stack is built per stage and per partition, so operation state
//! is never shared between threads.
//!
//! # Lifecycle
//!
//! 1. `prepare()`: open sink collectors and prepare operations in
//!    topological order.
//! 2. `operate(..)` / `operate_group(..)` for every record or group.
//! 3. `finish(result)`: close sinks on success, then clean up prepared
//!    operations in reverse order and close traps on every path.
//!
//! # Failures
//!
//! Record-level failures ([`FailureKind::Operation`]) go to the trap bound
//! to the failing branch and processing continues; without a trap they
//! abort the stage. Resource exhaustion and internal failures always abort.

pub mod error;
pub mod group;

pub use error::{ExecutionError, FailureKind, RESOURCE_EXHAUSTION_HINT};
pub use group::{Group, GroupState, GroupedTuple, GroupingCollector, JoinIterator};

use crate::flow::{Flow, Stage};
use crate::id::ElementId;
use crate::operation::{EachOperation, EveryOperation, OperationCall, OutputCollector};
use crate::pipe::CallSite;
use crate::planner::graph::{ElementKind, GroupingResolution, Resolution};
use crate::process::{counters, FlowProcess};
use crate::tap::{TapRef, TupleCollector};
use crate::tuple::{EachResolution, EveryResolution, Selector, Tuple, TupleEntry};
use error::guarded;
use std::collections::{BTreeMap, HashMap};

/// Calls `keep_alive` every `interval` ticks.
struct Heartbeat {
    interval: u64,
    ticks: u64,
}

impl Heartbeat {
    fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            ticks: 0,
        }
    }

    fn tick(&mut self, process: &dyn FlowProcess) {
        self.ticks += 1;
        if self.ticks % self.interval == 0 {
            tracing::trace!("keep alive after {} ticks", self.ticks);
            process.keep_alive();
        }
    }
}

enum Node {
    /// Sources, intermediates read by the stage, merges.
    Pass,
    Each {
        operation: EachOperation,
        resolution: EachResolution,
        call: OperationCall,
    },
    /// Map-side end of a grouping.
    Group { resolution: GroupingResolution },
    /// A tap written by the stage.
    Sink {
        tap: TapRef,
        selector: Selector,
        collector: Option<Box<dyn TupleCollector>>,
    },
}

struct Slot {
    id: ElementId,
    name: String,
    trace: CallSite,
    node: Node,
    /// `(slot, ordinal)` pairs fed by this slot.
    next: Vec<(usize, usize)>,
    prepared: bool,
}

struct Trap {
    tap: TapRef,
    collector: Option<Box<dyn TupleCollector>>,
}

/// Slots shared by both stack kinds.
pub(crate) struct Chain<'a> {
    process: &'a dyn FlowProcess,
    slots: Vec<Slot>,
    lookup: HashMap<ElementId, usize>,
    traps: BTreeMap<String, Trap>,
    heartbeat: Heartbeat,
    grouping: Option<Box<dyn GroupingCollector + 'a>>,
}

impl<'a> Chain<'a> {
    /// Build slots for `members` and link them with the stage edges
    /// between members.
    fn build(
        flow: &Flow,
        stage: &Stage,
        members: &[ElementId],
        process: &'a dyn FlowProcess,
        keep_alive_interval: u64,
    ) -> Result<Self, ExecutionError> {
        let graph = flow.graph();
        let order = graph
            .topological_order()
            .map_err(|e| ExecutionError::internal(stage.name(), e.to_string()))?;

        let mut slots = Vec::with_capacity(members.len());
        let mut lookup = HashMap::new();
        for id in order.into_iter().filter(|id| members.contains(id)) {
            let element = graph
                .element(id)
                .ok_or_else(|| ExecutionError::internal(stage.name(), format!("missing element {}", id)))?;
            let writes = stage.sinks().contains(&id);
            let node = match (&element.kind, &element.resolution) {
                (ElementKind::Sink { tap }, Resolution::Sink { selector }) => Node::Sink {
                    tap: tap.clone(),
                    selector: selector.clone(),
                    collector: None,
                },
                (ElementKind::Intermediate { tap }, _) if writes => Node::Sink {
                    tap: tap.clone(),
                    selector: Selector::All,
                    collector: None,
                },
                (ElementKind::Source { .. } | ElementKind::Intermediate { .. } | ElementKind::Merge, _) => {
                    Node::Pass
                }
                (ElementKind::Each { operation, .. }, Resolution::Each(resolution)) => Node::Each {
                    operation: operation.clone(),
                    resolution: resolution.clone(),
                    call: OperationCall::new(),
                },
                (kind, Resolution::Grouping(resolution)) if kind.is_grouping() => Node::Group {
                    resolution: resolution.clone(),
                },
                _ => {
                    return Err(ExecutionError::internal(
                        &element.name,
                        format!("{} cannot run in this stack", element),
                    ))
                }
            };
            lookup.insert(id, slots.len());
            slots.push(Slot {
                id,
                name: element.name.clone(),
                trace: element.trace,
                node,
                next: Vec::new(),
                prepared: false,
            });
        }

        for edge in stage.edges() {
            if let (Some(&from), Some(&to)) = (lookup.get(&edge.from), lookup.get(&edge.to)) {
                slots[from].next.push((to, edge.ordinal));
            }
        }

        let traps = stage
            .traps()
            .iter()
            .map(|(branch, tap)| {
                (
                    branch.clone(),
                    Trap {
                        tap: tap.clone(),
                        collector: None,
                    },
                )
            })
            .collect();

        Ok(Self {
            process,
            slots,
            lookup,
            traps,
            heartbeat: Heartbeat::new(keep_alive_interval),
            grouping: None,
        })
    }

    fn prepare(&mut self) -> Result<(), ExecutionError> {
        let process = self.process;
        for slot in &mut self.slots {
            match &mut slot.node {
                Node::Each { operation, call, .. } => {
                    guarded(&slot.name, slot.trace, &Tuple::new(), || operation.prepare(process, call))?;
                }
                Node::Sink { tap, collector, .. } => {
                    *collector = Some(
                        process
                            .open_tap_for_write(tap)
                            .map_err(|e| ExecutionError::tap(tap.identifier(), e))?,
                    );
                }
                Node::Pass | Node::Group { .. } => {}
            }
            slot.prepared = true;
        }
        Ok(())
    }

    /// Clean up prepared slots in reverse order. Every slot is attempted;
    /// the first failure is returned.
    fn cleanup(&mut self) -> Result<(), ExecutionError> {
        let process = self.process;
        let mut first = None;
        for slot in self.slots.iter_mut().rev().filter(|s| s.prepared) {
            slot.prepared = false;
            if let Node::Each { operation, call, .. } = &mut slot.node {
                if let Err(e) = guarded(&slot.name, slot.trace, &Tuple::new(), || operation.cleanup(process, call)) {
                    tracing::warn!("Cleanup failed for '{}': {}", slot.name, e);
                    first.get_or_insert(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn close_sinks(&mut self) -> Result<(), ExecutionError> {
        for slot in &mut self.slots {
            if let Node::Sink { tap, collector, .. } = &mut slot.node {
                if let Some(mut collector) = collector.take() {
                    collector
                        .close()
                        .map_err(|e| ExecutionError::tap(tap.identifier(), e))?;
                }
            }
        }
        Ok(())
    }

    fn close_traps(&mut self) -> Result<(), ExecutionError> {
        let mut first = None;
        for trap in self.traps.values_mut() {
            if let Some(mut collector) = trap.collector.take() {
                if let Err(e) = collector.close() {
                    tracing::warn!("Closing trap {} failed: {}", trap.tap.identifier(), e);
                    first.get_or_insert(ExecutionError::tap(trap.tap.identifier(), e));
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Tear down after the last record. Sinks are only committed when
    /// `outcome` is a success; cleanup and trap closing always run.
    fn finish(&mut self, outcome: Result<(), ExecutionError>) -> Result<(), ExecutionError> {
        let outcome = outcome.and_then(|()| self.close_sinks());
        let cleaned = self.cleanup();
        let trapped = self.close_traps();
        outcome.and(cleaned).and(trapped)
    }

    /// Route a failed record to the trap for `branch`, or give the error
    /// back when it cannot be trapped.
    fn trap(&mut self, branch: &str, error: ExecutionError, record: Tuple) -> Result<(), ExecutionError> {
        if !error.is_trappable() {
            return Err(error);
        }
        let process = self.process;
        let Some(trap) = self.traps.get_mut(branch) else {
            return Err(error);
        };
        tracing::warn!("Trapping record in '{}' to {}: {}", branch, trap.tap.identifier(), error);
        if trap.collector.is_none() {
            trap.collector = Some(
                process
                    .open_tap_for_write(&trap.tap)
                    .map_err(|e| ExecutionError::tap(trap.tap.identifier(), e))?,
            );
        }
        if let Some(collector) = trap.collector.as_mut() {
            collector
                .collect(record)
                .map_err(|e| ExecutionError::tap(trap.tap.identifier(), e))?;
        }
        process.increment_counter(counters::TUPLES_TRAPPED, 1);
        Ok(())
    }

    /// Run an `Each` slot. On failure returns the error and the record to
    /// trap.
    fn operate_each(&mut self, index: usize, tuple: &Tuple) -> Result<Vec<Tuple>, (ExecutionError, Tuple)> {
        let process = self.process;
        let slot = &mut self.slots[index];
        let (name, trace) = (slot.name.as_str(), slot.trace);
        let Node::Each {
            operation,
            resolution,
            call,
        } = &mut slot.node
        else {
            return Ok(vec![tuple.clone()]);
        };

        let Some(arguments) = resolution.arguments.apply(tuple) else {
            let error = arity_error(name, trace, resolution.argument_fields.size(), tuple);
            return Err((error, tuple.clone()));
        };
        let entry = TupleEntry::new(&resolution.argument_fields, &arguments);

        match operation {
            EachOperation::Filter(filter) => {
                let removed = guarded(name, trace, &arguments, || filter.is_remove(process, call, entry))
                    .map_err(|e| (e, arguments.clone()))?;
                Ok(if removed { Vec::new() } else { vec![tuple.clone()] })
            }
            EachOperation::Function(function) => {
                let mut output = OutputCollector::new();
                guarded(name, trace, &arguments, || function.operate(process, call, entry, &mut output))
                    .map_err(|e| (e, arguments.clone()))?;

                let mut results = Vec::with_capacity(output.len());
                for result in output.drain() {
                    if let Some(expected) = resolution.declared.arity() {
                        if result.size() != expected {
                            return Err((arity_error(name, trace, expected, &result), arguments.clone()));
                        }
                    }
                    match resolution.output.apply(tuple, &result) {
                        Some(out) => results.push(out),
                        None => {
                            let error = arity_error(name, trace, resolution.declared.size(), &result);
                            return Err((error, arguments.clone()));
                        }
                    }
                }
                Ok(results)
            }
        }
    }

    /// Key a tuple arriving at the grouping and hand it to the collector.
    fn emit_grouped(&mut self, index: usize, ordinal: usize, tuple: Tuple) -> Result<(), ExecutionError> {
        let slot = &self.slots[index];
        let Node::Group { resolution } = &slot.node else {
            return Err(ExecutionError::internal(&slot.name, "not a grouping"));
        };
        let key = resolution.key_selectors.get(ordinal).and_then(|s| s.apply(&tuple));
        let sort = match resolution.sort_selectors.get(ordinal) {
            Some(Some(selector)) => selector.apply(&tuple).map(Some),
            _ => Some(None),
        };
        let (Some(key), Some(sort)) = (key, sort) else {
            let error = arity_error(&slot.name, slot.trace, resolution.key_fields.size(), &tuple);
            let branch = slot.name.clone();
            return self.trap(&branch, error, tuple);
        };
        let Some(collector) = self.grouping.as_mut() else {
            return Err(ExecutionError::internal(&slot.name, "no grouping collector"));
        };
        collector.collect(GroupedTuple {
            ordinal,
            key,
            sort,
            value: tuple,
        })
    }

    fn write(&mut self, index: usize, tuple: Tuple) -> Result<(), ExecutionError> {
        let process = self.process;
        let slot = &mut self.slots[index];
        let Node::Sink {
            tap,
            selector,
            collector,
        } = &mut slot.node
        else {
            return Err(ExecutionError::internal(&slot.name, "not a sink"));
        };
        let Some(selected) = selector.apply(&tuple) else {
            let error = arity_error(&slot.name, slot.trace, selector.len(tuple.size()), &tuple);
            let branch = slot.name.clone();
            return self.trap(&branch, error, tuple);
        };
        let Some(collector) = collector.as_mut() else {
            return Err(ExecutionError::internal(tap.identifier(), "sink written before prepare"));
        };
        collector
            .collect(selected)
            .map_err(|e| ExecutionError::tap(tap.identifier(), e))?;
        process.increment_counter(counters::TUPLES_WRITTEN, 1);
        self.heartbeat.tick(process);
        Ok(())
    }

    /// Push `tuple` into slot `index` arriving on input `ordinal`.
    fn push(&mut self, index: usize, ordinal: usize, tuple: Tuple) -> Result<(), ExecutionError> {
        let outputs = match self.slots[index].node {
            Node::Pass => vec![tuple],
            Node::Each { .. } => match self.operate_each(index, &tuple) {
                Ok(outputs) => outputs,
                Err((error, record)) => {
                    let branch = self.slots[index].name.clone();
                    return self.trap(&branch, error, record);
                }
            },
            Node::Group { .. } => return self.emit_grouped(index, ordinal, tuple),
            Node::Sink { .. } => return self.write(index, tuple),
        };

        for position in 0..self.slots[index].next.len() {
            let (next, next_ordinal) = self.slots[index].next[position];
            for out in &outputs {
                self.push(next, next_ordinal, out.clone())?;
            }
        }
        Ok(())
    }
}

fn arity_error(element: &str, trace: CallSite, expected: usize, tuple: &Tuple) -> ExecutionError {
    ExecutionError::TupleArity {
        element: element.to_string(),
        trace,
        expected,
        actual: tuple.size(),
        tuple: tuple.clone(),
    }
}

/// Runs the map side of a stage for one partition.
pub struct MapperStack<'a> {
    chain: Chain<'a>,
}

impl<'a> MapperStack<'a> {
    pub fn new(
        flow: &Flow,
        stage: &Stage,
        process: &'a dyn FlowProcess,
        keep_alive_interval: u64,
    ) -> Result<Self, ExecutionError> {
        let mut members: Vec<ElementId> = stage
            .sources()
            .iter()
            .chain(stage.mapper())
            .chain(stage.grouping().iter())
            .copied()
            .collect();
        if stage.is_map_only() {
            members.extend_from_slice(stage.sinks());
        }
        let chain = Chain::build(flow, stage, &members, process, keep_alive_interval)?;
        Ok(Self { chain })
    }

    /// Where tuples reaching the grouping go.
    pub fn with_grouping_collector(mut self, collector: impl GroupingCollector + 'a) -> Self {
        self.chain.grouping = Some(Box::new(collector));
        self
    }

    pub fn prepare(&mut self) -> Result<(), ExecutionError> {
        self.chain.prepare()
    }

    /// Push one record read from `source` through the map side.
    pub fn operate(&mut self, source: ElementId, tuple: Tuple) -> Result<(), ExecutionError> {
        let process = self.chain.process;
        process.increment_counter(counters::TUPLES_READ, 1);
        self.chain.heartbeat.tick(process);
        let index = *self
            .chain
            .lookup
            .get(&source)
            .ok_or_else(|| ExecutionError::internal(&source.to_string(), "not a source of this stage"))?;
        self.chain.push(index, 0, tuple)
    }

    pub fn finish(&mut self, outcome: Result<(), ExecutionError>) -> Result<(), ExecutionError> {
        self.chain.finish(outcome)
    }

    /// Hand back the grouping collector, once the stack is finished.
    pub fn take_grouping_collector(&mut self) -> Option<Box<dyn GroupingCollector + 'a>> {
        self.chain.grouping.take()
    }
}

struct EverySlot {
    name: String,
    trace: CallSite,
    operation: EveryOperation,
    resolution: EveryResolution,
    call: OperationCall,
    prepared: bool,
}

/// Runs the reduce side of a stage: one call per group.
pub struct ReducerStack<'a> {
    chain: Chain<'a>,
    name: String,
    resolution: GroupingResolution,
    buckets: usize,
    everies: Vec<EverySlot>,
    /// Slots fed with every joined member tuple.
    member_next: Vec<(usize, usize)>,
    /// Slots fed with the output of the aggregation chain.
    tail_next: Vec<(usize, usize)>,
    state: GroupState,
}

impl<'a> ReducerStack<'a> {
    pub fn new(
        flow: &Flow,
        stage: &Stage,
        process: &'a dyn FlowProcess,
        keep_alive_interval: u64,
    ) -> Result<Self, ExecutionError> {
        let graph = flow.graph();
        let grouping = stage
            .grouping()
            .and_then(|id| graph.element(id))
            .ok_or_else(|| ExecutionError::internal(stage.name(), "stage has no grouping"))?;
        let Resolution::Grouping(resolution) = &grouping.resolution else {
            return Err(ExecutionError::internal(&grouping.name, "grouping is not resolved"));
        };

        // Walk the linear aggregation chain hanging off the grouping.
        let mut everies = Vec::new();
        let mut cursor = grouping.id;
        let mut chain_ids = Vec::new();
        while let Some(edge) = stage
            .edges()
            .iter()
            .find(|e| e.from == cursor && graph.element(e.to).is_some_and(|t| t.kind.is_every()))
        {
            let Some(element) = graph.element(edge.to) else { break };
            let (ElementKind::Every { operation, .. }, Resolution::Every(every)) = (&element.kind, &element.resolution)
            else {
                return Err(ExecutionError::internal(&element.name, "aggregation is not resolved"));
            };
            everies.push(EverySlot {
                name: element.name.clone(),
                trace: element.trace,
                operation: operation.clone(),
                resolution: every.clone(),
                call: OperationCall::new(),
                prepared: false,
            });
            chain_ids.push(element.id);
            cursor = element.id;
        }

        let members: Vec<ElementId> = stage
            .reducer()
            .iter()
            .chain(stage.sinks())
            .copied()
            .filter(|id| !chain_ids.contains(id))
            .collect();
        let chain = Chain::build(flow, stage, &members, process, keep_alive_interval)?;

        let targets = |from: ElementId| -> Vec<(usize, usize)> {
            stage
                .edges()
                .iter()
                .filter(|e| e.from == from)
                .filter_map(|e| chain.lookup.get(&e.to).map(|&slot| (slot, e.ordinal)))
                .collect()
        };
        let member_next = targets(grouping.id);
        let tail_next = chain_ids.last().map(|&tail| targets(tail)).unwrap_or_default();
        let buckets = match &grouping.kind {
            ElementKind::CoGroup { group_fields, .. } => group_fields.len(),
            _ => 1,
        };

        Ok(Self {
            name: grouping.name.clone(),
            resolution: resolution.clone(),
            buckets,
            everies,
            member_next,
            tail_next,
            chain,
            state: GroupState::Idle,
        })
    }

    /// Buckets a [`Group`] must carry: one per input for `CoGroup`, one
    /// for `GroupBy`.
    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    pub fn resolution(&self) -> &GroupingResolution {
        &self.resolution
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn prepare(&mut self) -> Result<(), ExecutionError> {
        let process = self.chain.process;
        for every in &mut self.everies {
            let EverySlot {
                name,
                trace,
                operation,
                call,
                prepared,
                ..
            } = every;
            guarded(name, *trace, &Tuple::new(), || operation.prepare(process, call))?;
            *prepared = true;
        }
        self.chain.prepare()
    }

    /// Process one group: start, members, complete.
    pub fn operate_group(&mut self, group: Group) -> Result<(), ExecutionError> {
        let process = self.chain.process;
        process.increment_counter(counters::GROUPS, 1);
        self.chain.heartbeat.tick(process);

        let Self {
            chain,
            name,
            resolution,
            everies,
            member_next,
            tail_next,
            state,
            ..
        } = self;
        let key = group.key;
        let key_entry = TupleEntry::new(&resolution.key_fields, &key);

        *state = state.advance(GroupState::Started, name)?;
        for every in everies.iter_mut() {
            let EverySlot {
                name: branch,
                trace,
                operation,
                call,
                ..
            } = every;
            let started = guarded(branch, *trace, &key, || match operation {
                EveryOperation::Aggregator(aggregator) => aggregator.start(process, call, key_entry),
                EveryOperation::Buffer(buffer) => buffer.start(process, call, key_entry),
            });
            if let Err(error) = started {
                let branch = branch.clone();
                chain.trap(&branch, error, key.clone())?;
                *state = GroupState::Idle;
                return Ok(());
            }
        }

        for values in JoinIterator::new(&group.members, &resolution.joiner, &resolution.input_arities) {
            *state = state.advance(GroupState::Accumulating, name)?;
            for &(slot, ordinal) in member_next.iter() {
                chain.push(slot, ordinal, values.clone())?;
            }
            for every in everies.iter_mut() {
                let EverySlot {
                    name: branch,
                    trace,
                    operation,
                    resolution: every_resolution,
                    call,
                    ..
                } = every;
                let Some(arguments) = every_resolution.arguments.apply(&values) else {
                    let error = ExecutionError::TupleArity {
                        element: branch.clone(),
                        trace: *trace,
                        expected: every_resolution.argument_fields.size(),
                        actual: values.size(),
                        tuple: values.clone(),
                    };
                    let branch = branch.clone();
                    chain.trap(&branch, error, values.clone())?;
                    break;
                };
                let entry = TupleEntry::new(&every_resolution.argument_fields, &arguments);
                let mut output = OutputCollector::new();
                let outcome = guarded(branch, *trace, &arguments, || match operation {
                    EveryOperation::Aggregator(aggregator) => aggregator.aggregate(process, call, entry),
                    EveryOperation::Buffer(buffer) => buffer.operate(process, call, key_entry, entry, &mut output),
                });
                if let Err(error) = outcome {
                    let branch = branch.clone();
                    chain.trap(&branch, error, arguments)?;
                    break;
                }
                if !output.is_empty() {
                    let results: Vec<Tuple> = output.drain().collect();
                    match combine(branch, *trace, every_resolution, std::slice::from_ref(&key), results) {
                        Ok(rows) => emit(chain, tail_next, rows)?,
                        Err((error, record)) => {
                            let branch = branch.clone();
                            chain.trap(&branch, error, record)?;
                        }
                    }
                }
            }
        }

        *state = state.advance(GroupState::Completed, name)?;
        let mut current = vec![key.clone()];
        for every in everies.iter_mut() {
            let EverySlot {
                name: branch,
                trace,
                operation,
                resolution: every_resolution,
                call,
                ..
            } = every;
            let mut output = OutputCollector::new();
            let completed = guarded(branch, *trace, &key, || match operation {
                EveryOperation::Aggregator(aggregator) => aggregator.complete(process, call, key_entry, &mut output),
                EveryOperation::Buffer(buffer) => buffer.complete(process, call, key_entry, &mut output),
            });
            if let Err(error) = completed {
                let branch = branch.clone();
                chain.trap(&branch, error, key.clone())?;
                *state = GroupState::Idle;
                return Ok(());
            }
            let results: Vec<Tuple> = output.drain().collect();
            match combine(branch, *trace, every_resolution, &current, results) {
                Ok(rows) => current = rows,
                Err((error, record)) => {
                    let branch = branch.clone();
                    chain.trap(&branch, error, record)?;
                    *state = GroupState::Idle;
                    return Ok(());
                }
            }
            if operation.is_buffer() {
                // Buffers stream their output; nothing is left to combine.
                emit(chain, tail_next, std::mem::take(&mut current))?;
            }
        }
        if everies.iter().any(|e| !e.operation.is_buffer()) {
            emit(chain, tail_next, current)?;
        }

        *state = state.advance(GroupState::Idle, name)?;
        Ok(())
    }

    pub fn finish(&mut self, outcome: Result<(), ExecutionError>) -> Result<(), ExecutionError> {
        let process = self.chain.process;
        let outcome = outcome.and_then(|()| self.chain.close_sinks());
        let cleaned = self.chain.cleanup();
        let mut first = None;
        for every in self.everies.iter_mut().rev().filter(|e| e.prepared) {
            every.prepared = false;
            let EverySlot {
                name,
                trace,
                operation,
                call,
                ..
            } = every;
            if let Err(e) = guarded(name, *trace, &Tuple::new(), || operation.cleanup(process, call)) {
                tracing::warn!("Cleanup failed for '{}': {}", name, e);
                first.get_or_insert(e);
            }
        }
        let trapped = self.chain.close_traps();
        self.state = GroupState::Idle;
        outcome.and(cleaned).and(first.map_or(Ok(()), Err)).and(trapped)
    }
}

/// Combine aggregation results with the tuples they follow.
fn combine(
    branch: &str,
    trace: CallSite,
    resolution: &EveryResolution,
    previous: &[Tuple],
    results: Vec<Tuple>,
) -> Result<Vec<Tuple>, (ExecutionError, Tuple)> {
    let mut rows = Vec::with_capacity(previous.len() * results.len());
    for result in &results {
        if let Some(expected) = resolution.declared.arity() {
            if result.size() != expected {
                return Err((arity_error(branch, trace, expected, result), result.clone()));
            }
        }
        for prev in previous {
            let row = resolution
                .output
                .apply(prev, result)
                .ok_or_else(|| (arity_error(branch, trace, resolution.declared.size(), result), result.clone()))?;
            rows.push(row);
        }
    }
    Ok(rows)
}

fn emit(chain: &mut Chain<'_>, targets: &[(usize, usize)], rows: Vec<Tuple>) -> Result<(), ExecutionError> {
    for row in rows {
        for &(slot, ordinal) in targets {
            chain.push(slot, ordinal, row.clone())?;
        }
    }
    Ok(())
}
