//! Integration tests for planning
//!
//! These tests plan whole assemblies through the public connector:
//! - Stage counts and element distances
//! - Structural and binding errors reported before execution
//! - Split materialization
//! - Deterministic output

mod common;

use common::builders::{count_by, FlowBuilder};
use pipeflow::operation::{Count, FirstN, Function, Identity, Operation, OperationCall, OperationResult, OutputCollector};
use pipeflow::pipe::{CoGroup, GroupBy, PipeAssembly};
use pipeflow::planner::{StructuralViolation, TapRole};
use pipeflow::tap::{MemoryStore, Scheme, SinkMode};
use pipeflow::tuple::{Fields, TupleEntry};
use pipeflow::{FlowProcess, PlannerError};

/// Identity that must not run twice per record.
struct Unsafe;

impl Operation for Unsafe {
    fn field_declaration(&self) -> Fields {
        Fields::args()
    }

    fn is_safe(&self) -> bool {
        false
    }
}

impl Function for Unsafe {
    fn operate(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        output.add(arguments.tuple().clone());
        Ok(())
    }
}

fn fork_into_two_groupings(safe: bool) -> PipeAssembly {
    let mut assembly = PipeAssembly::new();
    let head = assembly.head("in");
    let each = if safe {
        assembly.each_function(head, Fields::all(), Identity::new(), Fields::results())
    } else {
        assembly.each_function(head, Fields::all(), Unsafe, Fields::results())
    };
    let left = assembly.group_by(GroupBy::new(each, "first").named("left"));
    assembly.every_aggregator(left, Fields::all(), Count::new(), Fields::all());
    let right = assembly.group_by(GroupBy::new(each, "second").named("right"));
    assembly.every_aggregator(right, Fields::all(), Count::new(), Fields::all());
    assembly
}

fn plan_fork(safe: bool) -> pipeflow::Flow {
    let store = MemoryStore::new();
    FlowBuilder::new(&store)
        .named("fork")
        .source("in", "in", ["first", "second"])
        .sink("left", "left")
        .sink("right", "right")
        .connect(fork_into_two_groupings(safe))
        .unwrap()
}

#[test]
fn test_group_and_count_distances() {
    let store = MemoryStore::new();
    let sink_scheme = Scheme::default().with_sink_fields(Fields::positions(&[0, 1]));
    let flow = FlowBuilder::new(&store)
        .source("in", "in", ["first", "second"])
        .sink_with("in", "out", sink_scheme, SinkMode::Keep)
        .connect(count_by("in", "second"))
        .unwrap();

    assert_eq!(flow.stages().len(), 1);
    let stage = &flow.stages()[0];
    let source = stage.sources()[0];
    let group = stage.grouping().unwrap();
    let sink = stage.sinks()[0];
    assert_eq!(stage.distance(source, group), Some(0));
    assert_eq!(stage.distance(group, sink), Some(1));
}

#[test]
fn test_zero_groupings_plan_one_map_only_stage() {
    let mut assembly = PipeAssembly::new();
    let head = assembly.head("in");
    let each = assembly.each_function(head, Fields::all(), Identity::new(), Fields::results());
    assembly.each_function(each, Fields::all(), Identity::new(), Fields::results());

    let store = MemoryStore::new();
    let flow = FlowBuilder::new(&store)
        .source("in", "in", "line")
        .sink("in", "out")
        .connect(assembly)
        .unwrap();
    assert_eq!(flow.stages().len(), 1);
    assert!(flow.stages()[0].is_map_only());
    assert_eq!(flow.stats().map_only_stages, 1);
}

#[test]
fn test_one_grouping_plans_one_stage() {
    let store = MemoryStore::new();
    let flow = FlowBuilder::new(&store)
        .source("words", "in", "word")
        .sink("words", "out")
        .connect(count_by("words", "word"))
        .unwrap();
    assert_eq!(flow.stages().len(), 1);
    assert!(!flow.stages()[0].is_map_only());
    assert!(flow.intermediates().is_empty());
}

#[test]
fn test_safe_fork_is_not_materialized() {
    let flow = plan_fork(true);
    assert_eq!(flow.stats().intermediates, 0);
    assert_eq!(flow.stages().len(), 2);
    assert!(flow.stage_dependencies().is_empty());
}

#[test]
fn test_unsafe_fork_is_materialized_once() {
    let flow = plan_fork(false);
    assert_eq!(flow.stats().intermediates, 1);
    assert_eq!(flow.stages().len(), 3);
    assert!(flow.stages()[0].is_map_only());
    assert_eq!(flow.stage_dependencies().len(), 2);
}

#[test]
fn test_same_tap_under_two_names_is_ambiguous() {
    let store = MemoryStore::new();
    let shared = store.tap("shared", Scheme::new(Fields::from(["a", "b"])));

    let mut assembly = PipeAssembly::new();
    let first = assembly.head("first");
    let second = assembly.head("second");
    let third = assembly.head("third");
    let joined = assembly.co_group(
        CoGroup::join(first, "a", second, "a")
            .declared(["a1", "b1", "a2", "b2"])
            .named("joined"),
    );
    assembly.co_group(
        CoGroup::join(joined, "a1", third, "a")
            .declared(["a1", "b1", "a2", "b2", "a3", "b3"])
            .named("out"),
    );

    let err = FlowBuilder::new(&store)
        .source_tap("first", shared.clone())
        .source_tap("second", shared)
        .source("third", "third", ["a", "b"])
        .sink("out", "out")
        .connect(assembly)
        .unwrap_err();
    match err {
        PlannerError::DuplicateSource { tap, names, .. } => {
            assert_eq!(tap, "shared");
            assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
        }
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_shared_tap_across_chained_cogroups_plans() {
    // The shared tap feeds the first and the last join, which land in
    // different stages, so neither stage reads it under two names.
    let store = MemoryStore::new();
    let shared = store.tap("shared", Scheme::new(Fields::from(["a", "b"])));

    let mut assembly = PipeAssembly::new();
    let first = assembly.head("first");
    let second = assembly.head("second");
    let third = assembly.head("third");
    let joined = assembly.co_group(
        CoGroup::join(first, "a", second, "a")
            .declared(["a1", "b1", "a2", "b2"])
            .named("joined"),
    );
    assembly.co_group(
        CoGroup::join(joined, "a1", third, "a")
            .declared(["a1", "b1", "a2", "b2", "a3", "b3"])
            .named("out"),
    );

    let flow = FlowBuilder::new(&store)
        .source_tap("first", shared.clone())
        .source("second", "second", ["a", "b"])
        .source_tap("third", shared)
        .sink("out", "out")
        .connect(assembly)
        .unwrap();
    assert_eq!(flow.stages().len(), 2);
    for stage in flow.stages() {
        let reads_shared = stage
            .sources()
            .iter()
            .filter(|&&id| {
                flow.graph()
                    .element(id)
                    .and_then(|e| e.kind.tap())
                    .is_some_and(|tap| tap.identifier() == "shared")
            })
            .count();
        assert!(reads_shared <= 1);
    }
}

#[test]
fn test_source_bound_as_sink_rejected() {
    let store = MemoryStore::new();
    let mut assembly = PipeAssembly::new();
    let head = assembly.head("left");
    assembly.each_function(head, Fields::all(), Identity::new(), Fields::results());

    let err = FlowBuilder::new(&store)
        .source("left", "data", "word")
        .sink("left", "data")
        .connect(assembly)
        .unwrap_err();
    match err {
        PlannerError::SourceIsSink {
            tap,
            source_name,
            sink_name,
        } => {
            assert_eq!(tap, "data");
            assert_eq!(source_name, "left");
            assert_eq!(sink_name, "left");
        }
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_identity_fork_into_one_grouping_matches_unforked() {
    let store = MemoryStore::new();
    let mut assembly = PipeAssembly::new();
    let head = assembly.head("in");
    let lhs = assembly.branch(head, "lhs");
    let lhs = assembly.each_function(lhs, Fields::all(), Identity::new(), Fields::results());
    let rhs = assembly.branch(head, "rhs");
    let rhs = assembly.each_function(rhs, Fields::all(), Identity::new(), Fields::results());
    let group = assembly.group_by(GroupBy::merging(&[lhs, rhs], "first").named("out"));
    assembly.every_aggregator(group, Fields::all(), Count::new(), Fields::all());

    let forked = FlowBuilder::new(&store)
        .source("in", "in", ["first", "second"])
        .sink("out", "out")
        .connect(assembly)
        .unwrap();
    let unforked = FlowBuilder::new(&store)
        .source("in", "in", ["first", "second"])
        .sink("in", "out")
        .connect(count_by("in", "first"))
        .unwrap();

    assert_eq!(forked.stages().len(), 1);
    assert_eq!(forked.stages().len(), unforked.stages().len());
    assert_eq!(forked.stats().intermediates, 0);
    assert!(forked.intermediates().is_empty());
}

#[test]
fn test_buffer_and_count_on_one_grouping_rejected() {
    let mut assembly = PipeAssembly::new();
    let head = assembly.head("in");
    let group = assembly.group_by(GroupBy::new(head, "first"));
    let buffer = assembly.every_buffer(group, Fields::all(), FirstN::new(1), Fields::results());
    assembly.every_aggregator(buffer, Fields::all(), Count::new(), Fields::all());

    let store = MemoryStore::new();
    let err = FlowBuilder::new(&store)
        .source("in", "in", ["first", "second"])
        .sink("in", "out")
        .connect(assembly)
        .unwrap_err();
    assert_eq!(err.violation(), Some(&StructuralViolation::BufferWithOtherAggregators));
}

#[test]
fn test_aggregation_after_split_rejected() {
    let mut assembly = PipeAssembly::new();
    let head = assembly.head("in");
    let each = assembly.each_function(head, Fields::all(), Identity::new(), Fields::results());
    let left = assembly.branch(each, "left");
    assembly.branch(each, "right");
    assembly.every_aggregator(left, Fields::all(), Count::new(), Fields::all());

    let store = MemoryStore::new();
    let err = FlowBuilder::new(&store)
        .source("in", "in", "line")
        .sink("left", "left")
        .sink("right", "right")
        .connect(assembly)
        .unwrap_err();
    assert_eq!(err.violation(), Some(&StructuralViolation::SplitBeforeAggregation));
    assert_eq!(err.element(), Some("left"));
    assert!(err.to_string().contains("planner_integration.rs"));
}

#[test]
fn test_every_unbound_name_reported() {
    let mut assembly = PipeAssembly::new();
    let a = assembly.head("a");
    let b = assembly.head("b");
    assembly.branch(a, "left");
    assembly.branch(b, "right");

    let store = MemoryStore::new();
    let err = FlowBuilder::new(&store).connect(assembly).unwrap_err();
    match err {
        PlannerError::UnboundTap { role, names } => {
            assert_eq!(role, TapRole::Source);
            assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_unknown_group_field_names_the_grouping() {
    let mut assembly = PipeAssembly::new();
    let head = assembly.head("in");
    assembly.group_by(GroupBy::new(head, "missing").named("by_missing"));

    let store = MemoryStore::new();
    let err = FlowBuilder::new(&store)
        .source("in", "in", ["first", "second"])
        .sink("by_missing", "out")
        .connect(assembly)
        .unwrap_err();
    assert!(matches!(err, PlannerError::FieldResolution { .. }));
    assert_eq!(err.element(), Some("by_missing"));
}

#[test]
fn test_planning_is_deterministic() {
    let first = plan_fork(false);
    let second = plan_fork(false);

    assert_eq!(first.to_dot(), second.to_dot());
    let names = |flow: &pipeflow::Flow| flow.stages().iter().map(|s| s.name().to_string()).collect::<Vec<_>>();
    assert_eq!(names(&first), names(&second));
    assert_eq!(first.stage_dependencies(), second.stage_dependencies());
}

#[test]
fn test_description_serializes() {
    let flow = plan_fork(true);
    let json = flow.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["name"], "fork");
    assert_eq!(value["stages"].as_array().map(Vec::len), Some(2));
}
