//! pipeflow demo - word count
//!
//! Plans and runs a two-stage word count over a few in-memory lines:
//! count each word, then count how many words share each frequency.
//!
//! ```text
//! pipeflow [config.toml|config.json]
//! ```

use anyhow::Context;
use pipeflow::{
    operation::{Count, Function, Operation, OperationCall, OperationResult, OutputCollector},
    pipe::GroupBy,
    tap::{MemoryStore, Scheme},
    tuple,
    tuple::{Fields, TupleEntry},
    FlowConfig, FlowConnector, FlowDef, FlowProcess, LocalFlowRunner, PipeAssembly,
};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LINES: &[&str] = &[
    "the quick brown fox",
    "jumps over the lazy dog",
    "the dog sleeps",
];

/// Splits a line into one tuple per word.
struct SplitWords;

impl Operation for SplitWords {
    fn field_declaration(&self) -> Fields {
        Fields::from("word")
    }

    fn num_args(&self) -> Option<usize> {
        Some(1)
    }
}

impl Function for SplitWords {
    fn operate(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        let line = arguments.get_at(0).and_then(|v| v.as_str()).unwrap_or_default();
        for word in line.split_whitespace() {
            output.add(tuple![word.to_lowercase()]);
        }
        Ok(())
    }
}

fn init_logging(config: &FlowConfig) -> Option<WorkerGuard> {
    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pipeflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pipeflow=debug")))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => FlowConfig::load(&path).with_context(|| format!("Failed to load {}", path))?,
        None => FlowConfig::default(),
    };
    config.apply_env_overrides()?;
    let _guard = init_logging(&config);

    tracing::info!("Starting pipeflow word count demo");

    let store = MemoryStore::new();
    store.insert("lines", LINES.iter().map(|line| tuple![*line]).collect());

    let mut assembly = PipeAssembly::new();
    let lines = assembly.head("lines");
    let words = assembly.each_function(lines, Fields::from("line"), SplitWords, Fields::results());
    let by_word = assembly.group_by(GroupBy::new(words, "word").named("words"));
    let counted = assembly.every_aggregator(by_word, Fields::all(), Count::new(), Fields::all());
    let by_count = assembly.group_by(GroupBy::new(counted, "count").named("frequencies"));
    assembly.every_aggregator(by_count, Fields::all(), Count::as_field("words"), Fields::all());

    let def = FlowDef::new(assembly)
        .named("wordcount")
        .source("lines", store.tap("lines", Scheme::new(Fields::from("line"))))
        .sink("frequencies", store.tap("frequencies", Scheme::default()));

    let connector = FlowConnector::new(config.clone())?.with_temporary_factory(Arc::new(store.clone()));
    let flow = connector.connect(def).context("Failed to plan the word count")?;
    tracing::debug!("Plan:\n{}", flow.to_json()?);

    let stats = LocalFlowRunner::new(config).run(&flow)?;
    for row in store.read("frequencies").unwrap_or_default() {
        println!("{}", row);
    }
    tracing::info!(
        "Done: {} stages, {} records read, {} written",
        stats.stages,
        stats.tuples_read(),
        stats.tuples_written()
    );
    Ok(())
}
