//! # pipeflow: dataflow planning and streaming execution
//!
//! Build a logical pipe assembly, bind its heads and tails to taps, and let
//! the planner cut it into stages that a streaming stack interpreter runs
//! record by record.
//!
//! ## Architecture
//!
//! - **Pipe assembly** ([`pipe`]): `Each`, `Every`, `GroupBy`, `CoGroup` and
//!   `Merge` nodes built with `#[track_caller]` so errors point back at the
//!   assembly code.
//! - **Planner** ([`planner`]): validates the assembly, resolves field
//!   scopes once, inserts intermediate taps where work must not be
//!   repeated, and schedules one stage per grouping.
//! - **Stack** ([`stack`]): executes one side of a stage with the
//!   prepare/operate/cleanup lifecycle, traps and heartbeats.
//! - **Runner** ([`runner`]): local threads and an in-memory shuffle.
//! - **Cascade** ([`cascade`]): orders several flows by the taps they share.
//!
//! ## Example
//!
//! ```ignore
//! use pipeflow::{
//!     operation::Count,
//!     pipe::{GroupBy, PipeAssembly},
//!     tap::{MemoryStore, Scheme},
//!     tuple::Fields,
//!     FlowConfig, FlowConnector, FlowDef, LocalFlowRunner,
//! };
//!
//! let store = MemoryStore::new();
//! let mut assembly = PipeAssembly::new();
//! let words = assembly.head("words");
//! let group = assembly.group_by(GroupBy::new(words, "word"));
//! assembly.every_aggregator(group, Fields::all(), Count::new(), Fields::all());
//!
//! let def = FlowDef::new(assembly)
//!     .source("words", store.tap("in", Scheme::new(Fields::from("word"))))
//!     .sink("words", store.tap("out", Scheme::default()));
//! let flow = FlowConnector::new(FlowConfig::default())?.connect(def)?;
//! let stats = LocalFlowRunner::default().run(&flow)?;
//! ```

pub mod cascade;
pub mod config;
pub mod error;
pub mod flow;
pub mod id;
pub mod operation;
pub mod pipe;
pub mod planner;
pub mod process;
pub mod runner;
pub mod stack;
pub mod tap;
pub mod tuple;

// Re-export commonly used types
pub use cascade::{Cascade, CascadeConnector, CascadeError};
pub use config::FlowConfig;
pub use error::{Error, Result, ResultExt};
pub use flow::{Flow, Stage};
pub use pipe::PipeAssembly;
pub use planner::{FlowConnector, FlowDef, PlannerError};
pub use process::FlowProcess;
pub use runner::{FlowError, FlowStats, LocalFlowProcess, LocalFlowRunner};
pub use stack::{ExecutionError, MapperStack, ReducerStack};
pub use tuple::{Fields, Tuple, Value};
