//! Execution context handed to taps and operations.
//!
//! The execution substrate implements [`FlowProcess`]; the stack only ever
//! talks to it through this trait. [`LocalFlowProcess`](crate::runner::LocalFlowProcess)
//! is the in-process implementation.

use crate::tap::{TapRef, TapResult, TupleCollector, TupleIter};

/// Counter names maintained by the stack.
pub mod counters {
    pub const TUPLES_READ: &str = "tuples_read";
    pub const TUPLES_WRITTEN: &str = "tuples_written";
    pub const TUPLES_TRAPPED: &str = "tuples_trapped";
    pub const GROUPS: &str = "groups";
}

/// Services the execution substrate provides to a running stage.
///
/// All methods take `&self`: one process is shared by every partition of a
/// stage, so implementations synchronize internally.
#[cfg_attr(test, mockall::automock)]
pub trait FlowProcess: Send + Sync {
    fn open_tap_for_read(&self, tap: &TapRef) -> TapResult<TupleIter>;

    fn open_tap_for_write(&self, tap: &TapRef) -> TapResult<Box<dyn TupleCollector>>;

    /// Heartbeat so the substrate does not presume a hang.
    fn keep_alive(&self);

    fn increment_counter(&self, name: &str, amount: u64);

    fn set_status(&self, status: &str);

    fn property(&self, key: &str) -> Option<String>;
}
