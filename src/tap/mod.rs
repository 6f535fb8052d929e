//! Named external data endpoints.
//!
//! A [`Tap`] describes a resource that tuples are read from or written to,
//! together with the [`Scheme`] that declares its field schema. The planner
//! only ever asks a tap for its schema, identifier and identity; opening,
//! deleting and probing the resource happens during execution through a
//! [`FlowProcess`](crate::process::FlowProcess).
//!
//! # Design
//!
//! - **Shared descriptors**: taps are handed around as [`TapRef`]
//!   (`Arc<dyn Tap>`). Pointer identity tells the planner that two head
//!   names are bound to the *same* tap instance; [`Tap::is_same_resource`]
//!   tells the cascade that two instances describe the same resource.
//! - **Concrete I/O is pluggable**: the crate only ships [`MemoryTap`],
//!   which backs tests, the demo binary and default intermediate taps.

pub mod memory;

pub use memory::{MemoryStore, MemoryTap};

use crate::process::FlowProcess;
use crate::tuple::{Fields, Tuple};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by tap implementations.
#[derive(Error, Debug)]
pub enum TapError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("collector for {0} is already closed")]
    Closed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TapResult<T> = std::result::Result<T, TapError>;

/// Tuples read from a tap.
pub type TupleIter = Box<dyn Iterator<Item = TapResult<Tuple>> + Send>;

/// Shared tap descriptor.
pub type TapRef = Arc<dyn Tap>;

/// What happens to an existing sink resource when a flow starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SinkMode {
    /// Fail if the resource exists.
    #[default]
    Keep,
    /// Delete the resource before writing.
    Replace,
    /// Add to the existing resource.
    Append,
}

/// Field schema of a tap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scheme {
    /// Fields produced when the tap is read. `UNKNOWN` when not declared.
    pub source_fields: Fields,
    /// Fields selected from the incoming stream when the tap is written.
    pub sink_fields: Fields,
    /// Hint for how many parts a sink should be written as.
    pub num_sink_parts: usize,
}

impl Scheme {
    /// Read `fields`, write everything that arrives.
    pub fn new(source_fields: Fields) -> Self {
        Self {
            source_fields,
            sink_fields: Fields::all(),
            num_sink_parts: 1,
        }
    }

    /// Read and write the same fields.
    pub fn symmetric(fields: Fields) -> Self {
        Self {
            source_fields: fields.clone(),
            sink_fields: fields,
            num_sink_parts: 1,
        }
    }

    pub fn with_sink_fields(mut self, fields: Fields) -> Self {
        self.sink_fields = fields;
        self
    }

    pub fn with_num_sink_parts(mut self, parts: usize) -> Self {
        self.num_sink_parts = parts.max(1);
        self
    }
}

impl Default for Scheme {
    fn default() -> Self {
        Self::new(Fields::unknown())
    }
}

/// Receives tuples written to a tap.
pub trait TupleCollector: Send {
    fn collect(&mut self, tuple: Tuple) -> TapResult<()>;

    /// Flush and commit. Collectors dropped without `close` discard their
    /// output.
    fn close(&mut self) -> TapResult<()>;
}

/// A named external data endpoint.
pub trait Tap: Send + Sync + fmt::Debug {
    /// Path or other identity of the underlying resource.
    fn identifier(&self) -> &str;

    fn scheme(&self) -> &Scheme;

    fn sink_mode(&self) -> SinkMode {
        SinkMode::Keep
    }

    /// Planner-created intermediate storage.
    fn is_temporary(&self) -> bool {
        false
    }

    fn source_fields(&self) -> Fields {
        self.scheme().source_fields.clone()
    }

    fn sink_fields(&self) -> Fields {
        self.scheme().sink_fields.clone()
    }

    /// Whether both taps address the same underlying resource.
    fn is_same_resource(&self, other: &dyn Tap) -> bool {
        self.identifier() == other.identifier()
    }

    fn open_for_read(&self, process: &dyn FlowProcess) -> TapResult<TupleIter>;

    fn open_for_write(&self, process: &dyn FlowProcess) -> TapResult<Box<dyn TupleCollector>>;

    /// Returns `true` if something was deleted.
    fn delete_resource(&self, process: &dyn FlowProcess) -> TapResult<bool>;

    fn resource_exists(&self, process: &dyn FlowProcess) -> TapResult<bool>;

    /// `None` when the resource does not exist.
    fn modified_time(&self, process: &dyn FlowProcess) -> TapResult<Option<DateTime<Utc>>>;
}

/// Whether two shared descriptors are the very same tap instance.
pub fn same_instance(a: &TapRef, b: &TapRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Creates the intermediate taps the planner inserts at materialization
/// points. Implementations must not touch the underlying storage.
pub trait TemporaryTapFactory: Send + Sync {
    fn create(&self, identifier: &str, fields: &Fields) -> TapRef;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_defaults() {
        let scheme = Scheme::new(Fields::from(["a", "b"]));
        assert!(scheme.sink_fields.is_all());
        assert_eq!(scheme.num_sink_parts, 1);
        assert!(Scheme::default().source_fields.is_unknown());
    }

    #[test]
    fn test_scheme_equality_on_fields() {
        assert_eq!(
            Scheme::symmetric(Fields::from("a")),
            Scheme::new(Fields::from("a")).with_sink_fields(Fields::from("a"))
        );
        assert_ne!(Scheme::new(Fields::from("a")), Scheme::new(Fields::from("b")));
    }

    #[test]
    fn test_same_instance() {
        let store = MemoryStore::new();
        let a: TapRef = Arc::new(MemoryTap::new(&store, "in", Scheme::default()));
        let b: TapRef = Arc::new(MemoryTap::new(&store, "in", Scheme::default()));
        assert!(same_instance(&a, &a.clone()));
        assert!(!same_instance(&a, &b));
        assert!(a.is_same_resource(b.as_ref()));
    }
}
