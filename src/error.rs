//! Error handling for pipeflow
//!
//! Each component has its own error enum. This module rolls them up into one
//! [`Error`] for callers that plan, run and cascade flows in one place.

use crate::cascade::CascadeError;
use crate::config::ConfigError;
use crate::operation::OperationError;
use crate::planner::PlannerError;
use crate::runner::FlowError;
use crate::stack::ExecutionError;
use crate::tap::TapError;
use crate::tuple::FieldsError;
use thiserror::Error;

/// Main error type for pipeflow operations
#[derive(Error, Debug)]
pub enum Error {
    /// Field selection and schema errors
    #[error("Field error: {0}")]
    Fields(#[from] FieldsError),

    /// Planning errors, raised before any stage runs
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    /// Errors raised while a stage processes records
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Cascade error: {0}")]
    Cascade(#[from] CascadeError),

    #[error("Tap error: {0}")]
    Tap(#[from] TapError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for pipeflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
