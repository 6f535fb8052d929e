//! Execution errors and failure classification.

use crate::operation::{OperationError, OperationResult};
use crate::pipe::CallSite;
use crate::tap::TapError;
use crate::tuple::Tuple;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Appended to every resource exhaustion message.
pub const RESOURCE_EXHAUSTION_HINT: &str = "out of memory, try increasing task memory allocation";

/// How a failure is contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A record-level failure; routed to a trap when one is bound.
    Operation,
    /// Never trapped; aborts the stage.
    ResourceExhaustion,
    /// A defect or an unexpected panic; aborts the stage.
    Internal,
}

/// Errors raised while a stage runs.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("operation failed in '{element}' at {trace} on {tuple}: {message}")]
    OperationRuntime {
        element: String,
        trace: CallSite,
        tuple: Tuple,
        message: String,
    },

    #[error("'{element}' at {trace} expected {expected} values, found {actual}: {tuple}")]
    TupleArity {
        element: String,
        trace: CallSite,
        expected: usize,
        actual: usize,
        tuple: Tuple,
    },

    #[error("'{element}' failed: {message}, {hint}", hint = RESOURCE_EXHAUSTION_HINT)]
    ResourceExhaustion { element: String, message: String },

    #[error("unable to access tap '{tap}': {source}")]
    Tap {
        tap: String,
        #[source]
        source: TapError,
    },

    #[error("internal error in '{element}' on {tuple}: {message}")]
    Internal {
        element: String,
        tuple: String,
        message: String,
    },
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::OperationRuntime { .. } | Self::TupleArity { .. } => FailureKind::Operation,
            Self::ResourceExhaustion { .. } => FailureKind::ResourceExhaustion,
            Self::Tap { .. } | Self::Internal { .. } => FailureKind::Internal,
        }
    }

    pub fn is_trappable(&self) -> bool {
        self.kind() == FailureKind::Operation
    }

    pub(crate) fn internal(element: &str, message: impl Into<String>) -> Self {
        Self::Internal {
            element: element.to_string(),
            tuple: String::new(),
            message: message.into(),
        }
    }

    pub(crate) fn tap(tap: &str, source: TapError) -> Self {
        Self::Tap {
            tap: tap.to_string(),
            source,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// Run one operation call, turning its failures and panics into
/// classified execution errors.
pub(crate) fn guarded<T>(
    element: &str,
    trace: CallSite,
    tuple: &Tuple,
    call: impl FnOnce() -> OperationResult<T>,
) -> Result<T, ExecutionError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(OperationError::Failed(message))) => Err(ExecutionError::OperationRuntime {
            element: element.to_string(),
            trace,
            tuple: tuple.clone(),
            message,
        }),
        Ok(Err(OperationError::ResourceExhausted(message))) => Err(ExecutionError::ResourceExhaustion {
            element: element.to_string(),
            message,
        }),
        Err(payload) => Err(ExecutionError::Internal {
            element: element.to_string(),
            tuple: tuple.to_string(),
            message: panic_message(payload),
        }),
    }
}
