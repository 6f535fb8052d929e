//! Planner error types.

use crate::pipe::CallSite;
use crate::tuple::FieldsError;
use std::fmt;
use thiserror::Error;

/// Which binding map an unmatched name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapRole {
    Source,
    Sink,
    Trap,
}

impl fmt::Display for TapRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TapRole::Source => "source",
            TapRole::Sink => "sink",
            TapRole::Trap => "trap",
        })
    }
}

/// Structural rules an assembly can break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralViolation {
    /// An `Every` that is not downstream of a grouping.
    AggregationWithoutGrouping,
    /// An `Every` separated from its grouping by a split point.
    SplitBeforeAggregation,
    /// A grouping or `Every` feeding more than one `Every`.
    SplitAggregationChain,
    /// A buffer sharing its grouping with other aggregations.
    BufferWithOtherAggregators,
    /// Wrong number of inputs for the element kind.
    InputArity { expected: &'static str, actual: usize },
}

impl fmt::Display for StructuralViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AggregationWithoutGrouping => {
                f.write_str("aggregation must be preceded by a GroupBy or CoGroup")
            }
            Self::SplitBeforeAggregation => {
                f.write_str("aggregation must not follow a split without an intervening grouping")
            }
            Self::SplitAggregationChain => f.write_str("aggregation chains may not split"),
            Self::BufferWithOtherAggregators => {
                f.write_str("a buffer may not be combined with other aggregations on the same grouping")
            }
            Self::InputArity { expected, actual } => {
                write!(f, "expected {} inputs, found {}", expected, actual)
            }
        }
    }
}

/// Errors raised while turning an assembly into a flow. All of them are
/// reported before anything executes.
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("unable to resolve fields for '{element}' at {trace}: {source}")]
    FieldResolution {
        element: String,
        trace: CallSite,
        #[source]
        source: FieldsError,
    },

    #[error("{role} taps are not bound for pipes: {}", .names.join(", "))]
    UnboundTap { role: TapRole, names: Vec<String> },

    #[error("{role} taps are bound to missing pipes: {}", .names.join(", "))]
    DanglingPipe { role: TapRole, names: Vec<String> },

    #[error("duplicate {kind} names: {}", .names.join(", "))]
    DuplicateName { kind: &'static str, names: Vec<String> },

    #[error("tap '{tap}' is bound under multiple source names in stage '{stage}': {}", .names.join(", "))]
    DuplicateSource {
        tap: String,
        names: Vec<String>,
        stage: String,
    },

    #[error("tap '{tap}' is bound as source '{source_name}' and as sink '{sink_name}'")]
    SourceIsSink {
        tap: String,
        source_name: String,
        sink_name: String,
    },

    #[error("'{element}' at {trace}: {violation}")]
    Structural {
        element: String,
        trace: CallSite,
        violation: StructuralViolation,
    },

    #[error("invalid assembly at '{element}' ({trace}): {message}")]
    InvalidAssembly {
        element: String,
        trace: CallSite,
        message: String,
    },

    #[error("planner internal error: {0}")]
    Internal(String),
}

impl PlannerError {
    /// Declared name of the offending element, where there is one.
    pub fn element(&self) -> Option<&str> {
        match self {
            Self::FieldResolution { element, .. }
            | Self::Structural { element, .. }
            | Self::InvalidAssembly { element, .. } => Some(element),
            _ => None,
        }
    }

    pub fn violation(&self) -> Option<&StructuralViolation> {
        match self {
            Self::Structural { violation, .. } => Some(violation),
            _ => None,
        }
    }
}

pub type PlannerResult<T> = std::result::Result<T, PlannerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_names_listed() {
        let err = PlannerError::UnboundTap {
            role: TapRole::Sink,
            names: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "sink taps are not bound for pipes: a, b");
    }

    #[test]
    fn test_structural_message_carries_element() {
        let err = PlannerError::Structural {
            element: "count".into(),
            trace: CallSite::unknown(),
            violation: StructuralViolation::BufferWithOtherAggregators,
        };
        assert!(err.to_string().starts_with("'count' at <unknown>"));
        assert_eq!(err.element(), Some("count"));
        assert_eq!(err.violation(), Some(&StructuralViolation::BufferWithOtherAggregators));
    }
}
