//! Operation contract.
//!
//! Operations are the user logic wrapped by `Each` and `Every` pipes. They
//! come in four capabilities:
//!
//! | Trait          | Wrapped by | Entry points                          |
//! |----------------|------------|---------------------------------------|
//! | [`Function`]   | `Each`     | `operate` per record                  |
//! | [`Filter`]     | `Each`     | `is_remove` per record                |
//! | [`Aggregator`] | `Every`    | `start` / `aggregate` / `complete`    |
//! | [`Buffer`]     | `Every`    | `start` / `operate` / `complete`      |
//!
//! # Design
//!
//! - **Stateless instances, per-call state**: operations are shared as
//!   `Arc<dyn _>` and take `&self`. Anything that changes while records
//!   flow lives in the [`OperationCall`] owned by one stack element, so
//!   every parallel partition gets its own prepared state.
//! - **Enum dispatch at the pipe level**: [`EachOperation`] and
//!   [`EveryOperation`] close the capability set so the planner and the
//!   stack can match on it.

pub mod aggregator;
pub mod buffer;
pub mod filter;
pub mod function;

pub use aggregator::{Count, First, Last, Sum};
pub use buffer::FirstN;
pub use filter::{DebugLog, FilterNotNull, FilterNull};
pub use function::{FieldJoiner, Identity, Insert, SetValue};

use crate::process::FlowProcess;
use crate::tuple::{Fields, Tuple, TupleEntry};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failures an operation reports for the record or group at hand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// An ordinary processing failure. Trappable.
    #[error("{0}")]
    Failed(String),

    /// The operation ran out of memory or another bounded resource.
    /// Never trapped.
    #[error("{0}")]
    ResourceExhausted(String),
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }
}

pub type OperationResult<T> = std::result::Result<T, OperationError>;

/// Per-element state carried across calls to one operation instance.
#[derive(Default)]
pub struct OperationCall {
    context: Option<Box<dyn Any + Send>>,
}

impl OperationCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context.as_ref().and_then(|c| c.downcast_ref())
    }

    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.context.as_mut().and_then(|c| c.downcast_mut())
    }

    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        self.context = Some(Box::new(value));
    }

    pub fn take_context<T: Any>(&mut self) -> Option<T> {
        match self.context.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.context = Some(other);
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.context = None;
    }
}

impl fmt::Debug for OperationCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCall")
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

/// Receives the result tuples of one operation call.
#[derive(Debug, Default)]
pub struct OutputCollector {
    tuples: Vec<Tuple>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tuple: Tuple) {
        self.tuples.push(tuple);
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Tuple> {
        self.tuples.drain(..)
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Behaviour shared by every operation.
pub trait Operation: Send + Sync {
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }

    /// Fields this operation emits. Filters are always treated as `ALL`.
    fn field_declaration(&self) -> Fields {
        Fields::unknown()
    }

    /// Expected argument count, `None` for any.
    fn num_args(&self) -> Option<usize> {
        None
    }

    /// Whether running the operation twice on the same input is harmless.
    /// Unsafe operations force the planner to materialize instead of
    /// duplicating work at a split.
    fn is_safe(&self) -> bool {
        true
    }

    fn prepare(&self, _process: &dyn FlowProcess, _call: &mut OperationCall) -> OperationResult<()> {
        Ok(())
    }

    fn cleanup(&self, _process: &dyn FlowProcess, _call: &mut OperationCall) -> OperationResult<()> {
        Ok(())
    }
}

pub trait Function: Operation {
    fn operate(
        &self,
        process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()>;
}

pub trait Filter: Operation {
    fn is_remove(
        &self,
        process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<bool>;
}

pub trait Aggregator: Operation {
    fn start(
        &self,
        process: &dyn FlowProcess,
        call: &mut OperationCall,
        group: TupleEntry<'_>,
    ) -> OperationResult<()>;

    fn aggregate(
        &self,
        process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<()>;

    fn complete(
        &self,
        process: &dyn FlowProcess,
        call: &mut OperationCall,
        group: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()>;
}

/// Sees every member of a group and may emit at any point.
pub trait Buffer: Operation {
    fn start(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        _group: TupleEntry<'_>,
    ) -> OperationResult<()> {
        Ok(())
    }

    fn operate(
        &self,
        process: &dyn FlowProcess,
        call: &mut OperationCall,
        group: TupleEntry<'_>,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()>;

    fn complete(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        _group: TupleEntry<'_>,
        _output: &mut OutputCollector,
    ) -> OperationResult<()> {
        Ok(())
    }
}

/// Operation wrapped by an `Each`.
#[derive(Clone)]
pub enum EachOperation {
    Function(Arc<dyn Function>),
    Filter(Arc<dyn Filter>),
}

impl EachOperation {
    pub fn function<F: Function + 'static>(function: F) -> Self {
        Self::Function(Arc::new(function))
    }

    pub fn filter<F: Filter + 'static>(filter: F) -> Self {
        Self::Filter(Arc::new(filter))
    }

    pub fn is_filter(&self) -> bool {
        matches!(self, Self::Filter(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Function(op) => op.name(),
            Self::Filter(op) => op.name(),
        }
    }

    pub fn field_declaration(&self) -> Fields {
        match self {
            Self::Function(op) => op.field_declaration(),
            Self::Filter(_) => Fields::all(),
        }
    }

    pub fn num_args(&self) -> Option<usize> {
        match self {
            Self::Function(op) => op.num_args(),
            Self::Filter(op) => op.num_args(),
        }
    }

    pub fn is_safe(&self) -> bool {
        match self {
            Self::Function(op) => op.is_safe(),
            Self::Filter(op) => op.is_safe(),
        }
    }

    pub fn prepare(&self, process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        match self {
            Self::Function(op) => op.prepare(process, call),
            Self::Filter(op) => op.prepare(process, call),
        }
    }

    pub fn cleanup(&self, process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        match self {
            Self::Function(op) => op.cleanup(process, call),
            Self::Filter(op) => op.cleanup(process, call),
        }
    }

    /// Whether both wrap the very same operation instance.
    pub fn same_instance(&self, other: &EachOperation) -> bool {
        match (self, other) {
            (Self::Function(a), Self::Function(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            (Self::Filter(a), Self::Filter(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            _ => false,
        }
    }
}

impl fmt::Debug for EachOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(op) => write!(f, "Function({})", op.name()),
            Self::Filter(op) => write!(f, "Filter({})", op.name()),
        }
    }
}

/// Operation wrapped by an `Every`.
#[derive(Clone)]
pub enum EveryOperation {
    Aggregator(Arc<dyn Aggregator>),
    Buffer(Arc<dyn Buffer>),
}

impl EveryOperation {
    pub fn aggregator<A: Aggregator + 'static>(aggregator: A) -> Self {
        Self::Aggregator(Arc::new(aggregator))
    }

    pub fn buffer<B: Buffer + 'static>(buffer: B) -> Self {
        Self::Buffer(Arc::new(buffer))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Aggregator(op) => op.name(),
            Self::Buffer(op) => op.name(),
        }
    }

    pub fn field_declaration(&self) -> Fields {
        match self {
            Self::Aggregator(op) => op.field_declaration(),
            Self::Buffer(op) => op.field_declaration(),
        }
    }

    pub fn num_args(&self) -> Option<usize> {
        match self {
            Self::Aggregator(op) => op.num_args(),
            Self::Buffer(op) => op.num_args(),
        }
    }

    pub fn is_safe(&self) -> bool {
        match self {
            Self::Aggregator(op) => op.is_safe(),
            Self::Buffer(op) => op.is_safe(),
        }
    }

    pub fn prepare(&self, process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        match self {
            Self::Aggregator(op) => op.prepare(process, call),
            Self::Buffer(op) => op.prepare(process, call),
        }
    }

    pub fn cleanup(&self, process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        match self {
            Self::Aggregator(op) => op.cleanup(process, call),
            Self::Buffer(op) => op.cleanup(process, call),
        }
    }
}

impl fmt::Debug for EveryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggregator(op) => write!(f, "Aggregator({})", op.name()),
            Self::Buffer(op) => write!(f, "Buffer({})", op.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_context_round_trip() {
        let mut call = OperationCall::new();
        assert!(call.context::<i64>().is_none());
        call.set_context(5i64);
        *call.context_mut::<i64>().unwrap() += 1;
        assert_eq!(call.context::<i64>(), Some(&6));
        assert_eq!(call.take_context::<String>(), None);
        assert_eq!(call.take_context::<i64>(), Some(6));
        assert!(call.context::<i64>().is_none());
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Identity>(), "Identity");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }

    #[test]
    fn test_each_operation_dispatch() {
        let op = EachOperation::function(Identity::new());
        assert_eq!(op.name(), "Identity");
        assert!(op.field_declaration().kind() == crate::tuple::FieldsKind::Args);
        assert!(!op.is_filter());
        assert!(op.same_instance(&op.clone()));
        assert!(!op.same_instance(&EachOperation::function(Identity::new())));

        let filter = EachOperation::filter(FilterNull);
        assert!(filter.is_filter());
        assert!(filter.field_declaration().is_all());
    }

    #[test]
    fn test_every_operation_dispatch() {
        let op = EveryOperation::aggregator(Count::new());
        assert_eq!(op.name(), "Count");
        assert!(!op.is_buffer());
        assert!(EveryOperation::buffer(FirstN::new(1)).is_buffer());
    }
}
