//! Operations with scripted behaviour for driving the stack

use pipeflow::operation::{Function, Operation, OperationCall, OperationError, OperationResult, OutputCollector};
use pipeflow::tuple::{Fields, TupleEntry};
use pipeflow::FlowProcess;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Passes its argument through, failing on one value.
#[derive(Debug, Clone)]
pub struct FailOn {
    value: String,
    exhausted: bool,
}

impl FailOn {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            exhausted: false,
        }
    }

    /// Fail with resource exhaustion instead of an ordinary failure.
    pub fn exhausted(mut self) -> Self {
        self.exhausted = true;
        self
    }
}

impl Operation for FailOn {
    fn field_declaration(&self) -> Fields {
        Fields::args()
    }
}

impl Function for FailOn {
    fn operate(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        if arguments.get_at(0).and_then(|v| v.as_str()) == Some(self.value.as_str()) {
            return Err(if self.exhausted {
                OperationError::exhausted(format!("no room for {}", self.value))
            } else {
                OperationError::failed(format!("refused {}", self.value))
            });
        }
        output.add(arguments.tuple().clone());
        Ok(())
    }
}

/// Counts lifecycle calls across every partition.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    pub prepared: Arc<AtomicUsize>,
    pub cleaned: Arc<AtomicUsize>,
    pub operated: Arc<AtomicUsize>,
}

impl Lifecycle {
    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn cleaned(&self) -> usize {
        self.cleaned.load(Ordering::SeqCst)
    }

    pub fn operated(&self) -> usize {
        self.operated.load(Ordering::SeqCst)
    }
}

impl Operation for Lifecycle {
    fn field_declaration(&self) -> Fields {
        Fields::args()
    }

    fn prepare(&self, _process: &dyn FlowProcess, _call: &mut OperationCall) -> OperationResult<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self, _process: &dyn FlowProcess, _call: &mut OperationCall) -> OperationResult<()> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Function for Lifecycle {
    fn operate(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        self.operated.fetch_add(1, Ordering::SeqCst);
        output.add(arguments.tuple().clone());
        Ok(())
    }
}
