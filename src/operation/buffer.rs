//! Built-in buffers.

use super::{Buffer, Operation, OperationCall, OperationError, OperationResult, OutputCollector};
use crate::process::FlowProcess;
use crate::tuple::{Fields, TupleEntry};

/// Emits the arguments of the first `n` members of each group.
#[derive(Debug, Clone)]
pub struct FirstN {
    n: usize,
    declared: Fields,
}

impl FirstN {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            declared: Fields::args(),
        }
    }

    pub fn as_fields(n: usize, fields: Fields) -> Self {
        Self { n, declared: fields }
    }
}

impl Operation for FirstN {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }

    fn num_args(&self) -> Option<usize> {
        self.declared.arity()
    }
}

impl Buffer for FirstN {
    fn start(&self, _process: &dyn FlowProcess, call: &mut OperationCall, _group: TupleEntry<'_>) -> OperationResult<()> {
        call.set_context(0usize);
        Ok(())
    }

    fn operate(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        _group: TupleEntry<'_>,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        let emitted = call
            .context_mut::<usize>()
            .ok_or_else(|| OperationError::failed("FirstN operated before start"))?;
        if *emitted < self.n {
            *emitted += 1;
            output.add(arguments.tuple().clone());
        }
        Ok(())
    }

    fn complete(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        _group: TupleEntry<'_>,
        _output: &mut OutputCollector,
    ) -> OperationResult<()> {
        call.clear();
        Ok(())
    }
}
