//! Built-in functions.

use super::{Filter, Function, Operation, OperationCall, OperationError, OperationResult, OutputCollector};
use crate::process::FlowProcess;
use crate::tuple::{Fields, Tuple, TupleEntry, Value};
use std::sync::Arc;

/// Emits its arguments unchanged, optionally renamed.
#[derive(Debug, Clone)]
pub struct Identity {
    declared: Fields,
}

impl Identity {
    /// Declares `ARGS`, so the argument names flow through.
    pub fn new() -> Self {
        Self {
            declared: Fields::args(),
        }
    }

    /// Re-declares the arguments under new names.
    pub fn as_fields(fields: Fields) -> Self {
        Self { declared: fields }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for Identity {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }

    fn num_args(&self) -> Option<usize> {
        self.declared.arity()
    }
}

impl Function for Identity {
    fn operate(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        output.add(arguments.tuple().clone());
        Ok(())
    }
}

/// Emits a constant tuple for every record.
#[derive(Debug, Clone)]
pub struct Insert {
    declared: Fields,
    values: Tuple,
}

impl Insert {
    pub fn new(declared: Fields, values: Tuple) -> Self {
        Self { declared, values }
    }
}

impl Operation for Insert {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }
}

impl Function for Insert {
    fn operate(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        _arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        output.add(self.values.clone());
        Ok(())
    }
}

/// Emits the first value when the wrapped filter keeps the record, the
/// second when it would remove it.
#[derive(Clone)]
pub struct SetValue {
    declared: Fields,
    filter: Arc<dyn Filter>,
    values: [Value; 2],
}

impl SetValue {
    pub fn new<F: Filter + 'static>(declared: Fields, filter: F, kept: Value, removed: Value) -> Self {
        Self {
            declared,
            filter: Arc::new(filter),
            values: [kept, removed],
        }
    }
}

impl std::fmt::Debug for SetValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetValue")
            .field("declared", &self.declared)
            .field("filter", &self.filter.name())
            .field("values", &self.values)
            .finish()
    }
}

impl Operation for SetValue {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }

    fn num_args(&self) -> Option<usize> {
        self.filter.num_args()
    }

    fn is_safe(&self) -> bool {
        self.filter.is_safe()
    }

    fn prepare(&self, process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        self.filter.prepare(process, call)
    }

    fn cleanup(&self, process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        self.filter.cleanup(process, call)
    }
}

impl Function for SetValue {
    fn operate(
        &self,
        process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        let removed = self.filter.is_remove(process, call, arguments)?;
        let value = self.values[usize::from(removed)].clone();
        output.add(Tuple::from(vec![value]));
        Ok(())
    }
}

/// Joins all argument values into one string.
#[derive(Debug, Clone)]
pub struct FieldJoiner {
    declared: Fields,
    delimiter: String,
}

impl FieldJoiner {
    pub fn new(declared: Fields, delimiter: impl Into<String>) -> Self {
        Self {
            declared,
            delimiter: delimiter.into(),
        }
    }
}

impl Operation for FieldJoiner {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }
}

impl Function for FieldJoiner {
    fn operate(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        if self.declared.arity().is_some_and(|n| n != 1) {
            return Err(OperationError::failed(format!(
                "FieldJoiner declares {} fields, expected one",
                self.declared
            )));
        }
        let joined = arguments
            .tuple()
            .values()
            .iter()
            .map(|v| match v {
                Value::Str(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(&self.delimiter);
        output.add(Tuple::from(vec![Value::Str(joined)]));
        Ok(())
    }
}
