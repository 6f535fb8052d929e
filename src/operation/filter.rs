//! Built-in filters.

use super::{Filter, Operation, OperationCall, OperationResult};
use crate::process::FlowProcess;
use crate::tuple::TupleEntry;

/// Removes records where any argument is null.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterNull;

impl Operation for FilterNull {}

impl Filter for FilterNull {
    fn is_remove(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<bool> {
        Ok(arguments.tuple().values().iter().any(|v| v.is_null()))
    }
}

/// Removes records where any argument is not null.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterNotNull;

impl Operation for FilterNotNull {}

impl Filter for FilterNotNull {
    fn is_remove(
        &self,
        _process: &dyn FlowProcess,
        _call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<bool> {
        Ok(arguments.tuple().values().iter().any(|v| !v.is_null()))
    }
}

/// Logs records at debug level and never removes anything.
#[derive(Debug, Clone)]
pub struct DebugLog {
    prefix: Option<String>,
    every: u64,
}

impl DebugLog {
    pub fn new() -> Self {
        Self { prefix: None, every: 1 }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Log only every `n`th record.
    pub fn every(mut self, n: u64) -> Self {
        self.every = n.max(1);
        self
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for DebugLog {
    fn prepare(&self, _process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        call.set_context(0u64);
        Ok(())
    }

    fn cleanup(&self, _process: &dyn FlowProcess, call: &mut OperationCall) -> OperationResult<()> {
        if let Some(seen) = call.take_context::<u64>() {
            tracing::debug!("{}: saw {} records", self.prefix.as_deref().unwrap_or("debug"), seen);
        }
        Ok(())
    }
}

impl Filter for DebugLog {
    fn is_remove(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<bool> {
        let seen = match call.context_mut::<u64>() {
            Some(seen) => {
                *seen += 1;
                *seen
            }
            None => 1,
        };
        if (seen - 1) % self.every == 0 {
            match &self.prefix {
                Some(prefix) => tracing::debug!("{}: {}", prefix, arguments),
                None => tracing::debug!("{}", arguments),
            }
        }
        Ok(false)
    }
}
