//! Built-in aggregators.

use super::{Aggregator, Operation, OperationCall, OperationError, OperationResult, OutputCollector};
use crate::process::FlowProcess;
use crate::tuple::{Fields, Tuple, TupleEntry, Value};

fn missing_start(name: &str) -> OperationError {
    OperationError::failed(format!("{} aggregated before start", name))
}

/// Counts the members of a group.
#[derive(Debug, Clone)]
pub struct Count {
    declared: Fields,
}

impl Count {
    pub fn new() -> Self {
        Self::as_field("count")
    }

    pub fn as_field(name: &str) -> Self {
        Self {
            declared: Fields::from(name),
        }
    }
}

impl Default for Count {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for Count {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }
}

impl Aggregator for Count {
    fn start(&self, _process: &dyn FlowProcess, call: &mut OperationCall, _group: TupleEntry<'_>) -> OperationResult<()> {
        call.set_context(0i64);
        Ok(())
    }

    fn aggregate(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        _arguments: TupleEntry<'_>,
    ) -> OperationResult<()> {
        let count = call.context_mut::<i64>().ok_or_else(|| missing_start("Count"))?;
        *count += 1;
        Ok(())
    }

    fn complete(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        _group: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        let count = call.take_context::<i64>().ok_or_else(|| missing_start("Count"))?;
        output.add(Tuple::from(vec![Value::Int(count)]));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Total {
    Empty,
    Int(i64),
    Float(f64),
}

impl Total {
    fn add(self, value: &Value) -> OperationResult<Total> {
        Ok(match (self, value) {
            (total, Value::Null) => total,
            (Total::Empty, Value::Int(v)) => Total::Int(*v),
            (Total::Empty, Value::Float(v)) => Total::Float(*v),
            (Total::Int(t), Value::Int(v)) => Total::Int(t.wrapping_add(*v)),
            (Total::Int(t), Value::Float(v)) => Total::Float(t as f64 + v),
            (Total::Float(t), Value::Int(v)) => Total::Float(t + *v as f64),
            (Total::Float(t), Value::Float(v)) => Total::Float(t + v),
            (_, other) => {
                return Err(OperationError::failed(format!("Sum cannot add non-numeric value {}", other)))
            }
        })
    }

    fn into_value(self) -> Value {
        match self {
            Total::Empty => Value::Null,
            Total::Int(v) => Value::Int(v),
            Total::Float(v) => Value::Float(v),
        }
    }
}

/// Sums one numeric argument. Nulls are skipped; an all-null group sums to
/// null.
#[derive(Debug, Clone)]
pub struct Sum {
    declared: Fields,
}

impl Sum {
    pub fn new() -> Self {
        Self::as_field("sum")
    }

    pub fn as_field(name: &str) -> Self {
        Self {
            declared: Fields::from(name),
        }
    }
}

impl Default for Sum {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for Sum {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }

    fn num_args(&self) -> Option<usize> {
        Some(1)
    }
}

impl Aggregator for Sum {
    fn start(&self, _process: &dyn FlowProcess, call: &mut OperationCall, _group: TupleEntry<'_>) -> OperationResult<()> {
        call.set_context(Total::Empty);
        Ok(())
    }

    fn aggregate(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<()> {
        let total = call.context_mut::<Total>().ok_or_else(|| missing_start("Sum"))?;
        let value = arguments.get_at(0).unwrap_or(&Value::Null);
        *total = total.add(value)?;
        Ok(())
    }

    fn complete(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        _group: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        let total = call.take_context::<Total>().ok_or_else(|| missing_start("Sum"))?;
        output.add(Tuple::from(vec![total.into_value()]));
        Ok(())
    }
}

/// Emits the arguments of the first member of each group.
#[derive(Debug, Clone)]
pub struct First {
    declared: Fields,
}

impl First {
    pub fn new() -> Self {
        Self {
            declared: Fields::args(),
        }
    }

    pub fn as_fields(fields: Fields) -> Self {
        Self { declared: fields }
    }
}

impl Default for First {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for First {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }

    fn num_args(&self) -> Option<usize> {
        self.declared.arity()
    }
}

impl Aggregator for First {
    fn start(&self, _process: &dyn FlowProcess, call: &mut OperationCall, _group: TupleEntry<'_>) -> OperationResult<()> {
        call.set_context(None::<Tuple>);
        Ok(())
    }

    fn aggregate(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<()> {
        let first = call.context_mut::<Option<Tuple>>().ok_or_else(|| missing_start("First"))?;
        if first.is_none() {
            *first = Some(arguments.tuple().clone());
        }
        Ok(())
    }

    fn complete(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        _group: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        let first = call.take_context::<Option<Tuple>>().ok_or_else(|| missing_start("First"))?;
        if let Some(tuple) = first {
            output.add(tuple);
        }
        Ok(())
    }
}

/// Emits the arguments of the last member of each group.
#[derive(Debug, Clone)]
pub struct Last {
    declared: Fields,
}

impl Last {
    pub fn new() -> Self {
        Self {
            declared: Fields::args(),
        }
    }

    pub fn as_fields(fields: Fields) -> Self {
        Self { declared: fields }
    }
}

impl Default for Last {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for Last {
    fn field_declaration(&self) -> Fields {
        self.declared.clone()
    }

    fn num_args(&self) -> Option<usize> {
        self.declared.arity()
    }
}

impl Aggregator for Last {
    fn start(&self, _process: &dyn FlowProcess, call: &mut OperationCall, _group: TupleEntry<'_>) -> OperationResult<()> {
        call.set_context(None::<Tuple>);
        Ok(())
    }

    fn aggregate(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        arguments: TupleEntry<'_>,
    ) -> OperationResult<()> {
        let last = call.context_mut::<Option<Tuple>>().ok_or_else(|| missing_start("Last"))?;
        *last = Some(arguments.tuple().clone());
        Ok(())
    }

    fn complete(
        &self,
        _process: &dyn FlowProcess,
        call: &mut OperationCall,
        _group: TupleEntry<'_>,
        output: &mut OutputCollector,
    ) -> OperationResult<()> {
        let last = call.take_context::<Option<Tuple>>().ok_or_else(|| missing_start("Last"))?;
        if let Some(tuple) = last {
            output.add(tuple);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockFlowProcess;
    use crate::tuple;

    fn aggregate_all(aggregator: &dyn Aggregator, members: &[Tuple]) -> Vec<Tuple> {
        let process = MockFlowProcess::new();
        let key_fields = Fields::from(["k"]);
        let key = tuple!["key"];
        let group = TupleEntry::new(&key_fields, &key);
        let mut call = OperationCall::new();
        aggregator.start(&process, &mut call, group).unwrap();
        for member in members {
            let fields = Fields::size_of(member.size());
            aggregator
                .aggregate(&process, &mut call, TupleEntry::new(&fields, member))
                .unwrap();
        }
        let mut output = OutputCollector::new();
        aggregator.complete(&process, &mut call, group, &mut output).unwrap();
        output.drain().collect()
    }

    #[test]
    fn test_count() {
        assert_eq!(aggregate_all(&Count::new(), &[tuple![1], tuple![2]]), vec![tuple![2]]);
        assert_eq!(aggregate_all(&Count::new(), &[]), vec![tuple![0]]);
    }

    #[test]
    fn test_sum_promotes_and_skips_nulls() {
        let members = [tuple![1], tuple![None::<i64>], tuple![2.5]];
        assert_eq!(aggregate_all(&Sum::new(), &members), vec![tuple![3.5]]);
        assert_eq!(aggregate_all(&Sum::new(), &[tuple![2], tuple![3]]), vec![tuple![5]]);
        assert_eq!(aggregate_all(&Sum::new(), &[]), vec![Tuple::nulls(1)]);
    }

    #[test]
    fn test_sum_rejects_strings() {
        let process = MockFlowProcess::new();
        let fields = Fields::from(["v"]);
        let key = tuple!["k"];
        let mut call = OperationCall::new();
        Sum::new().start(&process, &mut call, TupleEntry::new(&fields, &key)).unwrap();
        let bad = tuple!["x"];
        let err = Sum::new()
            .aggregate(&process, &mut call, TupleEntry::new(&fields, &bad))
            .unwrap_err();
        assert!(matches!(err, OperationError::Failed(_)));
    }

    #[test]
    fn test_first_and_last() {
        let members = [tuple!["a"], tuple!["b"], tuple!["c"]];
        assert_eq!(aggregate_all(&First::new(), &members), vec![tuple!["a"]]);
        assert_eq!(aggregate_all(&Last::new(), &members), vec![tuple!["c"]]);
        assert!(aggregate_all(&First::new(), &[]).is_empty());
    }

    #[test]
    fn test_aggregate_without_start_fails() {
        let process = MockFlowProcess::new();
        let fields = Fields::from(["v"]);
        let t = tuple![1];
        let err = Count::new()
            .aggregate(&process, &mut OperationCall::new(), TupleEntry::new(&fields, &t))
            .unwrap_err();
        assert!(err.to_string().contains("before start"));
    }
}
