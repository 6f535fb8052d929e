//! Tuples, field schemas and field resolution.
//!
//! Everything in this module is immutable value data that is shared
//! read-only between the planner and any number of concurrently running
//! stacks.

pub mod fields;
pub mod resolve;
pub mod value;

pub use fields::{Comparator, FieldRef, Fields, FieldsError, FieldsKind, Selector};
pub use resolve::{resolve_each, resolve_every, EachResolution, EveryResolution, OutputSelector};
pub use value::Value;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Build a [`Tuple`] from values convertible into [`Value`].
///
/// ```
/// use pipeflow::tuple;
/// let t = tuple!["word", 3];
/// assert_eq!(t.size(), 2);
/// ```
#[macro_export]
macro_rules! tuple {
    () => {
        $crate::tuple::Tuple::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::tuple::Tuple::from(vec![$($crate::tuple::Value::from($value)),+])
    };
}

/// An ordered list of values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A tuple of `size` nulls, used to pad outer join sides.
    pub fn nulls(size: usize) -> Self {
        Self(vec![Value::Null; size])
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&Value> {
        self.0.get(pos)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.0.push(value.into());
    }

    /// Values at `positions`, or `None` if any position is out of range.
    pub fn select(&self, positions: &[usize]) -> Option<Tuple> {
        positions
            .iter()
            .map(|&p| self.0.get(p).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Tuple)
    }

    pub fn append(&self, other: &Tuple) -> Tuple {
        let mut values = Vec::with_capacity(self.size() + other.size());
        values.extend_from_slice(&self.0);
        values.extend_from_slice(&other.0);
        Tuple(values)
    }

    /// Copy with the given positions removed.
    pub fn remove(&self, positions: &[usize]) -> Tuple {
        Tuple(
            self.0
                .iter()
                .enumerate()
                .filter(|(i, _)| !positions.contains(i))
                .map(|(_, v)| v.clone())
                .collect(),
        )
    }

    /// Overwrite `positions` with `values` in order. Returns `false` on an
    /// arity or range mismatch, leaving the tuple untouched.
    pub fn put(&mut self, positions: &[usize], values: &Tuple) -> bool {
        if positions.len() != values.size() || positions.iter().any(|&p| p >= self.size()) {
            return false;
        }
        for (&p, v) in positions.iter().zip(values.values()) {
            self.0[p] = v.clone();
        }
        true
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Tuple {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

/// A borrowed view pairing a tuple with the fields that describe it.
#[derive(Debug, Clone, Copy)]
pub struct TupleEntry<'a> {
    fields: &'a Fields,
    tuple: &'a Tuple,
}

impl<'a> TupleEntry<'a> {
    pub fn new(fields: &'a Fields, tuple: &'a Tuple) -> Self {
        Self { fields, tuple }
    }

    pub fn fields(&self) -> &'a Fields {
        self.fields
    }

    pub fn tuple(&self) -> &'a Tuple {
        self.tuple
    }

    pub fn size(&self) -> usize {
        self.tuple.size()
    }

    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.fields.index_of(name).and_then(|i| self.tuple.get(i))
    }

    pub fn get_at(&self, pos: usize) -> Option<&'a Value> {
        self.tuple.get(pos)
    }

    pub fn get_str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }
}

impl fmt::Display for TupleEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fields: {} tuple: {}", self.fields, self.tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_macro_and_display() {
        let t = tuple!["a", 1, 2.5, true];
        assert_eq!(t.size(), 4);
        assert_eq!(t.to_string(), "['a', 1, 2.5, true]");
        assert!(tuple![].is_empty());
    }

    #[test]
    fn test_select_out_of_range() {
        let t = tuple!["a", "b"];
        assert_eq!(t.select(&[1, 0]), Some(tuple!["b", "a"]));
        assert_eq!(t.select(&[2]), None);
    }

    #[test]
    fn test_put_and_remove() {
        let mut t = tuple!["a", "b", "c"];
        assert!(t.put(&[1], &tuple!["B"]));
        assert_eq!(t, tuple!["a", "B", "c"]);
        assert!(!t.put(&[1, 2], &tuple!["x"]));
        assert_eq!(t.remove(&[0, 2]), tuple!["B"]);
    }

    #[test]
    fn test_entry_lookup() {
        let fields = Fields::from(["word", "count"]);
        let t = tuple!["rust", 3];
        let entry = TupleEntry::new(&fields, &t);
        assert_eq!(entry.get_str("word"), Some("rust"));
        assert_eq!(entry.get_i64("count"), Some(3));
        assert_eq!(entry.get("missing"), None);
    }
}
