//! Field schemas.
//!
//! A [`Fields`] value is either a *defined* ordered sequence of field
//! references (names and/or positions), or one of the substitution
//! sentinels used by operations and pipes:
//!
//! | Sentinel  | Meaning                                                         |
//! |-----------|-----------------------------------------------------------------|
//! | `ALL`     | every incoming field                                            |
//! | `UNKNOWN` | values whose names are resolved at runtime                      |
//! | `ARGS`    | an operation declares the same fields as its arguments          |
//! | `RESULTS` | output only the operation results                               |
//! | `SWAP`    | output incoming fields minus the arguments, then the results    |
//! | `REPLACE` | output incoming fields with argument values replaced in place   |
//!
//! The empty defined set doubles as `NONE`.
//!
//! Fields are immutable once built; every algebra operation returns a new
//! value. Equality and hashing cover the ordered references *and* the
//! attached comparators, so two join keys only compare equal when they
//! would also group the same way.

use super::value::Value;
use super::Tuple;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Errors raised while resolving one field schema against another.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldsError {
    #[error("field {field} not found in {available}")]
    NotFound { field: String, available: String },

    #[error("position {position} is out of range for {size} fields")]
    OutOfRange { position: i32, size: usize },

    #[error("cannot select field {field} by name from UNKNOWN fields")]
    UnknownIncoming { field: String },

    #[error("field name collision on '{name}', declare the output fields explicitly")]
    Collision { name: String },

    #[error("field '{name}' is present in both the incoming and the declared fields")]
    Ambiguous { name: String },

    #[error("{context}: expected {expected} fields, found {actual}")]
    ArityMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} fields cannot be used as {usage}")]
    Unresolvable { kind: FieldsKind, usage: String },

    #[error("{0}")]
    Incompatible(String),
}

/// A single field reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldRef {
    Name(String),
    /// Position in the tuple; negative positions count from the end.
    Pos(i32),
}

impl FieldRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            FieldRef::Name(n) => Some(n),
            FieldRef::Pos(_) => None,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRef::Name(n) => write!(f, "'{}'", n),
            FieldRef::Pos(p) => write!(f, "{}", p),
        }
    }
}

impl From<&str> for FieldRef {
    fn from(name: &str) -> Self {
        FieldRef::Name(name.to_string())
    }
}

impl From<String> for FieldRef {
    fn from(name: String) -> Self {
        FieldRef::Name(name)
    }
}

impl From<i32> for FieldRef {
    fn from(pos: i32) -> Self {
        FieldRef::Pos(pos)
    }
}

/// Ordering attached to a field for grouping and secondary sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Comparator {
    #[default]
    Natural,
    Reverse,
    CaseInsensitive,
}

impl Comparator {
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match self {
            Comparator::Natural => a.cmp(b),
            Comparator::Reverse => b.cmp(a),
            Comparator::CaseInsensitive => match (a, b) {
                (Value::Str(x), Value::Str(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
                _ => a.cmp(b),
            },
        }
    }

    /// Lexicographic tuple comparison; positions without a comparator use
    /// natural ordering.
    pub fn compare_tuples(a: &Tuple, b: &Tuple, comparators: &[Comparator]) -> Ordering {
        for (i, (x, y)) in a.values().iter().zip(b.values()).enumerate() {
            let cmp = comparators.get(i).copied().unwrap_or_default();
            match cmp.compare(x, y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.size().cmp(&b.size())
    }
}

/// Which sentinel (if any) a [`Fields`] value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldsKind {
    Defined,
    All,
    Unknown,
    Args,
    Results,
    Swap,
    Replace,
}

impl fmt::Display for FieldsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldsKind::Defined => "DEFINED",
            FieldsKind::All => "ALL",
            FieldsKind::Unknown => "UNKNOWN",
            FieldsKind::Args => "ARGS",
            FieldsKind::Results => "RESULTS",
            FieldsKind::Swap => "SWAP",
            FieldsKind::Replace => "REPLACE",
        };
        f.write_str(s)
    }
}

/// Argument selection resolved against a concrete incoming schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Positions(Vec<usize>),
}

impl Selector {
    /// Extract the selected values, `None` when a position is out of range.
    pub fn apply(&self, tuple: &Tuple) -> Option<Tuple> {
        match self {
            Selector::All => Some(tuple.clone()),
            Selector::Positions(positions) => tuple.select(positions),
        }
    }

    pub fn len(&self, incoming_size: usize) -> usize {
        match self {
            Selector::All => incoming_size,
            Selector::Positions(p) => p.len(),
        }
    }

    pub fn positions(&self) -> Option<&[usize]> {
        match self {
            Selector::All => None,
            Selector::Positions(p) => Some(p),
        }
    }
}

/// An ordered, immutable field schema or substitution sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fields {
    kind: FieldsKind,
    refs: Vec<FieldRef>,
    comparators: Vec<Option<Comparator>>,
}

impl Fields {
    fn sentinel(kind: FieldsKind) -> Self {
        Self {
            kind,
            refs: Vec::new(),
            comparators: Vec::new(),
        }
    }

    pub fn from_refs(refs: Vec<FieldRef>) -> Self {
        let comparators = vec![None; refs.len()];
        Self {
            kind: FieldsKind::Defined,
            refs,
            comparators,
        }
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_refs(names.into_iter().map(|n| FieldRef::Name(n.into())).collect())
    }

    pub fn positions(positions: &[i32]) -> Self {
        Self::from_refs(positions.iter().map(|&p| FieldRef::Pos(p)).collect())
    }

    pub fn at(position: i32) -> Self {
        Self::positions(&[position])
    }

    /// Positional fields `0..size`.
    pub fn size_of(size: usize) -> Self {
        Self::from_refs((0..size as i32).map(FieldRef::Pos).collect())
    }

    pub fn all() -> Self {
        Self::sentinel(FieldsKind::All)
    }

    pub fn unknown() -> Self {
        Self::sentinel(FieldsKind::Unknown)
    }

    pub fn args() -> Self {
        Self::sentinel(FieldsKind::Args)
    }

    pub fn results() -> Self {
        Self::sentinel(FieldsKind::Results)
    }

    pub fn swap() -> Self {
        Self::sentinel(FieldsKind::Swap)
    }

    pub fn replace() -> Self {
        Self::sentinel(FieldsKind::Replace)
    }

    pub fn none() -> Self {
        Self::from_refs(Vec::new())
    }

    /// Defined fields from raw parts, with positional references renumbered.
    pub(crate) fn with_parts(refs: Vec<FieldRef>, comparators: Vec<Option<Comparator>>) -> Self {
        let mut fields = Self {
            kind: FieldsKind::Defined,
            refs,
            comparators,
        };
        fields.renumber();
        fields
    }

    /// Attach a comparator to the field named `name`; unknown names are ignored.
    pub fn with_comparator(mut self, name: &str, comparator: Comparator) -> Self {
        if let Some(i) = self.index_of(name) {
            self.comparators[i] = Some(comparator);
        }
        self
    }

    pub fn with_comparator_at(mut self, index: usize, comparator: Comparator) -> Self {
        if index < self.comparators.len() {
            self.comparators[index] = Some(comparator);
        }
        self
    }

    // ==================== Queries ====================

    pub fn kind(&self) -> FieldsKind {
        self.kind
    }

    pub fn is_defined(&self) -> bool {
        self.kind == FieldsKind::Defined
    }

    pub fn is_all(&self) -> bool {
        self.kind == FieldsKind::All
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == FieldsKind::Unknown
    }

    pub fn is_none(&self) -> bool {
        self.is_defined() && self.refs.is_empty()
    }

    /// Number of defined references; zero for sentinels.
    pub fn size(&self) -> usize {
        self.refs.len()
    }

    /// Arity when it is known at plan time.
    pub fn arity(&self) -> Option<usize> {
        self.is_defined().then_some(self.refs.len())
    }

    pub fn refs(&self) -> &[FieldRef] {
        &self.refs
    }

    pub fn comparator(&self, index: usize) -> Comparator {
        self.comparators
            .get(index)
            .copied()
            .flatten()
            .unwrap_or_default()
    }

    pub(crate) fn raw_comparator(&self, index: usize) -> Option<Comparator> {
        self.comparators.get(index).copied().flatten()
    }

    pub fn comparators(&self) -> Vec<Comparator> {
        (0..self.refs.len()).map(|i| self.comparator(i)).collect()
    }

    pub fn has_comparators(&self) -> bool {
        self.comparators.iter().any(Option::is_some)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.refs.iter().position(|r| r.name() == Some(name))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    // ==================== Algebra ====================

    /// Resolve this selector against `incoming` into concrete positions.
    pub fn positions_in(&self, incoming: &Fields) -> Result<Selector, FieldsError> {
        match self.kind {
            FieldsKind::All => Ok(Selector::All),
            FieldsKind::Defined => {
                let mut positions = Vec::with_capacity(self.refs.len());
                for field in &self.refs {
                    positions.push(incoming.position_of(field)?);
                }
                Ok(Selector::Positions(positions))
            }
            kind => Err(FieldsError::Unresolvable {
                kind,
                usage: "a field selector".to_string(),
            }),
        }
    }

    fn position_of(&self, field: &FieldRef) -> Result<usize, FieldsError> {
        match (field, self.kind) {
            (FieldRef::Name(name), FieldsKind::Defined) => {
                self.index_of(name).ok_or_else(|| FieldsError::NotFound {
                    field: field.to_string(),
                    available: self.to_string(),
                })
            }
            (FieldRef::Name(_), _) => Err(FieldsError::UnknownIncoming {
                field: field.to_string(),
            }),
            (FieldRef::Pos(p), FieldsKind::Defined) => {
                let size = self.refs.len();
                let resolved = if *p < 0 { size as i64 + *p as i64 } else { *p as i64 };
                if resolved < 0 || resolved >= size as i64 {
                    Err(FieldsError::OutOfRange { position: *p, size })
                } else {
                    Ok(resolved as usize)
                }
            }
            (FieldRef::Pos(p), _) if *p >= 0 => Ok(*p as usize),
            (FieldRef::Pos(p), _) => Err(FieldsError::OutOfRange {
                position: *p,
                size: 0,
            }),
        }
    }

    /// The schema of the values this selector picks out of `incoming`.
    pub fn select_from(&self, incoming: &Fields) -> Result<Fields, FieldsError> {
        match self.positions_in(incoming)? {
            Selector::All => Ok(incoming.clone()),
            Selector::Positions(positions) => {
                if !incoming.is_defined() {
                    let mut fields = Fields::size_of(positions.len());
                    fields.comparators.clone_from(&self.comparators);
                    return Ok(fields);
                }
                let mut refs = Vec::with_capacity(positions.len());
                let mut comparators = Vec::with_capacity(positions.len());
                for (i, &pos) in positions.iter().enumerate() {
                    refs.push(incoming.refs[pos].clone());
                    let own = self.comparators.get(i).copied().flatten();
                    comparators.push(own.or(incoming.comparators[pos]));
                }
                let mut fields = Fields {
                    kind: FieldsKind::Defined,
                    refs,
                    comparators,
                };
                fields.renumber();
                Ok(fields)
            }
        }
    }

    /// Concatenate two schemas; a repeated name is a collision.
    ///
    /// `UNKNOWN` on either side yields `UNKNOWN`.
    pub fn append(&self, other: &Fields) -> Result<Fields, FieldsError> {
        if self.is_unknown() || other.is_unknown() {
            return Ok(Fields::unknown());
        }
        for kind in [self.kind, other.kind] {
            if kind != FieldsKind::Defined {
                return Err(FieldsError::Unresolvable {
                    kind,
                    usage: "an appendable schema".to_string(),
                });
            }
        }
        for name in other.refs.iter().filter_map(FieldRef::name) {
            if self.contains_name(name) {
                return Err(FieldsError::Collision {
                    name: name.to_string(),
                });
            }
        }
        Ok(self.concat(other))
    }

    /// Concatenation without the collision check, used to address
    /// `incoming ++ declared` by position.
    pub(crate) fn concat(&self, other: &Fields) -> Fields {
        let mut fields = Fields {
            kind: FieldsKind::Defined,
            refs: self.refs.iter().chain(&other.refs).cloned().collect(),
            comparators: self
                .comparators
                .iter()
                .chain(&other.comparators)
                .copied()
                .collect(),
        };
        fields.renumber();
        fields
    }

    /// Remove the given positions.
    pub fn subtract(&self, positions: &[usize]) -> Fields {
        let mut fields = Fields::none();
        for (i, field) in self.refs.iter().enumerate() {
            if !positions.contains(&i) {
                fields.refs.push(field.clone());
                fields.comparators.push(self.comparators[i]);
            }
        }
        fields.renumber();
        fields
    }

    /// Positional references always describe their own index.
    fn renumber(&mut self) {
        for (i, field) in self.refs.iter_mut().enumerate() {
            if let FieldRef::Pos(p) = field {
                *p = i as i32;
            }
        }
    }
}

impl Default for Fields {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FieldsKind::Defined if self.refs.is_empty() => write!(f, "[NONE]"),
            FieldsKind::Defined => {
                write!(f, "[")?;
                for (i, field) in self.refs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "]")
            }
            kind => write!(f, "[{}]", kind),
        }
    }
}

impl From<&str> for Fields {
    fn from(name: &str) -> Self {
        Fields::names([name])
    }
}

impl<const N: usize> From<[&str; N]> for Fields {
    fn from(names: [&str; N]) -> Self {
        Fields::names(names)
    }
}
