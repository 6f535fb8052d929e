//! Grouped records and the per-group lifecycle.
//!
//! ```text
//!   IDLE ──start──► STARTED ──operate──► ACCUMULATING ──complete──► COMPLETED
//!    ▲                 │                     │  ▲ operate                │
//!    │                 └──────complete───────┼──┘                      │
//!    └───────────────────────────── reset ──────────────────────────────┘
//! ```

use super::error::ExecutionError;
use crate::pipe::Joiner;
use crate::tuple::Tuple;
use std::borrow::Cow;

/// Lifecycle state of one grouping while a group is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    #[default]
    Idle,
    Started,
    Accumulating,
    Completed,
}

impl GroupState {
    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(self, next: GroupState, element: &str) -> Result<GroupState, ExecutionError> {
        use GroupState::*;
        let legal = matches!(
            (self, next),
            (Idle, Started)
                | (Started, Accumulating)
                | (Accumulating, Accumulating)
                | (Started, Completed)
                | (Accumulating, Completed)
                | (Completed, Idle)
        );
        if legal {
            Ok(next)
        } else {
            Err(ExecutionError::internal(
                element,
                format!("illegal group transition {:?} -> {:?}", self, next),
            ))
        }
    }
}

/// One tuple emitted by a map side towards a grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedTuple {
    /// Input ordinal at the grouping.
    pub ordinal: usize,
    pub key: Tuple,
    pub sort: Option<Tuple>,
    pub value: Tuple,
}

/// Receives the map side output for a grouping.
pub trait GroupingCollector: Send {
    fn collect(&mut self, tuple: GroupedTuple) -> Result<(), ExecutionError>;
}

impl GroupingCollector for Vec<GroupedTuple> {
    fn collect(&mut self, tuple: GroupedTuple) -> Result<(), ExecutionError> {
        self.push(tuple);
        Ok(())
    }
}

impl<C: GroupingCollector + ?Sized> GroupingCollector for &mut C {
    fn collect(&mut self, tuple: GroupedTuple) -> Result<(), ExecutionError> {
        (**self).collect(tuple)
    }
}

/// All members of one key, one bucket per input (a single bucket for
/// `GroupBy`). Members are in the order the shuffle delivered them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub key: Tuple,
    pub members: Vec<Vec<Tuple>>,
}

impl Group {
    pub fn new(key: Tuple, members: Vec<Vec<Tuple>>) -> Self {
        Self { key, members }
    }

    pub fn single(key: Tuple, members: Vec<Tuple>) -> Self {
        Self {
            key,
            members: vec![members],
        }
    }

    pub fn len(&self) -> usize {
        self.members.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.members.iter().all(Vec::is_empty)
    }
}

/// Lazy cartesian product over the buckets of a group.
///
/// Empty buckets of inputs the joiner does not require are replaced by one
/// all-null tuple of the input's arity. An empty required bucket yields
/// nothing.
pub struct JoinIterator<'a> {
    sides: Vec<Cow<'a, [Tuple]>>,
    cursor: Vec<usize>,
    done: bool,
}

impl<'a> JoinIterator<'a> {
    pub fn new(buckets: &'a [Vec<Tuple>], joiner: &Joiner, arities: &[Option<usize>]) -> Self {
        let mut done = buckets.is_empty();
        let sides = buckets
            .iter()
            .enumerate()
            .map(|(ordinal, bucket)| {
                if !bucket.is_empty() {
                    return Cow::Borrowed(bucket.as_slice());
                }
                if joiner.is_required(ordinal) {
                    done = true;
                    return Cow::Borrowed(bucket.as_slice());
                }
                let arity = arities.get(ordinal).copied().flatten().unwrap_or(0);
                Cow::Owned(vec![Tuple::nulls(arity)])
            })
            .collect();
        Self {
            sides,
            cursor: vec![0; buckets.len()],
            done,
        }
    }
}

impl Iterator for JoinIterator<'_> {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        if self.done {
            return None;
        }
        let mut joined = Tuple::new();
        for (side, &at) in self.sides.iter().zip(&self.cursor) {
            joined = joined.append(&side[at]);
        }

        // Advance the rightmost side first, like an odometer.
        let mut position = self.cursor.len();
        loop {
            if position == 0 {
                self.done = true;
                break;
            }
            position -= 1;
            self.cursor[position] += 1;
            if self.cursor[position] < self.sides[position].len() {
                break;
            }
            self.cursor[position] = 0;
        }
        Some(joined)
    }
}
