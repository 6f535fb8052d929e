//! In-memory sort-based shuffle between the map and reduce sides.

use crate::planner::graph::GroupingResolution;
use crate::stack::{ExecutionError, Group, GroupedTuple, GroupingCollector};
use crate::tuple::{Comparator, Tuple};
use crossbeam_channel::Sender;
use std::cmp::Ordering;

/// Buffers grouped tuples and hands them back as ordered groups.
///
/// Keys are ordered with their comparators. Within a key, members are
/// ordered by the sort fields when the grouping declares them and keep
/// their arrival order otherwise.
#[derive(Debug)]
pub struct Shuffle {
    grouping: String,
    key_comparators: Vec<Comparator>,
    sort_comparators: Vec<Comparator>,
    reverse: bool,
    buckets: usize,
    max_tuples: usize,
    entries: Vec<GroupedTuple>,
}

impl Shuffle {
    pub fn new(grouping: &str, resolution: &GroupingResolution, buckets: usize, max_tuples: usize) -> Self {
        Self {
            grouping: grouping.to_string(),
            key_comparators: resolution.key_comparators.clone(),
            sort_comparators: resolution.sort_comparators.clone(),
            reverse: resolution.reverse,
            buckets: buckets.max(1),
            max_tuples,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, tuple: GroupedTuple) -> Result<(), ExecutionError> {
        if self.entries.len() >= self.max_tuples {
            return Err(ExecutionError::ResourceExhaustion {
                element: self.grouping.clone(),
                message: format!("shuffle exceeded {} buffered tuples", self.max_tuples),
            });
        }
        self.entries.push(tuple);
        Ok(())
    }

    fn compare_sort(&self, a: &Option<Tuple>, b: &Option<Tuple>) -> Ordering {
        let ordering = match (a, b) {
            (Some(a), Some(b)) => Comparator::compare_tuples(a, b, &self.sort_comparators),
            _ => Ordering::Equal,
        };
        if self.reverse {
            ordering.reverse()
        } else {
            ordering
        }
    }

    /// Sort everything buffered and split it into groups.
    pub fn into_groups(mut self) -> Vec<Group> {
        let mut entries = std::mem::take(&mut self.entries);
        // Stable, so equal keys and sorts keep their arrival order.
        entries.sort_by(|a, b| {
            Comparator::compare_tuples(&a.key, &b.key, &self.key_comparators)
                .then_with(|| self.compare_sort(&a.sort, &b.sort))
        });

        let mut groups: Vec<Group> = Vec::new();
        for entry in entries {
            let same_key = groups.last().is_some_and(|group| {
                Comparator::compare_tuples(&group.key, &entry.key, &self.key_comparators) == Ordering::Equal
            });
            if !same_key {
                groups.push(Group::new(entry.key.clone(), vec![Vec::new(); self.buckets]));
            }
            if let Some(group) = groups.last_mut() {
                let bucket = entry.ordinal.min(self.buckets - 1);
                group.members[bucket].push(entry.value);
            }
        }
        tracing::debug!("Shuffle for '{}' produced {} groups", self.grouping, groups.len());
        groups
    }
}

/// Map-side workers stream their grouped output to the shuffle thread.
impl GroupingCollector for Sender<GroupedTuple> {
    fn collect(&mut self, tuple: GroupedTuple) -> Result<(), ExecutionError> {
        self.send(tuple)
            .map_err(|_| ExecutionError::internal("shuffle", "shuffle stopped accepting tuples"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::Joiner;
    use crate::tuple;
    use crate::tuple::{Fields, Selector};

    fn resolution(sorted: bool, reverse: bool) -> GroupingResolution {
        GroupingResolution {
            key_selectors: vec![Selector::Positions(vec![0])],
            sort_selectors: vec![sorted.then(|| Selector::Positions(vec![1]))],
            key_fields: Fields::from("k"),
            key_comparators: vec![Comparator::Natural],
            sort_comparators: if sorted { vec![Comparator::Natural] } else { Vec::new() },
            reverse,
            input_fields: vec![Fields::from(["k", "v"])],
            input_arities: vec![Some(2)],
            values: Fields::from(["k", "v"]),
            joiner: Joiner::Inner,
        }
    }

    fn grouped(ordinal: usize, key: &str, value: i64, sort: bool) -> GroupedTuple {
        GroupedTuple {
            ordinal,
            key: tuple![key],
            sort: sort.then(|| tuple![value]),
            value: tuple![key, value],
        }
    }

    #[test]
    fn test_groups_by_key_in_arrival_order() {
        let mut shuffle = Shuffle::new("g", &resolution(false, false), 1, 100);
        for (key, value) in [("b", 1), ("a", 2), ("b", 3), ("a", 4)] {
            shuffle.push(grouped(0, key, value, false)).unwrap();
        }
        let groups = shuffle.into_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, tuple!["a"]);
        assert_eq!(groups[0].members, vec![vec![tuple!["a", 2], tuple!["a", 4]]]);
        assert_eq!(groups[1].members, vec![vec![tuple!["b", 1], tuple!["b", 3]]]);
    }

    #[test]
    fn test_secondary_sort_and_reverse() {
        let mut shuffle = Shuffle::new("g", &resolution(true, false), 1, 100);
        for value in [3, 1, 2] {
            shuffle.push(grouped(0, "a", value, true)).unwrap();
        }
        let values: Vec<Tuple> = shuffle.into_groups().remove(0).members.remove(0);
        assert_eq!(values, vec![tuple!["a", 1], tuple!["a", 2], tuple!["a", 3]]);

        let mut shuffle = Shuffle::new("g", &resolution(true, true), 1, 100);
        for value in [3, 1, 2] {
            shuffle.push(grouped(0, "a", value, true)).unwrap();
        }
        let values: Vec<Tuple> = shuffle.into_groups().remove(0).members.remove(0);
        assert_eq!(values, vec![tuple!["a", 3], tuple!["a", 2], tuple!["a", 1]]);
    }

    #[test]
    fn test_buckets_by_ordinal() {
        let mut shuffle = Shuffle::new("g", &resolution(false, false), 2, 100);
        shuffle.push(grouped(1, "a", 1, false)).unwrap();
        shuffle.push(grouped(0, "a", 2, false)).unwrap();
        let groups = shuffle.into_groups();
        assert_eq!(groups[0].members, vec![vec![tuple!["a", 2]], vec![tuple!["a", 1]]]);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut shuffle = Shuffle::new("g", &resolution(false, false), 1, 1);
        shuffle.push(grouped(0, "a", 1, false)).unwrap();
        let err = shuffle.push(grouped(0, "a", 2, false)).unwrap_err();
        assert!(matches!(err, ExecutionError::ResourceExhaustion { .. }));
        assert!(!err.is_trappable());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_groups_partition_the_input(pairs in prop::collection::vec((0i64..5, 0i64..100), 0..60)) {
            let mut shuffle = Shuffle::new("g", &resolution(true, false), 1, usize::MAX);
            for &(key, value) in &pairs {
                shuffle.push(GroupedTuple {
                    ordinal: 0,
                    key: tuple![key],
                    sort: Some(tuple![value]),
                    value: tuple![key, value],
                }).unwrap();
            }
            let groups = shuffle.into_groups();

            prop_assert_eq!(groups.iter().map(Group::len).sum::<usize>(), pairs.len());
            for window in groups.windows(2) {
                prop_assert!(window[0].key < window[1].key);
            }
            for group in &groups {
                let values: Vec<&Tuple> = group.members[0].iter().collect();
                prop_assert!(values.windows(2).all(|w| w[0].get(1) <= w[1].get(1)));
                prop_assert!(values.iter().all(|v| v.get(0) == group.key.get(0)));
            }
        }
    }
}
