//! Builders for grouping and merge pipes.
//!
//! These are plain builders handed to [`PipeAssembly::group_by`],
//! [`PipeAssembly::co_group`] and [`PipeAssembly::merge`](super::PipeAssembly::merge).
//!
//! [`PipeAssembly::group_by`]: super::PipeAssembly::group_by
//! [`PipeAssembly::co_group`]: super::PipeAssembly::co_group

use crate::id::PipeId;
use crate::tuple::Fields;
use serde::{Deserialize, Serialize};

/// Groups one or more inputs on the same key fields.
#[derive(Debug, Clone)]
pub struct GroupBy {
    pub(crate) inputs: Vec<PipeId>,
    pub(crate) group_fields: Fields,
    pub(crate) sort_fields: Option<Fields>,
    pub(crate) reverse: bool,
    pub(crate) name: Option<String>,
}

impl GroupBy {
    pub fn new(input: PipeId, group_fields: impl Into<Fields>) -> Self {
        Self::merging(&[input], group_fields)
    }

    /// Group several inputs with identical schemas as one stream.
    pub fn merging(inputs: &[PipeId], group_fields: impl Into<Fields>) -> Self {
        Self {
            inputs: inputs.to_vec(),
            group_fields: group_fields.into(),
            sort_fields: None,
            reverse: false,
            name: None,
        }
    }

    /// Secondary sort applied to the members of each group.
    pub fn sort_by(mut self, sort_fields: impl Into<Fields>) -> Self {
        self.sort_fields = Some(sort_fields.into());
        self
    }

    /// Reverse the member order produced by the secondary sort.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Which inputs of a [`CoGroup`] must have members for a group to emit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Joiner {
    /// Every input is required.
    #[default]
    Inner,
    /// No input is required; missing sides are padded with nulls.
    Outer,
    /// Only the first input is required.
    Left,
    /// The first input is optional, all others are required.
    Right,
    /// `true` marks a required input, by ordinal.
    Mixed(Vec<bool>),
}

impl Joiner {
    pub fn is_required(&self, ordinal: usize) -> bool {
        match self {
            Joiner::Inner => true,
            Joiner::Outer => false,
            Joiner::Left => ordinal == 0,
            Joiner::Right => ordinal != 0,
            Joiner::Mixed(required) => required.get(ordinal).copied().unwrap_or(true),
        }
    }

    /// Whether any input may be padded with nulls.
    pub fn pads(&self, num_inputs: usize) -> bool {
        (0..num_inputs).any(|ordinal| !self.is_required(ordinal))
    }
}

/// Joins several inputs on per-input key fields.
#[derive(Debug, Clone)]
pub struct CoGroup {
    pub(crate) inputs: Vec<(PipeId, Fields)>,
    pub(crate) declared: Option<Fields>,
    pub(crate) joiner: Joiner,
    pub(crate) name: Option<String>,
}

impl CoGroup {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            declared: None,
            joiner: Joiner::Inner,
            name: None,
        }
    }

    /// Two-way join.
    pub fn join(
        lhs: PipeId,
        lhs_fields: impl Into<Fields>,
        rhs: PipeId,
        rhs_fields: impl Into<Fields>,
    ) -> Self {
        Self::new().input(lhs, lhs_fields).input(rhs, rhs_fields)
    }

    /// Join `input` with itself `copies` times on the same key.
    pub fn self_join(input: PipeId, group_fields: impl Into<Fields>, copies: usize) -> Self {
        let fields = group_fields.into();
        (0..copies).fold(Self::new(), |spec, _| spec.input(input, fields.clone()))
    }

    pub fn input(mut self, pipe: PipeId, group_fields: impl Into<Fields>) -> Self {
        self.inputs.push((pipe, group_fields.into()));
        self
    }

    /// Names for the joined values, replacing the appended input fields.
    pub fn declared(mut self, fields: impl Into<Fields>) -> Self {
        self.declared = Some(fields.into());
        self
    }

    pub fn joiner(mut self, joiner: Joiner) -> Self {
        self.joiner = joiner;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Default for CoGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Unions inputs with identical schemas without grouping.
#[derive(Debug, Clone)]
pub struct Merge {
    pub(crate) inputs: Vec<PipeId>,
    pub(crate) name: Option<String>,
}

impl Merge {
    pub fn new(inputs: &[PipeId]) -> Self {
        Self {
            inputs: inputs.to_vec(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joiner_required_inputs() {
        assert!(Joiner::Inner.is_required(3));
        assert!(!Joiner::Outer.is_required(0));
        assert!(Joiner::Left.is_required(0));
        assert!(!Joiner::Left.is_required(1));
        assert!(!Joiner::Right.is_required(0));
        assert!(Joiner::Right.is_required(1));
        let mixed = Joiner::Mixed(vec![true, false]);
        assert!(mixed.is_required(0));
        assert!(!mixed.is_required(1));
        assert!(mixed.is_required(2));
    }

    #[test]
    fn test_joiner_pads() {
        assert!(!Joiner::Inner.pads(2));
        assert!(Joiner::Left.pads(2));
        assert!(!Joiner::Left.pads(1));
    }

    #[test]
    fn test_self_join_repeats_input() {
        let spec = CoGroup::self_join(PipeId(0), "k", 3);
        assert_eq!(spec.inputs.len(), 3);
        assert!(spec.inputs.iter().all(|(p, f)| *p == PipeId(0) && *f == Fields::from("k")));
    }
}
