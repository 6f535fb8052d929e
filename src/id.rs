//! Identity types for assemblies, element graphs and flows.
//!
//! All IDs are newtypes over `u32` that serve as direct array indices
//! into their respective storage vectors, providing O(1) lookup.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! index_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(u32::MAX);

            #[inline]
            pub fn is_valid(self) -> bool {
                self != Self::INVALID
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if *self == Self::INVALID {
                    write!(f, concat!(stringify!($name), "(INVALID)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

index_id!(
    /// Index into `PipeAssembly::nodes`.
    PipeId
);

index_id!(
    /// Index into `ElementGraph::elements`.
    ElementId
);

index_id!(
    /// Position of a stage in a flow's schedule.
    StageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_id() {
        let id = PipeId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!PipeId::INVALID.is_valid());
    }

    #[test]
    fn test_element_id_debug() {
        assert_eq!(format!("{:?}", ElementId(3)), "ElementId(3)");
        assert_eq!(format!("{}", ElementId::INVALID), "ElementId(INVALID)");
    }

    #[test]
    fn test_stage_id_ordering() {
        assert!(StageId(0) < StageId(1));
        assert_eq!(StageId::from_index(7).index(), 7);
    }
}
