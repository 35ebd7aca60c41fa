// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier newtypes used throughout the engine.

use std::fmt;

/// Node of the cluster a view lives on (its "space").
///
/// Space zero is a valid node like any other; ids are dense and assigned by
/// the embedding runtime when the grid is brought up.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpaceId(pub u16);

/// Field within an allocation's field space.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldId(pub u32);

/// Reduction operator id. Zero means "no reduction".
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RedopId(pub u32);

impl RedopId {
    /// The distinguished "not a reduction" operator.
    pub const NONE: Self = Self(0);

    /// Returns true when this names an actual reduction operator.
    #[must_use]
    pub fn is_reduction(self) -> bool {
        self.0 != 0
    }
}

/// Handle naming a node of the external region tree.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionHandle(pub u64);

/// Handle naming a physical allocation managed outside the engine.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocId(pub u64);

/// Context id of the task that owns a view's user epochs.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextId(pub u64);

/// Address of a child region within its parent region node.
///
/// The invalid color marks an analysis entering a view from the view's own
/// region rather than from below; every interference cut-off that reasons
/// about sibling disjointness first checks `is_valid`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChildColor(pub u32);

impl ChildColor {
    /// Sentinel used at the root of a traversal.
    pub const INVALID: Self = Self(u32::MAX);

    /// Returns true when this addresses an actual child.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for ChildColor {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for ChildColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ChildColor({})", self.0)
        } else {
            write!(f, "ChildColor(invalid)")
        }
    }
}

/// Which of the four view kinds a [`ViewId`] names.
///
/// The kind is packed into the low two bits of the id so a message handler
/// on a foreign node can dispatch before the object itself has arrived.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViewKind {
    /// View backed by a concrete physical allocation.
    Materialized,
    /// View accumulating reduction contributions.
    Reduction,
    /// Immutable snapshot tree of a sub-region at a version.
    Composite,
    /// View whose contents are a constant value.
    Fill,
}

impl ViewKind {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Self::Materialized,
            1 => Self::Reduction,
            2 => Self::Composite,
            _ => Self::Fill,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Self::Materialized => 0,
            Self::Reduction => 1,
            Self::Composite => 2,
            Self::Fill => 3,
        }
    }
}

/// Cluster-unique view identifier.
///
/// Layout: bits 63..48 carry the owner [`SpaceId`], bits 47..2 a sequence
/// number allocated by the owner, bits 1..0 the [`ViewKind`]. The owner and
/// kind are therefore recoverable from the id alone, which is what lets a
/// remote node route a request for a view it has never seen.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViewId(pub u64);

/// Number of sequence values available per owner space.
pub const VIEW_SEQUENCE_LIMIT: u64 = 1 << 46;

impl ViewId {
    /// Packs an id from its parts. `sequence` must be below
    /// [`VIEW_SEQUENCE_LIMIT`]; the runtime's allocator enforces this.
    #[must_use]
    pub fn pack(owner: SpaceId, sequence: u64, kind: ViewKind) -> Self {
        debug_assert!(sequence < VIEW_SEQUENCE_LIMIT);
        Self((u64::from(owner.0) << 48) | (sequence << 2) | kind.to_bits())
    }

    /// Owner space encoded in the id.
    #[must_use]
    pub fn owner(self) -> SpaceId {
        SpaceId((self.0 >> 48) as u16)
    }

    /// View kind encoded in the id.
    #[must_use]
    pub fn kind(self) -> ViewKind {
        ViewKind::from_bits(self.0)
    }

    /// Sequence number encoded in the id.
    #[must_use]
    pub fn sequence(self) -> u64 {
        (self.0 >> 2) & (VIEW_SEQUENCE_LIMIT - 1)
    }
}

impl fmt::Debug for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ViewId({:?}@{} #{})",
            self.kind(),
            self.owner().0,
            self.sequence()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_id_round_trips_its_parts() {
        let id = ViewId::pack(SpaceId(7), 12345, ViewKind::Composite);
        assert_eq!(id.owner(), SpaceId(7));
        assert_eq!(id.sequence(), 12345);
        assert_eq!(id.kind(), ViewKind::Composite);
    }

    #[test]
    fn kind_bits_are_distinct() {
        let kinds = [
            ViewKind::Materialized,
            ViewKind::Reduction,
            ViewKind::Composite,
            ViewKind::Fill,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(
                    ViewId::pack(SpaceId(0), 1, *a),
                    ViewId::pack(SpaceId(0), 1, *b)
                );
            }
        }
    }

    #[test]
    fn invalid_color_is_default() {
        assert!(!ChildColor::default().is_valid());
        assert!(ChildColor(0).is_valid());
    }
}
