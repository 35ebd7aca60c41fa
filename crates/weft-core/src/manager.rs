// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Interface to the physical allocation manager, plus the version and
//! reservation plumbing that rides along with it.
//!
//! The engine computes orderings; the manager performs copies. Every
//! planner hands the manager typed work items (field tuples, a merged
//! precondition event, an optional intersection region) and records the
//! completion event it gets back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::event::Event;
use crate::ident::{AllocId, FieldId, RedopId, RegionHandle};
use crate::mask::FieldMask;
use crate::user::FieldVersions;

/// One field of a copy operation, resolved to its allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CopyField {
    /// Allocation the field lives in.
    pub alloc: AllocId,
    /// Field within the allocation.
    pub field: FieldId,
}

/// Handle to an atomic-coherence lock leased from a root view's owner.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reservation(pub u64);

static NEXT_RESERVATION: AtomicU64 = AtomicU64::new(1);

impl Reservation {
    /// Mints a fresh reservation handle. Only root-view owners create them.
    #[must_use]
    pub fn create() -> Self {
        Self(NEXT_RESERVATION.fetch_add(1, Ordering::Relaxed))
    }
}

/// Frozen version context for one analysis traversal.
///
/// Carries the upper-bound region node (the hierarchy recursion stops
/// there) and the per-node field versions consulted by the same-version
/// write-after-read skip.
#[derive(Clone, Default)]
pub struct VersionInfo {
    upper_bound: Option<RegionHandle>,
    versions: BTreeMap<RegionHandle, Arc<FieldVersions>>,
}

impl VersionInfo {
    /// Version info with no upper bound and no versions; analyses never
    /// recurse above the view they entered and never take the version skip.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the upper-bound node.
    #[must_use]
    pub fn with_upper_bound(mut self, node: RegionHandle) -> Self {
        self.upper_bound = Some(node);
        self
    }

    /// Records the field versions for `node`.
    #[must_use]
    pub fn with_versions(mut self, node: RegionHandle, versions: Arc<FieldVersions>) -> Self {
        self.versions.insert(node, versions);
        self
    }

    /// True when `node` is the traversal's upper bound.
    #[must_use]
    pub fn is_upper_bound(&self, node: RegionHandle) -> bool {
        self.upper_bound == Some(node)
    }

    /// Versions recorded for `node`, if any.
    #[must_use]
    pub fn versions_for(&self, node: RegionHandle) -> Option<&Arc<FieldVersions>> {
        self.versions.get(&node)
    }

    /// The upper-bound node, if one is set.
    #[must_use]
    pub fn upper_bound(&self) -> Option<RegionHandle> {
        self.upper_bound
    }

    /// Iterates the recorded per-node versions.
    pub fn iter_versions(&self) -> impl Iterator<Item = (RegionHandle, &Arc<FieldVersions>)> + '_ {
        self.versions.iter().map(|(node, v)| (*node, v))
    }
}

/// Operations the engine asks of a physical allocation.
///
/// Implementations are read-only from the engine's perspective; the engine
/// holds no lock across any of these calls.
pub trait Allocation: Send + Sync {
    /// Identity of the allocation.
    fn id(&self) -> AllocId;

    /// Fields actually allocated; every mask stored in a view over this
    /// allocation stays within it.
    fn allocated_fields(&self) -> FieldMask;

    /// Event that must precede first use of the allocation, or the
    /// no-event once the memory is ready.
    fn use_event(&self) -> Event;

    /// Resolves a mask to concrete copy fields, in ascending field order.
    fn copy_fields(&self, mask: &FieldMask) -> Vec<CopyField> {
        (self.allocated_fields() & *mask)
            .iter()
            .map(|field| CopyField {
                alloc: self.id(),
                field,
            })
            .collect()
    }

    /// Issues one grouped copy from `src_fields` to `dst_fields` after
    /// `precondition`, optionally clipped to `intersect`. Returns the copy's
    /// completion event.
    fn issue_copy(
        &self,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        precondition: Event,
        intersect: Option<RegionHandle>,
    ) -> Event;

    /// Issues a constant fill of `dst_fields` after `precondition`.
    fn issue_fill(
        &self,
        dst_fields: &[CopyField],
        value: &[u8],
        precondition: Event,
        intersect: Option<RegionHandle>,
    ) -> Event;

    /// Issues a reduction from `src_fields` into `dst_fields` under `redop`.
    /// `fold` selects reduction-into-reduction layout.
    fn issue_reduction(
        &self,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        redop: RedopId,
        precondition: Event,
        fold: bool,
        intersect: Option<RegionHandle>,
    ) -> Event;
}
