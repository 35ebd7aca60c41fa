// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Distributed-collectable reference accounting.
//!
//! Every view carries a [`RefLedger`] with one counter per
//! [`ReferenceKind`]. Memory safety is `Arc`'s job; the ledger's job is
//! lifecycle: a view leaves the runtime directory (and a replica notifies
//! its owner) when the last counter drops to zero.

use std::sync::atomic::{AtomicI64, Ordering};

/// The closed set of reference kinds the engine uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ReferenceKind {
    /// Structural reference; the holder relies on the object existing.
    Resource,
    /// Logical validity; the view's contents are current somewhere.
    Valid,
    /// Held while a deferred-collection task is pending.
    Gc,
    /// Held by each remote replica on its owner.
    RemoteDid,
    /// Child view on its parent, parent view on its allocation.
    NestedResource,
    /// Composite tree on the views it captured.
    CompositeNode,
}

const KIND_COUNT: usize = 6;

impl ReferenceKind {
    fn index(self) -> usize {
        match self {
            Self::Resource => 0,
            Self::Valid => 1,
            Self::Gc => 2,
            Self::RemoteDid => 3,
            Self::NestedResource => 4,
            Self::CompositeNode => 5,
        }
    }
}

/// Per-view reference counters.
#[derive(Debug, Default)]
pub struct RefLedger {
    counts: [AtomicI64; KIND_COUNT],
}

impl RefLedger {
    /// Ledger with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` references of `kind`.
    pub fn add(&self, kind: ReferenceKind, count: u32) {
        self.counts[kind.index()].fetch_add(i64::from(count), Ordering::AcqRel);
    }

    /// Removes `count` references of `kind`; returns true when every
    /// counter is now zero (the holder should tear the view down).
    #[must_use]
    pub fn remove(&self, kind: ReferenceKind, count: u32) -> bool {
        let prior = self.counts[kind.index()].fetch_sub(i64::from(count), Ordering::AcqRel);
        debug_assert!(prior >= i64::from(count), "reference underflow");
        self.total() == 0
    }

    /// Current count for `kind`.
    #[must_use]
    pub fn count(&self, kind: ReferenceKind) -> i64 {
        self.counts[kind.index()].load(Ordering::Acquire)
    }

    /// Sum across all kinds.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.counts.iter().map(|c| c.load(Ordering::Acquire)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paired_add_remove_reaches_zero() {
        let ledger = RefLedger::new();
        ledger.add(ReferenceKind::Resource, 1);
        ledger.add(ReferenceKind::Gc, 2);
        assert!(!ledger.remove(ReferenceKind::Gc, 1));
        assert!(!ledger.remove(ReferenceKind::Resource, 1));
        assert!(ledger.remove(ReferenceKind::Gc, 1));
        assert_eq!(ledger.total(), 0);
    }

    #[test]
    fn counts_are_per_kind() {
        let ledger = RefLedger::new();
        ledger.add(ReferenceKind::RemoteDid, 3);
        assert_eq!(ledger.count(ReferenceKind::RemoteDid), 3);
        assert_eq!(ledger.count(ReferenceKind::Valid), 0);
    }
}
