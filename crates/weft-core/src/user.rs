// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! User records and the per-event epoch tables.
//!
//! Every operation that touches a view leaves a [`PhysicalUser`] behind,
//! keyed by its completion event. The [`EpochTables`] hold two layers of
//! them: `current` for users not yet dominated by anything newer, and
//! `previous` for users superseded on some fields but not yet collected.
//! The dependency analyzer walks these tables read-locked and applies its
//! mutations (dead-event pruning, domination moves) in a second, exclusive
//! pass through the primitives defined here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::event::Event;
use crate::ident::{ChildColor, FieldId};
use crate::mask::FieldMask;
use crate::usage::RegionUsage;

static NEXT_USER_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Field-version snapshot attached to read-only users.
///
/// Versions exist for exactly one purpose: letting a later writer skip the
/// write-after-read dependency when it writes the same version the reader
/// read (the reader's data cannot be invalidated by re-producing it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldVersions {
    versions: BTreeMap<FieldId, u64>,
}

impl FieldVersions {
    /// Empty version set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `field` at `version`.
    pub fn insert(&mut self, field: FieldId, version: u64) {
        self.versions.insert(field, version);
    }

    /// Version recorded for `field`, if any.
    #[must_use]
    pub fn get(&self, field: FieldId) -> Option<u64> {
        self.versions.get(&field).copied()
    }

    /// Iterates the recorded `(field, version)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (FieldId, u64)> + '_ {
        self.versions.iter().map(|(f, v)| (*f, *v))
    }

    /// True when both sides record an identical version for every field of
    /// `overlap`.
    #[must_use]
    pub fn same_versions(&self, overlap: &FieldMask, other: &Self) -> bool {
        overlap.iter().all(|field| {
            matches!((self.get(field), other.get(field)), (Some(a), Some(b)) if a == b)
        })
    }
}

impl FromIterator<(FieldId, u64)> for FieldVersions {
    fn from_iter<I: IntoIterator<Item = (FieldId, u64)>>(iter: I) -> Self {
        Self {
            versions: iter.into_iter().collect(),
        }
    }
}

/// Immutable record of one prior user of a view.
///
/// Shared between the current and previous epochs and across nodes after
/// serialization; the process-unique `serial` provides the identity that
/// keys multi-user maps and wire deduplication tables.
#[derive(Debug)]
pub struct PhysicalUser {
    serial: u64,
    /// How the user accessed its fields.
    pub usage: RegionUsage,
    /// Child the user was registered against, or invalid for the view's own
    /// region.
    pub child: ChildColor,
    /// Field versions; present only for read-only users.
    pub versions: Option<Arc<FieldVersions>>,
}

impl PhysicalUser {
    /// Creates a shared user record.
    #[must_use]
    pub fn new(
        usage: RegionUsage,
        child: ChildColor,
        versions: Option<Arc<FieldVersions>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            serial: NEXT_USER_SERIAL.fetch_add(1, Ordering::Relaxed),
            usage,
            child,
            versions,
        })
    }

    /// Rebuilds a record received over the wire, minting a fresh local
    /// serial.
    #[must_use]
    pub fn from_wire(
        usage: RegionUsage,
        child: ChildColor,
        versions: Option<Arc<FieldVersions>>,
    ) -> Arc<Self> {
        Self::new(usage, child, versions)
    }

    /// Process-unique identity.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// True when this user recorded versions matching `versions` on all of
    /// `overlap`.
    #[must_use]
    pub fn same_versions(&self, overlap: &FieldMask, versions: &FieldVersions) -> bool {
        self.versions
            .as_ref()
            .map_or(false, |own| own.same_versions(overlap, versions))
    }
}

enum UserSet {
    Single(Arc<PhysicalUser>),
    Multi(BTreeMap<u64, (Arc<PhysicalUser>, FieldMask)>),
}

/// Compact per-event bucket of users.
///
/// Holds either one user (whose mask is the summary) or a map of users; the
/// single form is promoted to the map on second insertion and the map
/// collapses back to single when it shrinks to one entry. The summary mask
/// is always the union of the per-user masks.
pub struct EventUsers {
    mask: FieldMask,
    set: UserSet,
}

impl EventUsers {
    pub(crate) fn new(user: Arc<PhysicalUser>, mask: FieldMask) -> Self {
        Self {
            mask,
            set: UserSet::Single(user),
        }
    }

    /// Summary mask: union of all contained per-user masks.
    #[must_use]
    pub fn mask(&self) -> &FieldMask {
        &self.mask
    }

    /// True when the bucket holds a single user.
    #[must_use]
    pub fn is_single(&self) -> bool {
        matches!(self.set, UserSet::Single(_))
    }

    /// Number of distinct users in the bucket.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.set {
            UserSet::Single(_) => 1,
            UserSet::Multi(map) => map.len(),
        }
    }

    /// True when the bucket carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Iterates `(user, mask)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<PhysicalUser>, FieldMask)> + '_ {
        // Chained option iterators keep a single concrete type for both arms.
        let (single, multi) = match &self.set {
            UserSet::Single(user) => (Some((user, self.mask)), None),
            UserSet::Multi(map) => (None, Some(map.values().map(|(u, m)| (u, *m)))),
        };
        single.into_iter().chain(multi.into_iter().flatten())
    }

    /// Inserts `user` over `mask`, merging masks when the user is already
    /// present. Merging (rather than overwriting) keeps remote updates
    /// idempotent.
    pub(crate) fn insert(&mut self, user: Arc<PhysicalUser>, mask: FieldMask) {
        match &mut self.set {
            UserSet::Single(existing) if existing.serial() == user.serial() => {}
            UserSet::Single(existing) => {
                // Promote: the existing single's per-user mask is the
                // pre-insert summary.
                let mut map = BTreeMap::new();
                map.insert(existing.serial(), (Arc::clone(existing), self.mask));
                map.insert(user.serial(), (user, mask));
                self.set = UserSet::Multi(map);
            }
            UserSet::Multi(map) => {
                map.entry(user.serial())
                    .and_modify(|(_, m)| *m |= mask)
                    .or_insert((user, mask));
            }
        }
        self.mask |= mask;
    }

    /// Removes the `sub`-overlapping portion of every user, returning the
    /// removed `(user, mask)` parts. Users whose mask empties are dropped
    /// and a two-entry map that shrinks to one collapses back to single.
    fn split_off(&mut self, sub: &FieldMask) -> Vec<(Arc<PhysicalUser>, FieldMask)> {
        let overlap = self.mask & *sub;
        if overlap.is_empty() {
            return Vec::new();
        }
        self.mask -= overlap;
        match &mut self.set {
            UserSet::Single(user) => vec![(Arc::clone(user), overlap)],
            UserSet::Multi(map) => {
                let mut moved = Vec::new();
                map.retain(|_, (user, mask)| {
                    let part = *mask & *sub;
                    if part.is_empty() {
                        return true;
                    }
                    moved.push((Arc::clone(user), part));
                    *mask -= part;
                    !mask.is_empty()
                });
                self.collapse();
                moved
            }
        }
    }

    /// Subtracts `sub` from every user, discarding emptied users.
    fn subtract(&mut self, sub: &FieldMask) {
        let overlap = self.mask & *sub;
        if overlap.is_empty() {
            return;
        }
        self.mask -= overlap;
        if let UserSet::Multi(map) = &mut self.set {
            map.retain(|_, (_, mask)| {
                *mask -= *sub;
                !mask.is_empty()
            });
            self.collapse();
        }
    }

    fn collapse(&mut self) {
        if let UserSet::Multi(map) = &mut self.set {
            if map.len() == 1 {
                let (_, (user, mask)) = map.pop_first().unwrap_or_else(|| unreachable!());
                debug_assert_eq!(mask, self.mask);
                self.set = UserSet::Single(user);
            }
        }
    }

    /// Checks that the summary mask equals the union of per-user masks.
    /// Analysis correctness leans on this; tests call it after every
    /// mutation sequence.
    #[must_use]
    pub fn summary_consistent(&self) -> bool {
        let mut union = FieldMask::EMPTY;
        for (_, mask) in self.iter() {
            union |= mask;
        }
        union == self.mask
    }
}

/// The two dependency layers of a view plus the outstanding-collection set.
#[derive(Default)]
pub struct EpochTables {
    current: BTreeMap<Event, EventUsers>,
    previous: BTreeMap<Event, EventUsers>,
    outstanding_gc: BTreeSet<Event>,
}

impl EpochTables {
    /// Empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current-epoch entries, keyed by completion event.
    #[must_use]
    pub fn current(&self) -> &BTreeMap<Event, EventUsers> {
        &self.current
    }

    /// Previous-epoch entries, keyed by completion event.
    #[must_use]
    pub fn previous(&self) -> &BTreeMap<Event, EventUsers> {
        &self.previous
    }

    /// Events with a deferred-collection task outstanding.
    #[must_use]
    pub fn outstanding_gc(&self) -> &BTreeSet<Event> {
        &self.outstanding_gc
    }

    /// Inserts into the current epoch.
    pub fn add_current(&mut self, user: Arc<PhysicalUser>, event: Event, mask: FieldMask) {
        match self.current.entry(event) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(EventUsers::new(user, mask));
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                slot.get_mut().insert(user, mask);
            }
        }
    }

    /// Inserts into the previous epoch.
    pub fn add_previous(&mut self, user: Arc<PhysicalUser>, event: Event, mask: FieldMask) {
        match self.previous.entry(event) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(EventUsers::new(user, mask));
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                slot.get_mut().insert(user, mask);
            }
        }
    }

    /// Marks `event` as having a deferred collection scheduled; returns true
    /// when the event was not yet tracked.
    pub fn note_outstanding(&mut self, event: Event) -> bool {
        self.outstanding_gc.insert(event)
    }

    /// Drops `event` from both epochs and the outstanding set. Safe to call
    /// for events that were never recorded.
    pub fn filter_local(&mut self, event: &Event) {
        if self.outstanding_gc.remove(event) {
            self.current.remove(event);
            self.previous.remove(event);
        }
    }

    /// Moves the `dominated` fields of every current-epoch user into the
    /// previous epoch. Entries whose events already triggered are pruned
    /// outright; entries whose summary empties are erased.
    pub fn filter_current(&mut self, dominated: &FieldMask) {
        let mut moves: Vec<(Event, Vec<(Arc<PhysicalUser>, FieldMask)>)> = Vec::new();
        self.current.retain(|event, users| {
            if event.has_triggered() {
                return false;
            }
            let moved = users.split_off(dominated);
            if !moved.is_empty() {
                moves.push((event.clone(), moved));
            }
            !users.is_empty()
        });
        for (event, moved) in moves {
            for (user, mask) in moved {
                self.add_previous(user, event.clone(), mask);
            }
        }
    }

    /// Subtracts the per-event masks from the previous epoch; users whose
    /// mask empties are deleted and emptied entries erased.
    pub fn filter_previous(&mut self, filter: &BTreeMap<Event, FieldMask>) {
        for (event, mask) in filter {
            // Someone may already have removed the entry.
            let Some(users) = self.previous.get_mut(event) else {
                continue;
            };
            users.subtract(mask);
            if users.is_empty() {
                self.previous.remove(event);
            }
        }
    }

    /// Snapshots the outstanding events into `out`.
    pub fn accumulate_events(&self, out: &mut BTreeSet<Event>) {
        out.extend(self.outstanding_gc.iter().cloned());
    }

    /// True when both epochs and the outstanding set are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.is_empty() && self.outstanding_gc.is_empty()
    }

    /// Checks every bucket's summary-mask invariant.
    #[must_use]
    pub fn summaries_consistent(&self) -> bool {
        self.current
            .values()
            .chain(self.previous.values())
            .all(EventUsers::summary_consistent)
    }
}
