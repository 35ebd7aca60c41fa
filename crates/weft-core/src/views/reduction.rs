// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reduction views.
//!
//! A reduction view accumulates reduction contributions and hands them out
//! to readers. Its dependency structure is bipartite and much simpler than
//! the materialized analyzer: reducers (same operator) never wait on
//! reducers, readers never wait on readers, and any reader/reducer pair
//! with overlapping fields orders. The general dependence table is never
//! consulted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::event::Event;
use crate::ident::{ChildColor, ContextId, RedopId, RegionHandle, SpaceId, ViewId};
use crate::manager::{Allocation, CopyField, VersionInfo};
use crate::mask::FieldMask;
use crate::runtime::{EngineError, Runtime};
use crate::usage::{Coherence, Privilege, RegionUsage};
use crate::user::{EventUsers, PhysicalUser};
use crate::views::materialized::{merge_precondition, UpdatePacker};
use crate::views::{LogicalView, MaterializedView, ViewBase};
use crate::wire::{Message, UpdatePayload};

struct ReductionState {
    reducers: BTreeMap<Event, EventUsers>,
    readers: BTreeMap<Event, EventUsers>,
    outstanding_gc: BTreeSet<Event>,
    initial_user_events: BTreeSet<Event>,
}

/// A view that accumulates reduction contributions.
pub struct ReductionView {
    base: ViewBase,
    manager: Arc<dyn Allocation>,
    redop: RedopId,
    context: ContextId,
    state: RwLock<ReductionState>,
}

fn add_event_user(
    map: &mut BTreeMap<Event, EventUsers>,
    user: Arc<PhysicalUser>,
    event: Event,
    mask: FieldMask,
) {
    match map.entry(event) {
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(EventUsers::new(user, mask));
        }
        std::collections::btree_map::Entry::Occupied(mut slot) => {
            slot.get_mut().insert(user, mask);
        }
    }
}

impl ReductionView {
    /// Creates the view; replicas register with their owner.
    pub fn create(
        runtime: &Arc<Runtime>,
        did: ViewId,
        owner: SpaceId,
        region: RegionHandle,
        manager: Arc<dyn Allocation>,
        redop: RedopId,
        context: ContextId,
    ) -> Arc<Self> {
        let view = Arc::new(Self {
            base: ViewBase::new(runtime, did, owner, region),
            manager,
            redop,
            context,
            state: RwLock::new(ReductionState {
                reducers: BTreeMap::new(),
                readers: BTreeMap::new(),
                outstanding_gc: BTreeSet::new(),
                initial_user_events: BTreeSet::new(),
            }),
        });
        if !view.base.is_owner() {
            view.base.send_remote_registration();
        }
        debug!(did = ?view.base.did(), redop = redop.0, "reduction view created");
        view
    }

    pub(crate) fn base(&self) -> &ViewBase {
        &self.base
    }

    /// The view's id.
    #[must_use]
    pub fn did(&self) -> ViewId {
        self.base.did()
    }

    /// Region-tree node the view covers.
    #[must_use]
    pub fn region(&self) -> RegionHandle {
        self.base.region()
    }

    /// The reduction operator this view accumulates under.
    #[must_use]
    pub fn redop(&self) -> RedopId {
        self.redop
    }

    /// The backing reduction allocation.
    #[must_use]
    pub fn manager(&self) -> &Arc<dyn Allocation> {
        &self.manager
    }

    /// Source fields for reducing out of this view.
    #[must_use]
    pub fn reduce_from(&self, reduce_mask: &FieldMask) -> Vec<CopyField> {
        self.manager.copy_fields(reduce_mask)
    }

    /// Destination fields for folding into this view.
    #[must_use]
    pub fn reduce_to(&self, reduce_mask: &FieldMask) -> (Vec<CopyField>, bool) {
        (self.manager.copy_fields(reduce_mask), true)
    }

    /// Copy preconditions: a reading caller waits on overlapping reducers,
    /// a reducing caller waits on overlapping readers.
    pub fn find_copy_preconditions(
        &self,
        _redop: RedopId,
        reading: bool,
        copy_mask: &FieldMask,
        preconditions: &mut BTreeMap<Event, FieldMask>,
    ) {
        let use_event = self.manager.use_event();
        if use_event.exists() {
            merge_precondition(preconditions, &use_event, copy_mask);
        }
        let state = self.state.read();
        let table = if reading {
            &state.reducers
        } else {
            &state.readers
        };
        for (event, users) in table {
            if copy_mask.disjoint(users.mask()) {
                continue;
            }
            for (_, mask) in users.iter() {
                let overlap = *copy_mask & mask;
                if overlap.is_empty() {
                    continue;
                }
                merge_precondition(preconditions, event, &overlap);
            }
        }
    }

    /// Registers a completed copy's user record.
    pub fn add_copy_user(
        self: &Arc<Self>,
        redop: RedopId,
        copy_term: &Event,
        mask: &FieldMask,
        reading: bool,
    ) {
        debug_assert!(!redop.is_reduction() || redop == self.redop);
        if !copy_term.exists() {
            return;
        }
        let usage = if reading {
            RegionUsage::new(Privilege::ReadOnly, Coherence::Exclusive, RedopId::NONE)
        } else {
            RegionUsage::new(Privilege::Reduce, Coherence::Exclusive, self.redop)
        };
        let user = PhysicalUser::new(usage, ChildColor::INVALID, None);
        let issue_collect = {
            let mut state = self.state.write();
            state.add_physical_user(user, reading, copy_term.clone(), *mask);
            state.outstanding_gc.insert(copy_term.clone())
        };
        if issue_collect {
            let view = LogicalView::Reduction(Arc::clone(self));
            self.base.runtime().defer_collect_user(&view, copy_term);
        }
    }

    /// Registers a task user, returning the merged precondition event.
    /// Readers wait on reducers; reducers wait on readers.
    pub fn add_user(
        self: &Arc<Self>,
        usage: &RegionUsage,
        term_event: &Event,
        user_mask: &FieldMask,
    ) -> Event {
        debug_assert!(usage.is_read_only() || usage.redop == self.redop);
        let reading = usage.is_read_only();
        let mut wait_on = BTreeSet::new();
        let use_event = self.manager.use_event();
        if use_event.exists() {
            wait_on.insert(use_event);
        }
        let new_user = PhysicalUser::new(*usage, ChildColor::INVALID, None);
        let issue_collect = {
            // The bipartite check is cheap, hold the lock exclusively.
            let mut state = self.state.write();
            let opposite = if reading {
                &state.reducers
            } else {
                &state.readers
            };
            for (event, users) in opposite {
                if user_mask.disjoint(users.mask()) {
                    continue;
                }
                for (_, mask) in users.iter() {
                    if !(*user_mask & mask).is_empty() {
                        // One precondition per event is enough.
                        wait_on.insert(event.clone());
                        break;
                    }
                }
            }
            state.add_physical_user(new_user, reading, term_event.clone(), *user_mask);
            state.outstanding_gc.insert(term_event.clone())
        };
        if issue_collect {
            let view = LogicalView::Reduction(Arc::clone(self));
            self.base.runtime().defer_collect_user(&view, term_event);
        }
        Event::merge(wait_on.iter())
    }

    /// Seeds the tables at construction time; teardown drains these.
    pub fn add_initial_user(&self, term_event: &Event, usage: &RegionUsage, user_mask: &FieldMask) {
        let user = PhysicalUser::new(*usage, ChildColor::INVALID, None);
        let mut state = self.state.write();
        state.add_physical_user(user, usage.is_read_only(), term_event.clone(), *user_mask);
        state.initial_user_events.insert(term_event.clone());
        state.outstanding_gc.insert(term_event.clone());
    }

    /// Reduces this view's contents into `target`, composing preconditions
    /// from both sides and registering the completion on both.
    pub fn perform_reduction(
        self: &Arc<Self>,
        target: &LogicalView,
        reduce_mask: &FieldMask,
        version_info: &VersionInfo,
    ) {
        let src_fields = self.reduce_from(reduce_mask);
        let mut preconditions = BTreeMap::new();
        let (dst_fields, fold) = match target {
            LogicalView::Materialized(dst) => {
                dst.find_copy_preconditions(
                    self.redop,
                    false,
                    reduce_mask,
                    version_info,
                    &mut preconditions,
                );
                dst.reduce_to(reduce_mask)
            }
            LogicalView::Reduction(dst) => {
                dst.find_copy_preconditions(self.redop, false, reduce_mask, &mut preconditions);
                dst.reduce_to(reduce_mask)
            }
            LogicalView::Composite(_) | LogicalView::Fill(_) => {
                debug_assert!(false, "reduction into a deferred view");
                return;
            }
        };
        self.find_copy_preconditions(self.redop, true, reduce_mask, &mut preconditions);
        let reduce_pre = Event::merge(preconditions.keys());
        let reduce_post = self.manager.issue_reduction(
            &src_fields,
            &dst_fields,
            self.redop,
            reduce_pre,
            fold,
            None,
        );
        match target {
            LogicalView::Materialized(dst) => {
                dst.add_copy_user(self.redop, &reduce_post, version_info, reduce_mask, false);
            }
            LogicalView::Reduction(dst) => {
                dst.add_copy_user(self.redop, &reduce_post, reduce_mask, false);
            }
            LogicalView::Composite(_) | LogicalView::Fill(_) => {}
        }
        self.add_copy_user(self.redop, &reduce_post, reduce_mask, true);
    }

    /// Planner variant: external preconditions, optional intersection, and
    /// the destination's user record is the caller's responsibility.
    pub fn perform_deferred_reduction(
        self: &Arc<Self>,
        target: &Arc<MaterializedView>,
        reduce_mask: &FieldMask,
        preconditions: &BTreeSet<Event>,
        intersect: Option<RegionHandle>,
    ) -> Event {
        let (dst_fields, fold) = target.reduce_to(reduce_mask);
        let src_fields = self.reduce_from(reduce_mask);
        let mut src_pre = BTreeMap::new();
        self.find_copy_preconditions(self.redop, true, reduce_mask, &mut src_pre);
        let mut wait_on: BTreeSet<Event> = preconditions.clone();
        wait_on.extend(src_pre.keys().cloned());
        let reduce_pre = Event::merge(wait_on.iter());
        let reduce_post = self.manager.issue_reduction(
            &src_fields,
            &dst_fields,
            self.redop,
            reduce_pre,
            fold,
            intersect,
        );
        self.add_copy_user(self.redop, &reduce_post, reduce_mask, true);
        reduce_post
    }

    /// Drops the records of `term_events`.
    pub fn collect_users(&self, term_events: &[Event]) {
        let mut state = self.state.write();
        for event in term_events {
            state.filter_local(event);
        }
    }

    /// Removes one event's records; runs behind the view lock.
    pub fn filter_local_users(&self, term_event: &Event) {
        self.state.write().filter_local(term_event);
    }

    /// Snapshots the outstanding collection events.
    pub fn accumulate_events(&self, all_events: &mut BTreeSet<Event>) {
        let state = self.state.read();
        all_events.extend(state.outstanding_gc.iter().cloned());
    }

    /// Owner-side announce to `target`.
    pub fn send_view(&self, target: SpaceId) {
        debug_assert!(self.base.is_owner());
        self.base.runtime().send(
            target,
            &Message::ReductionViewAnnounce {
                did: self.did(),
                manager: self.manager.id(),
                region: self.region(),
                owner: self.base.owner(),
                context: self.context,
                redop: self.redop,
            },
        );
        self.base.update_remote_instances(target);
    }

    /// Ships both tables to `target`; reducers travel in the payload's
    /// current block and readers in its previous block.
    pub fn send_view_updates(&self, target: SpaceId, update_mask: &FieldMask) {
        let runtime = self.base.runtime();
        let (update, events) = {
            let state = self.state.read();
            let mut packer = UpdatePacker::default();
            let reducers = packer.pack_epoch(&state.reducers, update_mask);
            let readers = packer.pack_epoch(&state.readers, update_mask);
            (
                UpdatePayload {
                    users: packer.users,
                    current: reducers,
                    previous: readers,
                },
                packer.events,
            )
        };
        for event in &events {
            runtime.events().register(event);
        }
        runtime.send(
            target,
            &Message::ReductionUpdate {
                did: self.did(),
                update,
            },
        );
    }

    /// Applies a shipped update; events new to this replica schedule their
    /// own deferred collection.
    pub fn process_update(self: &Arc<Self>, update: &UpdatePayload) -> Result<(), EngineError> {
        let runtime = Arc::clone(self.base.runtime());
        let users: Vec<Arc<PhysicalUser>> = update
            .users
            .iter()
            .map(|wire| {
                PhysicalUser::from_wire(wire.usage, wire.child, wire.versions.clone().map(Arc::new))
            })
            .collect();
        let mut collect_events = Vec::new();
        {
            let mut state = self.state.write();
            for (reading, entries) in [(false, &update.current), (true, &update.previous)] {
                for (event_id, blocks) in entries {
                    let event = runtime
                        .events()
                        .resolve(*event_id)
                        .ok_or(EngineError::UnknownEvent(*event_id))?;
                    for (index, mask) in blocks {
                        let user = users
                            .get(*index as usize)
                            .ok_or(EngineError::BadUserIndex(*index))?;
                        state.add_physical_user(Arc::clone(user), reading, event.clone(), *mask);
                    }
                    if state.outstanding_gc.insert(event.clone()) {
                        collect_events.push(event);
                    }
                }
            }
        }
        let view = LogicalView::Reduction(Arc::clone(self));
        for event in &collect_events {
            runtime.defer_collect_user(&view, event);
        }
        Ok(())
    }

    /// Lifecycle teardown.
    pub fn destroy(&self) {
        let initial: Vec<Event> = {
            let state = self.state.read();
            state.initial_user_events.iter().cloned().collect()
        };
        for event in &initial {
            self.filter_local_users(event);
        }
        self.base.runtime().unregister_view(self.did());
        if !self.base.is_owner() {
            self.base.send_remote_unregistration();
        }
    }
}

impl ReductionState {
    fn add_physical_user(
        &mut self,
        user: Arc<PhysicalUser>,
        reading: bool,
        term_event: Event,
        user_mask: FieldMask,
    ) {
        let table = if reading {
            &mut self.readers
        } else {
            &mut self.reducers
        };
        add_event_user(table, user, term_event, user_mask);
    }

    fn filter_local(&mut self, term_event: &Event) {
        if self.outstanding_gc.remove(term_event) {
            self.reducers.remove(term_event);
            self.readers.remove(term_event);
        }
    }
}
