// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Materialized views: the read/write views backed by a physical
//! allocation, and the heart of the dependency analyzer.
//!
//! The analyzer runs in two passes over the epoch tables. The read-locked
//! pass walks `current` computing preconditions plus the `dominated` mask
//! (fields where every current user is strictly older than the caller),
//! then walks `previous` restricted to the non-dominated fields. Mutations
//! observed along the way (triggered events, superseded previous users,
//! domination moves) are applied afterwards under the write lock, so
//! readers never block each other during analysis.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::collect::ReferenceKind;
use crate::event::{Event, UserEvent};
use crate::ident::{ChildColor, ContextId, FieldId, RegionHandle, SpaceId, ViewId};
use crate::manager::{Allocation, CopyField, Reservation, VersionInfo};
use crate::mask::FieldMask;
use crate::runtime::{EngineError, Runtime};
use crate::usage::{check_dependence, RegionUsage};
use crate::user::{EpochTables, FieldVersions, PhysicalUser};
use crate::views::{LogicalView, ViewBase};
use crate::wire::{Message, UpdateEntry, UpdatePayload, WireUser};

struct MaterializedState {
    tables: EpochTables,
    children: BTreeMap<ChildColor, Arc<MaterializedView>>,
    atomic_reservations: BTreeMap<FieldId, Reservation>,
    initial_user_events: BTreeSet<Event>,
    recycle_events: BTreeSet<Event>,
}

/// A view backed by a concrete physical allocation.
pub struct MaterializedView {
    base: ViewBase,
    manager: Arc<dyn Allocation>,
    parent: Option<Arc<MaterializedView>>,
    context: ContextId,
    state: RwLock<MaterializedState>,
}

impl MaterializedView {
    /// Creates a view (owner side or replica side; `owner` decides which).
    /// Replicas register themselves with their owner immediately.
    pub fn create(
        runtime: &Arc<Runtime>,
        did: ViewId,
        owner: SpaceId,
        region: RegionHandle,
        manager: Arc<dyn Allocation>,
        parent: Option<Arc<MaterializedView>>,
        context: ContextId,
    ) -> Arc<Self> {
        let view = Arc::new(Self {
            base: ViewBase::new(runtime, did, owner, region),
            manager,
            parent,
            context,
            state: RwLock::new(MaterializedState {
                tables: EpochTables::new(),
                children: BTreeMap::new(),
                atomic_reservations: BTreeMap::new(),
                initial_user_events: BTreeSet::new(),
                recycle_events: BTreeSet::new(),
            }),
        });
        if view.parent.is_some() {
            // The parent's children map holds the structural edge.
            view.base.refs().add(ReferenceKind::NestedResource, 1);
        }
        if !view.base.is_owner() {
            view.base.send_remote_registration();
        }
        debug!(did = ?view.base.did(), region = region.0, "materialized view created");
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

    /// The backing allocation.
    #[must_use]
    pub fn manager(&self) -> &Arc<dyn Allocation> {
        &self.manager
    }

    /// Region-tree node the view covers.
    #[must_use]
    pub fn region(&self) -> RegionHandle {
        self.base.region()
    }

    /// Parent view covering a strictly larger region of the allocation.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<MaterializedView>> {
        self.parent.as_ref()
    }

    /// Owning task context.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// True when this node owns the view.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.base.is_owner()
    }

    /// True when the allocation carries every field of `space_mask`.
    #[must_use]
    pub fn has_space(&self, space_mask: &FieldMask) -> bool {
        self.manager.allocated_fields().dominates(space_mask)
    }

    /// Resolves `mask` to copy destination fields.
    #[must_use]
    pub fn copy_to(&self, copy_mask: &FieldMask) -> Vec<CopyField> {
        self.manager.copy_fields(copy_mask)
    }

    /// Resolves `mask` to copy source fields.
    #[must_use]
    pub fn copy_from(&self, copy_mask: &FieldMask) -> Vec<CopyField> {
        self.manager.copy_fields(copy_mask)
    }

    /// Destination fields for a reduction into this view. Materialized
    /// targets never fold.
    #[must_use]
    pub fn reduce_to(&self, copy_mask: &FieldMask) -> (Vec<CopyField>, bool) {
        (self.manager.copy_fields(copy_mask), false)
    }

    // -----------------------------------------------------------------
    // Task-path analysis
    // -----------------------------------------------------------------

    /// Registers a task user, returning the merged event the task must wait
    /// for. Newly tracked term events schedule a deferred collection; atomic
    /// usages also deposit their reservation handles into `atomic_locks`.
    pub fn add_user(
        self: &Arc<Self>,
        usage: &RegionUsage,
        term_event: &Event,
        user_mask: &FieldMask,
        version_info: &VersionInfo,
        mut atomic_locks: Option<&mut Vec<(Reservation, bool)>>,
    ) -> Event {
        let mut wait_on = BTreeSet::new();
        let start_use = self.manager.use_event();
        if start_use.exists() {
            wait_on.insert(start_use);
        }
        if self.parent.is_some() && !version_info.is_upper_bound(self.region()) {
            let local_color = self.local_color();
            if let Some(parent) = self.parent.as_ref() {
                parent.add_user_above(usage, term_event, local_color, version_info, user_mask, &mut wait_on);
            }
        }
        let issue_collect = self.add_local_user(
            usage,
            term_event,
            true,
            ChildColor::INVALID,
            version_info,
            user_mask,
            &mut wait_on,
        );
        if issue_collect {
            let view = LogicalView::Materialized(Arc::clone(self));
            self.base.runtime().defer_collect_user(&view, term_event);
        }
        debug_assert!(!wait_on.contains(term_event), "task waiting on itself");
        if usage.is_atomic() {
            if let Some(locks) = atomic_locks.as_deref_mut() {
                for (_, reservation) in self.find_atomic_reservations(user_mask) {
                    locks.push((reservation, usage.is_write()));
                }
            }
        }
        Event::merge(wait_on.iter())
    }

    fn add_user_above(
        &self,
        usage: &RegionUsage,
        term_event: &Event,
        child_color: ChildColor,
        version_info: &VersionInfo,
        user_mask: &FieldMask,
        preconditions: &mut BTreeSet<Event>,
    ) {
        if self.parent.is_some() && !version_info.is_upper_bound(self.region()) {
            let local_color = self.local_color();
            if let Some(parent) = self.parent.as_ref() {
                parent.add_user_above(usage, term_event, local_color, version_info, user_mask, preconditions);
            }
        }
        // Ancestors never launch the collection task; the base call does.
        let _ = self.add_local_user(
            usage,
            term_event,
            false,
            child_color,
            version_info,
            user_mask,
            preconditions,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn add_local_user(
        &self,
        usage: &RegionUsage,
        term_event: &Event,
        base_user: bool,
        child_color: ChildColor,
        version_info: &VersionInfo,
        user_mask: &FieldMask,
        preconditions: &mut BTreeSet<Event>,
    ) -> bool {
        let mut dead_events = Vec::new();
        let mut filter_previous: BTreeMap<Event, FieldMask> = BTreeMap::new();
        let dominated;
        {
            let state = self.state.read();
            let mut observed = FieldMask::EMPTY;
            let mut non_dominated = FieldMask::EMPTY;
            for (event, users) in state.tables.current() {
                // Cheap probe first so triggered entries skip the tests.
                if event.has_triggered() {
                    dead_events.push(event.clone());
                    continue;
                }
                if event == term_event {
                    continue;
                }
                if preconditions.contains(event) {
                    continue;
                }
                if user_mask.disjoint(users.mask()) {
                    continue;
                }
                for (user, mask) in users.iter() {
                    // Once this event is recorded we are done with it.
                    if self.analyze_current_task(
                        event,
                        user,
                        &mask,
                        usage,
                        user_mask,
                        child_color,
                        preconditions,
                        &mut observed,
                        &mut non_dominated,
                    ) {
                        break;
                    }
                }
            }
            // Only fields we actually observed are safe to dominate.
            dominated = observed & (*user_mask - non_dominated);
            let non_dominated = *user_mask - dominated;
            let skip_analysis = non_dominated.is_empty();
            for (event, users) in state.tables.previous() {
                if event.has_triggered() {
                    dead_events.push(event.clone());
                    continue;
                }
                if event == term_event {
                    continue;
                }
                if preconditions.contains(event) {
                    continue;
                }
                if !dominated.is_empty() {
                    let dom_overlap = *users.mask() & dominated;
                    if !dom_overlap.is_empty() {
                        filter_previous.insert(event.clone(), dom_overlap);
                    }
                }
                if skip_analysis {
                    continue;
                }
                if non_dominated.disjoint(users.mask()) {
                    continue;
                }
                for (user, mask) in users.iter() {
                    if self.analyze_previous_task(
                        event,
                        user,
                        &mask,
                        usage,
                        &non_dominated,
                        child_color,
                        preconditions,
                    ) {
                        break;
                    }
                }
            }
        }
        let new_user = if term_event.exists() {
            // Versions matter only to the WAR skip, which only reads them
            // off read-only users.
            let versions = if usage.is_read_only() {
                version_info.versions_for(self.region()).cloned()
            } else {
                None
            };
            Some(PhysicalUser::new(*usage, child_color, versions))
        } else {
            None
        };
        // Retake the lock exclusively for clean-up and the install.
        let mut state = self.state.write();
        for event in &dead_events {
            state.tables.filter_local(event);
        }
        if !filter_previous.is_empty() {
            state.tables.filter_previous(&filter_previous);
        }
        if !dominated.is_empty() {
            state.tables.filter_current(&dominated);
        }
        if let Some(user) = new_user {
            state.tables.add_current(user, term_event.clone(), *user_mask);
            if state.tables.note_outstanding(term_event.clone()) {
                return base_user;
            }
        }
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_current_task(
        &self,
        event: &Event,
        user: &Arc<PhysicalUser>,
        user_mask: &FieldMask,
        next_usage: &RegionUsage,
        next_mask: &FieldMask,
        child_color: ChildColor,
        preconditions: &mut BTreeSet<Event>,
        observed: &mut FieldMask,
        non_dominated: &mut FieldMask,
    ) -> bool {
        let overlap = *user_mask & *next_mask;
        if overlap.is_empty() {
            return false;
        }
        *observed |= overlap;
        if child_color.is_valid() {
            // Same child: the analysis already happened below us.
            if child_color == user.child {
                *non_dominated |= overlap;
                return false;
            }
            // Disjoint children cannot interfere.
            if user.child.is_valid()
                && self
                    .base
                    .runtime()
                    .region_tree()
                    .children_disjoint(self.region(), child_color, user.child)
            {
                *non_dominated |= overlap;
                return false;
            }
        }
        if check_dependence(&user.usage, next_usage).is_ordering() {
            preconditions.insert(event.clone());
            true
        } else {
            *non_dominated |= overlap;
            false
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_previous_task(
        &self,
        event: &Event,
        user: &Arc<PhysicalUser>,
        user_mask: &FieldMask,
        next_usage: &RegionUsage,
        next_mask: &FieldMask,
        child_color: ChildColor,
        preconditions: &mut BTreeSet<Event>,
    ) -> bool {
        if child_color.is_valid() {
            if child_color == user.child {
                return false;
            }
            if user.child.is_valid()
                && self
                    .base
                    .runtime()
                    .region_tree()
                    .children_disjoint(self.region(), child_color, user.child)
            {
                return false;
            }
        }
        let overlap = *user_mask & *next_mask;
        if overlap.is_empty() {
            return false;
        }
        if check_dependence(&user.usage, next_usage).is_ordering() {
            preconditions.insert(event.clone());
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------
    // Copy-path analysis
    // -----------------------------------------------------------------

    /// Computes the mask-keyed precondition map a copy must wait on before
    /// touching this view's fields.
    pub fn find_copy_preconditions(
        &self,
        redop: crate::ident::RedopId,
        reading: bool,
        copy_mask: &FieldMask,
        version_info: &VersionInfo,
        preconditions: &mut BTreeMap<Event, FieldMask>,
    ) {
        let start_use = self.manager.use_event();
        if start_use.exists() {
            merge_precondition(preconditions, &start_use, copy_mask);
        }
        if self.parent.is_some() && !version_info.is_upper_bound(self.region()) {
            let local_color = self.local_color();
            if let Some(parent) = self.parent.as_ref() {
                parent.find_copy_preconditions_above(
                    redop,
                    reading,
                    copy_mask,
                    local_color,
                    version_info,
                    preconditions,
                );
            }
        }
        self.find_local_copy_preconditions(
            redop,
            reading,
            copy_mask,
            ChildColor::INVALID,
            version_info,
            preconditions,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn find_copy_preconditions_above(
        &self,
        redop: crate::ident::RedopId,
        reading: bool,
        copy_mask: &FieldMask,
        child_color: ChildColor,
        version_info: &VersionInfo,
        preconditions: &mut BTreeMap<Event, FieldMask>,
    ) {
        if self.parent.is_some() && !version_info.is_upper_bound(self.region()) {
            let local_color = self.local_color();
            if let Some(parent) = self.parent.as_ref() {
                parent.find_copy_preconditions_above(
                    redop,
                    reading,
                    copy_mask,
                    local_color,
                    version_info,
                    preconditions,
                );
            }
        }
        self.find_local_copy_preconditions(
            redop,
            reading,
            copy_mask,
            child_color,
            version_info,
            preconditions,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn find_local_copy_preconditions(
        &self,
        redop: crate::ident::RedopId,
        reading: bool,
        copy_mask: &FieldMask,
        child_color: ChildColor,
        version_info: &VersionInfo,
        preconditions: &mut BTreeMap<Event, FieldMask>,
    ) {
        // Version data is only sound at the bottom of the version set.
        let versions = if child_color.is_valid() {
            None
        } else {
            version_info.versions_for(self.region())
        };
        let mut dead_events = Vec::new();
        let mut filter_previous: BTreeMap<Event, FieldMask> = BTreeMap::new();
        let dominated;
        {
            let state = self.state.read();
            let mut observed = FieldMask::EMPTY;
            let mut non_dominated = FieldMask::EMPTY;
            for (event, users) in state.tables.current() {
                if event.has_triggered() {
                    dead_events.push(event.clone());
                    continue;
                }
                if copy_mask.disjoint(users.mask()) {
                    continue;
                }
                // Unlike the task path, every user must be visited: copies
                // need precise per-field masks for each event.
                for (user, mask) in users.iter() {
                    self.analyze_current_copy(
                        event,
                        user,
                        &mask,
                        redop,
                        reading,
                        copy_mask,
                        child_color,
                        versions.map(|v| v.as_ref()),
                        preconditions,
                        &mut observed,
                        &mut non_dominated,
                    );
                }
            }
            dominated = observed & (*copy_mask - non_dominated);
            let non_dominated = *copy_mask - dominated;
            let skip_analysis = non_dominated.is_empty();
            for (event, users) in state.tables.previous() {
                if event.has_triggered() {
                    dead_events.push(event.clone());
                    continue;
                }
                if !dominated.is_empty() {
                    let dom_overlap = *users.mask() & dominated;
                    if !dom_overlap.is_empty() {
                        filter_previous.insert(event.clone(), dom_overlap);
                    }
                }
                if skip_analysis {
                    continue;
                }
                if non_dominated.disjoint(users.mask()) {
                    continue;
                }
                for (user, mask) in users.iter() {
                    self.analyze_previous_copy(
                        event,
                        user,
                        &mask,
                        redop,
                        reading,
                        &non_dominated,
                        child_color,
                        versions.map(|v| v.as_ref()),
                        preconditions,
                    );
                }
            }
        }
        if !dead_events.is_empty() || !filter_previous.is_empty() || !dominated.is_empty() {
            let mut state = self.state.write();
            for event in &dead_events {
                state.tables.filter_local(event);
            }
            if !filter_previous.is_empty() {
                state.tables.filter_previous(&filter_previous);
            }
            if !dominated.is_empty() {
                state.tables.filter_current(&dominated);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_current_copy(
        &self,
        event: &Event,
        user: &Arc<PhysicalUser>,
        user_mask: &FieldMask,
        redop: crate::ident::RedopId,
        reading: bool,
        copy_mask: &FieldMask,
        child_color: ChildColor,
        versions: Option<&FieldVersions>,
        preconditions: &mut BTreeMap<Event, FieldMask>,
        observed: &mut FieldMask,
        non_dominated: &mut FieldMask,
    ) {
        let overlap = *copy_mask & *user_mask;
        if overlap.is_empty() {
            return;
        }
        *observed |= overlap;
        if child_color.is_valid() {
            if child_color == user.child {
                *non_dominated |= overlap;
                return;
            }
            if user.child.is_valid()
                && self
                    .base
                    .runtime()
                    .region_tree()
                    .children_disjoint(self.region(), child_color, user.child)
            {
                *non_dominated |= overlap;
                return;
            }
        }
        // Readers never conflict with readers.
        if reading && user.usage.is_read_only() {
            *non_dominated |= overlap;
            return;
        }
        // Reductions under the same operator commute.
        if redop.is_reduction() && user.usage.redop == redop {
            *non_dominated |= overlap;
            return;
        }
        // A writer re-producing the version a reader consumed does not
        // invalidate the reader.
        if !reading
            && !redop.is_reduction()
            && versions.map_or(false, |v| {
                !user.usage.is_reduce() && user.same_versions(&overlap, v)
            })
        {
            *non_dominated |= overlap;
            return;
        }
        merge_precondition(preconditions, event, &overlap);
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_previous_copy(
        &self,
        event: &Event,
        user: &Arc<PhysicalUser>,
        user_mask: &FieldMask,
        redop: crate::ident::RedopId,
        reading: bool,
        copy_mask: &FieldMask,
        child_color: ChildColor,
        versions: Option<&FieldVersions>,
        preconditions: &mut BTreeMap<Event, FieldMask>,
    ) {
        if child_color.is_valid() {
            if child_color == user.child {
                return;
            }
            if user.child.is_valid()
                && self
                    .base
                    .runtime()
                    .region_tree()
                    .children_disjoint(self.region(), child_color, user.child)
            {
                return;
            }
        }
        let overlap = *user_mask & *copy_mask;
        if overlap.is_empty() {
            return;
        }
        if reading && user.usage.is_read_only() {
            return;
        }
        if redop.is_reduction() && user.usage.redop == redop {
            return;
        }
        if !reading
            && !redop.is_reduction()
            && versions.map_or(false, |v| {
                !user.usage.is_reduce() && user.same_versions(&overlap, v)
            })
        {
            return;
        }
        merge_precondition(preconditions, event, &overlap);
    }

    /// Registers a copy's user record once the copy has been issued.
    pub fn add_copy_user(
        self: &Arc<Self>,
        redop: crate::ident::RedopId,
        copy_term: &Event,
        version_info: &VersionInfo,
        copy_mask: &FieldMask,
        reading: bool,
    ) {
        // A copy without a completion event is already done.
        if !copy_term.exists() {
            return;
        }
        let usage = copy_usage(redop, reading);
        if self.parent.is_some() && !version_info.is_upper_bound(self.region()) {
            let local_color = self.local_color();
            if let Some(parent) = self.parent.as_ref() {
                parent.add_copy_user_above(&usage, copy_term, local_color, version_info, copy_mask);
            }
        }
        self.add_local_copy_user(&usage, copy_term, true, ChildColor::INVALID, version_info, copy_mask);
    }

    fn add_copy_user_above(
        self: &Arc<Self>,
        usage: &RegionUsage,
        copy_term: &Event,
        child_color: ChildColor,
        version_info: &VersionInfo,
        copy_mask: &FieldMask,
    ) {
        if self.parent.is_some() && !version_info.is_upper_bound(self.region()) {
            let local_color = self.local_color();
            if let Some(parent) = self.parent.as_ref() {
                parent.add_copy_user_above(usage, copy_term, local_color, version_info, copy_mask);
            }
        }
        self.add_local_copy_user(usage, copy_term, false, child_color, version_info, copy_mask);
    }

    fn add_local_copy_user(
        self: &Arc<Self>,
        usage: &RegionUsage,
        copy_term: &Event,
        base_user: bool,
        child_color: ChildColor,
        version_info: &VersionInfo,
        copy_mask: &FieldMask,
    ) {
        let versions = if usage.is_read_only() {
            version_info.versions_for(self.region()).cloned()
        } else {
            None
        };
        let user = PhysicalUser::new(*usage, child_color, versions);
        let issue_collect = {
            let mut state = self.state.write();
            state.tables.add_current(user, copy_term.clone(), *copy_mask);
            state.tables.note_outstanding(copy_term.clone()) && base_user
        };
        if issue_collect {
            let view = LogicalView::Materialized(Arc::clone(self));
            self.base.runtime().defer_collect_user(&view, copy_term);
        }
    }

    // -----------------------------------------------------------------
    // WAR probe
    // -----------------------------------------------------------------

    /// Cheap probe: would a writer with `usage` anti-depend on a recorded
    /// reader anywhere in this view's hierarchy?
    #[must_use]
    pub fn has_war_dependence(&self, usage: &RegionUsage, user_mask: &FieldMask) -> bool {
        // Readers and reducers never form WAR edges.
        if usage.is_read_only() || usage.is_reduce() {
            return false;
        }
        if self.has_local_war_dependence(user_mask) {
            return true;
        }
        self.parent
            .as_ref()
            .map_or(false, |parent| parent.has_war_dependence_above(user_mask))
    }

    fn has_war_dependence_above(&self, user_mask: &FieldMask) -> bool {
        if self.has_local_war_dependence(user_mask) {
            return true;
        }
        self.parent
            .as_ref()
            .map_or(false, |parent| parent.has_war_dependence_above(user_mask))
    }

    fn has_local_war_dependence(&self, user_mask: &FieldMask) -> bool {
        let state = self.state.read();
        let mut observed = FieldMask::EMPTY;
        for users in state.tables.current().values() {
            let overlap = *user_mask & *users.mask();
            if overlap.is_empty() {
                continue;
            }
            observed |= overlap;
            for (user, mask) in users.iter() {
                if !(*user_mask & mask).is_empty() && user.usage.is_read_only() {
                    return true;
                }
            }
        }
        let not_observed = *user_mask - observed;
        if !not_observed.is_empty() {
            for users in state.tables.previous().values() {
                if not_observed.disjoint(users.mask()) {
                    continue;
                }
                for (user, mask) in users.iter() {
                    if !(not_observed & mask).is_empty() && user.usage.is_read_only() {
                        return true;
                    }
                }
            }
        }
        false
    }

    // -----------------------------------------------------------------
    // Initial users, collection, bookkeeping
    // -----------------------------------------------------------------

    /// Seeds the epoch table at view construction; no collection task is
    /// launched, teardown drains these.
    pub fn add_initial_user(&self, term_event: &Event, usage: &RegionUsage, user_mask: &FieldMask) {
        let user = PhysicalUser::new(*usage, ChildColor::INVALID, None);
        let mut state = self.state.write();
        state.tables.add_current(user, term_event.clone(), *user_mask);
        state.initial_user_events.insert(term_event.clone());
        let _ = state.tables.note_outstanding(term_event.clone());
    }

    /// Drops the user records of `term_events` here and in every ancestor.
    pub fn collect_users(&self, term_events: &[Event]) {
        {
            let mut state = self.state.write();
            for event in term_events {
                state.tables.filter_local(event);
            }
        }
        if let Some(parent) = self.parent.as_ref() {
            parent.collect_users(term_events);
        }
    }

    /// Removes one event's records; runs behind the view lock.
    pub fn filter_local_users(&self, term_event: &Event) {
        self.state.write().tables.filter_local(term_event);
    }

    /// Snapshots the outstanding collection events.
    pub fn accumulate_events(&self, all_events: &mut BTreeSet<Event>) {
        self.state.read().tables.accumulate_events(all_events);
    }

    /// Runs `f` against the epoch tables under the read lock. Intended for
    /// assertions and debugging; analysis goes through the real entry
    /// points.
    pub fn with_epochs<R>(&self, f: impl FnOnce(&EpochTables) -> R) -> R {
        f(&self.state.read().tables)
    }

    /// Events fencing reuse of child allocations torn down under this view.
    #[must_use]
    pub fn recycle_events(&self) -> BTreeSet<Event> {
        self.state.read().recycle_events.clone()
    }

    fn local_color(&self) -> ChildColor {
        self.base.runtime().region_tree().color_of(self.region())
    }

    // -----------------------------------------------------------------
    // Subviews
    // -----------------------------------------------------------------

    /// Fetches or materializes the subview at `color`.
    ///
    /// Owners create missing children directly (freeing the eagerly
    /// allocated id if a racing call won); non-owners round-trip to the
    /// owner for the child's id, then resolve it like any remote view. No
    /// lock is held while waiting.
    pub fn get_materialized_subview(
        self: &Arc<Self>,
        color: ChildColor,
    ) -> Result<Arc<MaterializedView>, EngineError> {
        {
            let state = self.state.read();
            if let Some(child) = state.children.get(&color) {
                return Ok(Arc::clone(child));
            }
        }
        let runtime = Arc::clone(self.base.runtime());
        if self.is_owner() {
            let child_region = runtime.region_tree().child_of(self.region(), color);
            // Allocate the id eagerly, outside the lock.
            let child_did = runtime.allocate_view_id(crate::ident::ViewKind::Materialized)?;
            let mut state = self.state.write();
            if let Some(child) = state.children.get(&color) {
                // Lost the race; return the id.
                let child = Arc::clone(child);
                drop(state);
                runtime.free_view_id(child_did);
                return Ok(child);
            }
            let child = MaterializedView::create(
                &runtime,
                child_did,
                self.base.owner(),
                child_region,
                Arc::clone(&self.manager),
                Some(Arc::clone(self)),
                self.context,
            );
            state.children.insert(color, Arc::clone(&child));
            drop(state);
            runtime.register_view(LogicalView::Materialized(Arc::clone(&child)));
            Ok(child)
        } else {
            let (reply_slot, completion) = runtime.allocate_reply_slot();
            runtime.send(
                self.base.owner(),
                &Message::SubviewDidRequest {
                    parent: self.did(),
                    color,
                    reply_slot,
                    completion: completion.id(),
                },
            );
            completion.wait();
            let child_did = runtime
                .take_reply_slot(reply_slot)
                .ok_or(EngineError::UnknownView(self.did()))?;
            let child = runtime
                .find_or_request_logical_view(child_did)?
                .expect_materialized()?;
            let mut state = self.state.write();
            state.children.insert(color, Arc::clone(&child));
            Ok(child)
        }
    }

    // -----------------------------------------------------------------
    // Atomic reservations
    // -----------------------------------------------------------------

    /// Collects the reservation handles for the atomic-coherence fields of
    /// `mask`. Non-root views forward to the root; non-owner roots batch a
    /// request to the owner for fields they have not leased yet.
    pub fn find_atomic_reservations(
        self: &Arc<Self>,
        mask: &FieldMask,
    ) -> Vec<(FieldId, Reservation)> {
        if let Some(parent) = self.parent.as_ref() {
            return parent.find_atomic_reservations(mask);
        }
        let atomic_fields: Vec<FieldId> = (self.manager.allocated_fields() & *mask).iter().collect();
        if self.is_owner() {
            return self.find_field_reservations(&atomic_fields);
        }
        let mut found = Vec::new();
        let mut needed = Vec::new();
        {
            let state = self.state.read();
            for field in &atomic_fields {
                match state.atomic_reservations.get(field) {
                    Some(reservation) => found.push((*field, *reservation)),
                    None => needed.push(*field),
                }
            }
        }
        if !needed.is_empty() {
            let runtime = self.base.runtime();
            let completion = UserEvent::create();
            runtime.register_completion(&completion);
            runtime.send(
                self.base.owner(),
                &Message::AtomicReservationRequest {
                    did: self.did(),
                    fields: needed.clone(),
                    completion: completion.event().id(),
                },
            );
            completion.event().wait();
            let state = self.state.read();
            for field in &needed {
                if let Some(reservation) = state.atomic_reservations.get(field) {
                    found.push((*field, *reservation));
                }
            }
        }
        found
    }

    /// Owner-side lookup, creating reservations for fields that never had
    /// atomic coherence requested before.
    pub fn find_field_reservations(&self, fields: &[FieldId]) -> Vec<(FieldId, Reservation)> {
        let mut state = self.state.write();
        fields
            .iter()
            .map(|field| {
                let reservation = *state
                    .atomic_reservations
                    .entry(*field)
                    .or_insert_with(Reservation::create);
                (*field, reservation)
            })
            .collect()
    }

    /// Replica-side install of leased reservation handles.
    pub fn update_field_reservations(&self, pairs: &[(FieldId, Reservation)]) {
        let mut state = self.state.write();
        for (field, reservation) in pairs {
            state.atomic_reservations.insert(*field, *reservation);
        }
    }

    // -----------------------------------------------------------------
    // Remote replication
    // -----------------------------------------------------------------

    /// Owner-side announce to `target`.
    pub fn send_view(&self, target: SpaceId) {
        debug_assert!(self.is_owner());
        self.base.runtime().send(
            target,
            &Message::MaterializedViewAnnounce {
                did: self.did(),
                manager: self.manager.id(),
                parent: self.parent.as_ref().map(|p| p.did()),
                region: self.region(),
                owner: self.base.owner(),
                context: self.context,
            },
        );
        self.base.update_remote_instances(target);
    }

    /// Ships the epoch entries overlapping `update_mask` to `target`.
    pub fn send_view_updates(&self, target: SpaceId, update_mask: &FieldMask) {
        let runtime = self.base.runtime();
        let (update, events) = {
            let state = self.state.read();
            let mut packer = UpdatePacker::default();
            let current = packer.pack_epoch(state.tables.current(), update_mask);
            let previous = packer.pack_epoch(state.tables.previous(), update_mask);
            (
                UpdatePayload {
                    users: packer.users,
                    current,
                    previous,
                },
                packer.events,
            )
        };
        // Intern the shipped events so the receiver resolves the handles.
        for event in &events {
            runtime.events().register(event);
        }
        runtime.send(
            target,
            &Message::MaterializedUpdate {
                is_region: true,
                handle: self.region(),
                did: self.did(),
                update,
            },
        );
    }

    /// Applies a shipped update with the same primitives local inserts use;
    /// events new to this replica schedule their own deferred collection.
    pub fn process_update(
        self: &Arc<Self>,
        update: &UpdatePayload,
        _source: SpaceId,
    ) -> Result<(), EngineError> {
        let runtime = Arc::clone(self.base.runtime());
        let users: Vec<Arc<PhysicalUser>> = update
            .users
            .iter()
            .map(|wire| {
                PhysicalUser::from_wire(
                    wire.usage,
                    wire.child,
                    wire.versions.clone().map(Arc::new),
                )
            })
            .collect();
        let mut collect_events = Vec::new();
        {
            let mut state = self.state.write();
            for (event_id, blocks) in &update.current {
                let event = runtime
                    .events()
                    .resolve(*event_id)
                    .ok_or(EngineError::UnknownEvent(*event_id))?;
                for (index, mask) in blocks {
                    let user = users
                        .get(*index as usize)
                        .ok_or(EngineError::BadUserIndex(*index))?;
                    state.tables.add_current(Arc::clone(user), event.clone(), *mask);
                }
                if state.tables.note_outstanding(event.clone()) {
                    collect_events.push(event);
                }
            }
            for (event_id, blocks) in &update.previous {
                let event = runtime
                    .events()
                    .resolve(*event_id)
                    .ok_or(EngineError::UnknownEvent(*event_id))?;
                for (index, mask) in blocks {
                    let user = users
                        .get(*index as usize)
                        .ok_or(EngineError::BadUserIndex(*index))?;
                    state.tables.add_previous(Arc::clone(user), event.clone(), *mask);
                }
                if state.tables.note_outstanding(event.clone()) {
                    collect_events.push(event);
                }
            }
        }
        if !collect_events.is_empty() {
            if let Some(parent) = self.parent.as_ref() {
                parent.update_gc_events(&collect_events);
            }
            let view = LogicalView::Materialized(Arc::clone(self));
            for event in &collect_events {
                runtime.defer_collect_user(&view, event);
            }
        }
        Ok(())
    }

    fn update_gc_events(&self, gc_events: &[Event]) {
        if let Some(parent) = self.parent.as_ref() {
            parent.update_gc_events(gc_events);
        }
        let mut state = self.state.write();
        for event in gc_events {
            let _ = state.tables.note_outstanding(event.clone());
        }
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Lifecycle teardown: capture child recycle fences, return leased
    /// reservations, drain initial users, leave the directory, and tell
    /// the owner if we are a replica.
    pub fn destroy(&self) {
        let initial: Vec<Event> = {
            let mut state = self.state.write();
            let children: Vec<Arc<MaterializedView>> = state.children.values().cloned().collect();
            for child in children {
                let mut fence = BTreeSet::new();
                child.accumulate_events(&mut fence);
                state.recycle_events.extend(fence);
            }
            state.atomic_reservations.clear();
            state.initial_user_events.iter().cloned().collect()
        };
        for event in &initial {
            self.filter_local_users(event);
        }
        self.base.runtime().unregister_view(self.did());
        if !self.is_owner() {
            self.base.send_remote_unregistration();
        }
    }
}

fn copy_usage(redop: crate::ident::RedopId, reading: bool) -> RegionUsage {
    use crate::usage::{Coherence, Privilege};
    if reading {
        RegionUsage::new(Privilege::ReadOnly, Coherence::Exclusive, crate::ident::RedopId::NONE)
    } else if redop.is_reduction() {
        RegionUsage::new(Privilege::Reduce, Coherence::Exclusive, redop)
    } else {
        RegionUsage::new(Privilege::ReadWrite, Coherence::Exclusive, crate::ident::RedopId::NONE)
    }
}

/// Merges `mask` into `preconditions[event]`.
pub(crate) fn merge_precondition(
    preconditions: &mut BTreeMap<Event, FieldMask>,
    event: &Event,
    mask: &FieldMask,
) {
    preconditions
        .entry(event.clone())
        .and_modify(|m| *m |= *mask)
        .or_insert(*mask);
}

/// Builds the deduplicated user table while packing epochs.
#[derive(Default)]
pub(crate) struct UpdatePacker {
    pub(crate) users: Vec<WireUser>,
    pub(crate) events: Vec<Event>,
    indices: BTreeMap<u64, u32>,
}

impl UpdatePacker {
    fn index_of(&mut self, user: &Arc<PhysicalUser>) -> u32 {
        if let Some(index) = self.indices.get(&user.serial()) {
            return *index;
        }
        let index = self.users.len() as u32;
        self.users.push(WireUser {
            usage: user.usage,
            child: user.child,
            versions: user.versions.as_deref().cloned(),
        });
        self.indices.insert(user.serial(), index);
        index
    }

    pub(crate) fn pack_epoch(
        &mut self,
        epoch: &BTreeMap<Event, crate::user::EventUsers>,
        update_mask: &FieldMask,
    ) -> Vec<UpdateEntry> {
        let mut entries = Vec::new();
        for (event, users) in epoch {
            let overlap = *users.mask() & *update_mask;
            if overlap.is_empty() {
                continue;
            }
            let mut blocks = Vec::new();
            for (user, mask) in users.iter() {
                let user_overlap = mask & overlap;
                if user_overlap.is_empty() {
                    continue;
                }
                blocks.push((self.index_of(user), user_overlap));
            }
            self.events.push(event.clone());
            entries.push((event.id(), blocks));
        }
        entries
    }
}
