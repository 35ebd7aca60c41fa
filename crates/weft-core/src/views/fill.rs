// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fill views: views whose contents are a constant value.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::event::{compute_event_sets, Event};
use crate::ident::{RegionHandle, SpaceId, ViewId};
use crate::mask::FieldMask;
use crate::runtime::Runtime;
use crate::views::{MaterializedView, ViewBase};
use crate::wire::Message;

/// A view that produces a scalar fill on demand.
pub struct FillView {
    base: ViewBase,
    value: Arc<Vec<u8>>,
}

impl FillView {
    /// Creates the view around its constant payload.
    pub fn create(
        runtime: &Arc<Runtime>,
        did: ViewId,
        owner: SpaceId,
        region: RegionHandle,
        value: Arc<Vec<u8>>,
    ) -> Arc<Self> {
        let view = Arc::new(Self {
            base: ViewBase::new(runtime, did, owner, region),
            value,
        });
        if !view.base.is_owner() {
            view.base.send_remote_registration();
        }
        debug!(did = ?view.base.did(), bytes = view.value.len(), "fill view created");
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

    /// Region-tree node the fill covers.
    #[must_use]
    pub fn region(&self) -> RegionHandle {
        self.base.region()
    }

    /// The constant payload.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Plans the fills that give `dst` the constant on `copy_mask`:
    /// preconditions are partitioned into equal-event-set groups and one
    /// fill is issued per group, so `postconditions` ends up with exactly
    /// one event per field.
    pub fn issue_deferred_copies(
        &self,
        dst: &Arc<MaterializedView>,
        copy_mask: &FieldMask,
        preconditions: &BTreeMap<Event, FieldMask>,
        postconditions: &mut BTreeMap<Event, FieldMask>,
    ) {
        let intersect = if self.region() == dst.region() {
            None
        } else {
            Some(self.region())
        };
        for set in compute_event_sets(*copy_mask, preconditions) {
            let dst_fields = dst.copy_to(&set.mask);
            let fill_pre = Event::merge(set.events.iter());
            let fill_post = dst
                .manager()
                .issue_fill(&dst_fields, &self.value, fill_pre, intersect);
            if fill_post.exists() {
                postconditions.insert(fill_post, set.mask);
            }
        }
    }

    /// Owner-side announce: ships the payload bytes.
    pub fn send_view(&self, target: SpaceId) {
        debug_assert!(self.base.is_owner());
        self.base.runtime().send(
            target,
            &Message::FillViewAnnounce {
                did: self.did(),
                owner: self.base.owner(),
                handle: self.region(),
                value: self.value.as_ref().clone(),
            },
        );
        self.base.update_remote_instances(target);
    }

    /// Lifecycle teardown.
    pub fn destroy(&self) {
        self.base.runtime().unregister_view(self.did());
        if !self.base.is_owner() {
            self.base.send_remote_unregistration();
        }
    }
}
