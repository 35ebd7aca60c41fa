// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The view kinds and their shared header.
//!
//! A view is a named, reference-counted way of reading or writing a region
//! of data, and the subject of all dependency analysis. The four kinds are
//! modeled as a tagged sum over shared [`ViewBase`] state; dispatch that
//! the original expressed through virtual inheritance is an exhaustive
//! match here.

mod composite;
mod fill;
mod materialized;
mod reduction;

pub use composite::{CaptureState, CompositeNode, CompositeView, Simplified};
pub use fill::FillView;
pub use materialized::MaterializedView;
pub use reduction::ReductionView;

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collect::{RefLedger, ReferenceKind};
use crate::event::Event;
use crate::ident::{ChildColor, RegionHandle, SpaceId, ViewId, ViewKind};
use crate::runtime::{EngineError, Runtime};
use crate::wire::Message;

/// State shared by every view kind.
pub(crate) struct ViewBase {
    did: ViewId,
    owner: SpaceId,
    region: RegionHandle,
    runtime: Arc<Runtime>,
    refs: RefLedger,
    /// Spaces holding a replica; owner-side only.
    remote_instances: Mutex<BTreeSet<SpaceId>>,
}

impl ViewBase {
    pub(crate) fn new(
        runtime: &Arc<Runtime>,
        did: ViewId,
        owner: SpaceId,
        region: RegionHandle,
    ) -> Self {
        Self {
            did,
            owner,
            region,
            runtime: Arc::clone(runtime),
            refs: RefLedger::new(),
            remote_instances: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn did(&self) -> ViewId {
        self.did
    }

    pub(crate) fn owner(&self) -> SpaceId {
        self.owner
    }

    pub(crate) fn region(&self) -> RegionHandle {
        self.region
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub(crate) fn refs(&self) -> &RefLedger {
        &self.refs
    }

    pub(crate) fn is_owner(&self) -> bool {
        self.owner == self.runtime.space()
    }

    /// Registers this replica with its owner; called from replica
    /// constructors. The replica holds a remote-did reference on itself
    /// until torn down.
    pub(crate) fn send_remote_registration(&self) {
        debug_assert!(!self.is_owner());
        self.refs.add(ReferenceKind::RemoteDid, 1);
        self.runtime.send(
            self.owner,
            &Message::RemoteRegistration {
                did: self.did,
                source: self.runtime.space(),
                add: true,
            },
        );
    }

    /// Tells the owner this replica is going away.
    pub(crate) fn send_remote_unregistration(&self) {
        self.runtime.send(
            self.owner,
            &Message::RemoteRegistration {
                did: self.did,
                source: self.runtime.space(),
                add: false,
            },
        );
    }

    /// Records that `target` now holds a replica announced by us.
    pub(crate) fn update_remote_instances(&self, target: SpaceId) {
        self.remote_instances.lock().insert(target);
    }

    pub(crate) fn note_remote_instance(&self, source: SpaceId, add: bool) {
        let mut instances = self.remote_instances.lock();
        if add {
            instances.insert(source);
            self.refs.add(ReferenceKind::RemoteDid, 1);
        } else {
            instances.remove(&source);
            let _ = self.refs.remove(ReferenceKind::RemoteDid, 1);
        }
    }

    /// Spaces currently holding replicas.
    pub(crate) fn remote_instances(&self) -> Vec<SpaceId> {
        self.remote_instances.lock().iter().copied().collect()
    }
}

/// A reference to any view kind.
#[derive(Clone)]
pub enum LogicalView {
    /// View backed by a physical allocation.
    Materialized(Arc<MaterializedView>),
    /// View accumulating reduction contributions.
    Reduction(Arc<ReductionView>),
    /// Immutable snapshot of a sub-tree at a version.
    Composite(Arc<CompositeView>),
    /// Constant-valued view.
    Fill(Arc<FillView>),
}

impl LogicalView {
    /// Cluster-unique id of the view.
    #[must_use]
    pub fn did(&self) -> ViewId {
        self.base().did()
    }

    /// The view's kind.
    #[must_use]
    pub fn kind(&self) -> ViewKind {
        match self {
            Self::Materialized(_) => ViewKind::Materialized,
            Self::Reduction(_) => ViewKind::Reduction,
            Self::Composite(_) => ViewKind::Composite,
            Self::Fill(_) => ViewKind::Fill,
        }
    }

    /// Region-tree node of the view.
    #[must_use]
    pub fn region(&self) -> RegionHandle {
        self.base().region()
    }

    /// Reference ledger of the view.
    #[must_use]
    pub fn refs(&self) -> &RefLedger {
        self.base().refs()
    }

    pub(crate) fn base(&self) -> &ViewBase {
        match self {
            Self::Materialized(v) => v.base(),
            Self::Reduction(v) => v.base(),
            Self::Composite(v) => v.base(),
            Self::Fill(v) => v.base(),
        }
    }

    /// True for materialized and reduction views (the instance views).
    #[must_use]
    pub fn is_instance_view(&self) -> bool {
        matches!(self, Self::Materialized(_) | Self::Reduction(_))
    }

    /// True for composite and fill views (the deferred views).
    #[must_use]
    pub fn is_deferred_view(&self) -> bool {
        matches!(self, Self::Composite(_) | Self::Fill(_))
    }

    /// The materialized payload, if that is what this is.
    #[must_use]
    pub fn as_materialized(&self) -> Option<&Arc<MaterializedView>> {
        match self {
            Self::Materialized(v) => Some(v),
            _ => None,
        }
    }

    /// The reduction payload, if that is what this is.
    #[must_use]
    pub fn as_reduction(&self) -> Option<&Arc<ReductionView>> {
        match self {
            Self::Reduction(v) => Some(v),
            _ => None,
        }
    }

    /// The composite payload, if that is what this is.
    #[must_use]
    pub fn as_composite(&self) -> Option<&Arc<CompositeView>> {
        match self {
            Self::Composite(v) => Some(v),
            _ => None,
        }
    }

    /// The fill payload, if that is what this is.
    #[must_use]
    pub fn as_fill(&self) -> Option<&Arc<FillView>> {
        match self {
            Self::Fill(v) => Some(v),
            _ => None,
        }
    }

    /// Materialized payload or the misrouting error.
    pub fn expect_materialized(&self) -> Result<Arc<MaterializedView>, EngineError> {
        self.as_materialized().cloned().ok_or(EngineError::WrongViewKind {
            did: self.did(),
            expected: ViewKind::Materialized,
        })
    }

    /// Reduction payload or the misrouting error.
    pub fn expect_reduction(&self) -> Result<Arc<ReductionView>, EngineError> {
        self.as_reduction().cloned().ok_or(EngineError::WrongViewKind {
            did: self.did(),
            expected: ViewKind::Reduction,
        })
    }

    /// Subview at `color`. Materialized views materialize an actual child;
    /// reduction and deferred views do not subdivide and return themselves.
    pub fn get_subview(&self, color: ChildColor) -> Result<Self, EngineError> {
        match self {
            Self::Materialized(v) => Ok(Self::Materialized(v.get_materialized_subview(color)?)),
            _ => Ok(self.clone()),
        }
    }

    /// Owner-side announce of this view to `target`.
    pub fn send_view(&self, target: SpaceId) {
        match self {
            Self::Materialized(v) => v.send_view(target),
            Self::Reduction(v) => v.send_view(target),
            Self::Composite(v) => v.send_view(target),
            Self::Fill(v) => v.send_view(target),
        }
    }

    /// Removes the user records of `events`. Deferred views hold no user
    /// epochs and ignore the call.
    pub fn collect_users(&self, events: &[Event]) {
        match self {
            Self::Materialized(v) => v.collect_users(events),
            Self::Reduction(v) => v.collect_users(events),
            Self::Composite(_) | Self::Fill(_) => {}
        }
    }

    pub(crate) fn note_remote_instance(&self, source: SpaceId, add: bool) {
        self.base().note_remote_instance(source, add);
    }

    /// Adds `count` valid references. Replicas forward the delta to their
    /// owner, which keeps the authoritative count.
    pub fn add_valid_ref(&self, count: u32) {
        let base = self.base();
        base.refs().add(ReferenceKind::Valid, count);
        if !base.is_owner() {
            base.runtime().send(
                base.owner(),
                &Message::RemoteValidUpdate {
                    did: base.did(),
                    count,
                    add: true,
                },
            );
        }
    }

    /// Removes `count` valid references, forwarding the delta for
    /// replicas; returns true when every counter reached zero.
    #[must_use]
    pub fn remove_valid_ref(&self, count: u32) -> bool {
        let base = self.base();
        if !base.is_owner() {
            base.runtime().send(
                base.owner(),
                &Message::RemoteValidUpdate {
                    did: base.did(),
                    count,
                    add: false,
                },
            );
        }
        base.refs().remove(ReferenceKind::Valid, count)
    }

    /// Lifecycle teardown once the last reference is gone: directory
    /// removal, owner notification for replicas, per-kind cleanup.
    pub fn destroy(&self) {
        match self {
            Self::Materialized(v) => v.destroy(),
            Self::Reduction(v) => v.destroy(),
            Self::Composite(v) => v.destroy(),
            Self::Fill(v) => v.destroy(),
        }
    }
}

impl std::fmt::Debug for LogicalView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.did())
    }
}
