// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-node runtime: view directory, id allocation, message dispatch.
//!
//! One [`Runtime`] exists per cluster node. It owns the directory of views
//! living on the node (locally created or replicated), allocates view ids
//! for the views it owns, and routes the wire messages of
//! [`crate::wire::Message`] to the right view. Blocking request protocols
//! (view materialization, subview ids, reservation leases) park on events
//! with no lock held, per the engine's concurrency rules.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::event::{Event, EventTable, UserEvent};
use crate::ident::{AllocId, SpaceId, ViewId, ViewKind, VIEW_SEQUENCE_LIMIT};
use crate::manager::Allocation;
use crate::region::RegionTree;
use crate::views::{
    CompositeView, FillView, LogicalView, MaterializedView, ReductionView,
};
use crate::wire::{self, Message, WireError};

/// Fatal engine conditions.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The owner space ran out of view sequence numbers.
    #[error("view id space exhausted")]
    ViewIdExhausted,
    /// A message named a view this node does not hold.
    #[error("unknown view {0:?}")]
    UnknownView(ViewId),
    /// A DID resolved to an object of the wrong kind (protocol bug).
    #[error("view {did:?} is not a {expected:?} view")]
    WrongViewKind {
        /// The misrouted id.
        did: ViewId,
        /// Kind the handler required.
        expected: ViewKind,
    },
    /// An announce referenced an allocation this node has not registered.
    #[error("unknown allocation {0:?}")]
    UnknownAllocation(AllocId),
    /// A message carried an event id the event table cannot resolve.
    #[error("unknown event id {0}")]
    UnknownEvent(u64),
    /// An update block cited a user index outside its dedup table.
    #[error("update block cites user index {0} outside its table")]
    BadUserIndex(u32),
    /// Frame-level corruption.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Point-to-point serialized message delivery.
///
/// Implementations deliver `frame` to the runtime of `to`; the engine never
/// holds a view lock across a send, so inline (same-thread) delivery is a
/// legal implementation and is what the test grid does.
pub trait Transport: Send + Sync {
    /// Delivers one framed message.
    fn send(&self, from: SpaceId, to: SpaceId, frame: Vec<u8>);
}

struct ReplySlot {
    result: Option<ViewId>,
    completion: UserEvent,
}

#[derive(Default)]
struct RuntimeState {
    next_sequence: u64,
    free_sequences: Vec<u64>,
    directory: FxHashMap<ViewId, LogicalView>,
    arrivals: FxHashMap<ViewId, UserEvent>,
    allocations: FxHashMap<AllocId, Arc<dyn Allocation>>,
    reply_slots: FxHashMap<u64, ReplySlot>,
    next_reply_slot: u64,
    completions: FxHashMap<u64, UserEvent>,
}

/// Per-node engine runtime.
pub struct Runtime {
    space: SpaceId,
    region_tree: Arc<dyn RegionTree>,
    transport: Arc<dyn Transport>,
    events: Arc<EventTable>,
    state: Mutex<RuntimeState>,
}

impl Runtime {
    /// Brings up a node's runtime.
    #[must_use]
    pub fn new(
        space: SpaceId,
        region_tree: Arc<dyn RegionTree>,
        transport: Arc<dyn Transport>,
        events: Arc<EventTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            space,
            region_tree,
            transport,
            events,
            state: Mutex::new(RuntimeState::default()),
        })
    }

    /// This node's space id.
    #[must_use]
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// The region tree collaborator.
    #[must_use]
    pub fn region_tree(&self) -> &Arc<dyn RegionTree> {
        &self.region_tree
    }

    /// The grid-shared event interning table.
    #[must_use]
    pub fn events(&self) -> &Arc<EventTable> {
        &self.events
    }

    /// Makes `alloc` resolvable for announces that reference it.
    pub fn register_allocation(&self, alloc: Arc<dyn Allocation>) {
        self.state.lock().allocations.insert(alloc.id(), alloc);
    }

    /// Resolves a registered allocation.
    pub fn allocation(&self, id: AllocId) -> Result<Arc<dyn Allocation>, EngineError> {
        self.state
            .lock()
            .allocations
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownAllocation(id))
    }

    /// Allocates a view id owned by this node.
    pub fn allocate_view_id(&self, kind: ViewKind) -> Result<ViewId, EngineError> {
        let mut state = self.state.lock();
        let sequence = if let Some(seq) = state.free_sequences.pop() {
            seq
        } else {
            let seq = state.next_sequence;
            if seq >= VIEW_SEQUENCE_LIMIT {
                return Err(EngineError::ViewIdExhausted);
            }
            state.next_sequence += 1;
            seq
        };
        Ok(ViewId::pack(self.space, sequence, kind))
    }

    /// Returns an id allocated eagerly but lost to a creation race.
    pub fn free_view_id(&self, id: ViewId) {
        self.state.lock().free_sequences.push(id.sequence());
    }

    /// Installs `view` in the directory, waking any parked requesters.
    pub fn register_view(&self, view: LogicalView) {
        let did = view.did();
        let arrival = {
            let mut state = self.state.lock();
            state.directory.insert(did, view);
            state.arrivals.remove(&did)
        };
        debug!(?did, space = self.space.0, "view registered");
        if let Some(arrival) = arrival {
            arrival.trigger();
        }
    }

    /// Removes `did` from the directory.
    pub fn unregister_view(&self, did: ViewId) {
        self.state.lock().directory.remove(&did);
        debug!(?did, space = self.space.0, "view unregistered");
    }

    /// Directory lookup.
    #[must_use]
    pub fn lookup(&self, did: ViewId) -> Option<LogicalView> {
        self.state.lock().directory.get(&did).cloned()
    }

    /// Directory lookup that treats a miss as the protocol bug it is.
    pub fn find_view(&self, did: ViewId) -> Result<LogicalView, EngineError> {
        self.lookup(did).ok_or(EngineError::UnknownView(did))
    }

    /// Resolves `did` locally or requests it from its owner, parking until
    /// the owner's announce lands.
    pub fn find_or_request_logical_view(
        self: &Arc<Self>,
        did: ViewId,
    ) -> Result<LogicalView, EngineError> {
        let arrival = {
            let mut state = self.state.lock();
            if let Some(view) = state.directory.get(&did) {
                return Ok(view.clone());
            }
            match state.arrivals.get(&did) {
                Some(pending) => (pending.clone(), false),
                None => {
                    let pending = UserEvent::create();
                    state.arrivals.insert(did, pending.clone());
                    (pending, true)
                }
            }
        };
        let (arrival, newly_requested) = arrival;
        if newly_requested {
            trace!(?did, "requesting view from owner");
            self.send(did.owner(), &Message::ViewRequest { did });
        }
        arrival.event().wait();
        self.find_view(did)
    }

    /// Allocates a reply slot for a subview-id request; the returned
    /// completion event fires when the response fills the slot.
    pub(crate) fn allocate_reply_slot(&self) -> (u64, Event) {
        let mut state = self.state.lock();
        let slot = state.next_reply_slot;
        state.next_reply_slot += 1;
        let completion = UserEvent::create();
        let event = completion.event();
        state.reply_slots.insert(
            slot,
            ReplySlot {
                result: None,
                completion,
            },
        );
        (slot, event)
    }

    /// Takes the value a response deposited in `slot`.
    pub(crate) fn take_reply_slot(&self, slot: u64) -> Option<ViewId> {
        self.state
            .lock()
            .reply_slots
            .remove(&slot)
            .and_then(|s| s.result)
    }

    /// Registers a completion the local node will trigger when the matching
    /// response arrives.
    pub(crate) fn register_completion(&self, completion: &UserEvent) {
        self.events.register(&completion.event());
        self.state
            .lock()
            .completions
            .insert(completion.event().id(), completion.clone());
    }

    fn trigger_completion(&self, id: u64) -> Result<(), EngineError> {
        let completion = self
            .state
            .lock()
            .completions
            .remove(&id)
            .ok_or(EngineError::UnknownEvent(id))?;
        completion.trigger();
        Ok(())
    }

    /// Encodes and sends `message` to `target`.
    pub fn send(&self, target: SpaceId, message: &Message) {
        trace!(from = self.space.0, to = target.0, ?message, "send");
        self.transport.send(self.space, target, wire::encode(message));
    }

    /// Schedules removal of `event`'s user records on `view` once the event
    /// fires. The view holds a gc reference for the duration.
    pub fn defer_collect_user(&self, view: &LogicalView, event: &Event) {
        use crate::collect::ReferenceKind;
        view.refs().add(ReferenceKind::Gc, 1);
        let view = view.clone();
        let term = event.clone();
        event.subscribe(move || {
            view.collect_users(std::slice::from_ref(&term));
            if view.refs().remove(ReferenceKind::Gc, 1) {
                view.destroy();
            }
        });
    }

    /// Decodes and dispatches one frame from `source`.
    pub fn handle_message(self: &Arc<Self>, source: SpaceId, frame: &[u8]) -> Result<(), EngineError> {
        let (message, _) = wire::decode(frame)?;
        trace!(space = self.space.0, from = source.0, ?message, "recv");
        match message {
            Message::MaterializedViewAnnounce {
                did,
                manager,
                parent,
                region,
                owner,
                context,
            } => {
                if self.lookup(did).is_some() {
                    return Ok(());
                }
                let manager = self.allocation(manager)?;
                let parent = match parent {
                    None => None,
                    Some(pdid) => {
                        let view = self.find_or_request_logical_view(pdid)?;
                        Some(view.expect_materialized()?)
                    }
                };
                let view =
                    MaterializedView::create(self, did, owner, region, manager, parent, context);
                self.register_view(LogicalView::Materialized(view));
                Ok(())
            }
            Message::SubviewDidRequest {
                parent,
                color,
                reply_slot,
                completion,
            } => {
                let view = self.find_view(parent)?.expect_materialized()?;
                let child = view.get_materialized_subview(color)?;
                self.send(
                    source,
                    &Message::SubviewDidResponse {
                        child: child.did(),
                        reply_slot,
                        completion,
                    },
                );
                Ok(())
            }
            Message::SubviewDidResponse {
                child,
                reply_slot,
                completion,
            } => {
                let to_trigger = {
                    let mut state = self.state.lock();
                    state.reply_slots.get_mut(&reply_slot).map(|slot| {
                        slot.result = Some(child);
                        slot.completion.clone()
                    })
                };
                let Some(pending) = to_trigger else {
                    return Err(EngineError::UnknownEvent(completion));
                };
                debug_assert_eq!(pending.event().id(), completion);
                pending.trigger();
                Ok(())
            }
            Message::MaterializedUpdate { did, update, .. } => {
                let view = self.find_view(did)?.expect_materialized()?;
                view.process_update(&update, source)?;
                Ok(())
            }
            Message::AtomicReservationRequest {
                did,
                fields,
                completion,
            } => {
                let view = self.find_view(did)?.expect_materialized()?;
                let reservations = view.find_field_reservations(&fields);
                self.send(
                    source,
                    &Message::AtomicReservationResponse {
                        did,
                        reservations,
                        completion,
                    },
                );
                Ok(())
            }
            Message::AtomicReservationResponse {
                did,
                reservations,
                completion,
            } => {
                let view = self.find_view(did)?.expect_materialized()?;
                view.update_field_reservations(&reservations);
                self.trigger_completion(completion)
            }
            Message::ReductionViewAnnounce {
                did,
                manager,
                region,
                owner,
                context,
                redop,
            } => {
                if self.lookup(did).is_some() {
                    return Ok(());
                }
                let manager = self.allocation(manager)?;
                let view = ReductionView::create(self, did, owner, region, manager, redop, context);
                self.register_view(LogicalView::Reduction(view));
                Ok(())
            }
            Message::ReductionUpdate { did, update } => {
                let view = self.find_view(did)?.expect_reduction()?;
                view.process_update(&update)?;
                Ok(())
            }
            Message::CompositeViewAnnounce {
                did,
                owner,
                handle,
                version_info,
                root,
                ..
            } => {
                if self.lookup(did).is_some() {
                    return Ok(());
                }
                let view = CompositeView::from_wire(self, did, owner, handle, &version_info, &root)?;
                self.register_view(LogicalView::Composite(view));
                Ok(())
            }
            Message::FillViewAnnounce {
                did,
                owner,
                handle,
                value,
            } => {
                if self.lookup(did).is_some() {
                    return Ok(());
                }
                let view = FillView::create(self, did, owner, handle, Arc::new(value));
                self.register_view(LogicalView::Fill(view));
                Ok(())
            }
            Message::ViewRequest { did } => {
                let view = self.find_view(did)?;
                view.send_view(source);
                Ok(())
            }
            Message::RemoteRegistration { did, source, add } => {
                let view = self.find_view(did)?;
                view.note_remote_instance(source, add);
                Ok(())
            }
            Message::RemoteValidUpdate { did, count, add } => {
                use crate::collect::ReferenceKind;
                let view = self.find_view(did)?;
                if add {
                    view.refs().add(ReferenceKind::Valid, count);
                } else if view.refs().remove(ReferenceKind::Valid, count) {
                    view.destroy();
                }
                Ok(())
            }
        }
    }
}
