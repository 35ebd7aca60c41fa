// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire format for inter-node view traffic.
//!
//! Frame layout:
//!
//! ``MAGIC(4) || VERSION(2) || LENGTH(4) || PAYLOAD``
//!
//! The payload opens with a one-byte message tag followed by the message's
//! fields in declaration order. LENGTH and the consumed byte count are the
//! paired markers of the protocol: a decode that does not consume exactly
//! LENGTH bytes is protocol corruption and fails with
//! [`WireError::LengthMismatch`].
//!
//! Update payloads use a deduplicated user table: each distinct user
//! serializes once and epoch entries refer to it by small index. Within an
//! epoch entry a leading signed index `>= 0` denotes a single-user block; a
//! leading negative value `c` opens a multi-user block of `|c| - 1`
//! `(index, mask)` pairs. A multi bucket whose overlap dedups down to one
//! survivor is emitted as a single-user block.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::ident::{
    AllocId, ChildColor, ContextId, FieldId, RedopId, RegionHandle, SpaceId, ViewId,
};
use crate::manager::Reservation;
use crate::mask::FieldMask;
use crate::usage::{Coherence, Privilege, RegionUsage};
use crate::user::FieldVersions;

/// Protocol magic, "WFT1".
pub const MAGIC: [u8; 4] = *b"WFT1";
/// Wire protocol version.
pub const VERSION: u16 = 0x0001;

/// Errors raised by frame decoding. All of them indicate protocol
/// corruption and are fatal to the embedding runtime.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the frame did.
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated {
        /// Bytes missing from the buffer.
        needed: usize,
    },
    /// Frame does not open with the protocol magic.
    #[error("bad magic")]
    BadMagic,
    /// Frame version is not ours.
    #[error("unsupported protocol version {0:#06x}")]
    BadVersion(u16),
    /// Decode consumed a different byte count than the frame declared.
    #[error("length marker mismatch: declared {declared}, consumed {consumed}")]
    LengthMismatch {
        /// Length the frame header declared.
        declared: usize,
        /// Length the decoder actually consumed.
        consumed: usize,
    },
    /// Unknown message tag.
    #[error("unknown message tag {0}")]
    UnknownMessage(u8),
    /// A field carried a value outside its domain.
    #[error("invalid field encoding: {0}")]
    InvalidField(&'static str),
}

/// User record as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireUser {
    /// Usage of the recorded user.
    pub usage: RegionUsage,
    /// Child color the user was registered against.
    pub child: ChildColor,
    /// Field versions, present for read-only users that recorded them.
    pub versions: Option<FieldVersions>,
}

/// One epoch entry of an update payload: the completion event's id plus the
/// `(user index, mask)` pairs that overlap the shipped mask.
pub type UpdateEntry = (u64, Vec<(u32, FieldMask)>);

/// Deduplicated epoch-table update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePayload {
    /// User table; entry `i` is the user that epoch entries cite as `i`.
    pub users: Vec<WireUser>,
    /// Current-epoch entries.
    pub current: Vec<UpdateEntry>,
    /// Previous-epoch entries.
    pub previous: Vec<UpdateEntry>,
}

/// Composite snapshot tree in preorder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireCompositeNode {
    /// Fields dirty at this node.
    pub dirty: FieldMask,
    /// Fields with reductions registered at this node.
    pub reduction: FieldMask,
    /// Valid source views with their masks.
    pub views: Vec<(ViewId, FieldMask)>,
    /// Reduction views with their masks.
    pub reductions: Vec<(ViewId, FieldMask)>,
    /// Children by color, each with its mask and subtree.
    pub children: Vec<(ChildColor, FieldMask, WireCompositeNode)>,
}

/// Version info as it crosses the wire with a composite announce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireVersionInfo {
    /// Upper-bound region node, if one was frozen in.
    pub upper_bound: Option<RegionHandle>,
    /// Per-node field versions.
    pub versions: Vec<(RegionHandle, Vec<(FieldId, u64)>)>,
}

/// Every message the engine sends between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Owner announces a materialized view to a replica host.
    MaterializedViewAnnounce {
        /// View id.
        did: ViewId,
        /// Backing allocation.
        manager: AllocId,
        /// Parent view, if the view is a subview.
        parent: Option<ViewId>,
        /// Region-tree node of the view.
        region: RegionHandle,
        /// Owner space.
        owner: SpaceId,
        /// Context of the owning task.
        context: ContextId,
    },
    /// Non-owner asks the owner for a subview's id.
    SubviewDidRequest {
        /// Parent view on the owner.
        parent: ViewId,
        /// Requested child color.
        color: ChildColor,
        /// Requester-local reply slot.
        reply_slot: u64,
        /// Event to trigger once the slot is filled.
        completion: u64,
    },
    /// Owner's answer to a subview id request.
    SubviewDidResponse {
        /// The child's id.
        child: ViewId,
        /// Reply slot from the request.
        reply_slot: u64,
        /// Event to trigger.
        completion: u64,
    },
    /// Epoch-table state shipped to a replica.
    MaterializedUpdate {
        /// True when `handle` names a region (not a partition).
        is_region: bool,
        /// Region-tree handle of the view.
        handle: RegionHandle,
        /// Target view.
        did: ViewId,
        /// The deduplicated tables.
        update: UpdatePayload,
    },
    /// Batched request for atomic reservations on missing fields.
    AtomicReservationRequest {
        /// Root view owning the reservations.
        did: ViewId,
        /// Fields lacking a local handle.
        fields: Vec<FieldId>,
        /// Event to trigger once the response lands.
        completion: u64,
    },
    /// Reservation handles for a prior request.
    AtomicReservationResponse {
        /// Root view owning the reservations.
        did: ViewId,
        /// Field/handle pairs.
        reservations: Vec<(FieldId, Reservation)>,
        /// Event to trigger.
        completion: u64,
    },
    /// Owner announces a reduction view.
    ReductionViewAnnounce {
        /// View id.
        did: ViewId,
        /// Backing reduction allocation.
        manager: AllocId,
        /// Region-tree node.
        region: RegionHandle,
        /// Owner space.
        owner: SpaceId,
        /// Context of the owning task.
        context: ContextId,
        /// Reduction operator of the allocation.
        redop: RedopId,
    },
    /// Reducer/reader tables shipped to a replica.
    ReductionUpdate {
        /// Target view.
        did: ViewId,
        /// Reducer entries (user table shared with `readers`).
        update: UpdatePayload,
    },
    /// Owner announces a composite view with its frozen tree.
    CompositeViewAnnounce {
        /// View id.
        did: ViewId,
        /// Owner space.
        owner: SpaceId,
        /// True when `handle` names a region.
        is_region: bool,
        /// Region-tree handle of the root.
        handle: RegionHandle,
        /// Frozen version info.
        version_info: WireVersionInfo,
        /// Snapshot tree, preorder.
        root: WireCompositeNode,
    },
    /// Owner announces a fill view with its constant payload.
    FillViewAnnounce {
        /// View id.
        did: ViewId,
        /// Owner space.
        owner: SpaceId,
        /// Region-tree handle.
        handle: RegionHandle,
        /// The constant value bytes.
        value: Vec<u8>,
    },
    /// Ask a DID's owner to announce the view to the requester.
    ViewRequest {
        /// The wanted view.
        did: ViewId,
    },
    /// Replica informs the owner it now holds (or dropped) an instance.
    RemoteRegistration {
        /// The replicated view.
        did: ViewId,
        /// The replica's space.
        source: SpaceId,
        /// True on registration, false when the replica is torn down.
        add: bool,
    },
    /// Replica forwards a valid-reference delta to the owner.
    RemoteValidUpdate {
        /// The view.
        did: ViewId,
        /// Magnitude of the delta.
        count: u32,
        /// True to add, false to remove.
        add: bool,
    },
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Self::MaterializedViewAnnounce { .. } => 0,
            Self::SubviewDidRequest { .. } => 1,
            Self::SubviewDidResponse { .. } => 2,
            Self::MaterializedUpdate { .. } => 3,
            Self::AtomicReservationRequest { .. } => 4,
            Self::AtomicReservationResponse { .. } => 5,
            Self::ReductionViewAnnounce { .. } => 6,
            Self::ReductionUpdate { .. } => 7,
            Self::CompositeViewAnnounce { .. } => 8,
            Self::FillViewAnnounce { .. } => 9,
            Self::ViewRequest { .. } => 10,
            Self::RemoteRegistration { .. } => 11,
            Self::RemoteValidUpdate { .. } => 12,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_mask(buf: &mut BytesMut, mask: &FieldMask) {
    for word in mask.words() {
        buf.put_u64_le(word);
    }
}

fn put_usage(buf: &mut BytesMut, usage: &RegionUsage) {
    let privilege = match usage.privilege {
        Privilege::NoAccess => 0u8,
        Privilege::ReadOnly => 1,
        Privilege::ReadWrite => 2,
        Privilege::WriteDiscard => 3,
        Privilege::Reduce => 4,
    };
    let coherence = match usage.coherence {
        Coherence::Exclusive => 0u8,
        Coherence::Atomic => 1,
        Coherence::Simultaneous => 2,
        Coherence::Relaxed => 3,
    };
    buf.put_u8(privilege);
    buf.put_u8(coherence);
    buf.put_u32_le(usage.redop.0);
}

fn put_wire_user(buf: &mut BytesMut, user: &WireUser) {
    put_usage(buf, &user.usage);
    buf.put_u32_le(user.child.0);
    match &user.versions {
        None => buf.put_u32_le(0),
        Some(versions) => {
            let pairs: Vec<(FieldId, u64)> = versions.iter().collect();
            buf.put_u32_le(pairs.len() as u32 + 1);
            for (field, version) in pairs {
                buf.put_u32_le(field.0);
                buf.put_u64_le(version);
            }
        }
    }
}

fn put_update_entries(buf: &mut BytesMut, entries: &[UpdateEntry]) {
    buf.put_u32_le(entries.len() as u32);
    for (event, blocks) in entries {
        buf.put_u64_le(*event);
        if blocks.len() == 1 {
            let (index, mask) = &blocks[0];
            buf.put_i32_le(*index as i32);
            put_mask(buf, mask);
        } else {
            // Negative count: a block of |count| - 1 entries.
            buf.put_i32_le(-(blocks.len() as i32) - 1);
            for (index, mask) in blocks {
                buf.put_i32_le(*index as i32);
                put_mask(buf, mask);
            }
        }
    }
}

fn put_update(buf: &mut BytesMut, update: &UpdatePayload) {
    buf.put_u32_le(update.users.len() as u32);
    for (index, user) in update.users.iter().enumerate() {
        buf.put_u32_le(index as u32);
        put_wire_user(buf, user);
    }
    put_update_entries(buf, &update.current);
    put_update_entries(buf, &update.previous);
}

fn put_composite_node(buf: &mut BytesMut, node: &WireCompositeNode) {
    put_mask(buf, &node.dirty);
    put_mask(buf, &node.reduction);
    buf.put_u32_le(node.views.len() as u32);
    for (did, mask) in &node.views {
        buf.put_u64_le(did.0);
        put_mask(buf, mask);
    }
    buf.put_u32_le(node.reductions.len() as u32);
    for (did, mask) in &node.reductions {
        buf.put_u64_le(did.0);
        put_mask(buf, mask);
    }
    buf.put_u32_le(node.children.len() as u32);
    for (color, mask, child) in &node.children {
        buf.put_u32_le(color.0);
        put_mask(buf, mask);
        put_composite_node(buf, child);
    }
}

fn put_version_info(buf: &mut BytesMut, info: &WireVersionInfo) {
    match info.upper_bound {
        None => buf.put_u8(0),
        Some(node) => {
            buf.put_u8(1);
            buf.put_u64_le(node.0);
        }
    }
    buf.put_u32_le(info.versions.len() as u32);
    for (node, pairs) in &info.versions {
        buf.put_u64_le(node.0);
        buf.put_u32_le(pairs.len() as u32);
        for (field, version) in pairs {
            buf.put_u32_le(field.0);
            buf.put_u64_le(*version);
        }
    }
}

/// Encodes `message` into a framed byte vector.
#[must_use]
pub fn encode(message: &Message) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_u8(message.tag());
    match message {
        Message::MaterializedViewAnnounce {
            did,
            manager,
            parent,
            region,
            owner,
            context,
        } => {
            payload.put_u64_le(did.0);
            payload.put_u64_le(manager.0);
            payload.put_u64_le(parent.map_or(0, |p| p.0));
            payload.put_u64_le(region.0);
            payload.put_u16_le(owner.0);
            payload.put_u64_le(context.0);
        }
        Message::SubviewDidRequest {
            parent,
            color,
            reply_slot,
            completion,
        } => {
            payload.put_u64_le(parent.0);
            payload.put_u32_le(color.0);
            payload.put_u64_le(*reply_slot);
            payload.put_u64_le(*completion);
        }
        Message::SubviewDidResponse {
            child,
            reply_slot,
            completion,
        } => {
            payload.put_u64_le(child.0);
            payload.put_u64_le(*reply_slot);
            payload.put_u64_le(*completion);
        }
        Message::MaterializedUpdate {
            is_region,
            handle,
            did,
            update,
        } => {
            payload.put_u8(u8::from(*is_region));
            payload.put_u64_le(handle.0);
            payload.put_u64_le(did.0);
            put_update(&mut payload, update);
        }
        Message::AtomicReservationRequest {
            did,
            fields,
            completion,
        } => {
            payload.put_u64_le(did.0);
            payload.put_u32_le(fields.len() as u32);
            for field in fields {
                payload.put_u32_le(field.0);
            }
            payload.put_u64_le(*completion);
        }
        Message::AtomicReservationResponse {
            did,
            reservations,
            completion,
        } => {
            payload.put_u64_le(did.0);
            payload.put_u32_le(reservations.len() as u32);
            for (field, reservation) in reservations {
                payload.put_u32_le(field.0);
                payload.put_u64_le(reservation.0);
            }
            payload.put_u64_le(*completion);
        }
        Message::ReductionViewAnnounce {
            did,
            manager,
            region,
            owner,
            context,
            redop,
        } => {
            payload.put_u64_le(did.0);
            payload.put_u64_le(manager.0);
            payload.put_u64_le(region.0);
            payload.put_u16_le(owner.0);
            payload.put_u64_le(context.0);
            payload.put_u32_le(redop.0);
        }
        Message::ReductionUpdate { did, update } => {
            payload.put_u64_le(did.0);
            put_update(&mut payload, update);
        }
        Message::CompositeViewAnnounce {
            did,
            owner,
            is_region,
            handle,
            version_info,
            root,
        } => {
            payload.put_u64_le(did.0);
            payload.put_u16_le(owner.0);
            payload.put_u8(u8::from(*is_region));
            payload.put_u64_le(handle.0);
            put_version_info(&mut payload, version_info);
            put_composite_node(&mut payload, root);
        }
        Message::FillViewAnnounce {
            did,
            owner,
            handle,
            value,
        } => {
            payload.put_u64_le(did.0);
            payload.put_u16_le(owner.0);
            payload.put_u64_le(handle.0);
            payload.put_u32_le(value.len() as u32);
            payload.put_slice(value);
        }
        Message::ViewRequest { did } => {
            payload.put_u64_le(did.0);
        }
        Message::RemoteRegistration { did, source, add } => {
            payload.put_u64_le(did.0);
            payload.put_u16_le(source.0);
            payload.put_u8(u8::from(*add));
        }
        Message::RemoteValidUpdate { did, count, add } => {
            payload.put_u64_le(did.0);
            payload.put_u32_le(*count);
            payload.put_u8(u8::from(*add));
        }
    }
    let mut frame = Vec::with_capacity(10 + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&VERSION.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.bytes.len() - self.pos < n {
            return Err(WireError::Truncated {
                needed: n - (self.bytes.len() - self.pos),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn mask(&mut self) -> Result<FieldMask, WireError> {
        let mut words = [0u64; 4];
        for word in &mut words {
            *word = self.u64()?;
        }
        Ok(FieldMask::from_words(words))
    }

    fn usage(&mut self) -> Result<RegionUsage, WireError> {
        let privilege = match self.u8()? {
            0 => Privilege::NoAccess,
            1 => Privilege::ReadOnly,
            2 => Privilege::ReadWrite,
            3 => Privilege::WriteDiscard,
            4 => Privilege::Reduce,
            _ => return Err(WireError::InvalidField("privilege")),
        };
        let coherence = match self.u8()? {
            0 => Coherence::Exclusive,
            1 => Coherence::Atomic,
            2 => Coherence::Simultaneous,
            3 => Coherence::Relaxed,
            _ => return Err(WireError::InvalidField("coherence")),
        };
        let redop = RedopId(self.u32()?);
        Ok(RegionUsage::new(privilege, coherence, redop))
    }

    fn wire_user(&mut self) -> Result<WireUser, WireError> {
        let usage = self.usage()?;
        let child = ChildColor(self.u32()?);
        let version_count = self.u32()?;
        let versions = if version_count == 0 {
            None
        } else {
            let mut versions = FieldVersions::new();
            for _ in 0..version_count - 1 {
                let field = FieldId(self.u32()?);
                let version = self.u64()?;
                versions.insert(field, version);
            }
            Some(versions)
        };
        Ok(WireUser {
            usage,
            child,
            versions,
        })
    }

    fn update_entries(&mut self, user_count: usize) -> Result<Vec<UpdateEntry>, WireError> {
        let count = self.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let event = self.u64()?;
            let head = self.i32()?;
            let mut blocks = Vec::new();
            if head < 0 {
                let block_count = (-head) - 1;
                for _ in 0..block_count {
                    let index = self.i32()?;
                    if index < 0 || index as usize >= user_count {
                        return Err(WireError::InvalidField("user index"));
                    }
                    let mask = self.mask()?;
                    blocks.push((index as u32, mask));
                }
            } else {
                if head as usize >= user_count {
                    return Err(WireError::InvalidField("user index"));
                }
                let mask = self.mask()?;
                blocks.push((head as u32, mask));
            }
            entries.push((event, blocks));
        }
        Ok(entries)
    }

    fn update(&mut self) -> Result<UpdatePayload, WireError> {
        let user_count = self.u32()? as usize;
        let mut users = vec![None; user_count];
        for _ in 0..user_count {
            let index = self.u32()? as usize;
            let user = self.wire_user()?;
            let slot = users
                .get_mut(index)
                .ok_or(WireError::InvalidField("user table index"))?;
            *slot = Some(user);
        }
        let users: Vec<WireUser> = users
            .into_iter()
            .map(|u| u.ok_or(WireError::InvalidField("user table gap")))
            .collect::<Result<_, _>>()?;
        let current = self.update_entries(user_count)?;
        let previous = self.update_entries(user_count)?;
        Ok(UpdatePayload {
            users,
            current,
            previous,
        })
    }

    fn composite_node(&mut self, depth: u32) -> Result<WireCompositeNode, WireError> {
        if depth > 64 {
            return Err(WireError::InvalidField("composite tree depth"));
        }
        let dirty = self.mask()?;
        let reduction = self.mask()?;
        let view_count = self.u32()?;
        let mut views = Vec::with_capacity(view_count as usize);
        for _ in 0..view_count {
            let did = ViewId(self.u64()?);
            views.push((did, self.mask()?));
        }
        let reduction_count = self.u32()?;
        let mut reductions = Vec::with_capacity(reduction_count as usize);
        for _ in 0..reduction_count {
            let did = ViewId(self.u64()?);
            reductions.push((did, self.mask()?));
        }
        let child_count = self.u32()?;
        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            let color = ChildColor(self.u32()?);
            let mask = self.mask()?;
            let child = self.composite_node(depth + 1)?;
            children.push((color, mask, child));
        }
        Ok(WireCompositeNode {
            dirty,
            reduction,
            views,
            reductions,
            children,
        })
    }

    fn version_info(&mut self) -> Result<WireVersionInfo, WireError> {
        let upper_bound = match self.u8()? {
            0 => None,
            _ => Some(RegionHandle(self.u64()?)),
        };
        let node_count = self.u32()?;
        let mut versions = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let node = RegionHandle(self.u64()?);
            let pair_count = self.u32()?;
            let mut pairs = Vec::with_capacity(pair_count as usize);
            for _ in 0..pair_count {
                let field = FieldId(self.u32()?);
                pairs.push((field, self.u64()?));
            }
            versions.push((node, pairs));
        }
        Ok(WireVersionInfo {
            upper_bound,
            versions,
        })
    }
}

/// Decodes one framed message, returning it and the bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(Message, usize), WireError> {
    let mut header = Reader::new(bytes);
    if header.take(4)? != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = header.u16()?;
    if version != VERSION {
        return Err(WireError::BadVersion(version));
    }
    let declared = header.u32()? as usize;
    let payload = header.take(declared)?;
    let mut r = Reader::new(payload);
    let tag = r.u8()?;
    let message = match tag {
        0 => Message::MaterializedViewAnnounce {
            did: ViewId(r.u64()?),
            manager: AllocId(r.u64()?),
            parent: match r.u64()? {
                0 => None,
                raw => Some(ViewId(raw)),
            },
            region: RegionHandle(r.u64()?),
            owner: SpaceId(r.u16()?),
            context: ContextId(r.u64()?),
        },
        1 => Message::SubviewDidRequest {
            parent: ViewId(r.u64()?),
            color: ChildColor(r.u32()?),
            reply_slot: r.u64()?,
            completion: r.u64()?,
        },
        2 => Message::SubviewDidResponse {
            child: ViewId(r.u64()?),
            reply_slot: r.u64()?,
            completion: r.u64()?,
        },
        3 => Message::MaterializedUpdate {
            is_region: r.u8()? != 0,
            handle: RegionHandle(r.u64()?),
            did: ViewId(r.u64()?),
            update: r.update()?,
        },
        4 => {
            let did = ViewId(r.u64()?);
            let count = r.u32()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                fields.push(FieldId(r.u32()?));
            }
            Message::AtomicReservationRequest {
                did,
                fields,
                completion: r.u64()?,
            }
        }
        5 => {
            let did = ViewId(r.u64()?);
            let count = r.u32()?;
            let mut reservations = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let field = FieldId(r.u32()?);
                reservations.push((field, Reservation(r.u64()?)));
            }
            Message::AtomicReservationResponse {
                did,
                reservations,
                completion: r.u64()?,
            }
        }
        6 => Message::ReductionViewAnnounce {
            did: ViewId(r.u64()?),
            manager: AllocId(r.u64()?),
            region: RegionHandle(r.u64()?),
            owner: SpaceId(r.u16()?),
            context: ContextId(r.u64()?),
            redop: RedopId(r.u32()?),
        },
        7 => Message::ReductionUpdate {
            did: ViewId(r.u64()?),
            update: r.update()?,
        },
        8 => Message::CompositeViewAnnounce {
            did: ViewId(r.u64()?),
            owner: SpaceId(r.u16()?),
            is_region: r.u8()? != 0,
            handle: RegionHandle(r.u64()?),
            version_info: r.version_info()?,
            root: r.composite_node(0)?,
        },
        9 => {
            let did = ViewId(r.u64()?);
            let owner = SpaceId(r.u16()?);
            let handle = RegionHandle(r.u64()?);
            let len = r.u32()? as usize;
            let value = r.take(len)?.to_vec();
            Message::FillViewAnnounce {
                did,
                owner,
                handle,
                value,
            }
        }
        10 => Message::ViewRequest {
            did: ViewId(r.u64()?),
        },
        11 => Message::RemoteRegistration {
            did: ViewId(r.u64()?),
            source: SpaceId(r.u16()?),
            add: r.u8()? != 0,
        },
        12 => Message::RemoteValidUpdate {
            did: ViewId(r.u64()?),
            count: r.u32()?,
            add: r.u8()? != 0,
        },
        other => return Err(WireError::UnknownMessage(other)),
    };
    if r.pos != declared {
        return Err(WireError::LengthMismatch {
            declared,
            consumed: r.pos,
        });
    }
    Ok((message, header.pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let bytes = encode(&message);
        let (decoded, used) = decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(used, bytes.len());
    }

    fn sample_update() -> UpdatePayload {
        let reader = WireUser {
            usage: RegionUsage::read_only(),
            child: ChildColor(2),
            versions: Some([(FieldId(0), 7u64)].into_iter().collect()),
        };
        let writer = WireUser {
            usage: RegionUsage::read_write(),
            child: ChildColor::INVALID,
            versions: None,
        };
        UpdatePayload {
            users: vec![reader, writer],
            current: vec![
                (11, vec![(0, FieldMask::single(FieldId(0)))]),
                (
                    12,
                    vec![
                        (0, FieldMask::single(FieldId(1))),
                        (1, FieldMask::single(FieldId(2))),
                    ],
                ),
            ],
            previous: vec![(13, vec![(1, FieldMask::single(FieldId(3)))])],
        }
    }

    #[test]
    fn frames_round_trip() {
        round_trip(Message::MaterializedViewAnnounce {
            did: ViewId(0x40),
            manager: AllocId(9),
            parent: None,
            region: RegionHandle(1),
            owner: SpaceId(0),
            context: ContextId(5),
        });
        round_trip(Message::SubviewDidRequest {
            parent: ViewId(0x40),
            color: ChildColor(1),
            reply_slot: 3,
            completion: 99,
        });
        round_trip(Message::MaterializedUpdate {
            is_region: true,
            handle: RegionHandle(1),
            did: ViewId(0x40),
            update: sample_update(),
        });
        round_trip(Message::FillViewAnnounce {
            did: ViewId(0x43),
            owner: SpaceId(1),
            handle: RegionHandle(2),
            value: vec![0xde, 0xad, 0xbe, 0xef],
        });
        round_trip(Message::RemoteValidUpdate {
            did: ViewId(0x41),
            count: 2,
            add: false,
        });
    }

    #[test]
    fn composite_tree_round_trips() {
        let leaf = WireCompositeNode {
            dirty: FieldMask::single(FieldId(1)),
            reduction: FieldMask::EMPTY,
            views: vec![(ViewId(0x80), FieldMask::single(FieldId(1)))],
            reductions: Vec::new(),
            children: Vec::new(),
        };
        let root = WireCompositeNode {
            dirty: FieldMask::of(&[FieldId(0), FieldId(1)]),
            reduction: FieldMask::single(FieldId(5)),
            views: Vec::new(),
            reductions: vec![(ViewId(0x81), FieldMask::single(FieldId(5)))],
            children: vec![(ChildColor(0), FieldMask::single(FieldId(1)), leaf)],
        };
        round_trip(Message::CompositeViewAnnounce {
            did: ViewId(0x42),
            owner: SpaceId(0),
            is_region: true,
            handle: RegionHandle(1),
            version_info: WireVersionInfo {
                upper_bound: Some(RegionHandle(1)),
                versions: vec![(RegionHandle(1), vec![(FieldId(0), 3)])],
            },
            root,
        });
    }

    #[test]
    fn multi_block_uses_negative_count() {
        let update = sample_update();
        let message = Message::MaterializedUpdate {
            is_region: true,
            handle: RegionHandle(1),
            did: ViewId(0x40),
            update,
        };
        let bytes = encode(&message);
        // The two-entry bucket for event 12 must be preceded by -3
        // (|count| - 1 == 2 entries).
        let needle = (-3i32).to_le_bytes();
        assert!(
            bytes.windows(4).any(|w| w == needle),
            "expected a -3 multi-block sentinel in the frame"
        );
        let (decoded, _) = decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn corrupted_length_marker_is_fatal() {
        let mut bytes = encode(&Message::ViewRequest { did: ViewId(0x44) });
        // Shrink the declared length: decode must fail rather than accept a
        // short read.
        bytes[6] -= 1;
        assert!(matches!(
            decode(&bytes),
            Err(WireError::LengthMismatch { .. }) | Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = encode(&Message::ViewRequest { did: ViewId(0x44) });
        bytes[10] = 0xff;
        assert_eq!(decode(&bytes), Err(WireError::UnknownMessage(0xff)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = encode(&Message::ViewRequest { did: ViewId(0x44) });
        assert!(matches!(
            decode(&bytes[..bytes.len() - 2]),
            Err(WireError::Truncated { .. })
        ));
    }
}
