// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-process cluster fixtures for exercising the weft view engine.
//!
//! Three pieces: [`LoopbackGrid`] wires N runtimes together with an inline
//! transport (legal because the engine never holds a view lock across a
//! send), [`TestRegionTree`] is a table-driven region tree with explicit
//! disjointness declarations, and [`RecordingAllocation`] stands in for the
//! allocation manager, logging every issued copy/fill/reduction and minting
//! a fresh completion event for each.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use weft_core::{
    AllocId, Allocation, ChildColor, CopyField, Event, EventTable, FieldId, FieldMask,
    RedopId, RegionHandle, RegionTree, Runtime, SpaceId, Transport, UserEvent,
};

/// Builds a [`FieldMask`] from field numbers.
#[must_use]
pub fn mask(fields: &[u32]) -> FieldMask {
    fields.iter().map(|&f| FieldId(f)).collect()
}

// ---------------------------------------------------------------------------
// Region tree
// ---------------------------------------------------------------------------

struct RegionNode {
    parent: Option<RegionHandle>,
    color: ChildColor,
    children: BTreeMap<ChildColor, RegionHandle>,
}

/// Table-driven region tree. Children are not disjoint unless declared so.
#[derive(Default)]
pub struct TestRegionTree {
    nodes: Mutex<FxHashMap<RegionHandle, RegionNode>>,
    disjoint: Mutex<BTreeSet<(RegionHandle, ChildColor, ChildColor)>>,
}

impl TestRegionTree {
    /// Empty tree.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declares a root region.
    pub fn add_root(&self, handle: RegionHandle) {
        self.nodes.lock().insert(
            handle,
            RegionNode {
                parent: None,
                color: ChildColor::INVALID,
                children: BTreeMap::new(),
            },
        );
    }

    /// Declares `child` as the `color` child of `parent`.
    pub fn add_child(&self, parent: RegionHandle, color: ChildColor, child: RegionHandle) {
        let mut nodes = self.nodes.lock();
        nodes.insert(
            child,
            RegionNode {
                parent: Some(parent),
                color,
                children: BTreeMap::new(),
            },
        );
        if let Some(node) = nodes.get_mut(&parent) {
            node.children.insert(color, child);
        }
    }

    /// Declares two children of `parent` disjoint.
    pub fn declare_disjoint(&self, parent: RegionHandle, a: ChildColor, b: ChildColor) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.disjoint.lock().insert((parent, lo, hi));
    }

    fn path_to_root(&self, mut node: RegionHandle) -> Vec<RegionHandle> {
        let nodes = self.nodes.lock();
        let mut path = vec![node];
        while let Some(entry) = nodes.get(&node) {
            match entry.parent {
                Some(parent) => {
                    path.push(parent);
                    node = parent;
                }
                None => break,
            }
        }
        path
    }
}

impl RegionTree for TestRegionTree {
    fn color_of(&self, node: RegionHandle) -> ChildColor {
        self.nodes
            .lock()
            .get(&node)
            .map_or(ChildColor::INVALID, |n| n.color)
    }

    fn parent_of(&self, node: RegionHandle) -> Option<RegionHandle> {
        self.nodes.lock().get(&node).and_then(|n| n.parent)
    }

    fn child_of(&self, node: RegionHandle, color: ChildColor) -> RegionHandle {
        let nodes = self.nodes.lock();
        let entry = nodes
            .get(&node)
            .unwrap_or_else(|| panic!("unknown region {node:?}"));
        *entry
            .children
            .get(&color)
            .unwrap_or_else(|| panic!("region {node:?} has no child {color:?}"))
    }

    fn children_disjoint(&self, node: RegionHandle, a: ChildColor, b: ChildColor) -> bool {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.disjoint.lock().contains(&(node, lo, hi))
    }

    fn all_children_disjoint(&self, node: RegionHandle) -> bool {
        let colors: Vec<ChildColor> = {
            let nodes = self.nodes.lock();
            match nodes.get(&node) {
                Some(entry) => entry.children.keys().copied().collect(),
                None => return false,
            }
        };
        for (i, a) in colors.iter().enumerate() {
            for b in &colors[i + 1..] {
                if !self.children_disjoint(node, *a, *b) {
                    return false;
                }
            }
        }
        !colors.is_empty()
    }

    fn dominates(&self, node: RegionHandle, other: RegionHandle) -> bool {
        self.path_to_root(other).contains(&node)
    }

    fn intersects(&self, node: RegionHandle, other: RegionHandle) -> bool {
        if self.dominates(node, other) || self.dominates(other, node) {
            return true;
        }
        // Distinct branches: disjoint only when the diverging children of
        // the lowest common ancestor were declared so.
        let path_a = self.path_to_root(node);
        let path_b = self.path_to_root(other);
        for (i, step) in path_a.iter().enumerate() {
            if let Some(j) = path_b.iter().position(|p| p == step) {
                if i == 0 || j == 0 {
                    return true;
                }
                let lca = *step;
                let branch_a = self.color_of(path_a[i - 1]);
                let branch_b = self.color_of(path_b[j - 1]);
                return !self.children_disjoint(lca, branch_a, branch_b);
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Recording allocation manager
// ---------------------------------------------------------------------------

/// One operation issued through a [`RecordingAllocation`].
#[derive(Clone)]
pub enum IssuedOp {
    /// A grouped copy.
    Copy {
        /// Source fields.
        src: Vec<CopyField>,
        /// Destination fields.
        dst: Vec<CopyField>,
        /// Merged precondition the copy waits on.
        pre: Event,
        /// Intersection clip, if any.
        intersect: Option<RegionHandle>,
        /// Completion the manager minted.
        post: UserEvent,
    },
    /// A constant fill.
    Fill {
        /// Destination fields.
        dst: Vec<CopyField>,
        /// Payload bytes.
        value: Vec<u8>,
        /// Merged precondition.
        pre: Event,
        /// Intersection clip, if any.
        intersect: Option<RegionHandle>,
        /// Completion the manager minted.
        post: UserEvent,
    },
    /// A reduction.
    Reduction {
        /// Source fields.
        src: Vec<CopyField>,
        /// Destination fields.
        dst: Vec<CopyField>,
        /// Reduction operator.
        redop: RedopId,
        /// Whether the reduction folds.
        fold: bool,
        /// Merged precondition.
        pre: Event,
        /// Intersection clip, if any.
        intersect: Option<RegionHandle>,
        /// Completion the manager minted.
        post: UserEvent,
    },
}

impl IssuedOp {
    /// The operation's completion event.
    #[must_use]
    pub fn post_event(&self) -> Event {
        match self {
            Self::Copy { post, .. } | Self::Fill { post, .. } | Self::Reduction { post, .. } => {
                post.event()
            }
        }
    }
}

/// Allocation manager stand-in that records what the engine asks of it.
pub struct RecordingAllocation {
    id: AllocId,
    fields: FieldMask,
    use_event: Mutex<Event>,
    ops: Mutex<Vec<IssuedOp>>,
}

impl RecordingAllocation {
    /// Allocation with `fields` allocated and no use fence.
    #[must_use]
    pub fn new(id: AllocId, fields: FieldMask) -> Arc<Self> {
        Arc::new(Self {
            id,
            fields,
            use_event: Mutex::new(Event::none()),
            ops: Mutex::new(Vec::new()),
        })
    }

    /// Installs a use fence returned by [`Allocation::use_event`].
    pub fn set_use_event(&self, event: Event) {
        *self.use_event.lock() = event;
    }

    /// Everything issued so far.
    #[must_use]
    pub fn ops(&self) -> Vec<IssuedOp> {
        self.ops.lock().clone()
    }

    /// Number of issued operations.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.ops.lock().len()
    }

    /// Fires the completion of every issued operation.
    pub fn trigger_all(&self) {
        for op in self.ops.lock().iter() {
            match op {
                IssuedOp::Copy { post, .. }
                | IssuedOp::Fill { post, .. }
                | IssuedOp::Reduction { post, .. } => post.trigger(),
            }
        }
    }
}

impl Allocation for RecordingAllocation {
    fn id(&self) -> AllocId {
        self.id
    }

    fn allocated_fields(&self) -> FieldMask {
        self.fields
    }

    fn use_event(&self) -> Event {
        self.use_event.lock().clone()
    }

    fn issue_copy(
        &self,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        precondition: Event,
        intersect: Option<RegionHandle>,
    ) -> Event {
        let post = UserEvent::create();
        let event = post.event();
        self.ops.lock().push(IssuedOp::Copy {
            src: src_fields.to_vec(),
            dst: dst_fields.to_vec(),
            pre: precondition,
            intersect,
            post,
        });
        event
    }

    fn issue_fill(
        &self,
        dst_fields: &[CopyField],
        value: &[u8],
        precondition: Event,
        intersect: Option<RegionHandle>,
    ) -> Event {
        let post = UserEvent::create();
        let event = post.event();
        self.ops.lock().push(IssuedOp::Fill {
            dst: dst_fields.to_vec(),
            value: value.to_vec(),
            pre: precondition,
            intersect,
            post,
        });
        event
    }

    fn issue_reduction(
        &self,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        redop: RedopId,
        precondition: Event,
        fold: bool,
        intersect: Option<RegionHandle>,
    ) -> Event {
        let post = UserEvent::create();
        let event = post.event();
        self.ops.lock().push(IssuedOp::Reduction {
            src: src_fields.to_vec(),
            dst: dst_fields.to_vec(),
            redop,
            fold,
            pre: precondition,
            intersect,
            post,
        });
        event
    }
}

// ---------------------------------------------------------------------------
// Loopback grid
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LoopbackTransport {
    peers: Mutex<FxHashMap<u16, Arc<Runtime>>>,
}

impl Transport for LoopbackTransport {
    fn send(&self, from: SpaceId, to: SpaceId, frame: Vec<u8>) {
        let peer = {
            let peers = self.peers.lock();
            peers
                .get(&to.0)
                .unwrap_or_else(|| panic!("no runtime for space {}", to.0))
                .clone()
        };
        peer.handle_message(from, &frame)
            .unwrap_or_else(|err| panic!("delivery from {} to {} failed: {err}", from.0, to.0));
    }
}

/// N runtimes wired together with inline message delivery.
pub struct LoopbackGrid {
    runtimes: Vec<Arc<Runtime>>,
    events: Arc<EventTable>,
    tree: Arc<TestRegionTree>,
}

impl LoopbackGrid {
    /// Brings up `nodes` runtimes over `tree`.
    #[must_use]
    pub fn new(nodes: u16, tree: Arc<TestRegionTree>) -> Self {
        let events = Arc::new(EventTable::new());
        let transport = Arc::new(LoopbackTransport::default());
        let mut runtimes = Vec::new();
        for space in 0..nodes {
            let runtime = Runtime::new(
                SpaceId(space),
                Arc::clone(&tree) as Arc<dyn RegionTree>,
                Arc::clone(&transport) as Arc<dyn Transport>,
                Arc::clone(&events),
            );
            transport.peers.lock().insert(space, Arc::clone(&runtime));
            runtimes.push(runtime);
        }
        Self {
            runtimes,
            events,
            tree,
        }
    }

    /// Single-node grid.
    #[must_use]
    pub fn single(tree: Arc<TestRegionTree>) -> Self {
        Self::new(1, tree)
    }

    /// Runtime of `space`.
    #[must_use]
    pub fn runtime(&self, space: u16) -> &Arc<Runtime> {
        &self.runtimes[space as usize]
    }

    /// The shared event table.
    #[must_use]
    pub fn events(&self) -> &Arc<EventTable> {
        &self.events
    }

    /// The shared region tree.
    #[must_use]
    pub fn tree(&self) -> &Arc<TestRegionTree> {
        &self.tree
    }

    /// Registers `alloc` on every node, as a real grid would after
    /// distributing an allocation.
    pub fn register_allocation_everywhere(&self, alloc: &Arc<RecordingAllocation>) {
        for runtime in &self.runtimes {
            runtime.register_allocation(Arc::clone(alloc) as Arc<dyn Allocation>);
        }
    }
}
