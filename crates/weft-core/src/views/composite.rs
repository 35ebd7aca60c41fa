// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Composite views: immutable snapshots of a region sub-tree at a version,
//! and the planner that turns a snapshot into the minimum set of copies.
//!
//! The planner walks the snapshot tree toward the destination, issuing
//! grouped copies per level, recursing into intersecting children, folding
//! reductions in after the per-level copies, and compressing per-field
//! postconditions so the caller sees at most one event per field.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::collect::ReferenceKind;
use crate::event::{compute_event_sets, Event};
use crate::ident::{ChildColor, RedopId, RegionHandle, SpaceId, ViewId, ViewKind};
use crate::manager::VersionInfo;
use crate::mask::FieldMask;
use crate::runtime::{EngineError, Runtime};
use crate::user::FieldVersions;
use crate::views::materialized::merge_precondition;
use crate::views::{LogicalView, MaterializedView, ReductionView, ViewBase};
use crate::wire::{Message, WireCompositeNode, WireVersionInfo};

/// Outcome of [`CompositeView::simplify`].
pub enum Simplified {
    /// Nothing was elided; keep using the original view.
    Unchanged,
    /// A smaller equivalent snapshot was produced.
    Replaced(Arc<CompositeView>),
}

/// Tracks fields already captured per region node while simplifying, so
/// subtrees the closer has fully captured are elided from the new tree.
#[derive(Default)]
pub struct CaptureState {
    captured: BTreeMap<RegionHandle, FieldMask>,
}

impl CaptureState {
    /// Fresh state with nothing captured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subtracts the already-captured fields of `region` from `mask`;
    /// returns true when anything was removed.
    fn filter_capture_mask(&self, region: RegionHandle, mask: &mut FieldMask) -> bool {
        if let Some(captured) = self.captured.get(&region) {
            let overlap = *mask & *captured;
            if !overlap.is_empty() {
                *mask -= overlap;
                return true;
            }
        }
        false
    }

    /// Records `mask` as captured for `region`.
    pub fn update_capture_mask(&mut self, region: RegionHandle, mask: FieldMask) {
        self.captured
            .entry(region)
            .and_modify(|m| *m |= mask)
            .or_insert(mask);
    }
}

/// One node of a snapshot tree.
///
/// Nodes are built up by the capture path and immutable once the owning
/// view is published.
pub struct CompositeNode {
    region: RegionHandle,
    dirty_mask: FieldMask,
    reduction_mask: FieldMask,
    valid_views: BTreeMap<ViewId, (LogicalView, FieldMask)>,
    reduction_views: BTreeMap<ViewId, (Arc<ReductionView>, FieldMask)>,
    children: BTreeMap<ChildColor, (FieldMask, CompositeNode)>,
}

struct Ancestry<'a> {
    parent: &'a CompositeNode,
    color: ChildColor,
    up: Option<&'a Ancestry<'a>>,
}

impl CompositeNode {
    /// Empty node over `region`.
    #[must_use]
    pub fn new(region: RegionHandle) -> Self {
        Self {
            region,
            dirty_mask: FieldMask::EMPTY,
            reduction_mask: FieldMask::EMPTY,
            valid_views: BTreeMap::new(),
            reduction_views: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// Region-tree node this snapshot node covers.
    #[must_use]
    pub fn region(&self) -> RegionHandle {
        self.region
    }

    /// Marks `mask` as dirty at this level.
    pub fn record_dirty_fields(&mut self, mask: FieldMask) {
        self.dirty_mask |= mask;
    }

    /// Captures `view` as a valid source for `mask`.
    pub fn record_valid_view(&mut self, view: LogicalView, mask: FieldMask) {
        self.valid_views
            .entry(view.did())
            .and_modify(|(_, m)| *m |= mask)
            .or_insert((view, mask));
    }

    /// Captures `view` as a pending reduction for `mask`.
    pub fn record_reduction_view(&mut self, view: Arc<ReductionView>, mask: FieldMask) {
        self.reduction_mask |= mask;
        self.reduction_views
            .entry(view.did())
            .and_modify(|(_, m)| *m |= mask)
            .or_insert((view, mask));
    }

    /// Attaches `child` under `color`, merging masks when called twice.
    pub fn add_child(&mut self, color: ChildColor, mask: FieldMask, child: CompositeNode) {
        match self.children.entry(color) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert((mask, child));
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                slot.get_mut().0 |= mask;
            }
        }
    }

    fn for_each_view(&self, f: &mut impl FnMut(&LogicalView)) {
        for (view, _) in self.valid_views.values() {
            f(view);
        }
        for (view, _) in self.reduction_views.values() {
            let view = LogicalView::Reduction(Arc::clone(view));
            f(&view);
        }
        for (_, child) in self.children.values() {
            child.for_each_view(f);
        }
    }

    /// The single child the traversal can tail-call into: it must dominate
    /// the target while no sibling intersects it.
    fn find_next_root(
        &self,
        target: RegionHandle,
        runtime: &Runtime,
    ) -> Option<(ChildColor, &CompositeNode)> {
        if self.children.is_empty() {
            return None;
        }
        let tree = runtime.region_tree();
        if self.children.len() == 1 {
            let (color, (_, child)) = self.children.iter().next()?;
            if tree.dominates(child.region, target) {
                return Some((*color, child));
            }
            return None;
        }
        if tree.all_children_disjoint(self.region) {
            for (color, (_, child)) in &self.children {
                if tree.dominates(child.region, target) {
                    return Some((*color, child));
                }
            }
            return None;
        }
        let mut found: Option<(ChildColor, &CompositeNode)> = None;
        for (color, (_, child)) in &self.children {
            if tree.dominates(child.region, target) {
                // Two dominating children means no unique root.
                if found.is_some() {
                    return None;
                }
                found = Some((*color, child));
                continue;
            }
            if tree.intersects(child.region, target) {
                return None;
            }
        }
        found
    }

    /// Valid sources for `search_mask` at this level, inheriting from
    /// ancestors (through their subviews at our color) for fields not
    /// dirty at a nearer descendant.
    fn find_valid_views(
        &self,
        ancestry: Option<&Ancestry<'_>>,
        search_mask: FieldMask,
        valid: &mut BTreeMap<ViewId, (LogicalView, FieldMask)>,
    ) -> Result<(), EngineError> {
        if let Some(anc) = ancestry {
            let up_mask = search_mask - self.dirty_mask;
            if !up_mask.is_empty() {
                let mut valid_up = BTreeMap::new();
                anc.parent.find_valid_views(anc.up, up_mask, &mut valid_up)?;
                for (_, (view, mask)) in valid_up {
                    let local = view.get_subview(anc.color)?;
                    valid
                        .entry(local.did())
                        .and_modify(|(_, m)| *m |= mask)
                        .or_insert((local, mask));
                }
            }
        }
        for (did, (view, mask)) in &self.valid_views {
            let overlap = search_mask & *mask;
            if overlap.is_empty() {
                continue;
            }
            valid
                .entry(*did)
                .and_modify(|(_, m)| *m |= overlap)
                .or_insert((view.clone(), overlap));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_deferred_copies(
        &self,
        ancestry: Option<&Ancestry<'_>>,
        dst: &Arc<MaterializedView>,
        copy_mask: &FieldMask,
        version_info: &VersionInfo,
        preconditions: &BTreeMap<Event, FieldMask>,
        postconditions: &mut BTreeMap<Event, FieldMask>,
        postreductions: &mut BTreeMap<Event, FieldMask>,
        check_root: bool,
    ) -> Result<(), EngineError> {
        // Invariant: at most one event per field lands in `postconditions`.
        let mut local_postconditions: BTreeMap<Event, FieldMask> = BTreeMap::new();
        let mut traverse_children = true;
        if check_root {
            let rt = self.runtime_of(dst);
            if let Some((color, child)) = self.find_next_root(dst.region(), rt) {
                let child_anc = Ancestry {
                    parent: self,
                    color,
                    up: ancestry,
                };
                if self.reduction_views.is_empty() {
                    // The common case: tail-call into the dominating child.
                    return child.issue_deferred_copies(
                        Some(&child_anc),
                        dst,
                        copy_mask,
                        version_info,
                        preconditions,
                        postconditions,
                        postreductions,
                        true,
                    );
                }
                // Fall through to catch the reductions at this level, but
                // do not traverse the children twice.
                child.issue_deferred_copies(
                    Some(&child_anc),
                    dst,
                    copy_mask,
                    version_info,
                    preconditions,
                    &mut local_postconditions,
                    postreductions,
                    true,
                )?;
                traverse_children = false;
            } else {
                // Pull down every possibly-overlapping source before
                // issuing the level's copies.
                let mut all_valid = BTreeMap::new();
                self.find_valid_views(ancestry, *copy_mask, &mut all_valid)?;
                if !all_valid.is_empty() {
                    if self.children.is_empty() && self.reduction_views.is_empty() {
                        return self.issue_update_copies(
                            dst,
                            *copy_mask,
                            version_info,
                            preconditions,
                            postconditions,
                            &all_valid,
                        );
                    }
                    self.issue_update_copies(
                        dst,
                        *copy_mask,
                        version_info,
                        preconditions,
                        &mut local_postconditions,
                        &all_valid,
                    )?;
                }
            }
        } else if !self.valid_views.is_empty() {
            let update_mask = self.dirty_mask & *copy_mask;
            if !update_mask.is_empty() {
                if self.children.is_empty() && self.reduction_views.is_empty() {
                    return self.issue_update_copies(
                        dst,
                        update_mask,
                        version_info,
                        preconditions,
                        postconditions,
                        &self.valid_views,
                    );
                }
                self.issue_update_copies(
                    dst,
                    update_mask,
                    version_info,
                    preconditions,
                    &mut local_postconditions,
                    &self.valid_views,
                )?;
            }
        }
        // Preconditions for the children: everything from above plus what
        // this level just produced, snapshotted at the first interfering
        // child.
        let mut combined_pre: Option<BTreeMap<Event, FieldMask>> = None;
        if traverse_children {
            let rt = self.runtime_of(dst);
            for (color, (child_mask, child)) in &self.children {
                let overlap = *child_mask & *copy_mask;
                if overlap.is_empty() {
                    continue;
                }
                if !rt.region_tree().intersects(child.region, dst.region()) {
                    continue;
                }
                if combined_pre.is_none() {
                    combined_pre = Some(if local_postconditions.is_empty() {
                        preconditions.clone()
                    } else {
                        let mut merged = local_postconditions.clone();
                        for (event, mask) in preconditions {
                            merge_precondition(&mut merged, event, mask);
                        }
                        merged
                    });
                }
                let child_anc = Ancestry {
                    parent: self,
                    color: *color,
                    up: ancestry,
                };
                let pre = combined_pre
                    .as_ref()
                    .map_or(preconditions, |p| p);
                child.issue_deferred_copies(
                    Some(&child_anc),
                    dst,
                    &overlap,
                    version_info,
                    pre,
                    &mut local_postconditions,
                    postreductions,
                    false,
                )?;
            }
        }
        if !self.reduction_views.is_empty() {
            let merged_storage;
            let pre_for_reductions = if let Some(combined) = combined_pre.as_ref() {
                combined
            } else if local_postconditions.is_empty() {
                preconditions
            } else {
                let mut merged = local_postconditions.clone();
                for (event, mask) in preconditions {
                    merge_precondition(&mut merged, event, mask);
                }
                merged_storage = merged;
                &merged_storage
            };
            self.issue_update_reductions(dst, *copy_mask, pre_for_reductions, postreductions);
        }
        if local_postconditions.is_empty() {
            return Ok(());
        }
        if combined_pre.is_some() {
            // Children were traversed: compress so each field keeps a
            // single covering event.
            for set in compute_event_sets(*copy_mask, &local_postconditions) {
                let post = Event::merge(set.events.iter());
                if post.exists() {
                    postconditions.insert(post, set.mask);
                }
            }
        } else {
            for (event, mask) in local_postconditions {
                merge_precondition(postconditions, &event, &mask);
            }
        }
        Ok(())
    }

    fn runtime_of<'a>(&self, dst: &'a Arc<MaterializedView>) -> &'a Runtime {
        dst.base().runtime().as_ref()
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_update_copies(
        &self,
        dst: &Arc<MaterializedView>,
        copy_mask: FieldMask,
        version_info: &VersionInfo,
        preconditions: &BTreeMap<Event, FieldMask>,
        postconditions: &mut BTreeMap<Event, FieldMask>,
        views: &BTreeMap<ViewId, (LogicalView, FieldMask)>,
    ) -> Result<(), EngineError> {
        let mut copy_mask = copy_mask;
        // Fields the destination already holds need no copy.
        if let Some((_, already)) = views.get(&dst.did()) {
            copy_mask -= *already;
            if copy_mask.is_empty() {
                return Ok(());
            }
        }
        // Materialized sources take fields first; deferred sources cover
        // what remains. Assignment is greedy in id order.
        let mut assigned = FieldMask::EMPTY;
        let mut src_instances: Vec<(Arc<MaterializedView>, FieldMask)> = Vec::new();
        let mut deferred_instances: Vec<(LogicalView, FieldMask)> = Vec::new();
        for (did, (view, mask)) in views {
            if *did == dst.did() {
                continue;
            }
            if let Some(source) = view.as_materialized() {
                let take = (*mask & copy_mask) - assigned;
                if take.is_empty() {
                    continue;
                }
                assigned |= take;
                src_instances.push((Arc::clone(source), take));
            }
        }
        for (did, (view, mask)) in views {
            if *did == dst.did() || view.as_materialized().is_some() {
                continue;
            }
            let take = (*mask & copy_mask) - assigned;
            if take.is_empty() {
                continue;
            }
            assigned |= take;
            deferred_instances.push((view.clone(), take));
        }
        if !src_instances.is_empty() {
            let mut actual_copy_mask = FieldMask::EMPTY;
            let mut src_preconditions: BTreeMap<Event, FieldMask> = BTreeMap::new();
            for (source, mask) in &src_instances {
                source.find_copy_preconditions(
                    RedopId::NONE,
                    true,
                    mask,
                    version_info,
                    &mut src_preconditions,
                );
                actual_copy_mask |= *mask;
            }
            // Fold in the incoming preconditions on the copied fields.
            for (event, mask) in preconditions {
                let overlap = *mask & actual_copy_mask;
                if overlap.is_empty() {
                    continue;
                }
                merge_precondition(&mut src_preconditions, event, &overlap);
            }
            let intersect = if self.region == dst.region() {
                None
            } else {
                Some(self.region)
            };
            for set in compute_event_sets(actual_copy_mask, &src_preconditions) {
                let mut src_fields = Vec::new();
                let mut dst_fields = Vec::new();
                let mut contributions: Vec<(&Arc<MaterializedView>, FieldMask)> = Vec::new();
                for (source, mask) in &src_instances {
                    let overlap = *mask & set.mask;
                    if overlap.is_empty() {
                        continue;
                    }
                    src_fields.extend(source.copy_from(&overlap));
                    dst_fields.extend(dst.copy_to(&overlap));
                    contributions.push((source, overlap));
                }
                if contributions.is_empty() {
                    continue;
                }
                let copy_pre = Event::merge(set.events.iter());
                let copy_post =
                    dst.manager()
                        .issue_copy(&src_fields, &dst_fields, copy_pre, intersect);
                if copy_post.exists() {
                    merge_precondition(postconditions, &copy_post, &set.mask);
                    dst.add_copy_user(RedopId::NONE, &copy_post, version_info, &set.mask, false);
                    for (source, overlap) in contributions {
                        source.add_copy_user(
                            RedopId::NONE,
                            &copy_post,
                            version_info,
                            &overlap,
                            true,
                        );
                    }
                }
            }
        }
        for (view, mask) in deferred_instances {
            match view {
                LogicalView::Composite(composite) => {
                    composite.issue_deferred_copies(dst, &mask, preconditions, postconditions)?;
                }
                LogicalView::Fill(fill) => {
                    fill.issue_deferred_copies(dst, &mask, preconditions, postconditions);
                }
                LogicalView::Materialized(_) | LogicalView::Reduction(_) => {}
            }
        }
        Ok(())
    }

    fn issue_update_reductions(
        &self,
        dst: &Arc<MaterializedView>,
        copy_mask: FieldMask,
        preconditions: &BTreeMap<Event, FieldMask>,
        postreductions: &mut BTreeMap<Event, FieldMask>,
    ) {
        let reduce_mask = copy_mask & self.reduction_mask;
        if reduce_mask.is_empty() {
            return;
        }
        let mut local_preconditions = BTreeSet::new();
        for (event, mask) in preconditions {
            if mask.disjoint(&reduce_mask) {
                continue;
            }
            local_preconditions.insert(event.clone());
        }
        for (view, mask) in self.reduction_views.values() {
            let overlap = reduce_mask & *mask;
            if overlap.is_empty() {
                continue;
            }
            let intersect = if view.region() == dst.region() {
                None
            } else {
                Some(view.region())
            };
            let reduce_event = view.perform_deferred_reduction(
                dst,
                &reduce_mask,
                &local_preconditions,
                intersect,
            );
            if reduce_event.exists() {
                postreductions.insert(reduce_event, overlap);
            }
        }
    }

    fn simplify_into(
        &self,
        capture: &mut CaptureState,
        mut capture_mask: FieldMask,
        changed: &mut bool,
    ) -> Option<CompositeNode> {
        if capture.filter_capture_mask(self.region, &mut capture_mask) {
            *changed = true;
        }
        if capture_mask.is_empty() {
            *changed = true;
            return None;
        }
        let mut new_node = CompositeNode::new(self.region);
        for (color, (child_mask, child)) in &self.children {
            let child_capture = *child_mask & capture_mask;
            if child_capture.is_empty() {
                *changed = true;
                continue;
            }
            if let Some(new_child) = child.simplify_into(capture, child_capture, changed) {
                new_node.add_child(*color, child_capture, new_child);
            }
        }
        for (view, mask) in self.valid_views.values() {
            let overlap = *mask & capture_mask;
            if overlap.is_empty() {
                *changed = true;
                continue;
            }
            if overlap != *mask {
                *changed = true;
            }
            new_node.record_valid_view(view.clone(), overlap);
        }
        new_node.record_dirty_fields(self.dirty_mask & capture_mask);
        for (view, mask) in self.reduction_views.values() {
            let overlap = *mask & capture_mask;
            if overlap.is_empty() {
                continue;
            }
            new_node.record_reduction_view(Arc::clone(view), overlap);
        }
        capture.update_capture_mask(self.region, capture_mask);
        Some(new_node)
    }

    fn pack(&self) -> WireCompositeNode {
        WireCompositeNode {
            dirty: self.dirty_mask,
            reduction: self.reduction_mask,
            views: self
                .valid_views
                .values()
                .map(|(view, mask)| (view.did(), *mask))
                .collect(),
            reductions: self
                .reduction_views
                .values()
                .map(|(view, mask)| (view.did(), *mask))
                .collect(),
            children: self
                .children
                .iter()
                .map(|(color, (mask, child))| (*color, *mask, child.pack()))
                .collect(),
        }
    }

    fn unpack(
        runtime: &Arc<Runtime>,
        region: RegionHandle,
        wire: &WireCompositeNode,
    ) -> Result<Self, EngineError> {
        let mut node = CompositeNode::new(region);
        node.record_dirty_fields(wire.dirty);
        for (did, mask) in &wire.views {
            let view = runtime.find_or_request_logical_view(*did)?;
            node.record_valid_view(view, *mask);
        }
        for (did, mask) in &wire.reductions {
            let view = runtime.find_or_request_logical_view(*did)?.expect_reduction()?;
            node.record_reduction_view(view, *mask);
        }
        debug_assert_eq!(node.reduction_mask, wire.reduction);
        for (color, mask, child_wire) in &wire.children {
            let child_region = runtime.region_tree().child_of(region, *color);
            let child = Self::unpack(runtime, child_region, child_wire)?;
            node.add_child(*color, *mask, child);
        }
        Ok(node)
    }
}

/// An immutable snapshot of a sub-region's state at a version.
pub struct CompositeView {
    base: ViewBase,
    version_info: VersionInfo,
    root: CompositeNode,
}

impl CompositeView {
    /// Publishes a snapshot. The tree takes composite-node references on
    /// every captured view and is immutable from here on.
    pub fn create(
        runtime: &Arc<Runtime>,
        did: ViewId,
        owner: SpaceId,
        region: RegionHandle,
        version_info: VersionInfo,
        root: CompositeNode,
    ) -> Arc<Self> {
        root.for_each_view(&mut |view| {
            view.refs().add(ReferenceKind::CompositeNode, 1);
        });
        let view = Arc::new(Self {
            base: ViewBase::new(runtime, did, owner, region),
            version_info,
            root,
        });
        if !view.base.is_owner() {
            view.base.send_remote_registration();
        }
        debug!(did = ?view.base.did(), region = region.0, "composite view published");
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

    /// Region-tree node of the snapshot root.
    #[must_use]
    pub fn region(&self) -> RegionHandle {
        self.base.region()
    }

    /// The frozen version context the snapshot was captured at.
    #[must_use]
    pub fn version_info(&self) -> &VersionInfo {
        &self.version_info
    }

    /// The snapshot root.
    #[must_use]
    pub fn root(&self) -> &CompositeNode {
        &self.root
    }

    /// Plans the copies and fills that make `dst` hold the snapshot's
    /// contents on `copy_mask`. On return `postconditions` carries at most
    /// one event per requested field.
    pub fn issue_deferred_copies(
        &self,
        dst: &Arc<MaterializedView>,
        copy_mask: &FieldMask,
        preconditions: &BTreeMap<Event, FieldMask>,
        postconditions: &mut BTreeMap<Event, FieldMask>,
    ) -> Result<(), EngineError> {
        let mut postreductions = BTreeMap::new();
        self.root.issue_deferred_copies(
            None,
            dst,
            copy_mask,
            &self.version_info,
            preconditions,
            postconditions,
            &mut postreductions,
            true,
        )?;
        if !postreductions.is_empty() {
            // Reductions ran after the copies; regroup so each field keeps
            // a single covering event.
            for (event, mask) in std::mem::take(postconditions) {
                merge_precondition(&mut postreductions, &event, &mask);
            }
            for set in compute_event_sets(*copy_mask, &postreductions) {
                let post = Event::merge(set.events.iter());
                if post.exists() {
                    postconditions.insert(post, set.mask);
                }
            }
        }
        Ok(())
    }

    /// Produces an equivalent snapshot restricted to `capture_mask` with
    /// closer-captured subtrees elided. Returns [`Simplified::Unchanged`]
    /// when nothing was dropped.
    pub fn simplify(
        &self,
        capture: &mut CaptureState,
        capture_mask: &FieldMask,
    ) -> Result<Simplified, EngineError> {
        let mut changed = false;
        let new_root = self.root.simplify_into(capture, *capture_mask, &mut changed);
        if !changed {
            return Ok(Simplified::Unchanged);
        }
        let runtime = Arc::clone(self.base.runtime());
        let did = runtime.allocate_view_id(ViewKind::Composite)?;
        let root = new_root.unwrap_or_else(|| CompositeNode::new(self.region()));
        let view = Self::create(
            &runtime,
            did,
            runtime.space(),
            self.region(),
            self.version_info.clone(),
            root,
        );
        runtime.register_view(LogicalView::Composite(Arc::clone(&view)));
        Ok(Simplified::Replaced(view))
    }

    /// Owner-side announce: ships the frozen version info and the whole
    /// tree, preorder.
    pub fn send_view(&self, target: SpaceId) {
        debug_assert!(self.base.is_owner());
        let version_info = WireVersionInfo {
            upper_bound: self.version_info.upper_bound(),
            versions: self
                .version_info
                .iter_versions()
                .map(|(node, versions)| (node, versions.iter().collect()))
                .collect(),
        };
        self.base.runtime().send(
            target,
            &Message::CompositeViewAnnounce {
                did: self.did(),
                owner: self.base.owner(),
                is_region: true,
                handle: self.region(),
                version_info,
                root: self.root.pack(),
            },
        );
        self.base.update_remote_instances(target);
    }

    /// Builds the replica of an announced snapshot, resolving every
    /// captured view (blocking on arrivals as needed).
    pub fn from_wire(
        runtime: &Arc<Runtime>,
        did: ViewId,
        owner: SpaceId,
        region: RegionHandle,
        version_info: &WireVersionInfo,
        root: &WireCompositeNode,
    ) -> Result<Arc<Self>, EngineError> {
        let mut info = VersionInfo::new();
        if let Some(upper) = version_info.upper_bound {
            info = info.with_upper_bound(upper);
        }
        for (node, pairs) in &version_info.versions {
            let versions: FieldVersions = pairs.iter().copied().collect();
            info = info.with_versions(*node, Arc::new(versions));
        }
        let root = CompositeNode::unpack(runtime, region, root)?;
        Ok(Self::create(runtime, did, owner, region, info, root))
    }

    /// Lifecycle teardown: drop the tree's references on captured views.
    pub fn destroy(&self) {
        self.root.for_each_view(&mut |view| {
            if view.refs().remove(ReferenceKind::CompositeNode, 1) {
                view.destroy();
            }
        });
        self.base.runtime().unregister_view(self.did());
        if !self.base.is_owner() {
            self.base.send_remote_unregistration();
        }
    }
}
