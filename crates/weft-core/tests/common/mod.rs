// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared fixtures for the view-engine scenario tests.
#![allow(dead_code)]

use std::sync::Arc;

use weft_core::{
    AllocId, ChildColor, ContextId, LogicalView, MaterializedView, RedopId, ReductionView,
    RegionHandle, ViewKind,
};
use weft_testkit::{mask, LoopbackGrid, RecordingAllocation, TestRegionTree};

/// Root region used by every fixture.
pub const ROOT: RegionHandle = RegionHandle(1);
/// First child of [`ROOT`], color 0.
pub const CHILD_A: RegionHandle = RegionHandle(2);
/// Second child of [`ROOT`], color 1.
pub const CHILD_B: RegionHandle = RegionHandle(3);

/// Color of [`CHILD_A`].
pub const COLOR_A: ChildColor = ChildColor(0);
/// Color of [`CHILD_B`].
pub const COLOR_B: ChildColor = ChildColor(1);

pub struct Fixture {
    pub grid: LoopbackGrid,
    pub alloc: Arc<RecordingAllocation>,
    pub root: Arc<MaterializedView>,
}

/// One node, a root region with two children (disjoint when asked), and a
/// root materialized view over an eight-field allocation.
pub fn fixture(nodes: u16, disjoint_children: bool) -> Fixture {
    let tree = TestRegionTree::new();
    tree.add_root(ROOT);
    tree.add_child(ROOT, COLOR_A, CHILD_A);
    tree.add_child(ROOT, COLOR_B, CHILD_B);
    if disjoint_children {
        tree.declare_disjoint(ROOT, COLOR_A, COLOR_B);
    }
    let grid = LoopbackGrid::new(nodes, tree);
    let alloc = RecordingAllocation::new(AllocId(1), mask(&[0, 1, 2, 3, 4, 5, 6, 7]));
    grid.register_allocation_everywhere(&alloc);
    let root = materialized(&grid, 0, &alloc, ROOT);
    Fixture { grid, alloc, root }
}

/// Creates and registers a root materialized view owned by `space`.
pub fn materialized(
    grid: &LoopbackGrid,
    space: u16,
    alloc: &Arc<RecordingAllocation>,
    region: RegionHandle,
) -> Arc<MaterializedView> {
    let runtime = grid.runtime(space);
    let did = runtime
        .allocate_view_id(ViewKind::Materialized)
        .expect("id space");
    let view = MaterializedView::create(
        runtime,
        did,
        runtime.space(),
        region,
        Arc::clone(alloc) as _,
        None,
        ContextId(0),
    );
    runtime.register_view(LogicalView::Materialized(Arc::clone(&view)));
    view
}

/// Creates and registers a reduction view owned by `space`.
pub fn reduction(
    grid: &LoopbackGrid,
    space: u16,
    alloc: &Arc<RecordingAllocation>,
    region: RegionHandle,
    redop: RedopId,
) -> Arc<ReductionView> {
    let runtime = grid.runtime(space);
    let did = runtime
        .allocate_view_id(ViewKind::Reduction)
        .expect("id space");
    let view = ReductionView::create(
        runtime,
        did,
        runtime.space(),
        region,
        Arc::clone(alloc) as _,
        redop,
        ContextId(0),
    );
    runtime.register_view(LogicalView::Reduction(Arc::clone(&view)));
    view
}
