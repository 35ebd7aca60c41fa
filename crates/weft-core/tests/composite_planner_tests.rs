// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Composite snapshot planning: fan-out over disjoint children, tail-call
//! through dominating children, reduction folding, and simplification.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use weft_core::{
    AllocId, CaptureState, CompositeNode, CompositeView, ContextId, FieldId, LogicalView,
    MaterializedView, RedopId, Simplified, VersionInfo, ViewKind,
};
use weft_testkit::{mask, IssuedOp, LoopbackGrid, RecordingAllocation, TestRegionTree};

use common::{CHILD_A, CHILD_B, COLOR_A, COLOR_B, ROOT};

struct Planner {
    grid: LoopbackGrid,
    dst_alloc: Arc<RecordingAllocation>,
    dst: Arc<MaterializedView>,
}

fn planner() -> Planner {
    let tree = TestRegionTree::new();
    tree.add_root(ROOT);
    tree.add_child(ROOT, COLOR_A, CHILD_A);
    tree.add_child(ROOT, COLOR_B, CHILD_B);
    tree.declare_disjoint(ROOT, COLOR_A, COLOR_B);
    let grid = LoopbackGrid::single(tree);
    let dst_alloc = RecordingAllocation::new(AllocId(100), mask(&[0, 1, 2, 3]));
    grid.register_allocation_everywhere(&dst_alloc);
    let dst = common::materialized(&grid, 0, &dst_alloc, ROOT);
    Planner {
        grid,
        dst_alloc,
        dst,
    }
}

fn source(
    planner: &Planner,
    alloc_id: u64,
    region: weft_core::RegionHandle,
) -> Arc<MaterializedView> {
    let alloc = RecordingAllocation::new(AllocId(alloc_id), mask(&[0, 1, 2, 3]));
    planner.grid.register_allocation_everywhere(&alloc);
    common::materialized(&planner.grid, 0, &alloc, region)
}

fn publish(planner: &Planner, root: CompositeNode) -> Arc<CompositeView> {
    let runtime = planner.grid.runtime(0);
    let did = runtime
        .allocate_view_id(ViewKind::Composite)
        .expect("id space");
    let view = CompositeView::create(
        runtime,
        did,
        runtime.space(),
        root.region(),
        VersionInfo::new(),
        root,
    );
    runtime.register_view(LogicalView::Composite(Arc::clone(&view)));
    view
}

#[test]
fn fan_out_issues_one_grouped_copy_per_child_and_one_event_per_field() {
    let px = planner();
    let src_a = source(&px, 101, CHILD_A);
    let src_b = source(&px, 102, CHILD_B);

    let mut node_a = CompositeNode::new(CHILD_A);
    node_a.record_dirty_fields(mask(&[0]));
    node_a.record_valid_view(LogicalView::Materialized(Arc::clone(&src_a)), mask(&[0]));
    let mut node_b = CompositeNode::new(CHILD_B);
    node_b.record_dirty_fields(mask(&[1]));
    node_b.record_valid_view(LogicalView::Materialized(Arc::clone(&src_b)), mask(&[1]));

    let mut root = CompositeNode::new(ROOT);
    root.add_child(COLOR_A, mask(&[0]), node_a);
    root.add_child(COLOR_B, mask(&[1]), node_b);
    let composite = publish(&px, root);

    let mut post = BTreeMap::new();
    composite
        .issue_deferred_copies(&px.dst, &mask(&[0, 1]), &BTreeMap::new(), &mut post)
        .expect("plan");

    // One grouped copy per child.
    assert_eq!(copy_count(&px.dst_alloc), 2);
    // Exactly one postcondition event per requested field.
    for field in [FieldId(0), FieldId(1)] {
        let covering = post.values().filter(|m| m.contains(field)).count();
        assert_eq!(covering, 1, "field {field:?} must have one covering event");
    }
}

#[test]
fn single_dominating_child_is_tail_called() {
    let px = planner();
    let src_a = source(&px, 103, CHILD_A);

    let mut node_a = CompositeNode::new(CHILD_A);
    node_a.record_dirty_fields(mask(&[0]));
    node_a.record_valid_view(LogicalView::Materialized(Arc::clone(&src_a)), mask(&[0]));
    let mut root = CompositeNode::new(ROOT);
    root.add_child(COLOR_A, mask(&[0]), node_a);
    let composite = publish(&px, root);

    // The destination sits below the child, so the planner descends without
    // doing anything at the root level.
    let dst_alloc = RecordingAllocation::new(AllocId(104), mask(&[0, 1]));
    px.grid.register_allocation_everywhere(&dst_alloc);
    let dst = common::materialized(&px.grid, 0, &dst_alloc, CHILD_A);

    let mut post = BTreeMap::new();
    composite
        .issue_deferred_copies(&dst, &mask(&[0]), &BTreeMap::new(), &mut post)
        .expect("plan");
    assert_eq!(dst_alloc.op_count(), 1);
    assert_eq!(post.len(), 1);
    let (_, covered) = post.iter().next().expect("one post event");
    assert_eq!(*covered, mask(&[0]));
}

#[test]
fn reductions_fold_in_after_the_level_copies() {
    let px = planner();
    let src = source(&px, 105, ROOT);
    let red_alloc = RecordingAllocation::new(AllocId(106), mask(&[0, 1, 2, 3]));
    px.grid.register_allocation_everywhere(&red_alloc);
    let reducer = common::reduction(&px.grid, 0, &red_alloc, ROOT, RedopId(4));

    let mut root = CompositeNode::new(ROOT);
    root.record_dirty_fields(mask(&[0]));
    root.record_valid_view(LogicalView::Materialized(Arc::clone(&src)), mask(&[0]));
    root.record_reduction_view(Arc::clone(&reducer), mask(&[0]));
    let composite = publish(&px, root);

    let mut post = BTreeMap::new();
    composite
        .issue_deferred_copies(&px.dst, &mask(&[0]), &BTreeMap::new(), &mut post)
        .expect("plan");

    // The copy landed on the destination's manager, the reduction on the
    // reduction allocation, gated by the copy's completion.
    let copy_post = px
        .dst_alloc
        .ops()
        .iter()
        .find_map(|op| match op {
            IssuedOp::Copy { post, .. } => Some(post.event()),
            _ => None,
        })
        .expect("a copy was issued");
    let reduction_pre = red_alloc
        .ops()
        .iter()
        .find_map(|op| match op {
            IssuedOp::Reduction { pre, .. } => Some(pre.clone()),
            _ => None,
        })
        .expect("a reduction was issued");
    assert_eq!(reduction_pre, copy_post);

    // Copy and reduction compress to a single event covering field 0.
    assert_eq!(post.len(), 1);
}

#[test]
fn simplify_elides_captured_fields_and_reports_identity_otherwise() {
    let px = planner();
    let src = source(&px, 107, ROOT);
    let mut root = CompositeNode::new(ROOT);
    root.record_dirty_fields(mask(&[0, 1]));
    root.record_valid_view(LogicalView::Materialized(Arc::clone(&src)), mask(&[0, 1]));
    let composite = publish(&px, root);

    // Nothing captured yet: the same tree comes back.
    let mut fresh = CaptureState::new();
    match composite
        .simplify(&mut fresh, &mask(&[0, 1]))
        .expect("simplify")
    {
        Simplified::Unchanged => {}
        Simplified::Replaced(_) => panic!("an untouched capture must not rebuild the tree"),
    }

    // With field 0 already captured at the root, the new tree keeps only
    // field 1.
    let mut partial = CaptureState::new();
    partial.update_capture_mask(ROOT, mask(&[0]));
    let replaced = match composite
        .simplify(&mut partial, &mask(&[0, 1]))
        .expect("simplify")
    {
        Simplified::Replaced(view) => view,
        Simplified::Unchanged => panic!("captured fields must be elided"),
    };
    let mut post = BTreeMap::new();
    replaced
        .issue_deferred_copies(&px.dst, &mask(&[1]), &BTreeMap::new(), &mut post)
        .expect("plan");
    assert_eq!(post.len(), 1);
}

fn copy_count(alloc: &RecordingAllocation) -> usize {
    alloc
        .ops()
        .iter()
        .filter(|op| matches!(op, IssuedOp::Copy { .. }))
        .count()
}
