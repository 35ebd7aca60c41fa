// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reduction-view pairing rules and the deferred reduction path.

mod common;

use std::collections::{BTreeMap, BTreeSet};

use weft_core::{RedopId, RegionUsage, UserEvent, VersionInfo};
use weft_testkit::{mask, IssuedOp};

use common::{fixture, reduction, ROOT};

const OP: RedopId = RedopId(4);

#[test]
fn reducers_never_wait_on_reducers() {
    let fx = fixture(1, false);
    let view = reduction(&fx.grid, 0, &fx.alloc, ROOT, OP);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    let first = view.add_user(&RegionUsage::reduce(OP), &e1.event(), &mask(&[0]));
    let second = view.add_user(&RegionUsage::reduce(OP), &e2.event(), &mask(&[0]));
    assert!(!first.exists());
    assert!(!second.exists());
}

#[test]
fn readers_never_wait_on_readers() {
    let fx = fixture(1, false);
    let view = reduction(&fx.grid, 0, &fx.alloc, ROOT, OP);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    let first = view.add_user(&RegionUsage::read_only(), &e1.event(), &mask(&[0]));
    let second = view.add_user(&RegionUsage::read_only(), &e2.event(), &mask(&[0]));
    assert!(!first.exists());
    assert!(!second.exists());
}

#[test]
fn readers_and_reducers_order_both_ways() {
    let fx = fixture(1, false);
    let view = reduction(&fx.grid, 0, &fx.alloc, ROOT, OP);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    view.add_user(&RegionUsage::reduce(OP), &e1.event(), &mask(&[0]));
    let reader_pre = view.add_user(&RegionUsage::read_only(), &e2.event(), &mask(&[0]));
    assert_eq!(reader_pre, e1.event(), "a new reader waits on the reducer");

    let e3 = UserEvent::create();
    let reducer_pre = view.add_user(&RegionUsage::reduce(OP), &e3.event(), &mask(&[0]));
    assert_eq!(reducer_pre, e2.event(), "a new reducer waits on the reader");
}

#[test]
fn disjoint_fields_pair_freely() {
    let fx = fixture(1, false);
    let view = reduction(&fx.grid, 0, &fx.alloc, ROOT, OP);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    view.add_user(&RegionUsage::reduce(OP), &e1.event(), &mask(&[0]));
    let pre = view.add_user(&RegionUsage::read_only(), &e2.event(), &mask(&[1]));
    assert!(!pre.exists());
}

#[test]
fn copy_preconditions_follow_the_bipartite_rule() {
    let fx = fixture(1, false);
    let view = reduction(&fx.grid, 0, &fx.alloc, ROOT, OP);
    let e1 = UserEvent::create();
    view.add_copy_user(OP, &e1.event(), &mask(&[0]), false);

    // A reading copy depends on the reducer.
    let mut reading = BTreeMap::new();
    view.find_copy_preconditions(OP, true, &mask(&[0]), &mut reading);
    assert_eq!(reading[&e1.event()], mask(&[0]));

    // Another reducing copy does not.
    let mut reducing = BTreeMap::new();
    view.find_copy_preconditions(OP, false, &mask(&[0]), &mut reducing);
    assert!(reducing.is_empty());
}

#[test]
fn perform_reduction_issues_through_the_manager_and_registers_both_sides() {
    let fx = fixture(1, false);
    let view = reduction(&fx.grid, 0, &fx.alloc, ROOT, OP);
    let e1 = UserEvent::create();
    view.add_copy_user(OP, &e1.event(), &mask(&[0]), false);

    let target = weft_core::LogicalView::Materialized(std::sync::Arc::clone(&fx.root));
    view.perform_reduction(&target, &mask(&[0]), &VersionInfo::new());

    let ops = fx.alloc.ops();
    let reduction_op = ops
        .iter()
        .find_map(|op| match op {
            IssuedOp::Reduction { redop, fold, pre, .. } => Some((*redop, *fold, pre.clone())),
            _ => None,
        })
        .expect("a reduction was issued");
    assert_eq!(reduction_op.0, OP);
    assert!(!reduction_op.1, "materialized targets never fold");
    assert_eq!(reduction_op.2, e1.event(), "the reducer's event gates the copy");

    // Both views recorded the completion.
    fx.root.with_epochs(|tables| {
        assert_eq!(tables.current().len(), 1);
    });
}

#[test]
fn deferred_reduction_takes_external_preconditions_and_skips_the_target() {
    let fx = fixture(1, false);
    let view = reduction(&fx.grid, 0, &fx.alloc, ROOT, OP);
    let external = UserEvent::create();
    let mut pre = BTreeSet::new();
    pre.insert(external.event());

    let post = view.perform_deferred_reduction(&fx.root, &mask(&[0]), &pre, None);
    assert!(post.exists());
    let ops = fx.alloc.ops();
    match &ops[0] {
        IssuedOp::Reduction { pre, .. } => assert_eq!(*pre, external.event()),
        _ => panic!("expected a reduction"),
    }
    // The destination's record is the caller's job.
    fx.root.with_epochs(|tables| {
        assert!(tables.current().is_empty());
    });
}
