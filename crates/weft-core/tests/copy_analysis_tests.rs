// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Copy-path analysis: mask-keyed precondition maps, the reader/reducer
//! cut-offs, and the same-version WAR skip.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use weft_core::{FieldId, FieldVersions, RedopId, UserEvent, VersionInfo};
use weft_testkit::mask;

use common::{fixture, ROOT};

fn versions(field: u32, version: u64) -> VersionInfo {
    let fv: FieldVersions = [(FieldId(field), version)].into_iter().collect();
    VersionInfo::new().with_versions(ROOT, Arc::new(fv))
}

#[test]
fn copy_preconditions_carry_per_field_masks() {
    let fx = fixture(1, false);
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    fx.root
        .add_copy_user(RedopId::NONE, &e1.event(), &vi, &mask(&[0]), false);
    fx.root
        .add_copy_user(RedopId::NONE, &e2.event(), &vi, &mask(&[1]), false);

    let mut pre = BTreeMap::new();
    fx.root
        .find_copy_preconditions(RedopId::NONE, true, &mask(&[0, 1, 2]), &vi, &mut pre);
    assert_eq!(pre.len(), 2);
    assert_eq!(pre[&e1.event()], mask(&[0]));
    assert_eq!(pre[&e2.event()], mask(&[1]));
}

#[test]
fn reading_copies_skip_prior_readers() {
    let fx = fixture(1, false);
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();

    fx.root
        .add_copy_user(RedopId::NONE, &e1.event(), &vi, &mask(&[0]), true);
    let mut pre = BTreeMap::new();
    fx.root
        .find_copy_preconditions(RedopId::NONE, true, &mask(&[0]), &vi, &mut pre);
    assert!(pre.is_empty());
}

#[test]
fn same_op_reduction_copies_commute() {
    let fx = fixture(1, false);
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();
    let op = RedopId(9);

    fx.root.add_copy_user(op, &e1.event(), &vi, &mask(&[0]), false);
    let mut pre = BTreeMap::new();
    fx.root
        .find_copy_preconditions(op, false, &mask(&[0]), &vi, &mut pre);
    assert!(pre.is_empty(), "same-operator reductions need no ordering");

    let mut cross = BTreeMap::new();
    fx.root
        .find_copy_preconditions(RedopId(10), false, &mask(&[0]), &vi, &mut cross);
    assert_eq!(cross.len(), 1, "different operators do order");
}

#[test]
fn same_version_writer_skips_the_war_dependency() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();

    // A read-only copy user recorded at version 7 of field 0.
    fx.root
        .add_copy_user(RedopId::NONE, &e1.event(), &versions(0, 7), &mask(&[0]), true);

    // A writer producing the same version again owes the reader nothing.
    let mut pre = BTreeMap::new();
    fx.root
        .find_copy_preconditions(RedopId::NONE, false, &mask(&[0]), &versions(0, 7), &mut pre);
    assert!(pre.is_empty());
}

#[test]
fn different_version_writer_keeps_the_war_dependency() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();

    fx.root
        .add_copy_user(RedopId::NONE, &e1.event(), &versions(0, 7), &mask(&[0]), true);
    let mut pre = BTreeMap::new();
    fx.root
        .find_copy_preconditions(RedopId::NONE, false, &mask(&[0]), &versions(0, 8), &mut pre);
    assert_eq!(pre[&e1.event()], mask(&[0]));
}

#[test]
fn copy_without_version_info_keeps_the_war_dependency() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();

    fx.root
        .add_copy_user(RedopId::NONE, &e1.event(), &versions(0, 7), &mask(&[0]), true);
    let mut pre = BTreeMap::new();
    fx.root.find_copy_preconditions(
        RedopId::NONE,
        false,
        &mask(&[0]),
        &VersionInfo::new(),
        &mut pre,
    );
    assert_eq!(pre.len(), 1);
}

#[test]
fn use_event_fences_every_copy() {
    let fx = fixture(1, false);
    let fence = UserEvent::create();
    fx.alloc.set_use_event(fence.event());
    let mut pre = BTreeMap::new();
    fx.root.find_copy_preconditions(
        RedopId::NONE,
        true,
        &mask(&[0, 1]),
        &VersionInfo::new(),
        &mut pre,
    );
    assert_eq!(pre[&fence.event()], mask(&[0, 1]));
}
