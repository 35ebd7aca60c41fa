// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hierarchy recursion: sibling disjointness cut-offs and the WAR probe
//! across parent chains.

mod common;

use weft_core::{RegionUsage, UserEvent, VersionInfo};
use weft_testkit::mask;

use common::{fixture, COLOR_A, COLOR_B};

#[test]
fn disjoint_siblings_do_not_interfere() {
    let fx = fixture(1, true);
    let child_a = fx
        .root
        .get_materialized_subview(COLOR_A)
        .expect("subview a");
    let child_b = fx
        .root
        .get_materialized_subview(COLOR_B)
        .expect("subview b");
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    child_a.add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0]), &vi, None);
    let pre = child_b.add_user(&RegionUsage::read_write(), &e2.event(), &mask(&[0]), &vi, None);
    assert!(
        !pre.exists(),
        "disjoint siblings must not order against each other"
    );
}

#[test]
fn overlapping_siblings_interfere_through_the_parent() {
    let fx = fixture(1, false);
    let child_a = fx
        .root
        .get_materialized_subview(COLOR_A)
        .expect("subview a");
    let child_b = fx
        .root
        .get_materialized_subview(COLOR_B)
        .expect("subview b");
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    child_a.add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0]), &vi, None);
    let pre = child_b.add_user(&RegionUsage::read_write(), &e2.event(), &mask(&[0]), &vi, None);
    assert_eq!(pre, e1.event());
}

#[test]
fn upper_bound_stops_the_parent_recursion() {
    let fx = fixture(1, false);
    let child_a = fx
        .root
        .get_materialized_subview(COLOR_A)
        .expect("subview a");
    let child_b = fx
        .root
        .get_materialized_subview(COLOR_B)
        .expect("subview b");
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    // Each child analyzes only its own region: no parent entry is written,
    // so the overlapping siblings never observe each other.
    let vi_a = VersionInfo::new().with_upper_bound(child_a.region());
    child_a.add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0]), &vi_a, None);
    let vi_b = VersionInfo::new().with_upper_bound(child_b.region());
    let pre = child_b.add_user(&RegionUsage::read_write(), &e2.event(), &mask(&[0]), &vi_b, None);
    assert!(!pre.exists());
    fx.root.with_epochs(|tables| {
        assert!(tables.current().is_empty());
    });
}

#[test]
fn same_child_entries_are_skipped_by_the_parent_pass() {
    let fx = fixture(1, true);
    let child_a = fx
        .root
        .get_materialized_subview(COLOR_A)
        .expect("subview a");
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();

    child_a.add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0]), &vi, None);
    // The second user of the same child sees the dependency locally; the
    // parent pass contributes nothing extra.
    let pre = child_a.add_user(&RegionUsage::read_write(), &e2.event(), &mask(&[0]), &vi, None);
    assert_eq!(pre, e1.event());
}

#[test]
fn war_probe_sees_readers_up_the_hierarchy() {
    let fx = fixture(1, false);
    let child_a = fx
        .root
        .get_materialized_subview(COLOR_A)
        .expect("subview a");
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();

    fx.root
        .add_user(&RegionUsage::read_only(), &e1.event(), &mask(&[2]), &vi, None);
    assert!(child_a.has_war_dependence(&RegionUsage::read_write(), &mask(&[2])));
    assert!(!child_a.has_war_dependence(&RegionUsage::read_write(), &mask(&[5])));
    assert!(!child_a.has_war_dependence(&RegionUsage::read_only(), &mask(&[2])));
}

#[test]
fn subview_is_cached_after_first_materialization() {
    let fx = fixture(1, false);
    let first = fx
        .root
        .get_materialized_subview(COLOR_A)
        .expect("subview");
    let second = fx
        .root
        .get_materialized_subview(COLOR_A)
        .expect("subview again");
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}
