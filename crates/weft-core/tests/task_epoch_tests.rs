// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Task-path analysis over a single materialized view: epoch migration,
//! anti-dependencies, and deferred collection.

mod common;

use weft_core::{RegionUsage, UserEvent, VersionInfo};
use weft_testkit::mask;

use common::fixture;

#[test]
fn first_user_waits_on_nothing() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();
    let pre = fx.root.add_user(
        &RegionUsage::read_write(),
        &e1.event(),
        &mask(&[0]),
        &VersionInfo::new(),
        None,
    );
    assert!(!pre.exists());
    fx.root.with_epochs(|tables| {
        assert_eq!(tables.current().len(), 1);
        assert!(tables.previous().is_empty());
        assert!(tables.outstanding_gc().contains(&e1.event()));
    });
}

#[test]
fn waw_on_same_field_migrates_prior_user_to_previous_epoch() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();
    let usage = RegionUsage::read_write();
    let vi = VersionInfo::new();

    fx.root
        .add_user(&usage, &e1.event(), &mask(&[0]), &vi, None);
    let pre = fx.root.add_user(&usage, &e2.event(), &mask(&[0]), &vi, None);
    assert_eq!(pre, e1.event(), "the second writer waits on the first");

    fx.root.with_epochs(|tables| {
        // The first user was dominated and moved down an epoch.
        assert!(tables.current().get(&e1.event()).is_none());
        assert_eq!(*tables.previous()[&e1.event()].mask(), mask(&[0]));
        assert_eq!(*tables.current()[&e2.event()].mask(), mask(&[0]));
        assert!(tables.summaries_consistent());
    });
}

#[test]
fn write_after_read_returns_the_reader_event() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();
    let vi = VersionInfo::new();

    fx.root
        .add_user(&RegionUsage::read_only(), &e1.event(), &mask(&[0, 1]), &vi, None);
    let pre = fx
        .root
        .add_user(&RegionUsage::read_write(), &e2.event(), &mask(&[1]), &vi, None);
    assert_eq!(pre, e1.event());
}

#[test]
fn readers_do_not_wait_on_readers() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();
    let vi = VersionInfo::new();

    fx.root
        .add_user(&RegionUsage::read_only(), &e1.event(), &mask(&[0]), &vi, None);
    let pre = fx
        .root
        .add_user(&RegionUsage::read_only(), &e2.event(), &mask(&[0]), &vi, None);
    assert!(!pre.exists());
    fx.root.with_epochs(|tables| {
        // Nothing was dominated; both readers share the current epoch.
        assert_eq!(tables.current().len(), 2);
        assert!(tables.previous().is_empty());
    });
}

#[test]
fn disjoint_fields_do_not_interfere() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();
    let vi = VersionInfo::new();

    fx.root
        .add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0]), &vi, None);
    let pre = fx
        .root
        .add_user(&RegionUsage::read_write(), &e2.event(), &mask(&[3]), &vi, None);
    assert!(!pre.exists());
}

#[test]
fn task_never_waits_on_its_own_term_event() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();
    let vi = VersionInfo::new();
    fx.root
        .add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0]), &vi, None);
    // Re-registering more fields under the same termination event must not
    // produce a self-dependency.
    let pre = fx
        .root
        .add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0, 1]), &vi, None);
    assert!(!pre.exists());
}

#[test]
fn triggered_term_event_collects_its_records() {
    let fx = fixture(1, false);
    let e1 = UserEvent::create();
    let vi = VersionInfo::new();
    fx.root
        .add_user(&RegionUsage::read_write(), &e1.event(), &mask(&[0]), &vi, None);
    e1.trigger();
    fx.root.with_epochs(|tables| {
        assert!(tables.current().is_empty());
        assert!(tables.previous().is_empty());
        assert!(tables.outstanding_gc().is_empty());
    });
}

#[test]
fn dominated_previous_users_are_dropped_by_a_newer_writer() {
    let fx = fixture(1, false);
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();
    let e3 = UserEvent::create();
    let usage = RegionUsage::read_write();

    fx.root.add_user(&usage, &e1.event(), &mask(&[0]), &vi, None);
    fx.root.add_user(&usage, &e2.event(), &mask(&[0]), &vi, None);
    // e1 now lives in the previous epoch. A third writer dominates e2 and
    // supersedes e1's previous entry entirely.
    let pre = fx.root.add_user(&usage, &e3.event(), &mask(&[0]), &vi, None);
    assert_eq!(pre, e2.event());
    fx.root.with_epochs(|tables| {
        assert!(tables.previous().get(&e1.event()).is_none());
        assert_eq!(*tables.previous()[&e2.event()].mask(), mask(&[0]));
        assert_eq!(*tables.current()[&e3.event()].mask(), mask(&[0]));
        assert!(tables.summaries_consistent());
    });
}

#[test]
fn merged_preconditions_cover_all_interfering_users() {
    let fx = fixture(1, false);
    let vi = VersionInfo::new();
    let e1 = UserEvent::create();
    let e2 = UserEvent::create();
    let e3 = UserEvent::create();

    fx.root
        .add_user(&RegionUsage::read_only(), &e1.event(), &mask(&[0]), &vi, None);
    fx.root
        .add_user(&RegionUsage::read_only(), &e2.event(), &mask(&[1]), &vi, None);
    let pre = fx
        .root
        .add_user(&RegionUsage::read_write(), &e3.event(), &mask(&[0, 1]), &vi, None);
    // Two distinct reader events: the writer gets a merged event that fires
    // only after both.
    assert!(pre.exists());
    assert!(!pre.has_triggered());
    e1.trigger();
    assert!(!pre.has_triggered());
    e2.trigger();
    assert!(pre.has_triggered());
}
