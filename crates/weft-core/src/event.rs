// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Completion events.
//!
//! An [`Event`] is an opaque handle to an asynchronous completion. Events
//! compose with [`Event::merge`], support a non-blocking best-effort
//! [`Event::has_triggered`] probe, and carry subscriber callbacks that the
//! engine uses to drive deferred collection. [`UserEvent`] is the
//! manually-triggered variant.
//!
//! Handles order and hash by a process-unique id so they can key the
//! deterministic `BTreeMap` state of the epoch tables; the id is also what
//! crosses the wire, with [`EventTable`] interning handles for decode.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::mask::FieldMask;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

type Callback = Box<dyn FnOnce() + Send>;

struct EventState {
    id: u64,
    triggered: AtomicBool,
    waiters: Mutex<Vec<Callback>>,
    cond: Condvar,
}

/// Handle to an asynchronous completion.
///
/// The distinguished no-event (`Event::none`, also `Event::default`) exists
/// nowhere and counts as already triggered; analysis code uses it for "no
/// precondition".
#[derive(Clone, Default)]
pub struct Event {
    state: Option<Arc<EventState>>,
}

impl Event {
    /// The distinguished no-event.
    #[must_use]
    pub fn none() -> Self {
        Self { state: None }
    }

    fn fresh() -> Self {
        Self {
            state: Some(Arc::new(EventState {
                id: NEXT_EVENT_ID.fetch_add(1, AtomicOrdering::Relaxed),
                triggered: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
                cond: Condvar::new(),
            })),
        }
    }

    /// Returns true unless this is the no-event.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.state.is_some()
    }

    /// Process-unique id; zero for the no-event.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.id)
    }

    /// Non-blocking probe. The no-event reports triggered.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        self.state
            .as_ref()
            .map_or(true, |s| s.triggered.load(AtomicOrdering::Acquire))
    }

    /// Runs `callback` once the event fires. Fires immediately (on the
    /// calling thread) if the event already triggered; otherwise the
    /// callback runs on the triggering thread.
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) {
        let Some(state) = self.state.as_ref() else {
            callback();
            return;
        };
        {
            let mut waiters = state.waiters.lock();
            if !state.triggered.load(AtomicOrdering::Acquire) {
                waiters.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Blocks the calling thread until the event fires.
    ///
    /// Callers must not hold any view lock; every waiting path in the engine
    /// releases its lock before parking here.
    pub fn wait(&self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let mut waiters = state.waiters.lock();
        while !state.triggered.load(AtomicOrdering::Acquire) {
            state.cond.wait(&mut waiters);
        }
    }

    /// Merges a set of events into one that fires when all inputs fire.
    ///
    /// Already-triggered inputs and no-events are skipped; zero live inputs
    /// collapse to the no-event and a single live input is returned as-is.
    #[must_use]
    pub fn merge<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Self>,
    {
        let live: Vec<&Self> = events
            .into_iter()
            .filter(|e| e.exists() && !e.has_triggered())
            .collect();
        match live.len() {
            0 => Self::none(),
            1 => live[0].clone(),
            n => {
                let merged = UserEvent::create();
                let result = merged.event();
                let remaining = Arc::new(AtomicUsize::new(n));
                for event in live {
                    let remaining = Arc::clone(&remaining);
                    let merged = merged.clone();
                    event.subscribe(move || {
                        if remaining.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
                            merged.trigger();
                        }
                    });
                }
                result
            }
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(&other.id())
    }
}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "Event({})", self.id())
        } else {
            write!(f, "Event(none)")
        }
    }
}

/// Manually triggered event.
#[derive(Clone)]
pub struct UserEvent {
    event: Event,
}

impl UserEvent {
    /// Creates an untriggered user event.
    #[must_use]
    pub fn create() -> Self {
        Self {
            event: Event::fresh(),
        }
    }

    /// The underlying waitable handle.
    #[must_use]
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Fires the event. Subscribed callbacks run on this thread; repeated
    /// triggers are ignored.
    pub fn trigger(&self) {
        let Some(state) = self.event.state.as_ref() else {
            return;
        };
        let callbacks = {
            let mut waiters = state.waiters.lock();
            if state.triggered.swap(true, AtomicOrdering::AcqRel) {
                return;
            }
            state.cond.notify_all();
            std::mem::take(&mut *waiters)
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserEvent({})", self.event.id())
    }
}

/// Interning table mapping event ids back to handles on wire decode.
///
/// Every runtime of a grid shares one table; encoding a message registers
/// the events it carries so the receiving side resolves the same handles.
#[derive(Default)]
pub struct EventTable {
    events: Mutex<FxHashMap<u64, Event>>,
}

impl EventTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `event` for later resolution. No-events are ignored.
    pub fn register(&self, event: &Event) {
        if event.exists() {
            self.events.lock().insert(event.id(), event.clone());
        }
    }

    /// Resolves an id previously registered by a sender. Id zero resolves to
    /// the no-event; an unknown id resolves to `None` (protocol corruption).
    #[must_use]
    pub fn resolve(&self, id: u64) -> Option<Event> {
        if id == 0 {
            return Some(Event::none());
        }
        self.events.lock().get(&id).cloned()
    }
}

/// One group of a [`compute_event_sets`] partition: the fields of
/// `mask` covered by exactly the events in `events`.
#[derive(Debug, Clone)]
pub struct EventSet {
    /// Fields of the group.
    pub mask: FieldMask,
    /// Events covering every field of the group. May be empty.
    pub events: Vec<Event>,
}

/// Partitions `mask` into groups of fields that share an identical covering
/// event set in `input`. Fields covered by no event form one group with an
/// empty event list. Group order is deterministic.
#[must_use]
pub fn compute_event_sets(
    mask: FieldMask,
    input: &BTreeMap<Event, FieldMask>,
) -> Vec<EventSet> {
    let mut groups: BTreeMap<Vec<Event>, FieldMask> = BTreeMap::new();
    for field in mask.iter() {
        let covering: Vec<Event> = input
            .iter()
            .filter(|(_, m)| m.contains(field))
            .map(|(e, _)| e.clone())
            .collect();
        let group = groups.entry(covering).or_insert(FieldMask::EMPTY);
        group.set(field);
    }
    groups
        .into_iter()
        .map(|(events, mask)| EventSet { mask, events })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::FieldId;

    #[test]
    fn no_event_counts_as_triggered() {
        let none = Event::none();
        assert!(!none.exists());
        assert!(none.has_triggered());
        assert_eq!(none.id(), 0);
    }

    #[test]
    fn user_event_triggers_once() {
        let ue = UserEvent::create();
        let ev = ue.event();
        assert!(!ev.has_triggered());
        ue.trigger();
        assert!(ev.has_triggered());
        // Re-triggering is a no-op.
        ue.trigger();
    }

    #[test]
    fn subscribe_after_trigger_runs_inline() {
        let ue = UserEvent::create();
        ue.trigger();
        let flag = std::sync::Arc::new(AtomicBool::new(false));
        let inner = std::sync::Arc::clone(&flag);
        ue.event()
            .subscribe(move || inner.store(true, AtomicOrdering::SeqCst));
        assert!(flag.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn merge_fires_after_all_inputs() {
        let a = UserEvent::create();
        let b = UserEvent::create();
        let merged = Event::merge([&a.event(), &b.event()]);
        assert!(!merged.has_triggered());
        a.trigger();
        assert!(!merged.has_triggered());
        b.trigger();
        assert!(merged.has_triggered());
    }

    #[test]
    fn merge_short_circuits() {
        assert!(!Event::merge(std::iter::empty()).exists());
        let a = UserEvent::create();
        let only = Event::merge([&a.event(), &Event::none()]);
        assert_eq!(only, a.event());
        // Triggered inputs are dropped from the merge.
        let done = UserEvent::create();
        done.trigger();
        assert!(!Event::merge([&done.event()]).exists());
    }

    #[test]
    fn event_table_round_trips_handles() {
        let table = EventTable::new();
        let ue = UserEvent::create();
        table.register(&ue.event());
        assert_eq!(table.resolve(ue.event().id()), Some(ue.event()));
        assert_eq!(table.resolve(0), Some(Event::none()));
        assert_eq!(table.resolve(u64::MAX), None);
    }

    #[test]
    fn event_sets_partition_by_covering_set() {
        let e1 = UserEvent::create().event();
        let e2 = UserEvent::create().event();
        let mut input = BTreeMap::new();
        input.insert(e1.clone(), FieldMask::of(&[FieldId(0), FieldId(1)]));
        input.insert(e2.clone(), FieldMask::of(&[FieldId(1), FieldId(2)]));
        let request = FieldMask::of(&[FieldId(0), FieldId(1), FieldId(2), FieldId(3)]);
        let sets = compute_event_sets(request, &input);
        assert_eq!(sets.len(), 4);
        for set in &sets {
            if set.mask.contains(FieldId(0)) {
                assert_eq!(set.events, vec![e1.clone()]);
            } else if set.mask.contains(FieldId(1)) {
                assert_eq!(set.events.len(), 2);
            } else if set.mask.contains(FieldId(2)) {
                assert_eq!(set.events, vec![e2.clone()]);
            } else {
                assert!(set.events.is_empty());
            }
        }
        // The groups cover the request exactly.
        let mut union = FieldMask::EMPTY;
        for set in &sets {
            assert!(union.disjoint(&set.mask));
            union |= set.mask;
        }
        assert_eq!(union, request);
    }
}
