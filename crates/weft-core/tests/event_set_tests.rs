// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `compute_event_sets` grouping: flattening the groups back must
//! reproduce the input map, modulo merging.

use std::collections::BTreeMap;

use weft_core::{compute_event_sets, Event, UserEvent};
use weft_testkit::mask;

#[test]
fn disjoint_groups_reflatten_to_the_input_map() {
    let e1 = UserEvent::create().event();
    let e2 = UserEvent::create().event();
    let mut input = BTreeMap::new();
    input.insert(e1.clone(), mask(&[0, 1]));
    input.insert(e2.clone(), mask(&[2]));

    let request = mask(&[0, 1, 2]);
    let sets = compute_event_sets(request, &input);

    // Every group has a single event here, so no merging happens and the
    // reflattened map is exactly the input.
    let mut reflattened: BTreeMap<Event, _> = BTreeMap::new();
    for set in sets {
        assert_eq!(set.events.len(), 1);
        reflattened.insert(set.events[0].clone(), set.mask);
    }
    assert_eq!(reflattened, input);
}

#[test]
fn shared_fields_group_by_their_covering_set() {
    let e1 = UserEvent::create().event();
    let e2 = UserEvent::create().event();
    let mut input = BTreeMap::new();
    input.insert(e1.clone(), mask(&[0, 1]));
    input.insert(e2.clone(), mask(&[1, 2]));

    let request = mask(&[0, 1, 2, 3]);
    let sets = compute_event_sets(request, &input);
    assert_eq!(sets.len(), 4);

    // Reflatten: each field must end up covered by exactly the same events
    // as in the input (a merged group stands for all of its events).
    for field in request.iter() {
        let expected: Vec<&Event> = input
            .iter()
            .filter(|(_, m)| m.contains(field))
            .map(|(e, _)| e)
            .collect();
        let group = sets
            .iter()
            .find(|set| set.mask.contains(field))
            .expect("every requested field lands in a group");
        assert_eq!(group.events.iter().collect::<Vec<_>>(), expected);
    }
}

#[test]
fn uncovered_fields_form_the_empty_group() {
    let e1 = UserEvent::create().event();
    let mut input = BTreeMap::new();
    input.insert(e1, mask(&[0]));
    let sets = compute_event_sets(mask(&[5, 6]), &input);
    assert_eq!(sets.len(), 1);
    assert!(sets[0].events.is_empty());
    assert_eq!(sets[0].mask, mask(&[5, 6]));
}
