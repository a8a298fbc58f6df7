//! Room state materialization: state groups, the state before an event,
//! and resolution of the current state as new events land.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::events::StateEventType;
use crate::core::identifiers::{EventId, OwnedEventId, RoomId};
use crate::core::state::{self, StateMap};
use crate::core::RoomVersionRules;
use crate::event::PduEvent;
use crate::{AppResult, data};

fn fetch(event_id: &EventId) -> Option<Arc<PduEvent>> {
    data::event::get(event_id)
}

/// The full current state of a room as events.
pub fn current_full(room_id: &RoomId) -> StateMap<Arc<PduEvent>> {
    data::room::current_state(room_id)
        .into_iter()
        .filter_map(|(key, event_id)| fetch(&event_id).map(|pdu| (key, pdu)))
        .collect()
}

/// The room state *before* the given event: the resolution of the states
/// after each of its `prev_events`.
pub fn state_before(pdu: &PduEvent, rules: &RoomVersionRules) -> AppResult<StateMap<OwnedEventId>> {
    let mut groups: Vec<StateMap<OwnedEventId>> = Vec::new();
    for prev_id in &pdu.prev_events {
        if let Some(group) = data::room::state_after(prev_id) {
            groups.push((*group).clone());
        }
    }

    match groups.len() {
        0 => Ok(StateMap::new()),
        1 => Ok(groups.pop().expect("one group")),
        _ => {
            let auth_chains: Vec<HashSet<OwnedEventId>> = groups
                .iter()
                .map(|group| {
                    let ids: Vec<OwnedEventId> = group.values().cloned().collect();
                    data::event::auth_chain_ids(&ids)
                })
                .collect();
            Ok(state::resolve(rules, &groups, &auth_chains, &fetch)?)
        }
    }
}

/// Records the state group holding the state *after* `pdu`.
pub fn record_state_after(pdu: &PduEvent, rules: &RoomVersionRules) -> AppResult<()> {
    let mut state = state_before(pdu, rules)?;
    if let Some(state_key) = &pdu.state_key {
        state.insert(
            (
                StateEventType::from(pdu.event_ty.as_str()),
                state_key.clone(),
            ),
            pdu.event_id.clone(),
        );
    }
    data::room::record_state_group(&pdu.event_id, Arc::new(state));
    Ok(())
}

/// Resolves the room's new current state given a freshly accepted state
/// event: the old current state competes with the fork carrying the event.
pub fn resolve_current(
    room_id: &RoomId,
    pdu: &PduEvent,
    rules: &RoomVersionRules,
) -> AppResult<StateMap<OwnedEventId>> {
    let current = data::room::current_state(room_id);

    let Some(state_key) = &pdu.state_key else {
        return Ok(current);
    };
    let key = (
        StateEventType::from(pdu.event_ty.as_str()),
        state_key.clone(),
    );

    let mut with_event = current.clone();
    with_event.insert(key.clone(), pdu.event_id.clone());

    // Linear extension: the slot's occupant is an ancestor of the new
    // event, so the new event supersedes it without a conflict.
    if current_is_ancestor_of(&current, &key, pdu) {
        return Ok(with_event);
    }

    let chains = [chain_of(&current), chain_of(&with_event)];
    Ok(state::resolve(rules, &[current, with_event], &chains, &fetch)?)
}

fn chain_of(state: &StateMap<OwnedEventId>) -> std::collections::HashSet<OwnedEventId> {
    let ids: Vec<OwnedEventId> = state.values().cloned().collect();
    data::event::auth_chain_ids(&ids)
}

/// Whether the slot's current occupant is an ancestor of `pdu` (so the new
/// event simply supersedes it rather than conflicting with it).
fn current_is_ancestor_of(
    current: &StateMap<OwnedEventId>,
    key: &(StateEventType, String),
    pdu: &PduEvent,
) -> bool {
    let Some(occupant) = current.get(key) else {
        return true;
    };
    // Walk the prev-event graph a bounded distance looking for the
    // occupant; competing forks will not contain it.
    let mut visited: HashSet<OwnedEventId> = HashSet::new();
    let mut queue: Vec<OwnedEventId> = pdu.prev_events.to_vec();
    let mut steps = 0usize;
    while let Some(id) = queue.pop() {
        if id == *occupant {
            return true;
        }
        steps += 1;
        if steps > 500 {
            break;
        }
        if !visited.insert(id.clone()) {
            continue;
        }
        if let Some(event) = fetch(&id) {
            queue.extend(event.prev_events.iter().cloned());
        }
    }
    false
}
