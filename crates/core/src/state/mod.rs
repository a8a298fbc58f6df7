//! State resolution.
//!
//! When forks of a room's event graph disagree about state, every server
//! must independently arrive at the same resolved state. The algorithm here
//! is version-2 resolution: partition into unconflicted and conflicted
//! state, take the auth difference, authorize the control events in reverse
//! topological power order, then the rest in mainline order, and overlay the
//! unconflicted state. All tie-breaks are lexicographic on event id; wall
//! clocks never participate.

mod error;
pub mod event_auth;
pub mod power_levels;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde_json::Value as JsonValue;

pub use error::StateError;

use crate::events::room::{MembershipState, RoomMemberEventContent, RoomPowerLevelsEventContent};
use crate::events::{StateEventType, TimelineEventType};
use crate::identifiers::{EventId, OwnedEventId, RoomId, UserId};
use crate::{RoomVersionRules, UnixMillis};

/// The slot a state event occupies: its `(type, state_key)` pair.
pub type TypeStateKey = (StateEventType, String);

/// A state map: at most one value per slot. Backed by `BTreeMap` so that
/// iteration, and therefore serialization, is deterministic.
pub type StateMap<T> = BTreeMap<TypeStateKey, T>;

/// Abstraction over persisted events, implemented by the server's PDU type.
pub trait Event {
    fn event_id(&self) -> &EventId;
    fn room_id(&self) -> &RoomId;
    fn sender(&self) -> &UserId;
    fn event_type(&self) -> &TimelineEventType;
    fn content(&self) -> &JsonValue;
    fn origin_server_ts(&self) -> UnixMillis;
    fn state_key(&self) -> Option<&str>;
    fn prev_events(&self) -> &[OwnedEventId];
    fn auth_events(&self) -> &[OwnedEventId];
    fn redacts(&self) -> Option<&EventId>;

    fn rejected(&self) -> bool {
        false
    }
}

impl<E: Event> Event for std::sync::Arc<E> {
    fn event_id(&self) -> &EventId {
        (**self).event_id()
    }
    fn room_id(&self) -> &RoomId {
        (**self).room_id()
    }
    fn sender(&self) -> &UserId {
        (**self).sender()
    }
    fn event_type(&self) -> &TimelineEventType {
        (**self).event_type()
    }
    fn content(&self) -> &JsonValue {
        (**self).content()
    }
    fn origin_server_ts(&self) -> UnixMillis {
        (**self).origin_server_ts()
    }
    fn state_key(&self) -> Option<&str> {
        (**self).state_key()
    }
    fn prev_events(&self) -> &[OwnedEventId] {
        (**self).prev_events()
    }
    fn auth_events(&self) -> &[OwnedEventId] {
        (**self).auth_events()
    }
    fn redacts(&self) -> Option<&EventId> {
        (**self).redacts()
    }
    fn rejected(&self) -> bool {
        (**self).rejected()
    }
}

/// Resolves competing state sets to one state map.
///
/// `state_sets` are the states of the competing forks, `auth_chains` the
/// full auth chain of each, and `fetch_event` resolves event ids to events
/// (returning `None` for unknown ids, which are then ignored).
///
/// Determinism: identical inputs produce identical outputs, independent of
/// the order of `state_sets`.
pub fn resolve<E, F>(
    rules: &RoomVersionRules,
    state_sets: &[StateMap<OwnedEventId>],
    auth_chains: &[HashSet<OwnedEventId>],
    fetch_event: &F,
) -> Result<StateMap<OwnedEventId>, StateError>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    let (unconflicted, conflicted) = separate(state_sets);
    if conflicted.is_empty() {
        return Ok(unconflicted);
    }

    let auth_difference = auth_difference(auth_chains);

    let mut full_conflicted: HashSet<OwnedEventId> = conflicted
        .into_values()
        .flatten()
        .chain(auth_difference)
        .filter(|id| fetch_event(id).is_some())
        .collect();

    let control_events = control_event_closure(&full_conflicted, fetch_event);

    let sorted_control = reverse_topological_power_sort(&control_events, fetch_event)?;

    let partially_resolved =
        iterative_auth_check(rules, &sorted_control, unconflicted.clone(), fetch_event)?;

    let resolved_power = partially_resolved
        .get(&(StateEventType::RoomPowerLevels, String::new()))
        .cloned();

    for id in &sorted_control {
        full_conflicted.remove(id);
    }
    let sorted_rest = mainline_sort(
        &full_conflicted,
        resolved_power.as_deref(),
        fetch_event,
    )?;

    let mut resolved =
        iterative_auth_check(rules, &sorted_rest, partially_resolved, fetch_event)?;

    // The unconflicted state always wins.
    resolved.extend(unconflicted);
    Ok(resolved)
}

/// Splits the state sets into the keys every set agrees on and the rest.
/// A key missing from any set counts as conflicted.
fn separate(
    state_sets: &[StateMap<OwnedEventId>],
) -> (StateMap<OwnedEventId>, StateMap<HashSet<OwnedEventId>>) {
    let mut unconflicted = StateMap::new();
    let mut conflicted: StateMap<HashSet<OwnedEventId>> = StateMap::new();

    if state_sets.is_empty() {
        return (unconflicted, conflicted);
    }

    let all_keys: std::collections::BTreeSet<&TypeStateKey> =
        state_sets.iter().flat_map(|set| set.keys()).collect();

    for key in all_keys {
        let values: Vec<Option<&OwnedEventId>> =
            state_sets.iter().map(|set| set.get(key)).collect();
        let first = values[0];
        if first.is_some() && values.iter().all(|v| *v == first) {
            unconflicted.insert(key.clone(), first.unwrap().clone());
        } else {
            conflicted.insert(
                key.clone(),
                values.into_iter().flatten().cloned().collect(),
            );
        }
    }

    (unconflicted, conflicted)
}

/// The union minus the intersection of the auth chains.
fn auth_difference(auth_chains: &[HashSet<OwnedEventId>]) -> HashSet<OwnedEventId> {
    let mut chains = auth_chains.iter();
    let Some(first) = chains.next() else {
        return HashSet::new();
    };

    let mut union = first.clone();
    let mut intersection = first.clone();
    for chain in chains {
        union.extend(chain.iter().cloned());
        intersection.retain(|id| chain.contains(id));
    }
    union.retain(|id| !intersection.contains(id));
    union
}

/// Whether an event steers who may do what: power levels, join rules, the
/// create event, and membership events that eject a participant.
fn is_control_event<E: Event>(event: &E) -> bool {
    match event.event_type() {
        TimelineEventType::RoomPowerLevels
        | TimelineEventType::RoomJoinRules
        | TimelineEventType::RoomCreate => event.state_key() == Some(""),
        TimelineEventType::RoomMember => {
            let Ok(content) =
                serde_json::from_value::<RoomMemberEventContent>(event.content().clone())
            else {
                return false;
            };
            matches!(
                content.membership,
                MembershipState::Leave | MembershipState::Ban
            ) && event.state_key() != Some(event.sender().as_str())
        }
        _ => false,
    }
}

/// The control events of the conflicted set, closed over their auth events
/// within the set.
fn control_event_closure<E, F>(
    full_conflicted: &HashSet<OwnedEventId>,
    fetch_event: &F,
) -> HashSet<OwnedEventId>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    let mut closure = HashSet::new();
    let mut queue: VecDeque<OwnedEventId> = full_conflicted
        .iter()
        .filter(|id| fetch_event(id).is_some_and(|event| is_control_event(&event)))
        .cloned()
        .collect();

    while let Some(id) = queue.pop_front() {
        if !closure.insert(id.clone()) {
            continue;
        }
        if let Some(event) = fetch_event(&id) {
            for auth_id in event.auth_events() {
                if full_conflicted.contains(auth_id) && !closure.contains(auth_id) {
                    queue.push_back(auth_id.clone());
                }
            }
        }
    }

    closure
}

/// The power the sender held when the event was made, read from the power
/// levels event among its `auth_events`; the room creator defaults to 100.
fn sender_power_at_event<E, F>(event: &E, fetch_event: &F) -> i64
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    for auth_id in event.auth_events() {
        let Some(auth_event) = fetch_event(auth_id) else {
            continue;
        };
        if *auth_event.event_type() == TimelineEventType::RoomPowerLevels {
            if let Ok(levels) = serde_json::from_value::<RoomPowerLevelsEventContent>(
                auth_event.content().clone(),
            ) {
                return levels.user_power(event.sender());
            }
        }
    }

    // No power levels yet: only the creator has non-default power.
    for auth_id in event.auth_events() {
        let Some(auth_event) = fetch_event(auth_id) else {
            continue;
        };
        if *auth_event.event_type() == TimelineEventType::RoomCreate {
            let creator = creator_of(&auth_event);
            if creator.as_deref() == Some(event.sender().as_str()) {
                return 100;
            }
        }
    }
    if *event.event_type() == TimelineEventType::RoomCreate {
        return 100;
    }
    0
}

fn creator_of<E: Event>(create: &E) -> Option<String> {
    create
        .content()
        .get("creator")
        .and_then(JsonValue::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| Some(create.sender().as_str().to_owned()))
}

/// Orders `events` ancestors-first; ties are broken by greater sender
/// power, then earlier timestamp, then lexicographic event id.
fn reverse_topological_power_sort<E, F>(
    events: &HashSet<OwnedEventId>,
    fetch_event: &F,
) -> Result<Vec<OwnedEventId>, StateError>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    // Edges: auth event (parent) -> citing event (child).
    let mut indegree: HashMap<OwnedEventId, usize> = HashMap::new();
    let mut children: HashMap<OwnedEventId, Vec<OwnedEventId>> = HashMap::new();
    let mut sort_key: HashMap<OwnedEventId, (i64, u64)> = HashMap::new();

    for id in events {
        let event = fetch_event(id)
            .ok_or_else(|| StateError::not_found(id.as_str().to_owned()))?;
        let power = sender_power_at_event(&event, fetch_event);
        sort_key.insert(id.clone(), (-power, event.origin_server_ts().get()));
        indegree.entry(id.clone()).or_insert(0);
        for auth_id in event.auth_events() {
            if events.contains(auth_id) {
                *indegree.entry(id.clone()).or_insert(0) += 1;
                children
                    .entry(auth_id.clone())
                    .or_default()
                    .push(id.clone());
            }
        }
    }

    // Kahn's algorithm with a deterministic ready set.
    let mut ready: std::collections::BTreeSet<(i64, u64, OwnedEventId)> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| {
            let (neg_power, ts) = sort_key[id];
            (neg_power, ts, id.clone())
        })
        .collect();

    let mut sorted = Vec::with_capacity(events.len());
    while let Some(entry) = ready.iter().next().cloned() {
        ready.remove(&entry);
        let (_, _, id) = entry;
        sorted.push(id.clone());

        if let Some(next) = children.get(&id) {
            for child in next {
                let degree = indegree.get_mut(child).expect("child was registered");
                *degree -= 1;
                if *degree == 0 {
                    let (neg_power, ts) = sort_key[child];
                    ready.insert((neg_power, ts, child.clone()));
                }
            }
        }
    }

    if sorted.len() != events.len() {
        return Err(StateError::invalid_pdu("auth graph contains a cycle"));
    }
    Ok(sorted)
}

/// Applies the auth rules to `order` one event at a time against a running
/// state. Events failing authorization are skipped; successful state events
/// take their slot in the running state.
fn iterative_auth_check<E, F>(
    rules: &RoomVersionRules,
    order: &[OwnedEventId],
    base: StateMap<OwnedEventId>,
    fetch_event: &F,
) -> Result<StateMap<OwnedEventId>, StateError>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    let mut state = base;

    for event_id in order {
        let event = fetch_event(event_id)
            .ok_or_else(|| StateError::not_found(event_id.as_str().to_owned()))?;
        let Some(state_key) = event.state_key() else {
            continue;
        };

        // Auth state: the event's own auth events, overridden by whatever
        // the running resolution has already settled.
        let mut auth_state: StateMap<E> = StateMap::new();
        for auth_id in event.auth_events() {
            if let Some(auth_event) = fetch_event(auth_id) {
                if let Some(key) = auth_event.state_key() {
                    auth_state.insert(
                        (
                            StateEventType::from(auth_event.event_type().as_str()),
                            key.to_owned(),
                        ),
                        auth_event,
                    );
                }
            }
        }
        let needed = event_auth::auth_types_for_event(
            event.event_type(),
            event.sender(),
            Some(state_key),
            event.content(),
        )?;
        for key in &needed {
            if let Some(id) = state.get(key) {
                if let Some(resolved_event) = fetch_event(id) {
                    auth_state.insert(key.clone(), resolved_event);
                }
            }
        }

        let result = event_auth::auth_check(rules, &event, |kind, key| {
            auth_state.get(&(kind.clone(), key.to_owned())).cloned()
        });

        if result.is_ok() {
            state.insert(
                (
                    StateEventType::from(event.event_type().as_str()),
                    state_key.to_owned(),
                ),
                event_id.clone(),
            );
        }
    }

    Ok(state)
}

/// The chain of power-levels events reached by walking `auth_events` from
/// `start`, oldest first.
fn power_mainline<E, F>(start: Option<&EventId>, fetch_event: &F) -> Vec<OwnedEventId>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    let mut mainline = Vec::new();
    let mut current = start.map(ToOwned::to_owned);

    while let Some(id) = current {
        mainline.push(id.clone());
        current = None;
        if let Some(event) = fetch_event(&id) {
            for auth_id in event.auth_events() {
                if let Some(auth_event) = fetch_event(auth_id) {
                    if *auth_event.event_type() == TimelineEventType::RoomPowerLevels {
                        current = Some(auth_id.clone());
                        break;
                    }
                }
            }
        }
    }

    mainline.reverse();
    mainline
}

/// Sorts the remaining conflicted events by the mainline position of their
/// closest power-levels ancestor, then timestamp, then event id.
fn mainline_sort<E, F>(
    events: &HashSet<OwnedEventId>,
    resolved_power: Option<&EventId>,
    fetch_event: &F,
) -> Result<Vec<OwnedEventId>, StateError>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    let mainline = power_mainline(resolved_power, fetch_event);
    let positions: HashMap<&EventId, usize> = mainline
        .iter()
        .enumerate()
        .map(|(index, id)| (&**id, index + 1))
        .collect();

    let mainline_position = |event_id: &EventId| -> usize {
        let mut visited = HashSet::new();
        let mut current = Some(event_id.to_owned());
        while let Some(id) = current {
            if let Some(position) = positions.get(&*id) {
                return *position;
            }
            if !visited.insert(id.clone()) {
                break;
            }
            current = None;
            if let Some(event) = fetch_event(&id) {
                for auth_id in event.auth_events() {
                    if let Some(auth_event) = fetch_event(auth_id) {
                        if *auth_event.event_type() == TimelineEventType::RoomPowerLevels {
                            current = Some(auth_id.clone());
                            break;
                        }
                    }
                }
            }
        }
        0
    };

    let mut keyed: Vec<(usize, u64, OwnedEventId)> = Vec::with_capacity(events.len());
    for id in events {
        let event = fetch_event(id)
            .ok_or_else(|| StateError::not_found(id.as_str().to_owned()))?;
        keyed.push((
            mainline_position(id),
            event.origin_server_ts().get(),
            id.clone(),
        ));
    }
    keyed.sort();
    Ok(keyed.into_iter().map(|(_, _, id)| id).collect())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU64, Ordering};

    use serde_json::{Value as JsonValue, json};

    use super::{Event, StateMap};
    use crate::UnixMillis;
    use crate::events::{StateEventType, TimelineEventType};
    use crate::identifiers::{
        EventId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId,
    };

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Debug)]
    pub(crate) struct TestEvent {
        pub event_id: OwnedEventId,
        pub kind: TimelineEventType,
        pub room_id: OwnedRoomId,
        pub sender: OwnedUserId,
        pub state_key: Option<String>,
        pub content: JsonValue,
        pub origin_server_ts: UnixMillis,
        pub prev_events: Vec<OwnedEventId>,
        pub auth_events: Vec<OwnedEventId>,
    }

    impl TestEvent {
        fn new(
            kind: TimelineEventType,
            sender: &str,
            state_key: Option<&str>,
            room_id: &str,
            content: JsonValue,
        ) -> Self {
            let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
            Self {
                event_id: format!("$ev{seq:04}").try_into().unwrap(),
                kind,
                room_id: room_id.try_into().unwrap(),
                sender: sender.try_into().unwrap(),
                state_key: state_key.map(ToOwned::to_owned),
                content,
                origin_server_ts: UnixMillis(1_000_000 + seq),
                prev_events: Vec::new(),
                auth_events: Vec::new(),
            }
        }

        pub fn create(sender: &str, room_id: &str) -> Self {
            Self::new(
                TimelineEventType::RoomCreate,
                sender,
                Some(""),
                room_id,
                json!({"creator": sender, "room_version": "10"}),
            )
        }

        pub fn member(sender: &str, target: &str, membership: &str, room_id: &str) -> Self {
            Self::new(
                TimelineEventType::RoomMember,
                sender,
                Some(target),
                room_id,
                json!({"membership": membership}),
            )
        }

        pub fn member_with_content(
            sender: &str,
            target: &str,
            room_id: &str,
            content: JsonValue,
        ) -> Self {
            Self::new(TimelineEventType::RoomMember, sender, Some(target), room_id, content)
        }

        pub fn power_levels(sender: &str, room_id: &str, content: JsonValue) -> Self {
            Self::new(TimelineEventType::RoomPowerLevels, sender, Some(""), room_id, content)
        }

        pub fn join_rules(sender: &str, room_id: &str, content: JsonValue) -> Self {
            Self::new(TimelineEventType::RoomJoinRules, sender, Some(""), room_id, content)
        }

        pub fn topic(sender: &str, room_id: &str, topic: &str) -> Self {
            Self::new(
                TimelineEventType::RoomTopic,
                sender,
                Some(""),
                room_id,
                json!({"topic": topic}),
            )
        }

        pub fn message(sender: &str, room_id: &str, content: JsonValue) -> Self {
            Self::new(TimelineEventType::RoomMessage, sender, None, room_id, content)
        }

        pub fn with_id(mut self, id: &str) -> Self {
            self.event_id = id.try_into().unwrap();
            self
        }

        pub fn with_ts(mut self, ts: u64) -> Self {
            self.origin_server_ts = UnixMillis(ts);
            self
        }

        pub fn with_prev(mut self, prev: Vec<OwnedEventId>) -> Self {
            self.prev_events = prev;
            self
        }

        pub fn with_auth(mut self, auth: Vec<OwnedEventId>) -> Self {
            self.auth_events = auth;
            self
        }
    }

    impl Event for TestEvent {
        fn event_id(&self) -> &EventId {
            &self.event_id
        }
        fn room_id(&self) -> &RoomId {
            &self.room_id
        }
        fn sender(&self) -> &UserId {
            &self.sender
        }
        fn event_type(&self) -> &TimelineEventType {
            &self.kind
        }
        fn content(&self) -> &JsonValue {
            &self.content
        }
        fn origin_server_ts(&self) -> UnixMillis {
            self.origin_server_ts
        }
        fn state_key(&self) -> Option<&str> {
            self.state_key.as_deref()
        }
        fn prev_events(&self) -> &[OwnedEventId] {
            &self.prev_events
        }
        fn auth_events(&self) -> &[OwnedEventId] {
            &self.auth_events
        }
        fn redacts(&self) -> Option<&EventId> {
            None
        }
    }

    /// A state map of test events, fetchable by slot.
    #[derive(Clone, Default)]
    pub(crate) struct TestState {
        pub events: StateMap<TestEvent>,
    }

    impl TestState {
        pub fn new() -> Self {
            Self::default()
        }

        /// A room with its create event and a joined creator.
        pub fn room_with(creator: &str, room_id: &str) -> Self {
            let mut state = Self::new();
            state.insert(TestEvent::create(creator, room_id));
            state.insert(TestEvent::member(creator, creator, "join", room_id));
            state
        }

        pub fn insert(&mut self, event: TestEvent) {
            let key = (
                StateEventType::from(event.kind.as_str()),
                event.state_key.clone().unwrap_or_default(),
            );
            self.events.insert(key, event);
        }

        pub fn fetch(&self, kind: &StateEventType, state_key: &str) -> Option<TestEvent> {
            self.events.get(&(kind.clone(), state_key.to_owned())).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use serde_json::json;

    use super::test_support::TestEvent;
    use super::*;
    use crate::RoomVersionId;

    /// Builds an event graph fixture: a room on s1 with alice (creator) and
    /// bob joined, power levels giving both level 50.
    struct Graph {
        events: HashMap<OwnedEventId, TestEvent>,
        create: OwnedEventId,
        alice_join: OwnedEventId,
        bob_join: OwnedEventId,
        power: OwnedEventId,
    }

    impl Graph {
        fn new() -> Self {
            let create = TestEvent::create("@alice:s1", "!r:s1");
            let create_id = create.event_id.clone();

            let alice_join = TestEvent::member("@alice:s1", "@alice:s1", "join", "!r:s1")
                .with_auth(vec![create_id.clone()])
                .with_prev(vec![create_id.clone()]);
            let alice_join_id = alice_join.event_id.clone();

            let power = TestEvent::power_levels(
                "@alice:s1",
                "!r:s1",
                json!({"users": {"@alice:s1": 100, "@bob:s2": 50, "@carol:s3": 50}}),
            )
            .with_auth(vec![create_id.clone(), alice_join_id.clone()]);
            let power_id = power.event_id.clone();

            let bob_join = TestEvent::member_with_content(
                "@bob:s2",
                "@bob:s2",
                "!r:s1",
                json!({"membership": "join"}),
            )
            .with_auth(vec![create_id.clone(), power_id.clone()]);
            let bob_join_id = bob_join.event_id.clone();

            let mut events = HashMap::new();
            for event in [create, alice_join, power, bob_join] {
                events.insert(event.event_id.clone(), event);
            }

            // Make bob's join legal: the room is public.
            let join_rules = TestEvent::join_rules(
                "@alice:s1",
                "!r:s1",
                json!({"join_rule": "public"}),
            )
            .with_auth(vec![create_id.clone(), alice_join_id.clone(), power_id.clone()]);
            let join_rules_id = join_rules.event_id.clone();
            events.insert(join_rules_id.clone(), join_rules);
            events
                .get_mut(&bob_join_id)
                .unwrap()
                .auth_events
                .push(join_rules_id);

            Self {
                events,
                create: create_id,
                alice_join: alice_join_id,
                bob_join: bob_join_id,
                power: power_id,
            }
        }

        fn add(&mut self, event: TestEvent) -> OwnedEventId {
            let id = event.event_id.clone();
            self.events.insert(id.clone(), event);
            id
        }

        fn fetch(&self) -> impl Fn(&EventId) -> Option<TestEvent> + '_ {
            move |id| self.events.get(id).cloned()
        }

        fn base_state(&self) -> StateMap<OwnedEventId> {
            let mut state = StateMap::new();
            for id in [&self.create, &self.alice_join, &self.bob_join, &self.power] {
                let event = &self.events[id];
                state.insert(
                    (
                        StateEventType::from(event.kind.as_str()),
                        event.state_key.clone().unwrap(),
                    ),
                    id.clone(),
                );
            }
            let join_rules = self
                .events
                .values()
                .find(|e| e.kind == crate::events::TimelineEventType::RoomJoinRules)
                .unwrap();
            state.insert(
                (StateEventType::RoomJoinRules, String::new()),
                join_rules.event_id.clone(),
            );
            state
        }

        fn auth_chain(&self, frontier: &[&OwnedEventId]) -> HashSet<OwnedEventId> {
            let mut chain = HashSet::new();
            let mut queue: Vec<OwnedEventId> = frontier.iter().map(|id| (*id).clone()).collect();
            while let Some(id) = queue.pop() {
                if let Some(event) = self.events.get(&id) {
                    for auth_id in &event.auth_events {
                        if chain.insert(auth_id.clone()) {
                            queue.push(auth_id.clone());
                        }
                    }
                }
            }
            chain
        }
    }

    fn rules() -> RoomVersionRules {
        RoomVersionId::V10.rules()
    }

    #[test]
    fn unconflicted_passthrough() {
        let graph = Graph::new();
        let state = graph.base_state();
        let chains = vec![
            graph.auth_chain(&[&graph.bob_join]),
            graph.auth_chain(&[&graph.bob_join]),
        ];

        let resolved =
            resolve(&rules(), &[state.clone(), state.clone()], &chains, &graph.fetch()).unwrap();
        assert_eq!(resolved, state);
    }

    #[test]
    fn equal_power_topic_conflict_resolves_to_greater_event_id() {
        let mut graph = Graph::new();
        let base = graph.base_state();
        let auth = vec![graph.create.clone(), graph.power.clone(), graph.bob_join.clone()];

        let topic_a = graph.add(
            TestEvent::topic("@bob:s2", "!r:s1", "from fork a")
                .with_id("$aaaaaaaaaaaaaaaaaaaa")
                .with_ts(5_000_000)
                .with_auth(auth.clone()),
        );
        let topic_z = graph.add(
            TestEvent::topic("@carol:s3", "!r:s1", "from fork z")
                .with_id("$zzzzzzzzzzzzzzzzzzzz")
                .with_ts(5_000_000)
                .with_auth(auth.clone()),
        );
        let carol_join = graph.add(
            TestEvent::member("@carol:s3", "@carol:s3", "join", "!r:s1")
                .with_auth(vec![graph.create.clone(), graph.power.clone()]),
        );

        let mut fork_a = base.clone();
        fork_a.insert((StateEventType::RoomTopic, String::new()), topic_a.clone());
        fork_a.insert(
            (StateEventType::RoomMember, "@carol:s3".to_owned()),
            carol_join.clone(),
        );
        let mut fork_z = base.clone();
        fork_z.insert((StateEventType::RoomTopic, String::new()), topic_z.clone());
        fork_z.insert(
            (StateEventType::RoomMember, "@carol:s3".to_owned()),
            carol_join.clone(),
        );

        let chains = vec![
            graph.auth_chain(&[&topic_a, &carol_join]),
            graph.auth_chain(&[&topic_z, &carol_join]),
        ];

        let resolved = resolve(&rules(), &[fork_a.clone(), fork_z.clone()], &chains, &graph.fetch())
            .unwrap();
        assert_eq!(
            resolved[&(StateEventType::RoomTopic, String::new())],
            topic_z,
            "the lexicographically greater event id wins the tie-break"
        );

        // Determinism: swapping the fork order changes nothing.
        let swapped =
            resolve(&rules(), &[fork_z, fork_a], &chains, &graph.fetch()).unwrap();
        assert_eq!(resolved, swapped);
    }

    #[test]
    fn power_levels_conflict_settles_before_dependents() {
        let mut graph = Graph::new();
        let base = graph.base_state();

        // Bob (50) and alice (100) concurrently replace the power levels.
        let bob_pl = graph.add(
            TestEvent::power_levels(
                "@bob:s2",
                "!r:s1",
                json!({"users": {"@alice:s1": 100, "@bob:s2": 50, "@carol:s3": 50}}),
            )
            .with_ts(6_000_000)
            .with_auth(vec![graph.create.clone(), graph.power.clone(), graph.bob_join.clone()]),
        );
        let alice_pl = graph.add(
            TestEvent::power_levels(
                "@alice:s1",
                "!r:s1",
                json!({"users": {"@alice:s1": 100}}),
            )
            .with_ts(6_000_001)
            .with_auth(vec![graph.create.clone(), graph.power.clone(), graph.alice_join.clone()]),
        );

        let mut fork_a = base.clone();
        fork_a.insert((StateEventType::RoomPowerLevels, String::new()), bob_pl.clone());
        let mut fork_b = base.clone();
        fork_b.insert((StateEventType::RoomPowerLevels, String::new()), alice_pl.clone());

        let chains = vec![
            graph.auth_chain(&[&bob_pl, &graph.bob_join.clone()]),
            graph.auth_chain(&[&alice_pl, &graph.bob_join.clone()]),
        ];

        let resolved =
            resolve(&rules(), &[fork_a, fork_b], &chains, &graph.fetch()).unwrap();

        // Alice's event sorts first (higher power). Bob's is applied later
        // against the running state and only wins the slot if it passes
        // auth under alice's levels; bob at 50 cannot change levels, so
        // alice's stands.
        assert_eq!(
            resolved[&(StateEventType::RoomPowerLevels, String::new())],
            alice_pl
        );
    }

    #[test]
    fn resolution_is_deterministic_over_many_orders() {
        let mut graph = Graph::new();
        let base = graph.base_state();
        let auth = vec![graph.create.clone(), graph.power.clone(), graph.bob_join.clone()];

        let mut forks = Vec::new();
        let mut frontier = Vec::new();
        for index in 0..4 {
            let topic = graph.add(
                TestEvent::topic("@bob:s2", "!r:s1", &format!("topic {index}"))
                    .with_ts(7_000_000)
                    .with_auth(auth.clone()),
            );
            let mut fork = base.clone();
            fork.insert((StateEventType::RoomTopic, String::new()), topic.clone());
            forks.push(fork);
            frontier.push(topic);
        }

        let chains: Vec<_> = frontier
            .iter()
            .map(|id| graph.auth_chain(&[id]))
            .collect();

        let reference = resolve(&rules(), &forks, &chains, &graph.fetch()).unwrap();
        let mut rotated_forks = forks.clone();
        let mut rotated_chains = chains.clone();
        for _ in 0..3 {
            rotated_forks.rotate_left(1);
            rotated_chains.rotate_left(1);
            let resolved =
                resolve(&rules(), &rotated_forks, &rotated_chains, &graph.fetch()).unwrap();
            assert_eq!(resolved, reference);
        }
    }
}
