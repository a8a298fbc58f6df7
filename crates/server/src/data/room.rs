//! Rooms: the room rows, membership tables, the materialized current
//! state, numbered state groups and forward extremities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

use serde_json::Value as JsonValue;

use crate::core::events::room::MembershipState;
use crate::core::identifiers::{
    EventId, OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, RoomId, UserId,
};
use crate::core::state::StateMap;
use crate::core::{MatrixError, RoomVersionId, Seqnum};
use crate::{AppError, AppResult};

#[derive(Clone, Debug)]
pub struct DbRoom {
    pub room_id: OwnedRoomId,
    pub version: RoomVersionId,
    pub creator: Option<OwnedUserId>,
    pub published: bool,
    pub disabled: bool,
}

static ROOMS: LazyLock<RwLock<HashMap<OwnedRoomId, DbRoom>>> = LazyLock::new(Default::default);

static CURRENT_STATE: LazyLock<RwLock<HashMap<OwnedRoomId, StateMap<OwnedEventId>>>> =
    LazyLock::new(Default::default);

/// Log of current-state replacements per room, for sync state deltas.
static STATE_LOG: LazyLock<RwLock<HashMap<OwnedRoomId, Vec<(Seqnum, OwnedEventId)>>>> =
    LazyLock::new(Default::default);

/// State groups: the resolved state *after* a given event.
static STATE_GROUPS: LazyLock<RwLock<HashMap<u64, Arc<StateMap<OwnedEventId>>>>> =
    LazyLock::new(Default::default);
static EVENT_GROUPS: LazyLock<RwLock<HashMap<OwnedEventId, u64>>> =
    LazyLock::new(Default::default);
static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

static FORWARD_EXTREMITIES: LazyLock<RwLock<HashMap<OwnedRoomId, HashSet<OwnedEventId>>>> =
    LazyLock::new(Default::default);

static MEMBERS: LazyLock<RwLock<HashMap<OwnedRoomId, HashMap<OwnedUserId, MembershipState>>>> =
    LazyLock::new(Default::default);
static USER_ROOMS: LazyLock<RwLock<HashMap<OwnedUserId, HashMap<OwnedRoomId, MembershipState>>>> =
    LazyLock::new(Default::default);

/// Membership transitions in global stream order, for sync's invite/leave
/// sections.
static MEMBERSHIP_LOG: LazyLock<
    RwLock<Vec<(Seqnum, OwnedUserId, OwnedRoomId, MembershipState)>>,
> = LazyLock::new(Default::default);

/// Stripped state handed to invited / knocking users.
static INVITE_STATE: LazyLock<RwLock<HashMap<(OwnedRoomId, OwnedUserId), Vec<JsonValue>>>> =
    LazyLock::new(Default::default);
static KNOCK_STATE: LazyLock<RwLock<HashMap<(OwnedRoomId, OwnedUserId), Vec<JsonValue>>>> =
    LazyLock::new(Default::default);

pub fn create_room(
    room_id: &RoomId,
    version: RoomVersionId,
    creator: Option<OwnedUserId>,
    published: bool,
) {
    ROOMS.write().unwrap().insert(
        room_id.to_owned(),
        DbRoom {
            room_id: room_id.to_owned(),
            version,
            creator,
            published,
            disabled: false,
        },
    );
}

/// Creates the room row if it does not exist yet.
pub fn ensure_room(room_id: &RoomId, version: &RoomVersionId) -> AppResult<()> {
    let mut rooms = ROOMS.write().unwrap();
    rooms.entry(room_id.to_owned()).or_insert_with(|| DbRoom {
        room_id: room_id.to_owned(),
        version: *version,
        creator: None,
        published: false,
        disabled: false,
    });
    Ok(())
}

pub fn exists(room_id: &RoomId) -> bool {
    ROOMS.read().unwrap().contains_key(room_id)
}

pub fn get_room(room_id: &RoomId) -> Option<DbRoom> {
    ROOMS.read().unwrap().get(room_id).cloned()
}

pub fn room_version(room_id: &RoomId) -> AppResult<RoomVersionId> {
    ROOMS
        .read()
        .unwrap()
        .get(room_id)
        .map(|room| room.version)
        .ok_or_else(|| AppError::from(MatrixError::not_found("Room not found.")))
}

pub fn is_disabled(room_id: &RoomId) -> bool {
    ROOMS
        .read()
        .unwrap()
        .get(room_id)
        .map(|room| room.disabled)
        .unwrap_or(false)
}

pub fn set_creator(room_id: &RoomId, creator: OwnedUserId) {
    if let Some(room) = ROOMS.write().unwrap().get_mut(room_id) {
        room.creator.get_or_insert(creator);
    }
}

pub fn current_state(room_id: &RoomId) -> StateMap<OwnedEventId> {
    CURRENT_STATE
        .read()
        .unwrap()
        .get(room_id)
        .cloned()
        .unwrap_or_default()
}

pub fn current_state_id(
    room_id: &RoomId,
    kind: &crate::core::events::StateEventType,
    state_key: &str,
) -> Option<OwnedEventId> {
    CURRENT_STATE
        .read()
        .unwrap()
        .get(room_id)?
        .get(&(kind.clone(), state_key.to_owned()))
        .cloned()
}

/// Replaces the room's current state, logging every changed slot at the
/// given stream position.
pub fn set_current_state(room_id: &RoomId, state: StateMap<OwnedEventId>, sn: Seqnum) {
    let mut current = CURRENT_STATE.write().unwrap();
    let old = current.entry(room_id.to_owned()).or_default();

    let mut log = STATE_LOG.write().unwrap();
    let room_log = log.entry(room_id.to_owned()).or_default();
    for (key, event_id) in &state {
        if old.get(key) != Some(event_id) {
            room_log.push((sn, event_id.clone()));
        }
    }

    *old = state;
}

/// Current-state insertions after `since`, deduplicated.
pub fn state_changes_since(room_id: &RoomId, since: Seqnum) -> Vec<OwnedEventId> {
    let log = STATE_LOG.read().unwrap();
    let mut seen = HashSet::new();
    log.get(room_id)
        .map(|entries| {
            entries
                .iter()
                .filter(|(sn, _)| *sn > since)
                .filter(|(_, id)| seen.insert(id.clone()))
                .map(|(_, id)| id.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Registers the resolved state after `event_id` as a numbered group.
/// Identical maps share one group.
pub fn record_state_group(event_id: &EventId, state: Arc<StateMap<OwnedEventId>>) -> u64 {
    let mut groups = STATE_GROUPS.write().unwrap();
    let existing = groups
        .iter()
        .find(|(_, map)| ***map == *state)
        .map(|(id, _)| *id);
    let group_id = existing.unwrap_or_else(|| {
        let id = NEXT_GROUP.fetch_add(1, Ordering::SeqCst);
        groups.insert(id, state);
        id
    });
    EVENT_GROUPS
        .write()
        .unwrap()
        .insert(event_id.to_owned(), group_id);
    group_id
}

/// The resolved state *after* the given event, if known.
pub fn state_after(event_id: &EventId) -> Option<Arc<StateMap<OwnedEventId>>> {
    let group_id = *EVENT_GROUPS.read().unwrap().get(event_id)?;
    STATE_GROUPS.read().unwrap().get(&group_id).cloned()
}

pub fn forward_extremities(room_id: &RoomId) -> Vec<OwnedEventId> {
    let mut extremities: Vec<OwnedEventId> = FORWARD_EXTREMITIES
        .read()
        .unwrap()
        .get(room_id)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default();
    extremities.sort();
    extremities
}

/// Makes `event_id` a forward extremity, retiring the parents it cites.
pub fn replace_extremities(room_id: &RoomId, prev_events: &[OwnedEventId], event_id: &EventId) {
    let mut all = FORWARD_EXTREMITIES.write().unwrap();
    let set = all.entry(room_id.to_owned()).or_default();
    for prev in prev_events {
        set.remove(prev);
    }
    set.insert(event_id.to_owned());
}

pub fn update_membership(
    room_id: &RoomId,
    user_id: &UserId,
    membership: MembershipState,
    sn: Seqnum,
) {
    MEMBERS
        .write()
        .unwrap()
        .entry(room_id.to_owned())
        .or_default()
        .insert(user_id.to_owned(), membership);
    USER_ROOMS
        .write()
        .unwrap()
        .entry(user_id.to_owned())
        .or_default()
        .insert(room_id.to_owned(), membership);
    MEMBERSHIP_LOG.write().unwrap().push((
        sn,
        user_id.to_owned(),
        room_id.to_owned(),
        membership,
    ));
}

pub fn membership(room_id: &RoomId, user_id: &UserId) -> Option<MembershipState> {
    MEMBERS
        .read()
        .unwrap()
        .get(room_id)?
        .get(user_id)
        .copied()
}

pub fn is_joined(user_id: &UserId, room_id: &RoomId) -> bool {
    membership(room_id, user_id) == Some(MembershipState::Join)
}

pub fn is_invited(user_id: &UserId, room_id: &RoomId) -> bool {
    membership(room_id, user_id) == Some(MembershipState::Invite)
}

pub fn is_banned(user_id: &UserId, room_id: &RoomId) -> bool {
    membership(room_id, user_id) == Some(MembershipState::Ban)
}

pub fn joined_users(room_id: &RoomId) -> Vec<OwnedUserId> {
    MEMBERS
        .read()
        .unwrap()
        .get(room_id)
        .map(|members| {
            members
                .iter()
                .filter(|(_, membership)| **membership == MembershipState::Join)
                .map(|(user, _)| user.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// The servers with at least one joined user in the room.
pub fn joined_servers(room_id: &RoomId) -> Vec<OwnedServerName> {
    let mut servers: Vec<OwnedServerName> = joined_users(room_id)
        .iter()
        .map(|user| user.server_name().to_owned())
        .collect();
    servers.sort();
    servers.dedup();
    servers
}

pub fn is_server_joined(server: &crate::core::identifiers::ServerName, room_id: &RoomId) -> bool {
    joined_users(room_id)
        .iter()
        .any(|user| user.server_name() == server)
}

pub fn rooms_of(user_id: &UserId, membership: MembershipState) -> Vec<OwnedRoomId> {
    USER_ROOMS
        .read()
        .unwrap()
        .get(user_id)
        .map(|rooms| {
            rooms
                .iter()
                .filter(|(_, state)| **state == membership)
                .map(|(room, _)| room.clone())
                .collect()
        })
        .unwrap_or_default()
}

pub fn joined_rooms(user_id: &UserId) -> Vec<OwnedRoomId> {
    let mut rooms = rooms_of(user_id, MembershipState::Join);
    rooms.sort();
    rooms
}

/// Membership transitions concerning `user_id` after `since`.
pub fn membership_changes_since(
    user_id: &UserId,
    since: Seqnum,
) -> Vec<(Seqnum, OwnedRoomId, MembershipState)> {
    MEMBERSHIP_LOG
        .read()
        .unwrap()
        .iter()
        .filter(|(sn, user, _, _)| *sn > since && **user == *user_id)
        .map(|(sn, _, room, membership)| (*sn, room.clone(), *membership))
        .collect()
}

pub fn set_invite_state(room_id: &RoomId, user_id: &UserId, state: Vec<JsonValue>) {
    INVITE_STATE
        .write()
        .unwrap()
        .insert((room_id.to_owned(), user_id.to_owned()), state);
}

pub fn invite_state(room_id: &RoomId, user_id: &UserId) -> Vec<JsonValue> {
    INVITE_STATE
        .read()
        .unwrap()
        .get(&(room_id.to_owned(), user_id.to_owned()))
        .cloned()
        .unwrap_or_default()
}

pub fn set_knock_state(room_id: &RoomId, user_id: &UserId, state: Vec<JsonValue>) {
    KNOCK_STATE
        .write()
        .unwrap()
        .insert((room_id.to_owned(), user_id.to_owned()), state);
}

pub fn knock_state(room_id: &RoomId, user_id: &UserId) -> Vec<JsonValue> {
    KNOCK_STATE
        .read()
        .unwrap()
        .get(&(room_id.to_owned(), user_id.to_owned()))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_bookkeeping() {
        let room: OwnedRoomId = "!members:test.example".try_into().unwrap();
        let alice: OwnedUserId = "@alice:test.example".try_into().unwrap();
        let bob: OwnedUserId = "@bob:far.example".try_into().unwrap();

        update_membership(&room, &alice, MembershipState::Join, 1);
        update_membership(&room, &bob, MembershipState::Invite, 2);
        assert!(is_joined(&alice, &room));
        assert!(is_invited(&bob, &room));
        assert_eq!(joined_servers(&room).len(), 1);

        update_membership(&room, &bob, MembershipState::Join, 3);
        let servers = joined_servers(&room);
        assert_eq!(servers.len(), 2);
        assert!(is_server_joined(bob.server_name(), &room));

        let changes = membership_changes_since(&bob, 1);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].2, MembershipState::Join);
    }

    #[test]
    fn extremities_replace_their_parents() {
        let room: OwnedRoomId = "!frontier:test.example".try_into().unwrap();
        let a: OwnedEventId = "$frontier_a".try_into().unwrap();
        let b: OwnedEventId = "$frontier_b".try_into().unwrap();
        let c: OwnedEventId = "$frontier_c".try_into().unwrap();

        replace_extremities(&room, &[], &a);
        replace_extremities(&room, &[], &b);
        assert_eq!(forward_extremities(&room).len(), 2);

        replace_extremities(&room, &[a.clone(), b.clone()], &c);
        assert_eq!(forward_extremities(&room), vec![c]);
    }

    #[test]
    fn state_groups_deduplicate() {
        let a: OwnedEventId = "$group_a".try_into().unwrap();
        let b: OwnedEventId = "$group_b".try_into().unwrap();
        let mut state = StateMap::new();
        state.insert(
            (crate::core::events::StateEventType::RoomTopic, String::new()),
            a.clone(),
        );
        let state = Arc::new(state);

        let g1 = record_state_group(&a, state.clone());
        let g2 = record_state_group(&b, state.clone());
        assert_eq!(g1, g2);
        assert_eq!(state_after(&a).unwrap(), state_after(&b).unwrap());
    }
}
