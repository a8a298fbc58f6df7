//! The event store: an append-only log of PDUs with the indexes the room
//! engine queries.
//!
//! Events are immutable once stored, except for redaction (which replaces
//! content with its redacted form) and `unsigned` annotations. Outliers and
//! soft-failed events are retained for auth-chain consistency but never
//! enter a room's event stream.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock, RwLock};

use crate::core::serde::CanonicalJsonObject;
use crate::core::{MatrixError, Seqnum};
use crate::core::identifiers::{EventId, OwnedEventId, OwnedRoomId, RoomId};
use crate::event::PduEvent;
use crate::{AppError, AppResult};

#[derive(Clone)]
pub struct DbEvent {
    pub pdu: Arc<PduEvent>,
    /// The event exactly as hashed and signed; serving it back byte-exact
    /// keeps remote signature checks valid.
    pub json: CanonicalJsonObject,
    pub event_sn: Seqnum,
    /// Present but not part of any accepted state.
    pub outlier: bool,
    /// Rejected by the auth rules at receipt; retained, excluded from
    /// current state and streams.
    pub soft_failed: bool,
}

static EVENTS: LazyLock<RwLock<HashMap<OwnedEventId, DbEvent>>> =
    LazyLock::new(Default::default);

/// Per-room stream of accepted events in persistence order.
static ROOM_STREAM: LazyLock<RwLock<BTreeMap<(OwnedRoomId, Seqnum), OwnedEventId>>> =
    LazyLock::new(Default::default);

fn comparable(json: &CanonicalJsonObject) -> CanonicalJsonObject {
    let mut copy = json.clone();
    copy.remove("unsigned");
    copy.remove("event_id");
    copy
}

/// Appends an event. Identical duplicates are idempotent (and may upgrade
/// an outlier to accepted); a differing event under the same id is a
/// conflict.
pub fn put(
    pdu: &Arc<PduEvent>,
    json: CanonicalJsonObject,
    outlier: bool,
    soft_failed: bool,
) -> AppResult<Seqnum> {
    let mut events = EVENTS.write().unwrap();

    if let Some(existing) = events.get_mut(&pdu.event_id) {
        if comparable(&existing.json) != comparable(&json) {
            return Err(MatrixError::invalid_param(
                "event id collides with a differing event",
            )
            .into());
        }
        if existing.outlier && !outlier {
            existing.outlier = false;
            existing.soft_failed = soft_failed;
            if !soft_failed {
                ROOM_STREAM.write().unwrap().insert(
                    (pdu.room_id.clone(), existing.event_sn),
                    pdu.event_id.clone(),
                );
            }
        }
        return Ok(existing.event_sn);
    }

    let event_sn = super::next_sn();
    events.insert(
        pdu.event_id.clone(),
        DbEvent {
            pdu: pdu.clone(),
            json,
            event_sn,
            outlier,
            soft_failed,
        },
    );
    if !outlier && !soft_failed {
        ROOM_STREAM
            .write()
            .unwrap()
            .insert((pdu.room_id.clone(), event_sn), pdu.event_id.clone());
    }
    Ok(event_sn)
}

pub fn get(event_id: &EventId) -> Option<Arc<PduEvent>> {
    EVENTS.read().unwrap().get(event_id).map(|db| db.pdu.clone())
}

pub fn get_db(event_id: &EventId) -> Option<DbEvent> {
    EVENTS.read().unwrap().get(event_id).cloned()
}

pub fn get_json(event_id: &EventId) -> Option<CanonicalJsonObject> {
    EVENTS.read().unwrap().get(event_id).map(|db| db.json.clone())
}

pub fn exists(event_id: &EventId) -> bool {
    EVENTS.read().unwrap().contains_key(event_id)
}

/// Whether the event is stored and neither an outlier nor soft-failed.
pub fn is_accepted(event_id: &EventId) -> bool {
    EVENTS
        .read()
        .unwrap()
        .get(event_id)
        .map(|db| !db.outlier && !db.soft_failed)
        .unwrap_or(false)
}

pub fn is_soft_failed(event_id: &EventId) -> bool {
    EVENTS
        .read()
        .unwrap()
        .get(event_id)
        .map(|db| db.soft_failed)
        .unwrap_or(false)
}

/// Replaces a stored event's PDU and json in place; used when a redaction
/// is applied.
pub fn replace(event_id: &EventId, pdu: Arc<PduEvent>, json: CanonicalJsonObject) {
    if let Some(db) = EVENTS.write().unwrap().get_mut(event_id) {
        db.pdu = pdu;
        db.json = json;
    }
}

/// The transitive closure of the given events' `auth_events`,
/// de-duplicated, the starting events excluded.
pub fn auth_chain_ids(starts: &[OwnedEventId]) -> HashSet<OwnedEventId> {
    let events = EVENTS.read().unwrap();
    let mut chain = HashSet::new();
    let mut queue: VecDeque<OwnedEventId> = starts.to_vec().into();

    while let Some(id) = queue.pop_front() {
        if let Some(db) = events.get(&id) {
            for auth_id in &db.pdu.auth_events {
                if chain.insert(auth_id.clone()) {
                    queue.push_back(auth_id.clone());
                }
            }
        }
    }
    chain
}

/// The auth chain as events, ordered by depth then event id so output is
/// deterministic.
pub fn auth_chain(starts: &[OwnedEventId]) -> Vec<Arc<PduEvent>> {
    let ids = auth_chain_ids(starts);
    let events = EVENTS.read().unwrap();
    let mut chain: Vec<Arc<PduEvent>> = ids
        .into_iter()
        .filter_map(|id| events.get(&id).map(|db| db.pdu.clone()))
        .collect();
    chain.sort_by(|a, b| {
        a.depth
            .cmp(&b.depth)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    chain
}

/// Ancestors of `from` (walking `prev_events`), oldest first, up to
/// `limit`. The frontier events themselves are not included.
pub fn backfill(room_id: &RoomId, from: &[OwnedEventId], limit: usize) -> Vec<Arc<PduEvent>> {
    let events = EVENTS.read().unwrap();
    let mut collected: Vec<Arc<PduEvent>> = Vec::new();
    let mut visited: HashSet<OwnedEventId> = from.iter().cloned().collect();
    let mut queue: VecDeque<OwnedEventId> = from.to_vec().into();

    while let Some(id) = queue.pop_front() {
        let Some(db) = events.get(&id) else { continue };
        for prev in &db.pdu.prev_events {
            if visited.insert(prev.clone()) {
                if let Some(prev_db) = events.get(prev) {
                    if prev_db.pdu.room_id == *room_id {
                        collected.push(prev_db.pdu.clone());
                        queue.push_back(prev.clone());
                    }
                }
            }
        }
    }

    collected.sort_by(|a, b| {
        a.depth
            .cmp(&b.depth)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    collected.truncate(limit);
    collected
}

/// Events strictly between the earliest and latest sets in DAG order,
/// oldest first; fulfils `get_missing_events`.
pub fn missing_between(
    room_id: &RoomId,
    earliest: &[OwnedEventId],
    latest: &[OwnedEventId],
    limit: usize,
    min_depth: u64,
) -> Vec<Arc<PduEvent>> {
    let stop: HashSet<&OwnedEventId> = earliest.iter().collect();
    let events = EVENTS.read().unwrap();
    let mut collected: Vec<Arc<PduEvent>> = Vec::new();
    let mut visited: HashSet<OwnedEventId> = latest.iter().cloned().collect();
    let mut queue: VecDeque<OwnedEventId> = latest.to_vec().into();

    while let Some(id) = queue.pop_front() {
        let Some(db) = events.get(&id) else { continue };
        for prev in &db.pdu.prev_events {
            if stop.contains(prev) || !visited.insert(prev.clone()) {
                continue;
            }
            if let Some(prev_db) = events.get(prev) {
                if prev_db.pdu.room_id == *room_id && prev_db.pdu.depth >= min_depth {
                    collected.push(prev_db.pdu.clone());
                    queue.push_back(prev.clone());
                }
            }
        }
    }

    collected.sort_by(|a, b| {
        a.depth
            .cmp(&b.depth)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    collected.truncate(limit);
    collected
}

/// Accepted events of a room with stream position greater than `since`,
/// ascending, up to `limit`.
pub fn events_since(
    room_id: &RoomId,
    since: Seqnum,
    limit: usize,
) -> Vec<(Seqnum, Arc<PduEvent>)> {
    let stream = ROOM_STREAM.read().unwrap();
    let events = EVENTS.read().unwrap();
    stream
        .range((room_id.to_owned(), since + 1)..=(room_id.to_owned(), Seqnum::MAX))
        .filter_map(|((_, sn), id)| events.get(id).map(|db| (*sn, db.pdu.clone())))
        .take(limit)
        .collect()
}

/// The most recent accepted events at or before `until`, newest first.
pub fn events_before(
    room_id: &RoomId,
    until: Seqnum,
    limit: usize,
) -> Vec<(Seqnum, Arc<PduEvent>)> {
    let stream = ROOM_STREAM.read().unwrap();
    let events = EVENTS.read().unwrap();
    stream
        .range((room_id.to_owned(), Seqnum::MIN)..=(room_id.to_owned(), until))
        .rev()
        .filter_map(|((_, sn), id)| events.get(id).map(|db| (*sn, db.pdu.clone())))
        .take(limit)
        .collect()
}

/// The stream position of the newest accepted event in the room.
pub fn latest_sn(room_id: &RoomId) -> Seqnum {
    ROOM_STREAM
        .read()
        .unwrap()
        .range((room_id.to_owned(), Seqnum::MIN)..=(room_id.to_owned(), Seqnum::MAX))
        .next_back()
        .map(|((_, sn), _)| *sn)
        .unwrap_or(0)
}

/// Fails with `M_NOT_FOUND` when the event is unknown.
pub fn require(event_id: &EventId) -> AppResult<Arc<PduEvent>> {
    get(event_id)
        .ok_or_else(|| AppError::from(MatrixError::not_found("Event not found.")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::UnixMillis;
    use crate::core::events::TimelineEventType;
    use crate::event::{EventHash, PduEvent};

    fn make_pdu(id: &str, room: &str, depth: u64, prev: Vec<&str>, auth: Vec<&str>) -> Arc<PduEvent> {
        Arc::new(PduEvent {
            event_id: id.try_into().unwrap(),
            event_ty: TimelineEventType::RoomMessage,
            room_id: room.try_into().unwrap(),
            sender: "@a:test.example".try_into().unwrap(),
            origin_server_ts: UnixMillis(1),
            content: json!({"body": "x"}),
            state_key: None,
            prev_events: prev.into_iter().map(|p| p.try_into().unwrap()).collect(),
            depth,
            auth_events: auth.into_iter().map(|a| a.try_into().unwrap()).collect(),
            redacts: None,
            unsigned: Default::default(),
            hashes: EventHash { sha256: "x".into() },
            signatures: None,
        })
    }

    fn put_pdu(pdu: &Arc<PduEvent>) {
        let json = crate::core::serde::to_canonical_object(pdu.as_ref()).unwrap();
        put(pdu, json, false, false).unwrap();
    }

    #[test]
    fn duplicate_ids_are_idempotent_conflicts_rejected() {
        let room = "!dup:test.example";
        let a = make_pdu("$dup_a", room, 1, vec![], vec![]);
        put_pdu(&a);
        let sn_first = get_db(&a.event_id).unwrap().event_sn;
        put_pdu(&a);
        assert_eq!(get_db(&a.event_id).unwrap().event_sn, sn_first);

        let mut conflicting = (*a).clone();
        conflicting.content = json!({"body": "different"});
        let json = crate::core::serde::to_canonical_object(&conflicting).unwrap();
        let err = put(&Arc::new(conflicting), json, false, false).unwrap_err();
        assert!(matches!(err, AppError::Matrix(_)));
    }

    #[test]
    fn auth_chain_is_transitive_and_deduplicated() {
        let room = "!chain:test.example";
        let a = make_pdu("$chain_a", room, 1, vec![], vec![]);
        let b = make_pdu("$chain_b", room, 2, vec![], vec!["$chain_a"]);
        let c = make_pdu("$chain_c", room, 3, vec![], vec!["$chain_a", "$chain_b"]);
        let d = make_pdu("$chain_d", room, 4, vec![], vec!["$chain_c", "$chain_b"]);
        for pdu in [&a, &b, &c, &d] {
            put_pdu(pdu);
        }

        let ids = auth_chain_ids(&[d.event_id.clone()]);
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&d.event_id));

        let chain = auth_chain(&[d.event_id.clone()]);
        let depths: Vec<u64> = chain.iter().map(|p| p.depth).collect();
        assert_eq!(depths, vec![1, 2, 3]);
    }

    #[test]
    fn missing_between_walks_the_gap() {
        let room = "!gap:test.example";
        let e1 = make_pdu("$gap_1", room, 1, vec![], vec![]);
        let e2 = make_pdu("$gap_2", room, 2, vec!["$gap_1"], vec![]);
        let e3 = make_pdu("$gap_3", room, 3, vec!["$gap_2"], vec![]);
        let e4 = make_pdu("$gap_4", room, 4, vec!["$gap_3"], vec![]);
        for pdu in [&e1, &e2, &e3, &e4] {
            put_pdu(pdu);
        }

        let missing = missing_between(
            &e1.room_id,
            &[e1.event_id.clone()],
            &[e4.event_id.clone()],
            10,
            0,
        );
        let ids: Vec<&str> = missing.iter().map(|p| p.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$gap_2", "$gap_3"]);
    }

    #[test]
    fn backfill_returns_ancestors_oldest_first() {
        let room = "!bf:test.example";
        let e1 = make_pdu("$bf_1", room, 1, vec![], vec![]);
        let e2 = make_pdu("$bf_2", room, 2, vec!["$bf_1"], vec![]);
        let e3 = make_pdu("$bf_3", room, 3, vec!["$bf_2"], vec![]);
        for pdu in [&e1, &e2, &e3] {
            put_pdu(pdu);
        }

        let events = backfill(&e1.room_id, &[e3.event_id.clone()], 5);
        let ids: Vec<&str> = events.iter().map(|p| p.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$bf_1", "$bf_2"]);
    }

    #[test]
    fn soft_failed_events_stay_out_of_the_stream() {
        let room: OwnedRoomId = "!soft:test.example".try_into().unwrap();
        let ok = make_pdu("$soft_ok", room.as_str(), 1, vec![], vec![]);
        let bad = make_pdu("$soft_bad", room.as_str(), 2, vec![], vec![]);
        put_pdu(&ok);
        let json = crate::core::serde::to_canonical_object(bad.as_ref()).unwrap();
        put(&bad, json, false, true).unwrap();

        let since: Vec<_> = events_since(&room, 0, 10)
            .into_iter()
            .map(|(_, p)| p.event_id.clone())
            .collect();
        assert!(since.contains(&ok.event_id));
        assert!(!since.contains(&bad.event_id));
        // Retained nonetheless.
        assert!(exists(&bad.event_id));
        assert!(is_soft_failed(&bad.event_id));
    }
}
