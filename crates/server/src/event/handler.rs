//! Inbound PDU processing: the checks every federated event passes before
//! it can influence a room.
//!
//! Order per event: room ACL, content hash, signatures, auth against the
//! event's claimed auth events, then auth against the room's current
//! state. Failing the last check soft-fails the event: it is retained for
//! auth-chain consistency but never enters the current state, the event
//! stream or sync output.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::core::events::StateEventType;
use crate::core::identifiers::{EventId, OwnedEventId, RoomId, ServerName};
use crate::core::serde::CanonicalJsonObject;
use crate::core::signatures::Verified;
use crate::core::state::event_auth;
use crate::core::{MatrixError, RoomVersionId};
use crate::event::PduEvent;
use crate::{AppError, AppResult, data, room};

/// How many rounds of `get_missing_events` one incoming PDU may trigger.
const MAX_BACKWALK_ROUNDS: usize = 10;

/// How many unknown auth events may be pulled over `/event/{id}` for one
/// incoming PDU.
const MAX_AUTH_FETCHES: usize = 100;

/// Processes the PDUs of one inbound transaction. Failures are isolated:
/// each PDU gets its own verdict and one bad PDU never fails the batch.
pub async fn process_pdus(
    pdus: &[JsonValue],
    origin: &ServerName,
) -> AppResult<BTreeMap<OwnedEventId, Result<(), String>>> {
    crate::server_key::acquire_events_pubkeys(pdus).await;

    let mut resolved_map = BTreeMap::new();
    for raw in pdus {
        let (event_id, value, room_id, room_version) = match crate::event::parse_incoming_pdu(raw)
        {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "could not parse pdu");
                continue;
            }
        };

        let _room_lock = room::lock_state(&room_id).await;
        let result =
            process_incoming_pdu(origin, &event_id, &room_id, &room_version, value, true)
                .await
                .map_err(|e| e.to_matrix().to_string());
        if let Err(error) = &result {
            warn!(%event_id, %error, "incoming pdu failed");
        }
        resolved_map.insert(event_id, result);
    }

    Ok(resolved_map)
}

/// Runs one remote event through the full acceptance pipeline. The caller
/// holds the room lock.
pub async fn process_incoming_pdu(
    origin: &ServerName,
    event_id: &EventId,
    room_id: &RoomId,
    room_version: &RoomVersionId,
    value: CanonicalJsonObject,
    fetch_missing: bool,
) -> AppResult<()> {
    if !data::room::exists(room_id) {
        return Err(MatrixError::not_found("unknown room").into());
    }
    if data::room::is_disabled(room_id) {
        return Err(MatrixError::forbidden("federation is disabled for this room").into());
    }
    room::acl_check(origin, room_id)?;

    if data::event::is_accepted(event_id) || data::event::is_soft_failed(event_id) {
        return Ok(());
    }

    let rules = room_version.rules();
    let value = verify_incoming_event(&value, &rules).await?;

    let pdu = Arc::new(
        PduEvent::from_canonical_object(event_id, value.clone())
            .map_err(|e| MatrixError::invalid_param(format!("malformed pdu: {e}")))?,
    );
    if pdu.room_id != *room_id {
        return Err(MatrixError::invalid_param("pdu names a different room").into());
    }

    if fetch_missing {
        backwalk_missing_prev_events(origin, room_id, room_version, &pdu).await;
    }
    fetch_missing_auth_events(origin, room_version, &pdu).await;

    // DAG monotonicity: an event sits strictly below its parents.
    let known_prev_depth = pdu
        .prev_events
        .iter()
        .filter_map(|id| data::event::get(id))
        .map(|prev| prev.depth)
        .max();
    if let Some(max_prev) = known_prev_depth {
        if pdu.depth <= max_prev {
            return Err(MatrixError::invalid_param("event depth does not exceed its parents")
                .into());
        }
    }

    // Authorization against the state the event itself claims.
    let auth_state = claimed_auth_state(&pdu)?;
    event_auth::auth_check(&rules, &pdu, |kind, state_key| {
        auth_state.get(&(kind.clone(), state_key.to_owned())).cloned()
    })
    .map_err(|e| MatrixError::forbidden(format!("rejected by auth rules: {e}")))?;

    // Authorization against our current view of the room; failing here
    // soft-fails rather than rejects.
    let soft_failed = event_auth::auth_check(&rules, &pdu, |kind, state_key| {
        room::current_state_event(room_id, kind, state_key)
    })
    .is_err();

    if soft_failed {
        data::event::put(&pdu, value, false, true)?;
        debug!(%event_id, "event soft-failed against the current state");
        return Ok(());
    }

    room::timeline::append_pdu(&pdu, value, &rules)?;
    Ok(())
}

/// Hash and signature checks: the recomputed content hash must match
/// `hashes.sha256` and at least one valid signature per required server
/// must verify over the redacted form.
async fn verify_incoming_event(
    value: &CanonicalJsonObject,
    rules: &crate::core::RoomVersionRules,
) -> AppResult<CanonicalJsonObject> {
    match crate::server_key::verify_event(value, rules).await? {
        Verified::All => Ok(value.clone()),
        Verified::Signatures => {
            Err(MatrixError::invalid_param("event content hash mismatch").into())
        }
    }
}

/// The state map formed by the event's own `auth_events`.
fn claimed_auth_state(
    pdu: &PduEvent,
) -> AppResult<crate::core::state::StateMap<Arc<PduEvent>>> {
    let mut state = crate::core::state::StateMap::new();
    for auth_id in &pdu.auth_events {
        let Some(auth_event) = data::event::get(auth_id) else {
            return Err(
                MatrixError::invalid_param(format!("auth event {auth_id} is unknown")).into(),
            );
        };
        if auth_event.room_id != pdu.room_id {
            return Err(MatrixError::invalid_param("auth event from a different room").into());
        }
        if let Some(state_key) = &auth_event.state_key {
            state.insert(
                (
                    StateEventType::from(auth_event.event_ty.as_str()),
                    state_key.clone(),
                ),
                auth_event,
            );
        }
    }
    Ok(state)
}

/// Walks backwards over unknown `prev_events`, asking the origin to fill
/// the gap with `get_missing_events`. Fetched events run through the full
/// pipeline oldest-first; failures only leave the gap in place.
async fn backwalk_missing_prev_events(
    origin: &ServerName,
    room_id: &RoomId,
    room_version: &RoomVersionId,
    pdu: &PduEvent,
) {
    let mut rounds = 0usize;
    loop {
        let missing: Vec<OwnedEventId> = pdu
            .prev_events
            .iter()
            .filter(|id| !data::event::exists(id))
            .cloned()
            .collect();
        if missing.is_empty() || rounds >= MAX_BACKWALK_ROUNDS {
            return;
        }
        rounds += 1;

        let earliest = data::room::forward_extremities(room_id);
        let events = match request_missing_events(origin, room_id, &earliest, &missing).await {
            Ok(events) => events,
            Err(e) => {
                debug!(%origin, error = %e, "get_missing_events failed");
                return;
            }
        };
        if events.is_empty() {
            return;
        }

        for raw in events {
            let Ok((event_id, value)) =
                crate::event::gen_event_id_canonical_json(&raw, &room_version.rules())
            else {
                continue;
            };
            if let Err(e) = Box::pin(process_incoming_pdu(
                origin,
                &event_id,
                room_id,
                room_version,
                value,
                false,
            ))
            .await
            {
                debug!(%event_id, error = %e, "backfilled event rejected");
            }
        }
    }
}

async fn request_missing_events(
    origin: &ServerName,
    room_id: &RoomId,
    earliest: &[OwnedEventId],
    latest: &[OwnedEventId],
) -> AppResult<Vec<JsonValue>> {
    let base_url = crate::federation::resolver::origin(origin).await?;
    let request = crate::core::federation::event::missing_events_request(
        &base_url,
        room_id,
        crate::core::federation::event::MissingEventsReqBody {
            earliest_events: earliest.to_vec(),
            latest_events: latest.to_vec(),
            limit: 10,
            min_depth: 0,
        },
    )?;
    let response =
        crate::sending::send_federation_request(origin, request.into_inner(), Some(60)).await?;
    let body: crate::core::federation::event::MissingEventsResBody = response.json().await?;
    Ok(body.events)
}

/// Pulls unknown auth-chain ancestors over `/event/{id}` and stores them
/// as outliers after hash/signature verification. Ancestors are walked
/// iteratively with a visited set; shared ancestry never recurses.
async fn fetch_missing_auth_events(
    origin: &ServerName,
    room_version: &RoomVersionId,
    pdu: &PduEvent,
) {
    let rules = room_version.rules();
    let mut fetched = 0usize;
    let mut seen: HashSet<OwnedEventId> = HashSet::new();
    let mut queue: VecDeque<OwnedEventId> = pdu.auth_events.iter().cloned().collect();

    while let Some(auth_id) = queue.pop_front() {
        if data::event::exists(&auth_id) || !seen.insert(auth_id.clone()) {
            continue;
        }
        if fetched >= MAX_AUTH_FETCHES {
            warn!(%origin, "auth fetch budget exhausted");
            return;
        }
        fetched += 1;

        let raw = match crate::federation::fetch_event(origin, &auth_id).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(%auth_id, error = %e, "could not fetch auth event");
                continue;
            }
        };
        let Ok((derived_id, value)) = crate::event::gen_event_id_canonical_json(&raw, &rules)
        else {
            continue;
        };
        if derived_id != auth_id {
            warn!(%origin, %auth_id, "peer served an event with a different id");
            continue;
        }
        let Ok(verified_value) = verify_incoming_event(&value, &rules).await else {
            continue;
        };
        let Ok(auth_pdu) = PduEvent::from_canonical_object(&auth_id, verified_value.clone())
        else {
            continue;
        };
        queue.extend(auth_pdu.auth_events.iter().cloned());
        if let Err(e) = data::event::put(&Arc::new(auth_pdu), verified_value, true, false) {
            debug!(%auth_id, error = %e, "could not store auth event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::core::events::TimelineEventType;
    use crate::core::serde::{CanonicalJsonValue, to_canonical_value};
    use crate::core::{RoomVersionId, UnixMillis};
    use crate::event::PduBuilder;
    use crate::core::identifiers::{OwnedRoomId, OwnedServerName, OwnedUserId, UserId};
    use crate::room::timeline;
    use crate::{config, room};

    /// A public room with a joined creator, built through the local path.
    async fn public_room(alice: &UserId) -> OwnedRoomId {
        config::init_test();
        let room_id = crate::core::identifiers::RoomId::new(config::server_name());
        data::room::create_room(&room_id, RoomVersionId::V10, Some(alice.to_owned()), false);
        let guard = room::lock_state(&room_id).await;

        for (event_type, state_key, content) in [
            (
                TimelineEventType::RoomCreate,
                String::new(),
                json!({"creator": alice.as_str(), "room_version": "10"}),
            ),
            (
                TimelineEventType::RoomMember,
                alice.as_str().to_owned(),
                json!({"membership": "join"}),
            ),
            (
                TimelineEventType::RoomPowerLevels,
                String::new(),
                json!({"users": {alice.as_str(): 100}}),
            ),
            (
                TimelineEventType::RoomJoinRules,
                String::new(),
                json!({"join_rule": "public"}),
            ),
        ] {
            timeline::build_and_append_pdu(
                PduBuilder {
                    event_type,
                    content,
                    state_key: Some(state_key),
                    ..Default::default()
                },
                alice,
                &room_id,
                &guard,
            )
            .unwrap();
        }
        room_id
    }

    /// Crafts a signed event the way a peer would, without persisting it.
    fn craft_event(
        sender: &UserId,
        room_id: &OwnedRoomId,
        event_type: &str,
        content: serde_json::Value,
        auth_events: Vec<crate::core::identifiers::OwnedEventId>,
    ) -> (crate::core::identifiers::OwnedEventId, CanonicalJsonObject) {
        let rules = RoomVersionId::V10.rules();
        let prev_events = data::room::forward_extremities(room_id);
        let depth = prev_events
            .iter()
            .filter_map(|id| data::event::get(id))
            .map(|pdu| pdu.depth)
            .max()
            .unwrap_or(0)
            + 1;

        let mut object = CanonicalJsonObject::new();
        object.insert("type".into(), CanonicalJsonValue::String(event_type.into()));
        object.insert("content".into(), content.try_into().unwrap());
        object.insert(
            "sender".into(),
            CanonicalJsonValue::String(sender.as_str().into()),
        );
        object.insert(
            "room_id".into(),
            CanonicalJsonValue::String(room_id.as_str().into()),
        );
        object.insert("prev_events".into(), to_canonical_value(&prev_events).unwrap());
        object.insert("auth_events".into(), to_canonical_value(&auth_events).unwrap());
        object.insert("depth".into(), CanonicalJsonValue::Integer(depth as i64));
        object.insert(
            "origin_server_ts".into(),
            CanonicalJsonValue::Integer(UnixMillis::now().get() as i64),
        );
        crate::server_key::hash_and_sign_event(&mut object, &rules).unwrap();
        let event_id = crate::event::gen_event_id(&object, &rules).unwrap();
        (event_id, object)
    }

    fn current_auth_ids(room_id: &OwnedRoomId, user: &UserId) -> Vec<crate::core::identifiers::OwnedEventId> {
        use crate::core::events::StateEventType;
        [
            (StateEventType::RoomCreate, String::new()),
            (StateEventType::RoomPowerLevels, String::new()),
            (StateEventType::RoomMember, user.as_str().to_owned()),
        ]
        .into_iter()
        .filter_map(|(kind, key)| data::room::current_state_id(room_id, &kind, &key))
        .collect()
    }

    #[tokio::test]
    async fn transaction_with_one_bad_hash_is_partially_applied() {
        let alice: OwnedUserId = "@alice_txn:test.example".try_into().unwrap();
        let origin: OwnedServerName = "test.example".try_into().unwrap();
        let room_id = public_room(&alice).await;
        let auth = current_auth_ids(&room_id, &alice);

        let (e1_id, e1) = craft_event(&alice, &room_id, "m.room.message", json!({"body": "one"}), auth.clone());
        let (_, mut e2) = craft_event(&alice, &room_id, "m.room.message", json!({"body": "two"}), auth.clone());
        let (e3_id, e3) = craft_event(&alice, &room_id, "m.room.message", json!({"body": "three"}), auth.clone());

        // Tamper with the second event after signing: its content hash no
        // longer matches.
        e2.insert(
            "content".into(),
            CanonicalJsonValue::Object(BTreeMap::from([(
                "body".to_owned(),
                CanonicalJsonValue::String("tampered".into()),
            )])),
        );
        let e2_id = crate::event::gen_event_id(&e2, &RoomVersionId::V10.rules()).unwrap();

        let pdus: Vec<serde_json::Value> = [&e1, &e2, &e3]
            .iter()
            .map(|object| CanonicalJsonValue::Object((*object).clone()).into())
            .collect();

        let results = process_pdus(&pdus, &origin).await.unwrap();
        assert!(results[&e1_id].is_ok());
        assert!(results[&e3_id].is_ok());
        assert!(results[&e2_id].is_err());

        assert!(data::event::is_accepted(&e1_id));
        assert!(data::event::is_accepted(&e3_id));
        assert!(!data::event::exists(&e2_id));

        // Replaying the same transaction yields the same verdicts and no
        // further effects.
        let replay = process_pdus(&pdus, &origin).await.unwrap();
        assert!(replay[&e1_id].is_ok());
        assert!(replay[&e2_id].is_err());
    }

    #[tokio::test]
    async fn revoked_sender_soft_fails_but_is_retained() {
        let alice: OwnedUserId = "@alice2:test.example".try_into().unwrap();
        let bob: OwnedUserId = "@bob2:test.example".try_into().unwrap();
        let origin: OwnedServerName = "test.example".try_into().unwrap();
        let room_id = public_room(&alice).await;

        {
            let guard = room::lock_state(&room_id).await;
            timeline::build_and_append_pdu(
                PduBuilder {
                    event_type: TimelineEventType::RoomMember,
                    content: json!({"membership": "join"}),
                    state_key: Some(bob.as_str().to_owned()),
                    ..Default::default()
                },
                &bob,
                &room_id,
                &guard,
            )
            .unwrap();
        }
        // Bob's auth events still name his join.
        let auth_with_join = current_auth_ids(&room_id, &bob);

        {
            let guard = room::lock_state(&room_id).await;
            timeline::build_and_append_pdu(
                PduBuilder {
                    event_type: TimelineEventType::RoomMember,
                    content: json!({"membership": "ban"}),
                    state_key: Some(bob.as_str().to_owned()),
                    ..Default::default()
                },
                &alice,
                &room_id,
                &guard,
            )
            .unwrap();
        }

        // A message citing the stale (pre-ban) auth state passes the
        // claimed-auth check but fails against the current state.
        let (event_id, object) = craft_event(
            &bob,
            &room_id,
            "m.room.message",
            json!({"body": "still here?"}),
            auth_with_join,
        );

        {
            let _guard = room::lock_state(&room_id).await;
            process_incoming_pdu(&origin, &event_id, &room_id, &RoomVersionId::V10, object, true)
                .await
                .unwrap();
        }

        assert!(data::event::is_soft_failed(&event_id));
        assert!(data::event::exists(&event_id));
        // Excluded from the room's stream (and therefore from sync).
        let streamed: Vec<_> = data::event::events_since(&room_id, 0, 100)
            .into_iter()
            .map(|(_, pdu)| pdu.event_id.clone())
            .collect();
        assert!(!streamed.contains(&event_id));
    }
}
