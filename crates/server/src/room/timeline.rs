//! Building, authorizing and appending events to a room's timeline.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::RoomMutexGuard;
use crate::core::events::room::{MembershipState, RoomMemberEventContent};
use crate::core::events::{StateEventType, TimelineEventType};
use crate::core::identifiers::{EventId, OwnedEventId, RoomId, UserId};
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue, to_canonical_value};
use crate::core::state::event_auth;
use crate::core::{MatrixError, UnixMillis};
use crate::event::{PduBuilder, PduEvent};
use crate::{AppError, AppResult, config, data};

/// Creates a local event: fills in the DAG position, authorizes it against
/// the room's current state, hashes, signs, persists and queues it for
/// federation. The caller holds the room lock.
pub fn build_and_append_pdu(
    builder: PduBuilder,
    sender: &UserId,
    room_id: &RoomId,
    guard: &RoomMutexGuard,
) -> AppResult<Arc<PduEvent>> {
    let (pdu, object) = create_hash_and_sign(builder, sender, room_id, guard)?;
    let rules = data::room::room_version(room_id)?.rules();

    // Authorize against the current room state before anything persists.
    event_auth::auth_check(&rules, &pdu, |kind, state_key| {
        super::current_state_event(room_id, kind, state_key)
    })
    .map_err(|e| MatrixError::forbidden(format!("event not allowed: {e}")))?;

    append_pdu(&pdu, object, &rules)?;

    crate::sending::send_pdu_room(room_id, &pdu.event_id)?;
    Ok(pdu)
}

/// Builds, hashes and signs a local event without persisting it. Used
/// directly by handshakes that must ship the event elsewhere before it may
/// enter the room. The caller holds the room lock.
pub fn create_hash_and_sign(
    builder: PduBuilder,
    sender: &UserId,
    room_id: &RoomId,
    _guard: &RoomMutexGuard,
) -> AppResult<(Arc<PduEvent>, CanonicalJsonObject)> {
    let room_version = data::room::room_version(room_id)?;
    let rules = room_version.rules();

    let prev_events = data::room::forward_extremities(room_id);
    let depth = prev_events
        .iter()
        .filter_map(|id| data::event::get(id))
        .map(|pdu| pdu.depth)
        .max()
        .map(|max| max + 1)
        .unwrap_or(1);

    let auth_types = event_auth::auth_types_for_event(
        &builder.event_type,
        sender,
        builder.state_key.as_deref(),
        &builder.content,
    )?;
    let mut auth_events: Vec<OwnedEventId> = Vec::new();
    for (kind, state_key) in &auth_types {
        if let Some(id) = data::room::current_state_id(room_id, kind, state_key) {
            auth_events.push(id);
        }
    }

    let mut object = CanonicalJsonObject::new();
    object.insert("type".into(), to_canonical_value(&builder.event_type)?);
    object.insert("content".into(), builder.content.clone().try_into()?);
    object.insert("sender".into(), CanonicalJsonValue::String(sender.as_str().into()));
    object.insert(
        "room_id".into(),
        CanonicalJsonValue::String(room_id.as_str().into()),
    );
    if let Some(state_key) = &builder.state_key {
        object.insert("state_key".into(), CanonicalJsonValue::String(state_key.clone()));
    }
    if let Some(redacts) = &builder.redacts {
        object.insert(
            "redacts".into(),
            CanonicalJsonValue::String(redacts.as_str().into()),
        );
    }
    object.insert("prev_events".into(), to_canonical_value(&prev_events)?);
    object.insert("auth_events".into(), to_canonical_value(&auth_events)?);
    object.insert("depth".into(), CanonicalJsonValue::Integer(depth as i64));
    object.insert(
        "origin_server_ts".into(),
        CanonicalJsonValue::Integer(UnixMillis::now().get() as i64),
    );
    if let Some(unsigned) = &builder.unsigned {
        if !unsigned.is_empty() {
            object.insert("unsigned".into(), to_canonical_value(unsigned)?);
        }
    }

    crate::server_key::hash_and_sign_event(&mut object, &rules)?;
    let event_id = crate::event::gen_event_id(&object, &rules)?;
    let pdu = Arc::new(
        PduEvent::from_canonical_object(&event_id, object.clone())
            .map_err(|e| AppError::internal(format!("built an unparseable event: {e}")))?,
    );
    Ok((pdu, object))
}

/// Persists an accepted event and folds it into the room: extremities,
/// state group, current state, membership bookkeeping, redactions, and a
/// wake-up for sync.
pub fn append_pdu(
    pdu: &Arc<PduEvent>,
    json: CanonicalJsonObject,
    rules: &crate::core::RoomVersionRules,
) -> AppResult<()> {
    let sn = data::event::put(pdu, json, false, false)?;
    data::room::replace_extremities(&pdu.room_id, &pdu.prev_events, &pdu.event_id);
    super::state::record_state_after(pdu, rules)?;

    if pdu.is_state() {
        let new_state = super::state::resolve_current(&pdu.room_id, pdu, rules)?;
        data::room::set_current_state(&pdu.room_id, new_state, sn);
    }

    if pdu.event_ty == TimelineEventType::RoomMember {
        apply_membership(pdu, sn)?;
    }

    if pdu.event_ty == TimelineEventType::RoomCreate {
        data::room::set_creator(&pdu.room_id, pdu.sender.clone());
    }

    if let Some(target) = pdu.redaction_target(rules) {
        apply_redaction(&target, pdu, rules)?;
    }

    crate::sync::notify();
    Ok(())
}

fn apply_membership(pdu: &Arc<PduEvent>, sn: crate::core::Seqnum) -> AppResult<()> {
    let content: RoomMemberEventContent = pdu
        .get_content()
        .map_err(|_| MatrixError::invalid_param("bad membership content"))?;
    let Some(state_key) = &pdu.state_key else {
        return Ok(());
    };
    let target: crate::core::identifiers::OwnedUserId = state_key
        .as_str()
        .try_into()
        .map_err(|_| MatrixError::invalid_param("membership state key is not a user id"))?;

    data::room::update_membership(&pdu.room_id, &target, content.membership, sn);

    // Give invited and knocking users something to render.
    match content.membership {
        MembershipState::Invite => {
            data::room::set_invite_state(&pdu.room_id, &target, stripped_state(&pdu.room_id, pdu));
        }
        MembershipState::Knock => {
            data::room::set_knock_state(&pdu.room_id, &target, stripped_state(&pdu.room_id, pdu));
        }
        _ => {}
    }
    Ok(())
}

/// The stripped state handed to invited/knocking users: create, join
/// rules, name, topic plus the membership event itself.
pub fn stripped_state(room_id: &RoomId, membership_pdu: &PduEvent) -> Vec<JsonValue> {
    let mut events = Vec::new();
    for kind in [
        StateEventType::RoomCreate,
        StateEventType::RoomJoinRules,
        StateEventType::RoomName,
        StateEventType::RoomTopic,
    ] {
        if let Some(event) = super::current_state_event(room_id, &kind, "") {
            events.push(event.to_stripped_state_event());
        }
    }
    events.push(membership_pdu.to_stripped_state_event());
    events
}

/// Applies a redaction to its target: the original sender may redact their
/// own events, anyone else needs the room's redact power.
pub fn apply_redaction(
    target_id: &EventId,
    redaction: &PduEvent,
    rules: &crate::core::RoomVersionRules,
) -> AppResult<()> {
    let Some(target) = data::event::get(target_id) else {
        // The target may arrive later; the redaction stands on its own.
        return Ok(());
    };
    if target.room_id != redaction.room_id {
        return Err(MatrixError::invalid_param("redaction crosses rooms").into());
    }

    if target.sender != redaction.sender {
        let levels = super::current_state_event(
            &redaction.room_id,
            &StateEventType::RoomPowerLevels,
            "",
        )
        .and_then(|event| {
            serde_json::from_value::<
                crate::core::events::room::RoomPowerLevelsEventContent,
            >(event.content.clone())
            .ok()
        });
        let redact_level = levels.as_ref().map(|l| l.redact).unwrap_or(50);
        if super::user_power(&redaction.room_id, &redaction.sender) < redact_level {
            return Err(MatrixError::forbidden("not allowed to redact this event").into());
        }
    }

    let mut redacted = (*target).clone();
    redacted.redact(rules, redaction)?;
    let json = crate::core::serde::to_canonical_object(&redacted)
        .map_err(|e| AppError::internal(format!("redacted event not canonical: {e}")))?;
    data::event::replace(target_id, Arc::new(redacted), json);
    Ok(())
}

pub fn get_pdu(event_id: &EventId) -> AppResult<Arc<PduEvent>> {
    data::event::require(event_id)
}

pub fn has_pdu(event_id: &EventId) -> bool {
    data::event::exists(event_id)
}

/// The event as it travels over federation: the stored canonical json
/// without the derived id or local annotations.
pub fn outgoing_federation_json(event_id: &EventId) -> AppResult<JsonValue> {
    let mut json = data::event::get_json(event_id)
        .ok_or_else(|| AppError::from(MatrixError::not_found("Event not found.")))?;
    json.remove("event_id");
    if let Some(CanonicalJsonValue::Object(unsigned)) = json.get_mut("unsigned") {
        unsigned.remove("transaction_id");
    }
    Ok(CanonicalJsonValue::Object(json).into())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::RoomVersionId;
    use crate::core::events::room::{
        HistoryVisibility, JoinRule, RoomCreateEventContent, RoomHistoryVisibilityEventContent,
        RoomJoinRulesEventContent, RoomPowerLevelsEventContent,
    };
    use crate::core::identifiers::{OwnedRoomId, OwnedUserId};

    async fn create_test_room(alice: &UserId) -> OwnedRoomId {
        crate::config::init_test();
        let room_id = crate::core::identifiers::RoomId::new(config::server_name());
        let version = RoomVersionId::V10;
        data::room::create_room(&room_id, version, Some(alice.to_owned()), false);

        let guard = super::super::lock_state(&room_id).await;

        let create = RoomCreateEventContent::new(version, Some(alice.to_owned()));
        build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomCreate,
                content: serde_json::to_value(&create).unwrap(),
                state_key: Some(String::new()),
                ..Default::default()
            },
            alice,
            &room_id,
            &guard,
        )
        .unwrap();

        build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomMember,
                content: json!({"membership": "join"}),
                state_key: Some(alice.as_str().to_owned()),
                ..Default::default()
            },
            alice,
            &room_id,
            &guard,
        )
        .unwrap();

        build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomPowerLevels,
                content: serde_json::to_value(RoomPowerLevelsEventContent::initial(
                    alice.to_owned(),
                ))
                .unwrap(),
                state_key: Some(String::new()),
                ..Default::default()
            },
            alice,
            &room_id,
            &guard,
        )
        .unwrap();

        build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomJoinRules,
                content: serde_json::to_value(RoomJoinRulesEventContent::new(JoinRule::Invite))
                    .unwrap(),
                state_key: Some(String::new()),
                ..Default::default()
            },
            alice,
            &room_id,
            &guard,
        )
        .unwrap();

        build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomHistoryVisibility,
                content: serde_json::to_value(RoomHistoryVisibilityEventContent {
                    history_visibility: HistoryVisibility::Shared,
                })
                .unwrap(),
                state_key: Some(String::new()),
                ..Default::default()
            },
            alice,
            &room_id,
            &guard,
        )
        .unwrap();

        room_id
    }

    #[tokio::test]
    async fn create_room_materializes_five_state_keys() {
        let alice: OwnedUserId = "@alice_create:test.example".try_into().unwrap();
        let room_id = create_test_room(&alice).await;

        let state = data::room::current_state(&room_id);
        assert_eq!(state.len(), 5);
        for kind in [
            StateEventType::RoomCreate,
            StateEventType::RoomPowerLevels,
            StateEventType::RoomJoinRules,
            StateEventType::RoomHistoryVisibility,
        ] {
            assert!(state.contains_key(&(kind, String::new())));
        }
        assert!(state.contains_key(&(StateEventType::RoomMember, alice.as_str().to_owned())));

        assert!(data::room::is_joined(&alice, &room_id));
        assert_eq!(data::room::joined_rooms(&alice), vec![room_id.clone()]);

        // Depth increases monotonically along the linear chain.
        let events = data::event::events_since(&room_id, 0, 50);
        let depths: Vec<u64> = events.iter().map(|(_, p)| p.depth).collect();
        assert_eq!(depths, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn outsiders_cannot_send_into_the_room() {
        let alice: OwnedUserId = "@alice_outsider:test.example".try_into().unwrap();
        let room_id = create_test_room(&alice).await;
        let guard = super::super::lock_state(&room_id).await;

        let mallory: OwnedUserId = "@mallory:test.example".try_into().unwrap();
        let err = build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomMessage,
                content: json!({"body": "let me in"}),
                ..Default::default()
            },
            &mallory,
            &room_id,
            &guard,
        )
        .unwrap_err();
        let matrix = err.to_matrix();
        assert_eq!(matrix.kind, crate::core::ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn self_redaction_prunes_content() {
        let alice: OwnedUserId = "@alice_redact:test.example".try_into().unwrap();
        let room_id = create_test_room(&alice).await;
        let guard = super::super::lock_state(&room_id).await;

        let message = build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomMessage,
                content: json!({"body": "delete me"}),
                ..Default::default()
            },
            &alice,
            &room_id,
            &guard,
        )
        .unwrap();

        build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomRedaction,
                content: json!({"reason": "mistake"}),
                redacts: Some(message.event_id.clone()),
                ..Default::default()
            },
            &alice,
            &room_id,
            &guard,
        )
        .unwrap();

        let redacted = data::event::get(&message.event_id).unwrap();
        assert!(redacted.content.get("body").is_none());
        assert!(redacted.unsigned.contains_key("redacted_because"));
    }
}
