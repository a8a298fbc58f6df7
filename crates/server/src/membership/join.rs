//! Joining rooms, locally and across federation.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::core::client::membership::JoinRoomResBody;
use crate::core::events::room::{MembershipState, RoomMemberEventContent};
use crate::core::events::{StateEventType, TimelineEventType};
use crate::core::federation::membership::{
    MakeMembershipArgs, MakeMembershipResBody, SendJoinResBody, SendMembershipArgs,
    SendMembershipReqBody, make_join_request, send_join_request,
};
use crate::core::identifiers::{OwnedEventId, OwnedServerName, OwnedUserId, RoomId, UserId};
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use crate::core::state::StateMap;
use crate::core::{MatrixError, UnixMillis};
use crate::event::{PduBuilder, PduEvent};
use crate::room::timeline;
use crate::{AppError, AppResult, config, data, room};

/// Joins `user_id` into the room, going over federation when we are not
/// resident.
pub async fn join_room(
    user_id: &UserId,
    room_id: &RoomId,
    reason: Option<String>,
    servers: &[OwnedServerName],
) -> AppResult<JoinRoomResBody> {
    if data::room::is_joined(user_id, room_id) {
        return Ok(JoinRoomResBody::new(room_id.to_owned()));
    }
    if data::room::is_banned(user_id, room_id) {
        return Err(MatrixError::forbidden("you are banned from this room").into());
    }

    let resident = data::room::exists(room_id)
        && data::room::is_server_joined(config::server_name(), room_id);

    if resident {
        info!(%room_id, %user_id, "joining locally");
        let guard = room::lock_state(room_id).await;
        let content = RoomMemberEventContent {
            reason,
            ..RoomMemberEventContent::new(MembershipState::Join)
        };
        timeline::build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomMember,
                content: serde_json::to_value(&content)?,
                state_key: Some(user_id.as_str().to_owned()),
                ..Default::default()
            },
            user_id,
            room_id,
            &guard,
        )?;
        return Ok(JoinRoomResBody::new(room_id.to_owned()));
    }

    info!(%room_id, %user_id, "joining over federation");
    join_remote_room(user_id, room_id, reason, servers).await?;
    Ok(JoinRoomResBody::new(room_id.to_owned()))
}

async fn join_remote_room(
    user_id: &UserId,
    room_id: &RoomId,
    reason: Option<String>,
    extra_servers: &[OwnedServerName],
) -> AppResult<()> {
    let servers = super::candidate_servers(room_id, extra_servers);
    if servers.is_empty() {
        return Err(MatrixError::not_found("no servers available to join through").into());
    }

    let (make_join, remote_server) = make_join_over(&servers, user_id, room_id).await?;

    let room_version = match make_join.room_version {
        Some(version) if config::supported_room_versions().contains(&version) => version,
        _ => return Err(MatrixError::unsupported_room_version("room version not supported").into()),
    };
    let rules = room_version.rules();

    let mut join_event_stub: CanonicalJsonObject =
        CanonicalJsonValue::try_from(make_join.event)
            .ok()
            .and_then(|value| match value {
                CanonicalJsonValue::Object(object) => Some(object),
                _ => None,
            })
            .ok_or_else(|| MatrixError::invalid_param("invalid make_join event"))?;

    // Complete the draft: our timestamp, our reason, then hash and sign.
    join_event_stub.insert(
        "origin_server_ts".to_owned(),
        CanonicalJsonValue::Integer(UnixMillis::now().get() as i64),
    );
    if let Some(reason) = reason {
        if let Some(CanonicalJsonValue::Object(content)) = join_event_stub.get_mut("content") {
            content.insert("reason".to_owned(), CanonicalJsonValue::String(reason));
        }
    }
    join_event_stub.remove("event_id");
    crate::server_key::hash_and_sign_event(&mut join_event_stub, &rules)?;
    let event_id = crate::event::gen_event_id(&join_event_stub, &rules)?;

    info!(%remote_server, %event_id, "submitting send_join");
    let base_url = crate::federation::resolver::origin(&remote_server).await?;
    let request = send_join_request(
        &base_url,
        SendMembershipArgs {
            room_id: room_id.to_owned(),
            event_id: event_id.clone(),
        },
        SendMembershipReqBody(CanonicalJsonValue::Object(join_event_stub.clone()).into()),
    )?;
    let response =
        crate::sending::send_federation_request(&remote_server, request.into_inner(), Some(60))
            .await?;
    let body: SendJoinResBody = response.json().await?;

    let mut join_event = join_event_stub;
    if let Some(signed_raw) = &body.event {
        // Restricted joins come back countersigned by the resident server.
        let (signed_id, signed_object) =
            crate::event::gen_event_id_canonical_json(signed_raw, &rules)?;
        if signed_id != event_id {
            return Err(MatrixError::invalid_param("peer returned a different join event").into());
        }
        if let Some(signatures) = signed_object.get("signatures") {
            join_event.insert("signatures".to_owned(), signatures.clone());
        }
    }

    data::room::ensure_room(room_id, &room_version)?;
    let _room_lock = room::lock_state(room_id).await;

    info!(
        state = body.state.len(),
        auth_chain = body.auth_chain.len(),
        "seeding room from send_join response"
    );
    crate::server_key::acquire_events_pubkeys(&body.auth_chain).await;
    crate::server_key::acquire_events_pubkeys(&body.state).await;

    for raw in &body.auth_chain {
        if let Err(e) = ingest_outlier(raw, &rules).await {
            debug!(error = %e, "dropping auth chain event");
        }
    }

    let mut state: StateMap<OwnedEventId> = StateMap::new();
    for raw in &body.state {
        match ingest_outlier(raw, &rules).await {
            Ok(pdu) => {
                if let Some(state_key) = &pdu.state_key {
                    state.insert(
                        (
                            StateEventType::from(pdu.event_ty.as_str()),
                            state_key.clone(),
                        ),
                        pdu.event_id.clone(),
                    );
                }
            }
            Err(e) => debug!(error = %e, "dropping state event"),
        }
    }

    let join_pdu = Arc::new(
        PduEvent::from_canonical_object(&event_id, join_event.clone())
            .map_err(|e| MatrixError::invalid_param(format!("bad join event: {e}")))?,
    );

    // Seed the room: state after the join = the served state plus the join
    // event itself.
    let sn = data::event::put(&join_pdu, join_event, false, false)?;
    state.insert(
        (StateEventType::RoomMember, user_id.as_str().to_owned()),
        event_id.clone(),
    );
    data::room::record_state_group(&event_id, Arc::new(state.clone()));
    data::room::set_current_state(room_id, state.clone(), sn);
    data::room::replace_extremities(room_id, &join_pdu.prev_events, &event_id);

    // Membership bookkeeping straight from the resolved state.
    for ((kind, state_key), member_event_id) in &state {
        if *kind != StateEventType::RoomMember {
            if *kind == StateEventType::RoomCreate {
                if let Some(create) = data::event::get(member_event_id) {
                    data::room::set_creator(room_id, create.sender.clone());
                }
            }
            continue;
        }
        let (Ok(member), Some(event)) = (
            OwnedUserId::try_from(state_key.as_str()),
            data::event::get(member_event_id),
        ) else {
            continue;
        };
        if let Ok(content) = event.get_content::<RoomMemberEventContent>() {
            data::room::update_membership(room_id, &member, content.membership, sn);
        }
    }

    crate::sync::notify();
    Ok(())
}

/// Runs `make_join` against the candidates until one cooperates.
async fn make_join_over(
    servers: &[OwnedServerName],
    user_id: &UserId,
    room_id: &RoomId,
) -> AppResult<(MakeMembershipResBody, OwnedServerName)> {
    let mut last_error: AppError =
        MatrixError::not_found("no server could assist in joining").into();

    for remote_server in servers {
        info!(%remote_server, "asking for make_join");
        let result: AppResult<MakeMembershipResBody> = async {
            let base_url = crate::federation::resolver::origin(remote_server).await?;
            let request = make_join_request(
                &base_url,
                MakeMembershipArgs {
                    room_id: room_id.to_owned(),
                    user_id: user_id.to_owned(),
                    ver: config::supported_room_versions(),
                },
            )?;
            let response =
                crate::sending::send_federation_request(remote_server, request.into_inner(), Some(60))
                    .await?;
            Ok(response.json().await?)
        }
        .await;

        match result {
            Ok(body) => return Ok((body, remote_server.clone())),
            Err(e) => {
                warn!(%remote_server, error = %e, "make_join failed");
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Verifies one event out of a send_join response and stores it as an
/// outlier.
async fn ingest_outlier(
    raw: &JsonValue,
    rules: &crate::core::RoomVersionRules,
) -> AppResult<Arc<PduEvent>> {
    let (event_id, object) = crate::event::gen_event_id_canonical_json(raw, rules)?;
    if let Some(existing) = data::event::get(&event_id) {
        return Ok(existing);
    }
    let verified = match crate::server_key::verify_event(&object, rules).await? {
        crate::core::signatures::Verified::All => object,
        crate::core::signatures::Verified::Signatures => {
            crate::core::signatures::redact(&object, rules)?
        }
    };
    let pdu = Arc::new(
        PduEvent::from_canonical_object(&event_id, verified.clone())
            .map_err(|e| MatrixError::invalid_param(format!("malformed event: {e}")))?,
    );
    data::event::put(&pdu, verified, true, false)?;
    Ok(pdu)
}

/// Serving side of `send_join`: accept the signed join and return the
/// state before it plus that state's auth chain.
pub async fn ingest_send_join(
    origin: &crate::core::identifiers::ServerName,
    room_id: &RoomId,
    event_id: &crate::core::identifiers::EventId,
    value: &JsonValue,
) -> AppResult<SendJoinResBody> {
    let room_version = data::room::room_version(room_id)?;
    let rules = room_version.rules();

    // Snapshot the state before the join while we still have it.
    let state_before: Vec<OwnedEventId> =
        data::room::current_state(room_id).into_values().collect();

    let pdu = super::ingest_membership_event(
        origin,
        room_id,
        event_id,
        value,
        MembershipState::Join,
    )
    .await?;

    let mut state_events = Vec::new();
    let mut served: HashSet<OwnedEventId> = HashSet::new();
    for id in &state_before {
        if served.insert(id.clone()) {
            if let Ok(json) = timeline::outgoing_federation_json(id) {
                state_events.push(json);
            }
        }
    }

    let auth_chain = data::event::auth_chain(&state_before)
        .into_iter()
        .filter_map(|auth_pdu| timeline::outgoing_federation_json(&auth_pdu.event_id).ok())
        .collect();

    Ok(SendJoinResBody {
        auth_chain,
        state: state_events,
        event: Some(timeline::outgoing_federation_json(&pdu.event_id)?),
    })
}
