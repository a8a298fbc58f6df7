//! Knocking: asking a room for an invite.

use crate::core::events::TimelineEventType;
use crate::core::events::room::{MembershipState, RoomMemberEventContent};
use crate::core::federation::membership::{
    MakeMembershipArgs, MakeMembershipResBody, SendKnockResBody, SendMembershipArgs,
    SendMembershipReqBody, make_knock_request, send_knock_request,
};
use crate::core::identifiers::{OwnedServerName, RoomId, UserId};
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use crate::core::{MatrixError, UnixMillis};
use crate::event::PduBuilder;
use crate::room::timeline;
use crate::{AppResult, config, data, room};

/// Knocks on a room. Resident rooms take the knock directly; otherwise
/// the `make_knock`/`send_knock` handshake runs against the room's
/// servers.
pub async fn knock_room(
    user_id: &UserId,
    room_id: &RoomId,
    reason: Option<String>,
    servers: &[OwnedServerName],
) -> AppResult<()> {
    if data::room::is_joined(user_id, room_id) {
        return Err(MatrixError::forbidden("you are already in this room").into());
    }

    let resident = data::room::exists(room_id)
        && data::room::is_server_joined(config::server_name(), room_id);

    if resident {
        let guard = room::lock_state(room_id).await;
        let content = RoomMemberEventContent {
            reason,
            ..RoomMemberEventContent::new(MembershipState::Knock)
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
        return Ok(());
    }

    remote_knock(user_id, room_id, servers).await
}

async fn remote_knock(
    user_id: &UserId,
    room_id: &RoomId,
    extra_servers: &[OwnedServerName],
) -> AppResult<()> {
    let servers = super::candidate_servers(room_id, extra_servers);
    let mut last_error: crate::AppError =
        MatrixError::not_found("no servers available to knock through").into();

    for remote_server in &servers {
        match try_knock_via(remote_server, user_id, room_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(%remote_server, error = %e, "make_knock/send_knock failed");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

async fn try_knock_via(
    remote_server: &OwnedServerName,
    user_id: &UserId,
    room_id: &RoomId,
) -> AppResult<()> {
    let base_url = crate::federation::resolver::origin(remote_server).await?;
    let request = make_knock_request(
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
    let body: MakeMembershipResBody = response.json().await?;

    let room_version = body
        .room_version
        .ok_or_else(|| MatrixError::invalid_param("make_knock reply lacks a room version"))?;
    let rules = room_version.rules();
    if !rules.knock_join_rule {
        return Err(MatrixError::forbidden("this room version does not support knocking").into());
    }

    let mut knock_event_stub: CanonicalJsonObject = CanonicalJsonValue::try_from(body.event)
        .ok()
        .and_then(|value| match value {
            CanonicalJsonValue::Object(object) => Some(object),
            _ => None,
        })
        .ok_or_else(|| MatrixError::invalid_param("invalid make_knock event"))?;

    knock_event_stub.insert(
        "origin_server_ts".to_owned(),
        CanonicalJsonValue::Integer(UnixMillis::now().get() as i64),
    );
    knock_event_stub.remove("event_id");
    crate::server_key::hash_and_sign_event(&mut knock_event_stub, &rules)?;
    let event_id = crate::event::gen_event_id(&knock_event_stub, &rules)?;

    let request = send_knock_request(
        &base_url,
        SendMembershipArgs {
            room_id: room_id.to_owned(),
            event_id,
        },
        SendMembershipReqBody(CanonicalJsonValue::Object(knock_event_stub).into()),
    )?;
    let response =
        crate::sending::send_federation_request(remote_server, request.into_inner(), Some(60))
            .await?;
    let body: SendKnockResBody = response.json().await?;

    data::room::ensure_room(room_id, &room_version)?;
    data::room::update_membership(room_id, user_id, MembershipState::Knock, data::next_sn());
    data::room::set_knock_state(room_id, user_id, body.knock_room_state);
    crate::sync::notify();
    Ok(())
}
