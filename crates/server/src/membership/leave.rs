//! Leaving rooms, locally and across federation.

use crate::core::events::TimelineEventType;
use crate::core::events::room::{MembershipState, RoomMemberEventContent};
use crate::core::federation::membership::{
    MakeMembershipArgs, MakeMembershipResBody, SendMembershipArgs, SendMembershipReqBody,
    make_leave_request, send_leave_request,
};
use crate::core::identifiers::{OwnedServerName, RoomId, UserId};
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use crate::core::{MatrixError, UnixMillis};
use crate::event::PduBuilder;
use crate::room::timeline;
use crate::{AppResult, config, data, room};

/// Leaves the room: through our own copy when we are resident, otherwise
/// via the `make_leave`/`send_leave` handshake. Pending invites and knocks
/// are retracted the same way.
pub async fn leave_room(
    user_id: &UserId,
    room_id: &RoomId,
    reason: Option<String>,
) -> AppResult<()> {
    let resident = data::room::exists(room_id)
        && data::room::is_server_joined(config::server_name(), room_id);

    if resident {
        let guard = room::lock_state(room_id).await;
        let content = RoomMemberEventContent {
            reason,
            ..RoomMemberEventContent::new(MembershipState::Leave)
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

    match remote_leave(user_id, room_id).await {
        Ok(()) => {}
        Err(e) => {
            // The invite or knock is retracted locally even when no remote
            // will take the leave event.
            warn!(%room_id, error = %e, "remote leave failed, clearing local membership");
        }
    }

    data::room::update_membership(room_id, user_id, MembershipState::Leave, data::next_sn());
    crate::sync::notify();
    Ok(())
}

async fn remote_leave(user_id: &UserId, room_id: &RoomId) -> AppResult<()> {
    let servers = super::candidate_servers(room_id, &[]);
    let mut last_error: crate::AppError =
        MatrixError::not_found("no servers available to leave through").into();

    for remote_server in &servers {
        match try_leave_via(remote_server, user_id, room_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(%remote_server, error = %e, "make_leave/send_leave failed");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

async fn try_leave_via(
    remote_server: &OwnedServerName,
    user_id: &UserId,
    room_id: &RoomId,
) -> AppResult<()> {
    let base_url = crate::federation::resolver::origin(remote_server).await?;
    let request = make_leave_request(
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
        .ok_or_else(|| MatrixError::invalid_param("make_leave reply lacks a room version"))?;
    if !config::supported_room_versions().contains(&room_version) {
        return Err(MatrixError::unsupported_room_version("room version not supported").into());
    }
    let rules = room_version.rules();

    let mut leave_event_stub: CanonicalJsonObject = CanonicalJsonValue::try_from(body.event)
        .ok()
        .and_then(|value| match value {
            CanonicalJsonValue::Object(object) => Some(object),
            _ => None,
        })
        .ok_or_else(|| MatrixError::invalid_param("invalid make_leave event"))?;

    leave_event_stub.insert(
        "origin_server_ts".to_owned(),
        CanonicalJsonValue::Integer(UnixMillis::now().get() as i64),
    );
    leave_event_stub.remove("event_id");
    crate::server_key::hash_and_sign_event(&mut leave_event_stub, &rules)?;
    let event_id = crate::event::gen_event_id(&leave_event_stub, &rules)?;

    let request = send_leave_request(
        &base_url,
        SendMembershipArgs {
            room_id: room_id.to_owned(),
            event_id,
        },
        SendMembershipReqBody(CanonicalJsonValue::Object(leave_event_stub).into()),
    )?;
    crate::sending::send_federation_request(remote_server, request.into_inner(), Some(60))
        .await?;
    Ok(())
}
