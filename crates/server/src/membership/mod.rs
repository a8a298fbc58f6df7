//! Membership orchestration: invites, and the serving side of the
//! make_*/send_* handshakes used by remote servers.

pub mod join;
pub mod knock;
pub mod leave;

pub use join::join_room;
pub use knock::knock_room;
pub use leave::leave_room;

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::core::events::TimelineEventType;
use crate::core::events::room::{
    JoinRule, MembershipState, RoomMemberEventContent,
};
use crate::core::federation::membership::{
    InviteUserReqBody, SendMembershipArgs, invite_user_request,
};
use crate::core::identifiers::{
    EventId, OwnedEventId, OwnedServerName, OwnedUserId, RoomId, ServerName, UserId,
};
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue, to_canonical_value};
use crate::core::state::event_auth;
use crate::core::{MatrixError, RoomVersionId, UnixMillis};
use crate::event::{PduBuilder, PduEvent};
use crate::room::timeline;
use crate::{AppError, AppResult, config, data, room};

/// Invites a user. A local invitee gets the membership event directly; a
/// remote one first countersigns it through `PUT /invite`, and only the
/// doubly-signed event enters the room.
pub async fn invite_user(
    sender: &UserId,
    room_id: &RoomId,
    invitee: &UserId,
    reason: Option<String>,
) -> AppResult<()> {
    let guard = room::lock_state(room_id).await;

    let content = RoomMemberEventContent {
        reason,
        ..RoomMemberEventContent::new(MembershipState::Invite)
    };
    let builder = PduBuilder {
        event_type: TimelineEventType::RoomMember,
        content: serde_json::to_value(&content)?,
        state_key: Some(invitee.as_str().to_owned()),
        ..Default::default()
    };

    if invitee.server_name() == config::server_name() {
        timeline::build_and_append_pdu(builder, sender, room_id, &guard)?;
        return Ok(());
    }

    // Build and sign the invite, but let the invitee's server add its
    // signature before the event becomes part of the room.
    let (pdu, object) = timeline::create_hash_and_sign(builder, sender, room_id, &guard)?;
    let rules = data::room::room_version(room_id)?.rules();
    event_auth::auth_check(&rules, &pdu, |kind, state_key| {
        room::current_state_event(room_id, kind, state_key)
    })
    .map_err(|e| MatrixError::forbidden(format!("invite not allowed: {e}")))?;

    let room_version = data::room::room_version(room_id)?;
    let invite_room_state = timeline::stripped_state(room_id, &pdu);

    let destination = invitee.server_name();
    let base_url = crate::federation::resolver::origin(destination).await?;
    let request = invite_user_request(
        &base_url,
        SendMembershipArgs {
            room_id: room_id.to_owned(),
            event_id: pdu.event_id.clone(),
        },
        InviteUserReqBody {
            event: federation_format(&object),
            room_version,
            invite_room_state,
        },
    )?;
    let response =
        crate::sending::send_federation_request(destination, request.into_inner(), Some(60))
            .await?;
    let body: crate::core::federation::membership::InviteUserResBody = response.json().await?;

    // Adopt the countersigned event, verifying it is still the same one.
    let (signed_id, signed_object) =
        crate::event::gen_event_id_canonical_json(&body.event, &rules)?;
    if signed_id != pdu.event_id {
        return Err(MatrixError::invalid_param("peer returned a different invite event").into());
    }
    let signed_pdu = Arc::new(
        PduEvent::from_canonical_object(&signed_id, signed_object.clone())
            .map_err(|e| MatrixError::invalid_param(format!("bad countersigned invite: {e}")))?,
    );

    timeline::append_pdu(&signed_pdu, signed_object, &rules)?;
    crate::sending::send_pdu_room(room_id, &signed_pdu.event_id)?;
    Ok(())
}

/// Serves the invite exchange for a local invitee: verify, countersign,
/// record the pending invite, and hand the event back.
pub async fn ingest_invite(
    origin: &ServerName,
    room_id: &RoomId,
    event_id: &EventId,
    room_version: &RoomVersionId,
    event: &JsonValue,
    invite_room_state: Vec<JsonValue>,
) -> AppResult<JsonValue> {
    if !config::supported_room_versions().contains(room_version) {
        return Err(MatrixError::unsupported_room_version("unsupported room version").into());
    }
    let rules = room_version.rules();

    let (derived_id, mut object) = crate::event::gen_event_id_canonical_json(event, &rules)?;
    if derived_id != *event_id {
        return Err(MatrixError::invalid_param("event id does not match the event").into());
    }

    let pdu: PduEvent = PduEvent::from_canonical_object(&derived_id, object.clone())
        .map_err(|e| MatrixError::invalid_param(format!("malformed invite: {e}")))?;
    if pdu.sender.server_name() != origin {
        return Err(MatrixError::forbidden("invite sender does not belong to the origin").into());
    }
    let invitee: OwnedUserId = pdu
        .state_key
        .as_deref()
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invite has no valid state key"))?;
    if invitee.server_name() != config::server_name() {
        return Err(MatrixError::forbidden("invited user is not ours").into());
    }
    crate::server_key::verify_event(&object, &rules).await?;

    crate::server_key::sign_json(&mut object)?;

    data::room::ensure_room(room_id, room_version)?;
    let sn = data::next_sn();
    data::room::update_membership(room_id, &invitee, MembershipState::Invite, sn);
    let mut stripped = invite_room_state;
    stripped.push(pdu.to_stripped_state_event());
    data::room::set_invite_state(room_id, &invitee, stripped);
    crate::sync::notify();

    Ok(CanonicalJsonValue::Object(object).into())
}

/// Serves `make_join` / `make_leave` / `make_knock`: a draft membership
/// event positioned at the room's current frontier, unsigned and unhashed.
pub async fn make_membership_event(
    room_id: &RoomId,
    user_id: &UserId,
    membership: MembershipState,
    ver: &[RoomVersionId],
) -> AppResult<(RoomVersionId, JsonValue)> {
    if !data::room::exists(room_id) {
        return Err(MatrixError::not_found("unknown room").into());
    }
    let room_version = data::room::room_version(room_id)?;
    if matches!(membership, MembershipState::Join | MembershipState::Knock)
        && !ver.contains(&room_version)
    {
        return Err(MatrixError::incompatible_room_version(
            room_version,
            "room version not supported by the requesting server",
        )
        .into());
    }
    let rules = room_version.rules();

    let guard = room::lock_state(room_id).await;

    let mut content = RoomMemberEventContent::new(membership);
    if membership == MembershipState::Join {
        content.join_authorized_via_users_server =
            restricted_join_authoriser(room_id, user_id, &rules)?;
    }

    let prev_events = data::room::forward_extremities(room_id);
    let depth = prev_events
        .iter()
        .filter_map(|id| data::event::get(id))
        .map(|pdu| pdu.depth)
        .max()
        .map(|max| max + 1)
        .unwrap_or(1);
    let auth_types = event_auth::auth_types_for_event(
        &TimelineEventType::RoomMember,
        user_id,
        Some(user_id.as_str()),
        &serde_json::to_value(&content)?,
    )?;
    let mut auth_events: Vec<OwnedEventId> = Vec::new();
    for (kind, state_key) in &auth_types {
        if let Some(id) = data::room::current_state_id(room_id, kind, state_key) {
            auth_events.push(id);
        }
    }

    let mut object = CanonicalJsonObject::new();
    object.insert(
        "type".into(),
        CanonicalJsonValue::String("m.room.member".into()),
    );
    object.insert("content".into(), to_canonical_value(&content)?);
    object.insert(
        "sender".into(),
        CanonicalJsonValue::String(user_id.as_str().into()),
    );
    object.insert(
        "state_key".into(),
        CanonicalJsonValue::String(user_id.as_str().into()),
    );
    object.insert(
        "room_id".into(),
        CanonicalJsonValue::String(room_id.as_str().into()),
    );
    object.insert("prev_events".into(), to_canonical_value(&prev_events)?);
    object.insert("auth_events".into(), to_canonical_value(&auth_events)?);
    object.insert("depth".into(), CanonicalJsonValue::Integer(depth as i64));
    object.insert(
        "origin_server_ts".into(),
        CanonicalJsonValue::Integer(UnixMillis::now().get() as i64),
    );

    // Refuse to hand out a draft that could never pass authorization.
    let draft = PduEvent::from_canonical_object(
        &crate::event::gen_event_id(&object, &rules)?,
        object.clone(),
    )
    .map_err(|e| AppError::internal(format!("built an unparseable draft: {e}")))?;
    event_auth::auth_check(&rules, &draft, |kind, state_key| {
        room::current_state_event(room_id, kind, state_key).map(|event| (*event).clone())
    })
    .map_err(|e| MatrixError::forbidden(format!("membership not allowed: {e}")))?;

    drop(guard);
    Ok((room_version, CanonicalJsonValue::Object(object).into()))
}

/// For restricted rooms: the local joined user with invite power who
/// vouches for the join, when one is needed.
fn restricted_join_authoriser(
    room_id: &RoomId,
    joining_user: &UserId,
    rules: &crate::core::RoomVersionRules,
) -> AppResult<Option<OwnedUserId>> {
    if !rules.restricted_join_rule {
        return Ok(None);
    }
    let join_rule = room::get_join_rule(room_id);
    let restricted = matches!(
        join_rule,
        JoinRule::Restricted { .. } | JoinRule::KnockRestricted { .. }
    );
    if !restricted
        || data::room::is_joined(joining_user, room_id)
        || data::room::is_invited(joining_user, room_id)
    {
        return Ok(None);
    }

    // The joiner must be in one of the allow-listed rooms as far as we can
    // tell, and some local user must hold invite power.
    let qualifies = join_rule
        .restriction_rooms()
        .iter()
        .any(|allowed| data::room::is_joined(joining_user, allowed));
    if !qualifies {
        return Err(MatrixError::unable_to_authorize_join(
            "joining user is not known to be in any required room",
        )
        .into());
    }

    let invite_level = room::current_state_event(
        room_id,
        &crate::core::events::StateEventType::RoomPowerLevels,
        "",
    )
    .and_then(|event| {
        serde_json::from_value::<crate::core::events::room::RoomPowerLevelsEventContent>(
            event.content.clone(),
        )
        .ok()
    })
    .map(|levels| levels.invite)
    .unwrap_or(0);

    data::room::joined_users(room_id)
        .into_iter()
        .find(|user| {
            user.server_name() == config::server_name()
                && room::user_power(room_id, user) >= invite_level
        })
        .map(Some)
        .ok_or_else(|| {
            AppError::from(MatrixError::unable_to_grant_join(
                "no local user may authorise this join",
            ))
        })
}

/// Serves `send_join` / `send_leave` / `send_knock`: verify and accept the
/// signed membership event, then distribute it to the other resident
/// servers.
pub async fn ingest_membership_event(
    origin: &ServerName,
    room_id: &RoomId,
    event_id: &EventId,
    value: &JsonValue,
    expected: MembershipState,
) -> AppResult<Arc<PduEvent>> {
    let room_version = data::room::room_version(room_id)?;
    let rules = room_version.rules();

    let (derived_id, object) = crate::event::gen_event_id_canonical_json(value, &rules)?;
    if derived_id != *event_id {
        return Err(MatrixError::invalid_param("event id does not match the event").into());
    }

    let pdu = PduEvent::from_canonical_object(&derived_id, object.clone())
        .map_err(|e| MatrixError::invalid_param(format!("malformed event: {e}")))?;
    let content: RoomMemberEventContent = pdu
        .get_content()
        .map_err(|_| MatrixError::invalid_param("bad membership content"))?;
    if content.membership != expected {
        return Err(MatrixError::invalid_param(format!(
            "expected a {expected} event"
        ))
        .into());
    }
    if pdu.sender.server_name() != origin
        || pdu.state_key.as_deref() != Some(pdu.sender.as_str())
    {
        return Err(
            MatrixError::forbidden("membership event does not belong to the origin").into(),
        );
    }

    {
        let _room_lock = room::lock_state(room_id).await;
        crate::event::handler::process_incoming_pdu(
            origin,
            &derived_id,
            room_id,
            &room_version,
            object,
            true,
        )
        .await?;
    }

    if data::event::is_soft_failed(&derived_id) {
        return Err(MatrixError::forbidden("membership event failed authorization").into());
    }

    // The resident server distributes the handshake result.
    let others = data::room::joined_servers(room_id)
        .into_iter()
        .filter(|server| **server != *origin);
    crate::sending::send_pdu_servers(others, &derived_id)?;

    data::event::require(&derived_id)
}

/// The federation wire form of a just-built event.
pub(crate) fn federation_format(object: &CanonicalJsonObject) -> JsonValue {
    let mut object = object.clone();
    object.remove("event_id");
    CanonicalJsonValue::Object(object).into()
}

/// The candidate servers to run a remote membership handshake against.
pub(crate) fn candidate_servers(
    room_id: &RoomId,
    extra: &[OwnedServerName],
) -> Vec<OwnedServerName> {
    let mut servers: Vec<OwnedServerName> = Vec::new();
    if let Ok(server) = room_id.server_name() {
        servers.push(server.to_owned());
    }
    for server in extra {
        if !servers.contains(server) {
            servers.push(server.clone());
        }
    }
    for server in data::room::joined_servers(room_id) {
        if *server != *config::server_name() && !servers.contains(&server) {
            servers.push(server);
        }
    }
    servers.retain(|server| **server != *config::server_name());
    servers
}
