//! The two-step membership handshakes: make_/send_ join, leave and knock,
//! and the invite exchange.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::RoomVersionId;
use crate::identifiers::{OwnedEventId, OwnedRoomId, OwnedUserId};
use crate::sending::{SendRequest, SendResult};

#[derive(Clone, Debug)]
pub struct MakeMembershipArgs {
    pub room_id: OwnedRoomId,
    pub user_id: OwnedUserId,
    /// The room versions the requesting server can handle.
    pub ver: Vec<RoomVersionId>,
}

fn ver_query(ver: &[RoomVersionId]) -> String {
    ver.iter()
        .map(|v| format!("ver={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// `GET /_matrix/federation/v1/make_join/{roomId}/{userId}?ver=...`
pub fn make_join_request(origin: &str, args: MakeMembershipArgs) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/make_join/{}/{}?{}",
        args.room_id,
        args.user_id,
        ver_query(&args.ver)
    ))?;
    Ok(crate::sending::get(url))
}

/// The unsigned draft event a resident server hands back from `make_join`,
/// `make_leave` or `make_knock`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MakeMembershipResBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<RoomVersionId>,

    /// The draft event: `prev_events`, `auth_events` and `depth` filled in,
    /// unhashed and unsigned.
    pub event: JsonValue,
}
crate::json_body_modifier!(MakeMembershipResBody);

#[derive(Clone, Debug)]
pub struct SendMembershipArgs {
    pub room_id: OwnedRoomId,
    pub event_id: OwnedEventId,
}

/// The completed, signed membership event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendMembershipReqBody(pub JsonValue);
crate::json_body_modifier!(SendMembershipReqBody);

/// `PUT /_matrix/federation/v2/send_join/{roomId}/{eventId}`
pub fn send_join_request(
    origin: &str,
    args: SendMembershipArgs,
    body: SendMembershipReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v2/send_join/{}/{}",
        args.room_id, args.event_id
    ))?;
    crate::sending::put(url).stuff(body)
}

/// Response type for `send_join` (v2): the accepted event plus the room
/// state and auth chain the joining server seeds itself from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SendJoinResBody {
    #[serde(default)]
    pub auth_chain: Vec<JsonValue>,

    #[serde(default)]
    pub state: Vec<JsonValue>,

    /// The join event as accepted, carrying the resident server's
    /// signature; present for restricted joins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<JsonValue>,
}
crate::json_body_modifier!(SendJoinResBody);

/// `GET /_matrix/federation/v1/make_leave/{roomId}/{userId}`
pub fn make_leave_request(origin: &str, args: MakeMembershipArgs) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/make_leave/{}/{}",
        args.room_id, args.user_id
    ))?;
    Ok(crate::sending::get(url))
}

/// `PUT /_matrix/federation/v2/send_leave/{roomId}/{eventId}`
pub fn send_leave_request(
    origin: &str,
    args: SendMembershipArgs,
    body: SendMembershipReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v2/send_leave/{}/{}",
        args.room_id, args.event_id
    ))?;
    crate::sending::put(url).stuff(body)
}

/// `GET /_matrix/federation/v1/make_knock/{roomId}/{userId}?ver=...`
pub fn make_knock_request(origin: &str, args: MakeMembershipArgs) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/make_knock/{}/{}?{}",
        args.room_id,
        args.user_id,
        ver_query(&args.ver)
    ))?;
    Ok(crate::sending::get(url))
}

/// `PUT /_matrix/federation/v1/send_knock/{roomId}/{eventId}`
pub fn send_knock_request(
    origin: &str,
    args: SendMembershipArgs,
    body: SendMembershipReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/send_knock/{}/{}",
        args.room_id, args.event_id
    ))?;
    crate::sending::put(url).stuff(body)
}

/// Response type for `send_knock`: stripped state so the knocking user can
/// render what they knocked on.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SendKnockResBody {
    #[serde(default)]
    pub knock_room_state: Vec<JsonValue>,
}
crate::json_body_modifier!(SendKnockResBody);

/// Request type for `PUT /_matrix/federation/v2/invite/{roomId}/{eventId}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviteUserReqBody {
    /// The invite event, signed by the inviting server.
    pub event: JsonValue,

    pub room_version: RoomVersionId,

    /// Stripped state events giving the invited user context.
    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub invite_room_state: Vec<JsonValue>,
}
crate::json_body_modifier!(InviteUserReqBody);

/// Response type for the invite exchange: the same event, now carrying the
/// invited server's signature too.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviteUserResBody {
    pub event: JsonValue,
}
crate::json_body_modifier!(InviteUserResBody);

/// `PUT /_matrix/federation/v2/invite/{roomId}/{eventId}`
pub fn invite_user_request(
    origin: &str,
    args: SendMembershipArgs,
    body: InviteUserReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v2/invite/{}/{}",
        args.room_id, args.event_id
    ))?;
    crate::sending::put(url).stuff(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_join_url_carries_versions() {
        let request = make_join_request(
            "https://s2.example:8448",
            MakeMembershipArgs {
                room_id: "!r:s2.example".try_into().unwrap(),
                user_id: "@alice:s1.example".try_into().unwrap(),
                ver: vec![RoomVersionId::V10, RoomVersionId::V11],
            },
        )
        .unwrap();
        let url = request.url().to_string();
        assert!(url.contains("/make_join/!r:s2.example/@alice:s1.example"));
        assert!(url.contains("ver=10&ver=11"));
    }
}
