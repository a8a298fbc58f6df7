//! Event retrieval between servers: gap filling, state queries, backfill
//! and auth chains.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::UnixMillis;
use crate::identifiers::{EventId, OwnedEventId, OwnedServerName, RoomId};
use crate::sending::{SendRequest, SendResult};

fn default_missing_limit() -> usize {
    10
}

/// Request type for `POST /_matrix/federation/v1/get_missing_events/{roomId}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MissingEventsReqBody {
    /// The events the caller already has; walking stops here.
    pub earliest_events: Vec<OwnedEventId>,

    /// The events whose ancestry has the gap.
    pub latest_events: Vec<OwnedEventId>,

    #[serde(default = "default_missing_limit")]
    pub limit: usize,

    #[serde(default)]
    pub min_depth: u64,
}
crate::json_body_modifier!(MissingEventsReqBody);

/// Response type: the missing events, in DAG order between the two sets.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MissingEventsResBody {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}
crate::json_body_modifier!(MissingEventsResBody);

pub fn missing_events_request(
    origin: &str,
    room_id: &RoomId,
    body: MissingEventsReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/get_missing_events/{room_id}"
    ))?;
    crate::sending::post(url).stuff(body)
}

/// Response type for `GET /_matrix/federation/v1/state/{roomId}?event_id=...`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomStateResBody {
    #[serde(default)]
    pub auth_chain: Vec<JsonValue>,

    #[serde(default)]
    pub pdus: Vec<JsonValue>,
}
crate::json_body_modifier!(RoomStateResBody);

pub fn room_state_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
) -> SendResult<SendRequest> {
    let mut url = Url::parse(&format!("{origin}/_matrix/federation/v1/state/{room_id}"))?;
    url.query_pairs_mut().append_pair("event_id", event_id.as_str());
    Ok(crate::sending::get(url))
}

/// Response type for `GET /_matrix/federation/v1/state_ids/{roomId}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomStateIdsResBody {
    #[serde(default)]
    pub auth_chain_ids: Vec<OwnedEventId>,

    #[serde(default)]
    pub pdu_ids: Vec<OwnedEventId>,
}
crate::json_body_modifier!(RoomStateIdsResBody);

pub fn room_state_ids_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
) -> SendResult<SendRequest> {
    let mut url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/state_ids/{room_id}"
    ))?;
    url.query_pairs_mut().append_pair("event_id", event_id.as_str());
    Ok(crate::sending::get(url))
}

/// `GET /_matrix/federation/v1/backfill/{roomId}?v=...&limit=...`
pub fn backfill_request(
    origin: &str,
    room_id: &RoomId,
    from: &[OwnedEventId],
    limit: usize,
) -> SendResult<SendRequest> {
    let mut url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/backfill/{room_id}"
    ))?;
    {
        let mut query = url.query_pairs_mut();
        for event_id in from {
            query.append_pair("v", event_id.as_str());
        }
        query.append_pair("limit", &limit.to_string());
    }
    Ok(crate::sending::get(url))
}

/// Response type for backfill: ancestors of the requested frontier,
/// wrapped in a transaction-shaped envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackfillResBody {
    pub origin: OwnedServerName,
    pub origin_server_ts: UnixMillis,
    #[serde(default)]
    pub pdus: Vec<JsonValue>,
}
crate::json_body_modifier!(BackfillResBody);

/// Response type for `GET /_matrix/federation/v1/event_auth/{roomId}/{eventId}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventAuthResBody {
    /// The full auth chain of the event, serving soft-failed ancestors too.
    #[serde(default)]
    pub auth_chain: Vec<JsonValue>,
}
crate::json_body_modifier!(EventAuthResBody);

pub fn event_auth_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/event_auth/{room_id}/{event_id}"
    ))?;
    Ok(crate::sending::get(url))
}

/// Response type for `GET /_matrix/federation/v1/event/{eventId}`: a
/// single-PDU transaction envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventResBody {
    pub origin: OwnedServerName,
    pub origin_server_ts: UnixMillis,
    pub pdus: Vec<JsonValue>,
}
crate::json_body_modifier!(EventResBody);

pub fn event_request(origin: &str, event_id: &EventId) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/federation/v1/event/{event_id}"))?;
    Ok(crate::sending::get(url))
}
