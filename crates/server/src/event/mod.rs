//! Event identity and ingestion.

pub mod handler;
mod pdu;

pub use pdu::{EventHash, PduBuilder, PduEvent};

use serde_json::Value as JsonValue;

use crate::core::identifiers::{OwnedEventId, OwnedRoomId};
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use crate::core::{MatrixError, RoomVersionId, RoomVersionRules, signatures};
use crate::{AppError, AppResult, data};

/// Derives the event id from a canonical event object per the room
/// version's reference-hash algorithm.
pub fn gen_event_id(
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> AppResult<OwnedEventId> {
    Ok(signatures::event_id(object, rules)?)
}

/// Converts a raw incoming event to canonical form and derives its id.
pub fn gen_event_id_canonical_json(
    value: &JsonValue,
    rules: &RoomVersionRules,
) -> AppResult<(OwnedEventId, CanonicalJsonObject)> {
    let canonical = CanonicalJsonValue::try_from(value.clone())
        .map_err(|e| MatrixError::bad_json(format!("event is not canonical JSON: {e}")))?;
    let mut object = match canonical {
        CanonicalJsonValue::Object(object) => object,
        _ => return Err(MatrixError::bad_json("event is not a JSON object").into()),
    };

    // The id is derived, never transmitted.
    object.remove("event_id");
    let event_id = gen_event_id(&object, rules)?;
    Ok((event_id, object))
}

/// Parses one PDU out of a transaction: extracts its room, resolves the
/// room's version and derives the event id.
pub fn parse_incoming_pdu(
    raw: &JsonValue,
) -> AppResult<(OwnedEventId, CanonicalJsonObject, OwnedRoomId, RoomVersionId)> {
    let room_id: OwnedRoomId = raw
        .get("room_id")
        .and_then(JsonValue::as_str)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("PDU has no valid room_id"))?;

    let room_version = data::room::room_version(&room_id).map_err(|_| {
        AppError::from(MatrixError::not_found(format!(
            "server is not participating in {room_id}"
        )))
    })?;

    let (event_id, object) = gen_event_id_canonical_json(raw, &room_version.rules())?;
    Ok((event_id, object, room_id, room_version))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::RoomVersionId;

    #[test]
    fn transmitted_event_ids_are_ignored() {
        let rules = RoomVersionId::V10.rules();
        let event = json!({
            "type": "m.room.message",
            "room_id": "!r:test.example",
            "sender": "@a:test.example",
            "origin_server_ts": 1,
            "content": {"body": "hi"},
            "prev_events": [],
            "auth_events": [],
            "depth": 1
        });

        let (honest_id, _) = gen_event_id_canonical_json(&event, &rules).unwrap();

        let mut with_fake_id = event.clone();
        with_fake_id["event_id"] = json!("$forged");
        let (derived_id, object) = gen_event_id_canonical_json(&with_fake_id, &rules).unwrap();
        assert_eq!(derived_id, honest_id);
        assert!(!object.contains_key("event_id"));
    }
}
