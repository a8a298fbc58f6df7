//! The persisted event type and the builder for locally created events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::core::events::TimelineEventType;
use crate::core::identifiers::{EventId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use crate::core::serde::CanonicalJsonObject;
use crate::core::{RoomVersionRules, UnixMillis, signatures};
use crate::AppResult;

/// Content hashes of a PDU. Defaults to empty on draft events that have
/// not been hashed yet.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventHash {
    /// The SHA-256 hash, unpadded Base64.
    pub sha256: String,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct PduEvent {
    pub event_id: OwnedEventId,

    #[serde(rename = "type")]
    pub event_ty: TimelineEventType,

    pub room_id: OwnedRoomId,

    pub sender: OwnedUserId,

    pub origin_server_ts: UnixMillis,

    pub content: JsonValue,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    #[serde(default)]
    pub prev_events: Vec<OwnedEventId>,

    #[serde(default)]
    pub depth: u64,

    #[serde(default)]
    pub auth_events: Vec<OwnedEventId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unsigned: BTreeMap<String, JsonValue>,

    #[serde(default)]
    pub hashes: EventHash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<JsonValue>,
}

impl PduEvent {
    /// Parses a canonical event object, attaching the (derived) event id.
    pub fn from_canonical_object(
        event_id: &EventId,
        mut object: CanonicalJsonObject,
    ) -> Result<Self, serde_json::Error> {
        object.insert(
            "event_id".to_owned(),
            crate::core::serde::CanonicalJsonValue::String(event_id.as_str().to_owned()),
        );
        serde_json::from_value(
            crate::core::serde::CanonicalJsonValue::Object(object).into(),
        )
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The id of the event a redaction targets, wherever the room version
    /// keeps it.
    pub fn redaction_target(&self, rules: &RoomVersionRules) -> Option<OwnedEventId> {
        if self.event_ty != TimelineEventType::RoomRedaction {
            return None;
        }
        if rules.updated_redaction_rules {
            self.content
                .get("redacts")
                .and_then(JsonValue::as_str)
                .and_then(|s| s.try_into().ok())
        } else {
            self.redacts.clone()
        }
    }

    /// Applies redaction to this event: content collapses to the per-type
    /// whitelist and the cause is recorded in `unsigned`.
    pub fn redact(&mut self, rules: &RoomVersionRules, reason: &PduEvent) -> AppResult<()> {
        let object = crate::core::serde::to_canonical_object(&*self)?;
        let redacted = signatures::redact(&object, rules)?;

        let mut pruned: PduEvent = serde_json::from_value(
            crate::core::serde::CanonicalJsonValue::Object(redacted).into(),
        )?;
        pruned.unsigned = BTreeMap::from([(
            "redacted_because".to_owned(),
            reason.to_room_event(),
        )]);
        *self = pruned;
        Ok(())
    }

    /// The client-facing form, `event_id` included.
    pub fn to_room_event(&self) -> JsonValue {
        let mut event = json!({
            "event_id": self.event_id,
            "type": self.event_ty,
            "room_id": self.room_id,
            "sender": self.sender,
            "origin_server_ts": self.origin_server_ts,
            "content": self.content,
        });
        let object = event.as_object_mut().expect("built from a literal");
        if let Some(state_key) = &self.state_key {
            object.insert("state_key".to_owned(), json!(state_key));
        }
        if let Some(redacts) = &self.redacts {
            object.insert("redacts".to_owned(), json!(redacts));
        }
        if !self.unsigned.is_empty() {
            object.insert("unsigned".to_owned(), json!(self.unsigned));
        }
        event
    }

    /// The form used in sync timelines: no `room_id`.
    pub fn to_sync_room_event(&self) -> JsonValue {
        let mut event = self.to_room_event();
        event.as_object_mut().expect("object").remove("room_id");
        event
    }

    /// The form used in state sections.
    pub fn to_state_event(&self) -> JsonValue {
        self.to_room_event()
    }

    /// The minimal form shown to invited or knocking users.
    pub fn to_stripped_state_event(&self) -> JsonValue {
        json!({
            "type": self.event_ty,
            "state_key": self.state_key,
            "sender": self.sender,
            "content": self.content,
        })
    }

    pub fn get_content<T: serde::de::DeserializeOwned>(&self) -> AppResult<T> {
        Ok(serde_json::from_value(self.content.clone())?)
    }
}

impl crate::core::state::Event for PduEvent {
    fn event_id(&self) -> &EventId {
        &self.event_id
    }

    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn sender(&self) -> &UserId {
        &self.sender
    }

    fn event_type(&self) -> &TimelineEventType {
        &self.event_ty
    }

    fn content(&self) -> &JsonValue {
        &self.content
    }

    fn origin_server_ts(&self) -> UnixMillis {
        self.origin_server_ts
    }

    fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    fn prev_events(&self) -> &[OwnedEventId] {
        &self.prev_events
    }

    fn auth_events(&self) -> &[OwnedEventId] {
        &self.auth_events
    }

    fn redacts(&self) -> Option<&EventId> {
        self.redacts.as_deref()
    }
}

/// The transient shape of an event before it is hashed, signed and
/// persisted.
#[derive(Debug)]
pub struct PduBuilder {
    pub event_type: TimelineEventType,
    pub content: JsonValue,
    pub state_key: Option<String>,
    pub redacts: Option<OwnedEventId>,
    pub unsigned: Option<BTreeMap<String, JsonValue>>,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self {
            event_type: TimelineEventType::RoomMessage,
            content: JsonValue::Object(Default::default()),
            state_key: None,
            redacts: None,
            unsigned: None,
        }
    }
}
