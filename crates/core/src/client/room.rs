//! `POST /_matrix/client/v3/createRoom`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identifiers::{OwnedRoomId, OwnedUserId};

/// How much of the usual private/public furniture createRoom sets up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPreset {
    PrivateChat,
    PublicChat,
    TrustedPrivateChat,
}

/// One entry of `initial_state`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitialStateEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub state_key: String,

    pub content: JsonValue,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateRoomReqBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<RoomPreset>,

    /// "public" rooms are published to the room directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,

    /// Extra keys merged into the `m.room.create` content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_content: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub initial_state: Vec<InitialStateEvent>,

    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub invite: Vec<OwnedUserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateRoomResBody {
    pub room_id: OwnedRoomId,
}
