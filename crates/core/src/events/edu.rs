//! Content types of ephemeral data units.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value as JsonValue;

use crate::UnixMillis;
use crate::identifiers::{
    OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId,
};

/// A typing notification for one user in one room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingContent {
    pub room_id: OwnedRoomId,
    pub user_id: OwnedUserId,
    pub typing: bool,
}

/// Read receipts, keyed by room.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptContent(pub BTreeMap<OwnedRoomId, ReceiptMap>);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReceiptMap {
    #[serde(rename = "m.read", default)]
    pub read: BTreeMap<OwnedUserId, ReceiptData>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiptData {
    pub data: Receipt,

    /// The extremity event ids the user has read up to.
    pub event_ids: Vec<OwnedEventId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<UnixMillis>,
}

/// Presence updates for users of the sending homeserver.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresenceContent {
    pub push: Vec<PresenceUpdate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: OwnedUserId,

    pub presence: PresenceState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,

    /// Milliseconds since this user was last active.
    #[serde(default)]
    pub last_active_ago: u64,

    #[serde(default)]
    pub currently_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Offline,
    Unavailable,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Notice that a user of the sending server changed their device list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceListUpdateContent {
    pub user_id: OwnedUserId,

    pub device_id: OwnedDeviceId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,

    /// Monotonic per-user counter; receivers detect gaps and resync.
    pub stream_id: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev_id: Vec<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,

    /// Opaque device key blob, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<JsonValue>,
}

impl DeviceListUpdateContent {
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId, stream_id: u64) -> Self {
        Self {
            user_id,
            device_id,
            device_display_name: None,
            stream_id,
            prev_id: Vec::new(),
            deleted: None,
            keys: None,
        }
    }
}

/// A batch of to-device messages for users of the receiving server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectDeviceContent {
    pub sender: OwnedUserId,

    #[serde(rename = "type")]
    pub ev_type: String,

    /// Delivery is exactly-once per (sender, message_id).
    pub message_id: OwnedTransactionId,

    pub messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, JsonValue>>,
}

/// Either one device or the `*` wildcard addressing all of a user's devices.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceIdOrAllDevices {
    DeviceId(OwnedDeviceId),
    AllDevices,
}

impl fmt::Display for DeviceIdOrAllDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceId(id) => f.write_str(id.as_str()),
            Self::AllDevices => f.write_str("*"),
        }
    }
}

impl Serialize for DeviceIdOrAllDevices {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::DeviceId(id) => serializer.serialize_str(id.as_str()),
            Self::AllDevices => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for DeviceIdOrAllDevices {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "*" {
            Ok(Self::AllDevices)
        } else {
            OwnedDeviceId::try_from(s)
                .map(Self::DeviceId)
                .map_err(de::Error::custom)
        }
    }
}

/// Notice that a user updated their cross-signing keys; the key blobs are
/// opaque to this server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningKeyUpdateContent {
    pub user_id: OwnedUserId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signing_key: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_target_wire_format() {
        assert_eq!(
            serde_json::to_string(&DeviceIdOrAllDevices::AllDevices).unwrap(),
            "\"*\""
        );
        let target: DeviceIdOrAllDevices = serde_json::from_str("\"DEVICE1\"").unwrap();
        assert_eq!(
            target,
            DeviceIdOrAllDevices::DeviceId("DEVICE1".try_into().unwrap())
        );
    }

    #[test]
    fn receipt_content_shape() {
        let json = r#"{"!room:s1":{"m.read":{"@u:s1":{"data":{"ts":1000},"event_ids":["$e"]}}}}"#;
        let content: ReceiptContent = serde_json::from_str(json).unwrap();
        let room: OwnedRoomId = "!room:s1".try_into().unwrap();
        let user: OwnedUserId = "@u:s1".try_into().unwrap();
        let data = &content.0[&room].read[&user];
        assert_eq!(data.data.ts, Some(UnixMillis(1000)));
        assert_eq!(data.event_ids.len(), 1);
    }
}
