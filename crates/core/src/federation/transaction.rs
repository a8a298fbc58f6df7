//! Transactions: the envelope that pushes PDUs and EDUs between servers.
//!
//! `PUT /_matrix/federation/v1/send/{txn_id}`

use std::collections::BTreeMap;

use reqwest::Url;
use serde::{Deserialize, Serialize, de};
use serde_json::Value as JsonValue;

use crate::events::edu::{
    DeviceListUpdateContent, DirectDeviceContent, PresenceContent, ReceiptContent,
    SigningKeyUpdateContent, TypingContent,
};
use crate::identifiers::{OwnedEventId, OwnedServerName};
use crate::sending::{SendRequest, SendResult};
use crate::{EmptyObject, UnixMillis};

/// At most this many PDUs per transaction.
pub const PDU_LIMIT: usize = 50;

/// At most this many EDUs per transaction.
pub const EDU_LIMIT: usize = 100;

pub fn send_message_request(
    origin: &str,
    txn_id: &str,
    body: SendMessageReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/federation/v1/send/{txn_id}"))?;
    crate::sending::put(url).stuff(body)
}

/// Request type for the `send_transaction_message` endpoint.
#[derive(Deserialize, Serialize, Debug)]
pub struct SendMessageReqBody {
    /// The server_name of the homeserver sending this transaction.
    pub origin: OwnedServerName,

    /// POSIX timestamp in milliseconds on the originating homeserver when
    /// this transaction started.
    pub origin_server_ts: UnixMillis,

    /// List of persistent updates to rooms. No more than 50.
    #[serde(default)]
    pub pdus: Vec<JsonValue>,

    /// List of ephemeral messages. No more than 100.
    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub edus: Vec<Edu>,
}
crate::json_body_modifier!(SendMessageReqBody);

/// Response type for the `send_transaction_message` endpoint.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct SendMessageResBody {
    /// Per-PDU result for each PDU in the request: `{}` on success,
    /// `{"error": ...}` otherwise. One bad PDU never fails the batch.
    #[serde(default, with = "crate::serde::pdu_process_response")]
    pub pdus: BTreeMap<OwnedEventId, Result<(), String>>,
}
crate::json_body_modifier!(SendMessageResBody);

impl SendMessageResBody {
    pub fn new(pdus: BTreeMap<OwnedEventId, Result<(), String>>) -> Self {
        Self { pdus }
    }
}

/// Ephemeral data units riding along in a transaction.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "edu_type", content = "content")]
pub enum Edu {
    #[serde(rename = "m.presence")]
    Presence(PresenceContent),

    #[serde(rename = "m.receipt")]
    Receipt(ReceiptContent),

    #[serde(rename = "m.typing")]
    Typing(TypingContent),

    #[serde(rename = "m.device_list_update")]
    DeviceListUpdate(DeviceListUpdateContent),

    #[serde(rename = "m.direct_to_device")]
    DirectToDevice(DirectDeviceContent),

    #[serde(rename = "m.signing_key_update")]
    SigningKeyUpdate(SigningKeyUpdateContent),

    #[doc(hidden)]
    _Custom(JsonValue),
}

#[derive(Debug, Deserialize)]
struct EduDeHelper {
    edu_type: String,
    #[serde(default)]
    content: JsonValue,
}

impl<'de> Deserialize<'de> for Edu {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let EduDeHelper { edu_type, content } = EduDeHelper::deserialize(deserializer)?;
        let parsed = match edu_type.as_str() {
            "m.presence" => Self::Presence(parse(content)?),
            "m.receipt" => Self::Receipt(parse(content)?),
            "m.typing" => Self::Typing(parse(content)?),
            "m.device_list_update" => Self::DeviceListUpdate(parse(content)?),
            "m.direct_to_device" => Self::DirectToDevice(parse(content)?),
            "m.signing_key_update" => Self::SigningKeyUpdate(parse(content)?),
            _ => Self::_Custom(content),
        };
        Ok(parsed)
    }
}

fn parse<T: serde::de::DeserializeOwned, E: de::Error>(content: JsonValue) -> Result<T, E> {
    serde_json::from_value(content).map_err(de::Error::custom)
}

crate::json_body_modifier!(EmptyObject);

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn edu_round_trip() {
        let json = json!({
            "edu_type": "m.typing",
            "content": {"room_id": "!r:s1", "user_id": "@u:s1", "typing": true}
        });
        let edu: Edu = serde_json::from_value(json.clone()).unwrap();
        match &edu {
            Edu::Typing(content) => assert!(content.typing),
            other => panic!("wrong variant: {other:?}"),
        }
        assert_eq!(serde_json::to_value(&edu).unwrap(), json);
    }

    #[test]
    fn unknown_edu_is_tolerated() {
        let edu: Edu = serde_json::from_value(json!({
            "edu_type": "org.example.custom",
            "content": {"x": 1}
        }))
        .unwrap();
        assert!(matches!(edu, Edu::_Custom(_)));
    }

    #[test]
    fn transaction_body_shape() {
        let body: SendMessageReqBody = serde_json::from_value(json!({
            "origin": "s1",
            "origin_server_ts": 1000,
            "pdus": [{"type": "m.room.message"}]
        }))
        .unwrap();
        assert_eq!(body.pdus.len(), 1);
        assert!(body.edus.is_empty());
    }
}
