//! Published server signing keys and the key-query endpoints.

use std::collections::BTreeMap;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::UnixMillis;
use crate::identifiers::{OwnedServerName, OwnedServerSigningKeyId};
use crate::sending::{SendRequest, SendResult};

/// A currently valid public verify key, as unpadded Base64.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyKey {
    pub key: String,
}

impl VerifyKey {
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

/// A rotated-out verify key, kept so historic signatures stay verifiable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OldVerifyKey {
    pub expired_ts: UnixMillis,
    pub key: String,
}

impl OldVerifyKey {
    pub fn new(expired_ts: UnixMillis, key: String) -> Self {
        Self { expired_ts, key }
    }
}

/// The signed object a server publishes at `/_matrix/key/v2/server`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSigningKeys {
    pub server_name: OwnedServerName,

    #[serde(default)]
    pub verify_keys: BTreeMap<OwnedServerSigningKeyId, VerifyKey>,

    #[serde(default)]
    pub old_verify_keys: BTreeMap<OwnedServerSigningKeyId, OldVerifyKey>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<OwnedServerName, BTreeMap<OwnedServerSigningKeyId, String>>,

    /// The moment until which these keys may be trusted. Consumers cap
    /// their caching at seven days regardless.
    pub valid_until_ts: UnixMillis,
}

impl ServerSigningKeys {
    pub fn new(server_name: OwnedServerName, valid_until_ts: UnixMillis) -> Self {
        Self {
            server_name,
            verify_keys: BTreeMap::new(),
            old_verify_keys: BTreeMap::new(),
            signatures: BTreeMap::new(),
            valid_until_ts,
        }
    }
}
crate::json_body_modifier!(ServerSigningKeys);

pub fn server_keys_request(origin: &str) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/key/v2/server"))?;
    Ok(crate::sending::get(url))
}

/// Constraints on a single queried key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_valid_until_ts: Option<UnixMillis>,
}

/// Request type for `POST /_matrix/key/v2/query`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyQueryReqBody {
    pub server_keys:
        BTreeMap<OwnedServerName, BTreeMap<OwnedServerSigningKeyId, QueryCriteria>>,
}
crate::json_body_modifier!(KeyQueryReqBody);

/// Response type for `POST /_matrix/key/v2/query`: the queried servers'
/// signed key objects, passed through verbatim so signatures stay intact.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyQueryResBody {
    #[serde(default)]
    pub server_keys: Vec<JsonValue>,
}
crate::json_body_modifier!(KeyQueryResBody);

pub fn key_query_request(origin: &str, body: KeyQueryReqBody) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/key/v2/query"))?;
    crate::sending::post(url).stuff(body)
}
