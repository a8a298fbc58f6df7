//! `/_matrix/key/v2`: our signed keys, and batched queries for cached
//! peers' keys.

use salvo::prelude::*;

use crate::core::federation::discovery::{
    KeyQueryReqBody, KeyQueryResBody, ServerSigningKeys,
};
use crate::{AppResult, JsonResult, config, data, json_ok};

pub fn router() -> Router {
    Router::with_path("key/v2")
        .push(
            Router::with_path("server")
                .get(server_keys)
                .push(Router::with_path("{key_id}").get(server_keys)),
        )
        .push(Router::with_path("query").post(query_keys))
}

/// `GET /_matrix/key/v2/server`
///
/// The key id path segment is deprecated and ignored; the response always
/// carries every current key, signed by us.
#[handler]
async fn server_keys() -> JsonResult<ServerSigningKeys> {
    json_ok(crate::server_key::own_server_keys()?)
}

/// `POST /_matrix/key/v2/query`
///
/// Serves signed key objects from the local cache (plus our own), acting
/// as a passive notary.
#[handler]
async fn query_keys(req: &mut Request) -> JsonResult<KeyQueryResBody> {
    let body: KeyQueryReqBody = req.parse_json().await?;
    let mut result_keys = Vec::new();

    for server in body.server_keys.keys() {
        if **server == *config::server_name() {
            let own = crate::server_key::own_server_keys()?;
            result_keys.push(serde_json::to_value(own)?);
        } else if let Some(cached) = signed_cache_entry(server)? {
            result_keys.push(cached);
        }
    }

    json_ok(KeyQueryResBody {
        server_keys: result_keys,
    })
}

fn signed_cache_entry(
    server: &crate::core::identifiers::ServerName,
) -> AppResult<Option<serde_json::Value>> {
    let Some(keys) = data::server_key::signing_keys_for(server) else {
        return Ok(None);
    };
    // Notary responses carry our signature over the origin's object.
    let mut object = crate::core::serde::to_canonical_object(&keys)?;
    crate::server_key::sign_json(&mut object)?;
    Ok(Some(
        crate::core::serde::CanonicalJsonValue::Object(object).into(),
    ))
}
