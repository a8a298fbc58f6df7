//! The two authentication schemes: bearer access tokens on the client API
//! and X-Matrix request signatures on federation.

use salvo::http::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use salvo::prelude::*;

use crate::core::federation::XMatrix;
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use crate::core::signatures::{self, PublicKeyMap, PublicKeySet};
use crate::{AppResult, AuthedServer, AuthedUser, MatrixError, config, data};

#[handler]
pub async fn auth_by_access_token(req: &mut Request, depot: &mut Depot) -> AppResult<()> {
    let token = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .map(|Authorization(bearer)| bearer.token().to_owned())
        .or_else(|| req.query::<String>("access_token"));

    let Some(token) = token else {
        return Err(MatrixError::missing_token("Missing access token.").into());
    };

    match data::user::resolve_access_token(&token) {
        Some((user_id, device_id)) => {
            depot.inject(AuthedUser { user_id, device_id });
            Ok(())
        }
        None => Err(MatrixError::unknown_token(true, "Unknown access token.").into()),
    }
}

#[handler]
pub async fn auth_by_signatures(req: &mut Request, depot: &mut Depot) -> AppResult<()> {
    let Some(Authorization(x_matrix)) = req.headers().typed_get::<Authorization<XMatrix>>()
    else {
        warn!("missing or invalid Authorization header on a federation request");
        return Err(
            MatrixError::unauthorized("Missing or invalid X-Matrix authorization.").into(),
        );
    };

    // The destination in the header must be us.
    if let Some(destination) = &x_matrix.destination {
        if **destination != *config::server_name() {
            return Err(MatrixError::unauthorized("X-Matrix destination mismatch.").into());
        }
    }
    if !config::server_is_allowed(&x_matrix.origin) {
        return Err(MatrixError::forbidden("Federation with this server is not allowed.").into());
    }

    let mut request_map = CanonicalJsonObject::new();
    request_map.insert(
        "method".to_owned(),
        CanonicalJsonValue::String(req.method().to_string()),
    );
    request_map.insert(
        "uri".to_owned(),
        CanonicalJsonValue::String(format!(
            "{}{}",
            req.uri().path(),
            req.uri()
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default()
        )),
    );
    request_map.insert(
        "origin".to_owned(),
        CanonicalJsonValue::String(x_matrix.origin.as_str().to_owned()),
    );
    request_map.insert(
        "destination".to_owned(),
        CanonicalJsonValue::String(config::server_name().as_str().to_owned()),
    );
    if let Ok(payload) = req.payload().await {
        if !payload.is_empty() {
            let content: CanonicalJsonValue = serde_json::from_slice(payload)
                .map_err(|_| MatrixError::not_json("request body is not JSON"))?;
            request_map.insert("content".to_owned(), content);
        }
    }

    let mut signatures_entry = CanonicalJsonObject::new();
    signatures_entry.insert(
        x_matrix.key.as_str().to_owned(),
        CanonicalJsonValue::String(x_matrix.sig.clone()),
    );
    let mut signatures_map = CanonicalJsonObject::new();
    signatures_map.insert(
        x_matrix.origin.as_str().to_owned(),
        CanonicalJsonValue::Object(signatures_entry),
    );
    request_map.insert(
        "signatures".to_owned(),
        CanonicalJsonValue::Object(signatures_map),
    );

    let (verify_key, expired) =
        crate::server_key::get_verify_key(&x_matrix.origin, &x_matrix.key)
            .await
            .map_err(|e| {
                warn!(origin = %x_matrix.origin, error = %e, "failed to resolve signing key");
                MatrixError::unauthorized("Failed to resolve the origin's signing key.")
            })?;
    // Requests are always "now": an expired key never authenticates one.
    if expired.is_some() {
        return Err(MatrixError::unauthorized("Request signed with an expired key.").into());
    }

    let mut key_map = PublicKeyMap::new();
    key_map.insert(
        x_matrix.origin.as_str().to_owned(),
        PublicKeySet::from([(x_matrix.key.as_str().to_owned(), verify_key.key)]),
    );

    signatures::verify_json(&key_map, &request_map).map_err(|e| {
        warn!(origin = %x_matrix.origin, error = %e, "X-Matrix signature verification failed");
        MatrixError::unauthorized("Failed to verify the X-Matrix signature.")
    })?;

    depot.inject(AuthedServer {
        origin: x_matrix.origin.clone(),
    });
    Ok(())
}
