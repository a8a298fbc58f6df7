//! Outbound federation requests: discovery, signing and execution.

pub mod resolver;

use std::sync::OnceLock;
use std::time::Duration;

use salvo::http::header::{AUTHORIZATION, HOST};
use salvo::http::headers::authorization::Credentials;

use crate::core::federation::XMatrix;
use crate::core::identifiers::ServerName;
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use crate::{AppError, AppResult, MatrixError, config};

/// The shared HTTP client for all federation traffic.
pub fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client builds")
    })
}

/// Signs and executes a federation request.
///
/// The signature covers the canonical JSON of
/// `{method, uri, origin, destination, content?}`; it travels in an
/// `X-Matrix` Authorization header. Non-200 responses become
/// `MatrixError`s carrying the peer's errcode.
pub async fn send_request(
    destination: &ServerName,
    mut request: reqwest::Request,
) -> AppResult<reqwest::Response> {
    if !config::get().federation.enable {
        return Err(AppError::public("federation is disabled"));
    }
    if destination == config::server_name() {
        return Err(AppError::public("refusing to send a federation request to ourselves"));
    }
    if !config::server_is_allowed(destination) {
        return Err(AppError::public(format!("{destination} is not an allowed peer")));
    }

    let mut request_map = CanonicalJsonObject::new();
    if let Some(body) = request.body() {
        let bytes = body.as_bytes().unwrap_or_default();
        let content: CanonicalJsonValue = serde_json::from_slice(bytes)
            .map_err(|e| AppError::internal(format!("unsignable request body: {e}")))?;
        request_map.insert("content".to_owned(), content);
    }
    request_map.insert(
        "method".to_owned(),
        CanonicalJsonValue::String(request.method().to_string()),
    );
    request_map.insert(
        "uri".to_owned(),
        CanonicalJsonValue::String(format!(
            "{}{}",
            request.url().path(),
            request
                .url()
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default()
        )),
    );
    request_map.insert(
        "origin".to_owned(),
        CanonicalJsonValue::String(config::server_name().as_str().to_owned()),
    );
    request_map.insert(
        "destination".to_owned(),
        CanonicalJsonValue::String(destination.as_str().to_owned()),
    );

    crate::server_key::sign_json(&mut request_map)?;

    let signatures = request_map
        .get("signatures")
        .and_then(CanonicalJsonValue::as_object)
        .and_then(|all| all.get(config::server_name().as_str()))
        .and_then(CanonicalJsonValue::as_object)
        .cloned()
        .unwrap_or_default();

    for (key_id, signature) in signatures {
        let Some(signature) = signature.as_str() else { continue };
        let Ok(key_id) = key_id.as_str().try_into() else { continue };
        let header = XMatrix {
            origin: config::server_name().to_owned(),
            destination: Some(destination.to_owned()),
            key: key_id,
            sig: signature.to_owned(),
        };
        request.headers_mut().insert(AUTHORIZATION, header.encode());
    }

    // The Host header names the destination even when SRV pointed the
    // connection elsewhere.
    let resolved = resolver::resolve(destination).await?;
    if let Ok(host) = resolved.host_header.parse() {
        request.headers_mut().insert(HOST, host);
    }

    let url = request.url().clone();
    debug!(%destination, %url, "sending federation request");
    let response = client().execute(request).await;

    match response {
        Ok(response) => {
            let status = response.status();
            if status == reqwest::StatusCode::OK {
                Ok(response)
            } else {
                let body = response.text().await.unwrap_or_default();
                warn!(%destination, %url, %status, "federation request rejected");
                Err(MatrixError::from_response_body(
                    salvo::http::StatusCode::from_u16(status.as_u16())
                        .unwrap_or(salvo::http::StatusCode::BAD_GATEWAY),
                    &body,
                )
                .into())
            }
        }
        Err(e) => {
            warn!(%destination, %url, error = %e, "federation request failed");
            Err(e.into())
        }
    }
}

/// Fetches a single event from a peer, for auth-chain gap filling.
pub async fn fetch_event(
    destination: &ServerName,
    event_id: &crate::core::identifiers::EventId,
) -> AppResult<serde_json::Value> {
    let base_url = resolver::origin(destination).await?;
    let request = crate::core::federation::event::event_request(&base_url, event_id)?;
    let response = send_request(destination, request.into_inner()).await?;
    let body: crate::core::federation::event::EventResBody = response.json().await?;
    body.pdus
        .into_iter()
        .next()
        .ok_or_else(|| AppError::from(MatrixError::not_found("peer does not have the event")))
}
