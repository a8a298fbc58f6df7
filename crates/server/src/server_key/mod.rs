//! Signing-key lifecycle: our own Ed25519 key pair, the signed key object
//! we publish, and acquisition and caching of remote servers' keys.

use crate::core::UnixMillis;
use crate::core::federation::discovery::{ServerSigningKeys, VerifyKey};
use crate::core::identifiers::{OwnedServerName, ServerName, ServerSigningKeyId};
use crate::core::serde::CanonicalJsonObject;
use crate::core::signatures::{self, PublicKeyMap, PublicKeySet, Verified};
use crate::core::{MatrixError, RoomVersionRules};
use crate::{AppError, AppResult, config, data};

/// Loads the signing key from disk, generating and persisting one on first
/// boot. The file holds `ed25519 <version> <unpadded-base64-secret>`.
pub fn init() -> AppResult<()> {
    let path = &config::get().federation.signing_key_path;

    let keypair = match std::fs::read_to_string(path) {
        Ok(content) => {
            let mut parts = content.split_whitespace();
            let (algorithm, version, secret) = (
                parts.next().unwrap_or_default(),
                parts.next().unwrap_or_default(),
                parts.next().unwrap_or_default(),
            );
            if algorithm != "ed25519" || version.is_empty() {
                return Err(AppError::public(format!("malformed signing key file {path}")));
            }
            let secret = crate::core::serde::base64_decode(secret)
                .map_err(|e| AppError::public(format!("bad signing key material: {e}")))?;
            signatures::Ed25519KeyPair::from_secret_bytes(&secret, version)
                .map_err(|e| AppError::public(format!("bad signing key material: {e}")))?
        }
        Err(_) => {
            let version = crate::core::serde::random_string(8).to_lowercase();
            let keypair = signatures::Ed25519KeyPair::generate(version);
            let serialized = format!(
                "ed25519 {} {}",
                keypair.version(),
                crate::core::serde::base64_encode(keypair.secret_bytes())
            );
            std::fs::write(path, serialized)?;
            info!(version = keypair.version(), "generated a new signing key");
            keypair
        }
    };

    config::set_keypair(keypair);
    Ok(())
}

/// The signed key object we serve at `/_matrix/key/v2/server`.
pub fn own_server_keys() -> AppResult<ServerSigningKeys> {
    let keypair = config::keypair();
    let valid_until_ts =
        UnixMillis::now().saturating_add(config::get().federation.key_validity_ms);

    let mut keys = ServerSigningKeys::new(config::server_name().to_owned(), valid_until_ts);
    keys.verify_keys.insert(
        keypair.key_id(),
        VerifyKey::new(keypair.public_key_base64()),
    );

    let mut object = crate::core::serde::to_canonical_object(&keys)?;
    sign_json(&mut object)?;
    Ok(crate::core::serde::from_canonical_object(object)?)
}

/// Signs an arbitrary JSON object as this server.
pub fn sign_json(object: &mut CanonicalJsonObject) -> AppResult<()> {
    signatures::sign_json(config::server_name().as_str(), config::keypair(), object)
        .map_err(Into::into)
}

/// Content-hashes and signs an event we are about to persist.
pub fn hash_and_sign_event(
    object: &mut CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> AppResult<()> {
    signatures::hash_and_sign_event(
        config::server_name().as_str(),
        config::keypair(),
        object,
        rules,
    )
    .map_err(Into::into)
}

/// Resolves one verify key: our own, the local cache, then a fetch from
/// the origin's `/key/v2/server`.
pub async fn get_verify_key(
    origin: &ServerName,
    key_id: &ServerSigningKeyId,
) -> AppResult<(VerifyKey, Option<UnixMillis>)> {
    if origin == config::server_name() {
        let keypair = config::keypair();
        if keypair.key_id().as_str() == key_id.as_str() {
            return Ok((VerifyKey::new(keypair.public_key_base64()), None));
        }
        return Err(MatrixError::not_found("unknown local key id").into());
    }

    if let Some(found) = data::server_key::verify_key(origin, key_id) {
        if !data::server_key::refresh_due(origin) {
            return Ok(found);
        }
    }

    if let Err(e) = fetch_remote_keys(origin).await {
        warn!(%origin, error = %e, "failed to fetch signing keys");
    }

    data::server_key::verify_key(origin, key_id).ok_or_else(|| {
        MatrixError::unauthorized(format!("no usable key {key_id} for {origin}")).into()
    })
}

/// Fetches and verifies `/_matrix/key/v2/server` from the origin. The
/// response must be signed by the origin itself.
pub async fn fetch_remote_keys(origin: &ServerName) -> AppResult<()> {
    let base_url = crate::federation::resolver::origin(origin).await?;
    let request = crate::core::federation::discovery::server_keys_request(&base_url)?;

    let response: serde_json::Value = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        request.load(crate::federation::client()),
    )
    .await
    .map_err(|_| AppError::public("timed out fetching server keys"))??;

    let object = crate::core::serde::to_canonical_object(&response)?;
    let keys: ServerSigningKeys =
        serde_json::from_value(response).map_err(|e| {
            AppError::public(format!("malformed key response from {origin}: {e}"))
        })?;

    if keys.server_name != *origin {
        return Err(MatrixError::unauthorized("key response is for another server").into());
    }

    // Self-signature check before anything enters the cache.
    let mut key_map = PublicKeyMap::new();
    let key_set: PublicKeySet = keys
        .verify_keys
        .iter()
        .map(|(id, key)| (id.as_str().to_owned(), key.key.clone()))
        .collect();
    key_map.insert(origin.as_str().to_owned(), key_set);
    signatures::verify_json(&key_map, &object)
        .map_err(|e| MatrixError::unauthorized(format!("key response not self-signed: {e}")))?;

    data::server_key::add_signing_keys(keys);
    Ok(())
}

/// Acquires the keys needed to verify `object` and runs event
/// verification. A signature from a key that expired before the event was
/// created fails.
pub async fn verify_event(
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> AppResult<Verified> {
    let required = signatures::required_keys(object)?;
    let event_ts = object
        .get("origin_server_ts")
        .and_then(crate::core::serde::CanonicalJsonValue::as_integer)
        .map(|ts| UnixMillis(ts.max(0) as u64))
        .unwrap_or_else(UnixMillis::now);

    let mut key_map = PublicKeyMap::new();
    for (server, key_ids) in &required {
        let mut key_set = PublicKeySet::new();
        for key_id in key_ids {
            match get_verify_key(server, key_id).await {
                Ok((key, expired_ts)) => {
                    if let Some(expired_ts) = expired_ts {
                        if event_ts > expired_ts {
                            return Err(MatrixError::unauthorized(format!(
                                "signature of {server} uses a key that expired at {expired_ts}"
                            ))
                            .into());
                        }
                    }
                    key_set.insert(key_id.as_str().to_owned(), key.key);
                }
                Err(e) => {
                    debug!(%server, %key_id, error = %e, "could not resolve verify key");
                }
            }
        }
        key_map.insert(server.as_str().to_owned(), key_set);
    }

    signatures::verify_event(&key_map, object, rules)
        .map_err(|e| MatrixError::unauthorized(format!("event verification failed: {e}")).into())
}

/// Batch-acquires keys for a set of raw events before bulk verification;
/// fetches each origin at most once.
pub async fn acquire_events_pubkeys(events: &[serde_json::Value]) {
    let mut origins: Vec<OwnedServerName> = Vec::new();
    for event in events {
        let Ok(object) = crate::core::serde::to_canonical_object(event) else {
            continue;
        };
        let Ok(required) = signatures::required_keys(&object) else {
            continue;
        };
        for server in required.keys() {
            if **server != *config::server_name() && !origins.contains(server) {
                origins.push(server.clone());
            }
        }
    }

    for origin in origins {
        if data::server_key::refresh_due(&origin) {
            if let Err(e) = fetch_remote_keys(&origin).await {
                debug!(%origin, error = %e, "bulk key fetch failed");
            }
        }
    }
}
