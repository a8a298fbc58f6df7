//! Hashing and digital signatures over events and arbitrary JSON.
//!
//! Every homeserver holds one or more Ed25519 signing key pairs and uses
//! them to sign all events and federation requests it originates. Both
//! signatures and content hashes are stored inside the JSON object itself,
//! under `signatures` and `hashes`, as unpadded Base64.
//!
//! Event signing is more involved than plain JSON signing because events can
//! be redacted: the signature covers the redacted form so that it stays
//! valid after redaction, while the content hash covers the full event so
//! tampering is still detectable. Event identity for the supported room
//! versions derives from the reference hash of the redacted event.

mod error;
mod keys;

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

pub use self::error::{Error, VerificationError};
pub use self::keys::{Ed25519KeyPair, PublicKeyMap, PublicKeySet};
use crate::RoomVersionRules;
use crate::events::TimelineEventType;
use crate::identifiers::{OwnedEventId, OwnedServerName, OwnedServerSigningKeyId};
use crate::serde::{
    CanonicalJsonObject, CanonicalJsonValue, base64_encode, base64_encode_url_safe,
    canonical_json_bytes,
};

/// The fields stripped before signing any object.
const UNSIGNED_FIELDS: &[&str] = &["signatures", "unsigned"];

/// The result of verifying a signed event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verified {
    /// Signature and content hash both check out.
    All,

    /// The signature is valid but the content hash is not; the event must
    /// only be used in its redacted form.
    Signatures,
}

fn split_id(id: &str) -> Result<(&str, &str), Error> {
    let mut parts = id.splitn(2, ':');
    let algorithm = parts.next().unwrap_or_default();
    let version = parts.next().ok_or_else(|| Error::InvalidKeyId(id.to_owned()))?;
    if algorithm != "ed25519" {
        return Err(Error::UnsupportedAlgorithm(algorithm.to_owned()));
    }
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(Error::InvalidKeyId(id.to_owned()));
    }
    Ok((algorithm, version))
}

/// The canonical bytes of `object` with `signatures` and `unsigned`
/// removed: the input to both signing and signature verification.
fn signable_bytes(object: &CanonicalJsonObject) -> Vec<u8> {
    let mut copy = object.clone();
    for field in UNSIGNED_FIELDS {
        copy.remove(*field);
    }
    canonical_json_bytes(&copy)
}

/// Signs `object` with `key_pair` and stores the signature under
/// `signatures[entity][ed25519:<version>]`.
///
/// Existing signatures from other entities and keys are preserved.
pub fn sign_json(
    entity: &str,
    key_pair: &Ed25519KeyPair,
    object: &mut CanonicalJsonObject,
) -> Result<(), Error> {
    let signature = key_pair.sign(&signable_bytes(object));

    let signatures = object
        .entry("signatures".to_owned())
        .or_insert_with(|| CanonicalJsonValue::Object(BTreeMap::new()));
    let signatures = signatures
        .as_object_mut()
        .ok_or_else(|| Error::malformed("`signatures` is not an object"))?;
    let entity_signatures = signatures
        .entry(entity.to_owned())
        .or_insert_with(|| CanonicalJsonValue::Object(BTreeMap::new()));
    let entity_signatures = entity_signatures
        .as_object_mut()
        .ok_or_else(|| Error::malformed("`signatures` entry is not an object"))?;

    entity_signatures.insert(
        format!("ed25519:{}", key_pair.version()),
        CanonicalJsonValue::String(base64_encode(signature)),
    );
    Ok(())
}

/// Verifies that `object` carries, for every entity in `public_key_map`, at
/// least one valid signature under a known key.
pub fn verify_json(
    public_key_map: &PublicKeyMap,
    object: &CanonicalJsonObject,
) -> Result<(), Error> {
    let signatures = object
        .get("signatures")
        .and_then(CanonicalJsonValue::as_object);

    let bytes = signable_bytes(object);

    for (entity, key_set) in public_key_map {
        let entity_signatures = signatures
            .and_then(|s| s.get(entity))
            .and_then(CanonicalJsonValue::as_object)
            .ok_or_else(|| VerificationError::SignatureNotFound(entity.clone()))?;

        let mut verified = false;
        let mut checked_any = false;
        for (key_id, signature) in entity_signatures {
            if split_id(key_id).is_err() {
                continue;
            }
            let (Some(public_key), Some(signature)) = (key_set.get(key_id), signature.as_str())
            else {
                continue;
            };
            checked_any = true;
            if verify_signature(public_key, signature, &bytes)? {
                verified = true;
                break;
            }
        }

        if !verified {
            let err = if checked_any {
                VerificationError::SignatureVerificationFailed(entity.clone())
            } else {
                VerificationError::UnknownKey(entity.clone())
            };
            return Err(err.into());
        }
    }

    Ok(())
}

fn verify_signature(public_key: &str, signature: &str, message: &[u8]) -> Result<bool, Error> {
    use ed25519_dalek::Verifier;

    let key = keys::verifying_key(public_key)?;
    let signature_bytes = crate::serde::base64_decode(signature)
        .map_err(|e| Error::Base64(format!("signature: {e}")))?;
    let signature_bytes: [u8; 64] = match signature_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return Ok(false),
    };
    let signature = ed25519_dalek::Signature::from_bytes(&signature_bytes);
    Ok(key.verify(message, &signature).is_ok())
}

/// Computes the content hash of an event: SHA-256 over the canonical form
/// minus `hashes`, `signatures` and `unsigned`, as unpadded Base64.
pub fn content_hash(object: &CanonicalJsonObject) -> String {
    let mut copy = object.clone();
    copy.remove("hashes");
    copy.remove("signatures");
    copy.remove("unsigned");
    base64_encode(Sha256::digest(canonical_json_bytes(&copy)))
}

/// Computes the reference hash of an event: SHA-256 over the canonical
/// redacted form minus `signatures`, `unsigned` and `age_ts`.
pub fn reference_hash(
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<Vec<u8>, Error> {
    let mut redacted = redact(object, rules)?;
    redacted.remove("signatures");
    redacted.remove("unsigned");
    redacted.remove("age_ts");
    // A reference hash never includes the event's own id.
    redacted.remove("event_id");
    Ok(Sha256::digest(canonical_json_bytes(&redacted)).to_vec())
}

/// Derives the event id from the reference hash: `$` followed by unpadded
/// url-safe Base64.
pub fn event_id(
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<OwnedEventId, Error> {
    let hash = reference_hash(object, rules)?;
    OwnedEventId::try_from(format!("${}", base64_encode_url_safe(hash)))
        .map_err(|e| Error::malformed(format!("derived event id invalid: {e}")))
}

/// Hashes and signs an event: stores the content hash at `hashes.sha256`,
/// then signs the redacted form.
pub fn hash_and_sign_event(
    entity: &str,
    key_pair: &Ed25519KeyPair,
    object: &mut CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<(), Error> {
    let hash = content_hash(object);
    object.insert(
        "hashes".to_owned(),
        CanonicalJsonValue::Object(BTreeMap::from([(
            "sha256".to_owned(),
            CanonicalJsonValue::String(hash),
        )])),
    );

    let mut redacted = redact(object, rules)?;
    sign_json(entity, key_pair, &mut redacted)?;

    object.insert(
        "signatures".to_owned(),
        redacted
            .remove("signatures")
            .expect("sign_json inserted signatures"),
    );
    Ok(())
}

/// Verifies an event's signatures and content hash.
///
/// The signature covers the redacted form; the content hash covers the full
/// event. A valid signature with a mismatched hash yields
/// [`Verified::Signatures`], meaning only the redacted event is
/// trustworthy.
pub fn verify_event(
    public_key_map: &PublicKeyMap,
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<Verified, Error> {
    let redacted = redact(object, rules)?;
    verify_json(public_key_map, &redacted)?;

    let stored_hash = object
        .get("hashes")
        .and_then(CanonicalJsonValue::as_object)
        .and_then(|hashes| hashes.get("sha256"))
        .and_then(CanonicalJsonValue::as_str);

    if stored_hash == Some(content_hash(object).as_str()) {
        Ok(Verified::All)
    } else {
        Ok(Verified::Signatures)
    }
}

/// The (entity, key id) pairs a verifier must resolve before it can check
/// this object's signatures.
pub fn required_keys(
    object: &CanonicalJsonObject,
) -> Result<BTreeMap<OwnedServerName, BTreeSet<OwnedServerSigningKeyId>>, Error> {
    let mut required: BTreeMap<OwnedServerName, BTreeSet<OwnedServerSigningKeyId>> =
        BTreeMap::new();

    if let Some(sender) = object.get("sender").and_then(CanonicalJsonValue::as_str) {
        let sender_server = sender
            .split_once(':')
            .map(|(_, server)| server)
            .ok_or_else(|| Error::malformed("sender has no server part"))?;
        let server = OwnedServerName::try_from(sender_server)
            .map_err(|e| Error::malformed(format!("sender server: {e}")))?;
        required.entry(server).or_default();
    }

    let signatures = object
        .get("signatures")
        .and_then(CanonicalJsonValue::as_object);
    if let Some(signatures) = signatures {
        for (entity, keys) in signatures {
            let Ok(server) = OwnedServerName::try_from(entity.as_str()) else {
                continue;
            };
            let entry = required.entry(server).or_default();
            if let Some(keys) = keys.as_object() {
                for key_id in keys.keys() {
                    if let Ok(key_id) = OwnedServerSigningKeyId::try_from(key_id.as_str()) {
                        entry.insert(key_id);
                    }
                }
            }
        }
    }

    Ok(required)
}

/// The event-level keys kept through redaction.
fn kept_event_keys(rules: &RoomVersionRules) -> &'static [&'static str] {
    if rules.updated_redaction_rules {
        &[
            "event_id",
            "type",
            "room_id",
            "sender",
            "state_key",
            "content",
            "hashes",
            "signatures",
            "depth",
            "prev_events",
            "auth_events",
            "origin_server_ts",
        ]
    } else {
        &[
            "event_id",
            "type",
            "room_id",
            "sender",
            "state_key",
            "content",
            "hashes",
            "signatures",
            "depth",
            "prev_events",
            "prev_state",
            "auth_events",
            "origin",
            "origin_server_ts",
            "membership",
            "redacts",
        ]
    }
}

/// The content keys kept through redaction for the given event type.
fn kept_content_keys(event_type: &TimelineEventType, rules: &RoomVersionRules) -> Vec<&'static str> {
    match event_type {
        TimelineEventType::RoomMember => {
            let mut kept = vec!["membership"];
            if rules.restricted_join_rule_fix {
                kept.push("join_authorised_via_users_server");
            }
            kept
        }
        TimelineEventType::RoomCreate => {
            if rules.updated_redaction_rules {
                // The whole create content survives redaction.
                vec![]
            } else {
                vec!["creator"]
            }
        }
        TimelineEventType::RoomJoinRules => {
            let mut kept = vec!["join_rule"];
            if rules.restricted_join_rule {
                kept.push("allow");
            }
            kept
        }
        TimelineEventType::RoomPowerLevels => {
            let mut kept = vec![
                "ban",
                "events",
                "events_default",
                "kick",
                "redact",
                "state_default",
                "users",
                "users_default",
            ];
            if rules.updated_redaction_rules {
                kept.push("invite");
            }
            kept
        }
        TimelineEventType::RoomHistoryVisibility => vec!["history_visibility"],
        TimelineEventType::RoomRedaction if rules.updated_redaction_rules => vec!["redacts"],
        TimelineEventType::RoomAliases if rules.special_case_aliases_auth => vec!["aliases"],
        _ => vec![],
    }
}

/// Produces the redacted form of an event: strips all event-level keys and
/// content fields outside the per-type whitelist. Purely structural and
/// deterministic.
pub fn redact(
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<CanonicalJsonObject, Error> {
    let event_type = object
        .get("type")
        .and_then(CanonicalJsonValue::as_str)
        .map(TimelineEventType::from)
        .ok_or_else(|| Error::malformed("event has no `type`"))?;

    let kept_keys = kept_event_keys(rules);
    let mut redacted: CanonicalJsonObject = object
        .iter()
        .filter(|(key, _)| kept_keys.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if let Some(CanonicalJsonValue::Object(content)) = redacted.get_mut("content") {
        let kept = kept_content_keys(&event_type, rules);
        if !(event_type == TimelineEventType::RoomCreate && rules.updated_redaction_rules) {
            content.retain(|key, _| kept.contains(&key.as_str()));
        }
    }

    Ok(redacted)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::from_str as from_json_str;

    use super::*;
    use crate::RoomVersionId;
    use crate::serde::CanonicalJsonObject;

    fn object(json: &str) -> CanonicalJsonObject {
        let value: CanonicalJsonValue = from_json_str(json).unwrap();
        match value {
            CanonicalJsonValue::Object(obj) => obj,
            _ => panic!("expected object"),
        }
    }

    fn key_map_for(entity: &str, pair: &Ed25519KeyPair) -> PublicKeyMap {
        let mut key_set = PublicKeySet::new();
        key_set.insert(pair.key_id().as_str().to_owned(), pair.public_key_base64());
        let mut map = PublicKeyMap::new();
        map.insert(entity.to_owned(), key_set);
        map
    }

    #[test]
    fn sign_and_verify_empty_json() {
        let pair = Ed25519KeyPair::generate("1");
        let mut value = object("{}");
        sign_json("domain", &pair, &mut value).unwrap();

        let signatures = value["signatures"].as_object().unwrap();
        let domain = signatures["domain"].as_object().unwrap();
        assert!(domain.contains_key("ed25519:1"));

        verify_json(&key_map_for("domain", &pair), &value).unwrap();
    }

    #[test]
    fn signature_is_independent_of_key_order() {
        let pair = Ed25519KeyPair::generate("1");
        let mut alpha = object(r#"{ "one": 1, "two": "Two" }"#);
        let mut reverse = object(r#"{ "two": "Two", "one": 1 }"#);
        sign_json("domain", &pair, &mut alpha).unwrap();
        sign_json("domain", &pair, &mut reverse).unwrap();
        assert_eq!(
            serde_json::to_string(&alpha).unwrap(),
            serde_json::to_string(&reverse).unwrap()
        );
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let pair = Ed25519KeyPair::generate("1");
        let other = Ed25519KeyPair::generate("1");
        let mut value = object(r#"{ "not": "empty" }"#);
        sign_json("domain", &pair, &mut value).unwrap();

        let err = verify_json(&key_map_for("domain", &other), &value).unwrap_err();
        assert!(matches!(
            err,
            Error::Verification(VerificationError::SignatureVerificationFailed(_))
        ));
    }

    #[test]
    fn verify_reports_missing_signature() {
        let pair = Ed25519KeyPair::generate("1");
        let value = object("{}");
        let err = verify_json(&key_map_for("domain", &pair), &value).unwrap_err();
        assert!(matches!(
            err,
            Error::Verification(VerificationError::SignatureNotFound(_))
        ));
    }

    const MINIMAL_EVENT: &str = r#"{
        "room_id": "!x:domain",
        "sender": "@a:domain",
        "origin": "domain",
        "origin_server_ts": 1000000,
        "type": "X",
        "content": {},
        "prev_events": [],
        "auth_events": [],
        "depth": 3,
        "unsigned": {
            "age_ts": 1000000
        }
    }"#;

    #[test]
    fn content_hash_vector() {
        let mut event = object(MINIMAL_EVENT);
        let pair = Ed25519KeyPair::generate("1");
        hash_and_sign_event("domain", &pair, &mut event, &RoomVersionId::V5.rules()).unwrap();

        let hashes = event["hashes"].as_object().unwrap();
        assert_eq!(
            hashes["sha256"].as_str().unwrap(),
            "5jM4wQpv6lnBo7CLIghJuHdW+s2CMBJPUOGOC89ncos"
        );
    }

    #[test]
    fn redacted_message_hash_vector() {
        let mut event = object(
            r#"{
                "content": {
                    "body": "Here is the message content"
                },
                "event_id": "$0:domain",
                "origin": "domain",
                "origin_server_ts": 1000000,
                "type": "m.room.message",
                "room_id": "!r:domain",
                "sender": "@u:domain",
                "unsigned": {
                    "age_ts": 1000000
                }
            }"#,
        );
        let pair = Ed25519KeyPair::generate("1");
        hash_and_sign_event("domain", &pair, &mut event, &RoomVersionId::V5.rules()).unwrap();

        let hashes = event["hashes"].as_object().unwrap();
        assert_eq!(
            hashes["sha256"].as_str().unwrap(),
            "onLKD1bGljeBWQhWZ1kaP9SorVmRQNdN5aM2JYU2n/g"
        );
    }

    #[test]
    fn hash_sign_verify_round_trip() {
        let pair = Ed25519KeyPair::generate("1");
        let mut event = object(MINIMAL_EVENT);
        let rules = RoomVersionId::V10.rules();
        hash_and_sign_event("domain", &pair, &mut event, &rules).unwrap();

        let verified = verify_event(&key_map_for("domain", &pair), &event, &rules).unwrap();
        assert_eq!(verified, Verified::All);
    }

    #[test]
    fn tampered_content_downgrades_to_signatures_only() {
        let pair = Ed25519KeyPair::generate("1");
        let mut event = object(
            r#"{
                "room_id": "!x:domain",
                "sender": "@a:domain",
                "origin_server_ts": 1000000,
                "type": "m.room.message",
                "content": {"body": "original"},
                "prev_events": [],
                "auth_events": [],
                "depth": 3
            }"#,
        );
        let rules = RoomVersionId::V10.rules();
        hash_and_sign_event("domain", &pair, &mut event, &rules).unwrap();

        if let Some(CanonicalJsonValue::Object(content)) = event.get_mut("content") {
            content.insert(
                "body".to_owned(),
                CanonicalJsonValue::String("tampered".to_owned()),
            );
        }

        let verified = verify_event(&key_map_for("domain", &pair), &event, &rules).unwrap();
        assert_eq!(verified, Verified::Signatures);
    }

    #[test]
    fn event_id_is_reproducible() {
        let pair = Ed25519KeyPair::generate("1");
        let mut event = object(MINIMAL_EVENT);
        let rules = RoomVersionId::V10.rules();
        hash_and_sign_event("domain", &pair, &mut event, &rules).unwrap();

        let first = event_id(&event, &rules).unwrap();
        let second = event_id(&event, &rules).unwrap();
        assert_eq!(first, second);
        assert!(first.as_str().starts_with('$'));
        // The id must not change when the event is annotated after the fact.
        let mut annotated = event.clone();
        annotated.insert(
            "unsigned".to_owned(),
            CanonicalJsonValue::Object(BTreeMap::from([(
                "age".to_owned(),
                CanonicalJsonValue::Integer(12),
            )])),
        );
        assert_eq!(event_id(&annotated, &rules).unwrap(), first);
    }

    #[test]
    fn redaction_keeps_membership_only() {
        let event = object(
            r#"{
                "type": "m.room.member",
                "room_id": "!r:domain",
                "sender": "@u:domain",
                "state_key": "@u:domain",
                "origin_server_ts": 1,
                "content": {
                    "membership": "join",
                    "displayname": "U",
                    "avatar_url": "mxc://x"
                },
                "unsigned": {"age_ts": 1}
            }"#,
        );
        let redacted = redact(&event, &RoomVersionId::V10.rules()).unwrap();
        let content = redacted["content"].as_object().unwrap();
        assert_eq!(content.len(), 1);
        assert!(content.contains_key("membership"));
        assert!(!redacted.contains_key("unsigned"));
    }

    #[test]
    fn updated_redaction_keeps_create_content() {
        let event = object(
            r#"{
                "type": "m.room.create",
                "room_id": "!r:domain",
                "sender": "@u:domain",
                "state_key": "",
                "origin_server_ts": 1,
                "content": {"room_version": "11", "m.federate": false}
            }"#,
        );
        let redacted = redact(&event, &RoomVersionId::V11.rules()).unwrap();
        let content = redacted["content"].as_object().unwrap();
        assert!(content.contains_key("m.federate"));

        let old = redact(&event, &RoomVersionId::V9.rules()).unwrap();
        assert!(old["content"].as_object().unwrap().is_empty());
    }

    #[test]
    fn required_keys_include_sender_and_cosigners() {
        let pair = Ed25519KeyPair::generate("1");
        let mut event = object(MINIMAL_EVENT);
        hash_and_sign_event("s2", &pair, &mut event, &RoomVersionId::V10.rules()).unwrap();

        let required = required_keys(&event).unwrap();
        let domain = OwnedServerName::try_from("domain").unwrap();
        let s2 = OwnedServerName::try_from("s2").unwrap();
        assert!(required.contains_key(&domain));
        assert_eq!(required[&s2].len(), 1);
    }
}
