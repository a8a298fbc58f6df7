//! Cached signing keys of remote servers.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use crate::core::UnixMillis;
use crate::core::federation::discovery::{ServerSigningKeys, VerifyKey};
use crate::core::identifiers::{OwnedServerName, ServerName, ServerSigningKeyId};

/// Remote keys never trusted longer than this, whatever their
/// `valid_until_ts` claims.
const MAX_CACHE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

struct CachedKeys {
    keys: ServerSigningKeys,
    fetched_at: UnixMillis,
}

static REMOTE_KEYS: LazyLock<RwLock<HashMap<OwnedServerName, CachedKeys>>> =
    LazyLock::new(Default::default);

/// Merges freshly fetched keys into the cache. The current key set is
/// authoritative and replaces the cached one; old keys accumulate so
/// historic signatures stay verifiable through the grace window.
pub fn add_signing_keys(new_keys: ServerSigningKeys) {
    let mut cache = REMOTE_KEYS.write().unwrap();
    let server = new_keys.server_name.clone();

    let entry = cache.entry(server.clone()).or_insert_with(|| CachedKeys {
        keys: ServerSigningKeys::new(server, new_keys.valid_until_ts),
        fetched_at: UnixMillis::now(),
    });
    entry.keys.valid_until_ts = new_keys.valid_until_ts;
    entry.keys.verify_keys = new_keys.verify_keys;
    entry.keys.old_verify_keys.extend(new_keys.old_verify_keys);
    entry.fetched_at = UnixMillis::now();
}

pub fn signing_keys_for(server: &ServerName) -> Option<ServerSigningKeys> {
    REMOTE_KEYS
        .read()
        .unwrap()
        .get(server)
        .map(|cached| cached.keys.clone())
}

/// The moment the cached keys stop being usable:
/// `min(valid_until_ts, fetched_at + 7 days)`.
pub fn cached_until(server: &ServerName) -> Option<UnixMillis> {
    REMOTE_KEYS.read().unwrap().get(server).map(|cached| {
        UnixMillis(
            cached
                .keys
                .valid_until_ts
                .get()
                .min(cached.fetched_at.get() + MAX_CACHE_MS),
        )
    })
}

/// Whether a proactive refetch is due: past the half-life of the cache
/// window.
pub fn refresh_due(server: &ServerName) -> bool {
    let cache = REMOTE_KEYS.read().unwrap();
    match cache.get(server) {
        Some(cached) => {
            let until = cached
                .keys
                .valid_until_ts
                .get()
                .min(cached.fetched_at.get() + MAX_CACHE_MS);
            let now = UnixMillis::now().get();
            now >= cached.fetched_at.get() + (until.saturating_sub(cached.fetched_at.get()) / 2)
        }
        None => true,
    }
}

/// Looks up one verify key, current or old.
pub fn verify_key(
    server: &ServerName,
    key_id: &ServerSigningKeyId,
) -> Option<(VerifyKey, Option<UnixMillis>)> {
    let cache = REMOTE_KEYS.read().unwrap();
    let keys = &cache.get(server)?.keys;
    if let Some(key) = keys.verify_keys.get(key_id) {
        return Some((key.clone(), None));
    }
    keys.old_verify_keys
        .get(key_id)
        .map(|old| (VerifyKey::new(old.key.clone()), Some(old.expired_ts)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::federation::discovery::OldVerifyKey;

    #[test]
    fn merge_keeps_old_keys() {
        let server: OwnedServerName = "keys.example".try_into().unwrap();

        let mut first = ServerSigningKeys::new(server.clone(), UnixMillis(10_000));
        first.verify_keys = BTreeMap::from([(
            "ed25519:a".try_into().unwrap(),
            VerifyKey::new("AAAA".into()),
        )]);
        add_signing_keys(first);

        let mut second = ServerSigningKeys::new(server.clone(), UnixMillis(20_000));
        second.verify_keys = BTreeMap::from([(
            "ed25519:b".try_into().unwrap(),
            VerifyKey::new("BBBB".into()),
        )]);
        second.old_verify_keys = BTreeMap::from([(
            "ed25519:a".try_into().unwrap(),
            OldVerifyKey::new(UnixMillis(15_000), "AAAA".into()),
        )]);
        add_signing_keys(second);

        let merged = signing_keys_for(&server).unwrap();
        let key_b: crate::core::identifiers::OwnedServerSigningKeyId =
            "ed25519:b".try_into().unwrap();
        assert!(merged.verify_keys.contains_key(&key_b));

        // The rotated key is only served as an old key with its expiry.
        let key_a: crate::core::identifiers::OwnedServerSigningKeyId =
            "ed25519:a".try_into().unwrap();
        let (_, expired) = verify_key(&server, &key_a).unwrap();
        assert_eq!(expired, Some(UnixMillis(15_000)));
        assert!(!merged.verify_keys.contains_key(&key_a));
    }
}
