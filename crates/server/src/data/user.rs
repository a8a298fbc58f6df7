//! The narrow account contract the engine consumes: users, bearer tokens,
//! to-device inboxes, device-list positions and account data.
//!
//! Registration and password handling live outside this server; tests and
//! deployment tooling provision users and tokens directly through these
//! functions.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use serde_json::{Value as JsonValue, json};

use crate::core::Seqnum;
use crate::core::identifiers::{
    DeviceId, OwnedDeviceId, OwnedUserId, UserId,
};

#[derive(Clone, Debug)]
pub struct DbUser {
    pub user_id: OwnedUserId,
    pub display_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DbAccessToken {
    pub token: String,
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
}

static USERS: LazyLock<RwLock<HashMap<OwnedUserId, DbUser>>> = LazyLock::new(Default::default);
static TOKENS: LazyLock<RwLock<HashMap<String, DbAccessToken>>> =
    LazyLock::new(Default::default);
static DEVICES: LazyLock<RwLock<HashMap<OwnedUserId, Vec<OwnedDeviceId>>>> =
    LazyLock::new(Default::default);

/// To-device messages per (user, device) with their stream position.
static INBOXES: LazyLock<
    RwLock<HashMap<(OwnedUserId, OwnedDeviceId), Vec<(Seqnum, JsonValue)>>>,
> = LazyLock::new(Default::default);

/// Users whose device list changed, in stream order.
static DEVICE_LIST_LOG: LazyLock<RwLock<Vec<(Seqnum, OwnedUserId)>>> =
    LazyLock::new(Default::default);

/// Per-user account data: type -> (position, content).
static ACCOUNT_DATA: LazyLock<
    RwLock<HashMap<OwnedUserId, HashMap<String, (Seqnum, JsonValue)>>>,
> = LazyLock::new(Default::default);

pub fn create_user(user_id: &UserId) -> DbUser {
    let user = DbUser {
        user_id: user_id.to_owned(),
        display_name: None,
    };
    USERS
        .write()
        .unwrap()
        .insert(user_id.to_owned(), user.clone());
    user
}

pub fn user_exists(user_id: &UserId) -> bool {
    USERS.read().unwrap().contains_key(user_id)
}

pub fn display_name(user_id: &UserId) -> Option<String> {
    USERS
        .read()
        .unwrap()
        .get(user_id)
        .and_then(|user| user.display_name.clone())
}

/// Issues a bearer token for the user's device, registering both as
/// needed.
pub fn create_access_token(user_id: &UserId, device_id: &DeviceId) -> String {
    if !user_exists(user_id) {
        create_user(user_id);
    }
    let mut devices = DEVICES.write().unwrap();
    let user_devices = devices.entry(user_id.to_owned()).or_default();
    if !user_devices.contains(&device_id.to_owned()) {
        user_devices.push(device_id.to_owned());
    }

    let token = crate::core::serde::random_string(32);
    TOKENS.write().unwrap().insert(
        token.clone(),
        DbAccessToken {
            token: token.clone(),
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
        },
    );
    token
}

pub fn resolve_access_token(token: &str) -> Option<(OwnedUserId, OwnedDeviceId)> {
    TOKENS
        .read()
        .unwrap()
        .get(token)
        .map(|entry| (entry.user_id.clone(), entry.device_id.clone()))
}

pub fn all_device_ids(user_id: &UserId) -> Vec<OwnedDeviceId> {
    DEVICES
        .read()
        .unwrap()
        .get(user_id)
        .cloned()
        .unwrap_or_default()
}

/// Queues a to-device event for one device of a local user.
pub fn add_to_device_event(
    sender: &UserId,
    target_user: &UserId,
    target_device: &DeviceId,
    ev_type: &str,
    content: JsonValue,
) {
    let event = json!({
        "type": ev_type,
        "sender": sender.as_str(),
        "content": content,
    });
    INBOXES
        .write()
        .unwrap()
        .entry((target_user.to_owned(), target_device.to_owned()))
        .or_default()
        .push((super::next_sn(), event));
}

/// To-device events for the device after `since`.
pub fn to_device_events_since(
    user_id: &UserId,
    device_id: &DeviceId,
    since: Seqnum,
) -> Vec<(Seqnum, JsonValue)> {
    INBOXES
        .read()
        .unwrap()
        .get(&(user_id.to_owned(), device_id.to_owned()))
        .map(|events| {
            events
                .iter()
                .filter(|(sn, _)| *sn > since)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

pub fn mark_device_list_change(user_id: &UserId) {
    DEVICE_LIST_LOG
        .write()
        .unwrap()
        .push((super::next_sn(), user_id.to_owned()));
}

pub fn device_list_changes_since(since: Seqnum) -> Vec<OwnedUserId> {
    let mut changed: Vec<OwnedUserId> = DEVICE_LIST_LOG
        .read()
        .unwrap()
        .iter()
        .filter(|(sn, _)| *sn > since)
        .map(|(_, user)| user.clone())
        .collect();
    changed.sort();
    changed.dedup();
    changed
}

pub fn set_account_data(user_id: &UserId, data_type: &str, content: JsonValue) {
    ACCOUNT_DATA
        .write()
        .unwrap()
        .entry(user_id.to_owned())
        .or_default()
        .insert(data_type.to_owned(), (super::next_sn(), content));
}

pub fn account_data_since(user_id: &UserId, since: Seqnum) -> Vec<(String, JsonValue)> {
    ACCOUNT_DATA
        .read()
        .unwrap()
        .get(user_id)
        .map(|data| {
            data.iter()
                .filter(|(_, (sn, _))| *sn > since)
                .map(|(data_type, (_, content))| (data_type.clone(), content.clone()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let alice: OwnedUserId = "@alice:test.example".try_into().unwrap();
        let device: OwnedDeviceId = "DEV1".try_into().unwrap();
        let token = create_access_token(&alice, &device);

        let (user, dev) = resolve_access_token(&token).unwrap();
        assert_eq!(user, alice);
        assert_eq!(dev, device);
        assert!(resolve_access_token("bogus").is_none());
        assert_eq!(all_device_ids(&alice), vec![device]);
    }

    #[test]
    fn to_device_inbox_is_positional() {
        let alice: OwnedUserId = "@inbox:test.example".try_into().unwrap();
        let bob: OwnedUserId = "@sender:far.example".try_into().unwrap();
        let device: OwnedDeviceId = "DEV1".try_into().unwrap();

        add_to_device_event(&bob, &alice, &device, "m.test", json!({"n": 1}));
        let all = to_device_events_since(&alice, &device, 0);
        assert_eq!(all.len(), 1);
        let after = to_device_events_since(&alice, &device, all[0].0);
        assert!(after.is_empty());
    }
}
