//! Typing notifications: per-room, expiring 30 seconds after receipt.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use crate::core::identifiers::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use crate::core::{Seqnum, UnixMillis};
use crate::{AppResult, data};

pub const TYPING_TIMEOUT_MS: u64 = 30_000;

/// (user -> expiry) per room, plus the stream position of the last change.
static TYPING: LazyLock<RwLock<HashMap<OwnedRoomId, (Seqnum, HashMap<OwnedUserId, UnixMillis>)>>> =
    LazyLock::new(Default::default);

pub fn add_typing(user_id: &UserId, room_id: &RoomId, expires_at: UnixMillis) -> AppResult<()> {
    let mut typing = TYPING.write().unwrap();
    let entry = typing.entry(room_id.to_owned()).or_default();
    entry.0 = data::next_sn();
    entry.1.insert(user_id.to_owned(), expires_at);
    crate::sync::notify();
    Ok(())
}

pub fn remove_typing(user_id: &UserId, room_id: &RoomId) -> AppResult<()> {
    let mut typing = TYPING.write().unwrap();
    if let Some(entry) = typing.get_mut(room_id) {
        if entry.1.remove(user_id).is_some() {
            entry.0 = data::next_sn();
            crate::sync::notify();
        }
    }
    Ok(())
}

/// Users currently typing; expired entries are swept on read.
pub fn typing_users(room_id: &RoomId) -> Vec<OwnedUserId> {
    let mut typing = TYPING.write().unwrap();
    let Some(entry) = typing.get_mut(room_id) else {
        return Vec::new();
    };
    let now = UnixMillis::now();
    let before = entry.1.len();
    entry.1.retain(|_, expires_at| *expires_at > now);
    if entry.1.len() != before {
        entry.0 = data::next_sn();
    }
    let mut users: Vec<OwnedUserId> = entry.1.keys().cloned().collect();
    users.sort();
    users
}

/// The stream position of the room's last typing change.
pub fn last_change(room_id: &RoomId) -> Seqnum {
    TYPING
        .read()
        .unwrap()
        .get(room_id)
        .map(|entry| entry.0)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_expires() {
        let room: OwnedRoomId = "!typing:test.example".try_into().unwrap();
        let user: OwnedUserId = "@typist:test.example".try_into().unwrap();

        add_typing(&user, &room, UnixMillis::now().saturating_add(TYPING_TIMEOUT_MS)).unwrap();
        assert_eq!(typing_users(&room), vec![user.clone()]);

        add_typing(&user, &room, UnixMillis::now().saturating_sub(1)).unwrap();
        assert!(typing_users(&room).is_empty());
    }
}
