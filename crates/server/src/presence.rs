//! Presence: last-writer-wins per user, with age computed at read time.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use serde_json::json;

use crate::core::events::edu::{PresenceState, PresenceUpdate};
use crate::core::identifiers::{OwnedUserId, UserId};
use crate::core::{Seqnum, UnixMillis};
use crate::data;

#[derive(Clone, Debug)]
struct UserPresence {
    state: PresenceState,
    status_msg: Option<String>,
    last_active_at: UnixMillis,
    currently_active: bool,
}

static PRESENCE: LazyLock<RwLock<HashMap<OwnedUserId, (Seqnum, UserPresence)>>> =
    LazyLock::new(Default::default);

pub fn set_presence(
    user_id: &UserId,
    state: PresenceState,
    status_msg: Option<String>,
    currently_active: bool,
) {
    PRESENCE.write().unwrap().insert(
        user_id.to_owned(),
        (
            data::next_sn(),
            UserPresence {
                state,
                status_msg,
                last_active_at: UnixMillis::now(),
                currently_active,
            },
        ),
    );
    crate::sync::notify();
}

/// Applies one federated presence push.
pub fn apply_update(update: PresenceUpdate) {
    set_presence(
        &update.user_id,
        update.presence,
        update.status_msg,
        update.currently_active,
    );
}

/// Presence events changed after `since`, in client `m.presence` format.
pub fn presence_since(since: Seqnum) -> Vec<serde_json::Value> {
    let now = UnixMillis::now();
    PRESENCE
        .read()
        .unwrap()
        .iter()
        .filter(|(_, (sn, _))| *sn > since)
        .map(|(user, (_, presence))| {
            json!({
                "type": "m.presence",
                "sender": user,
                "content": {
                    "presence": presence.state,
                    "status_msg": presence.status_msg,
                    "last_active_ago": presence.last_active_at.elapsed_until(now),
                    "currently_active": presence.currently_active,
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_is_last_writer_wins() {
        let user: OwnedUserId = "@presence:test.example".try_into().unwrap();
        set_presence(&user, PresenceState::Online, None, true);
        set_presence(&user, PresenceState::Unavailable, Some("away".into()), false);

        let events = presence_since(0);
        let mine: Vec<_> = events
            .iter()
            .filter(|e| e["sender"] == user.as_str())
            .collect();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["content"]["presence"], "unavailable");
    }
}
