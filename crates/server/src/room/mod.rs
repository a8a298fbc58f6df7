//! The room protocol engine's service surface: per-room locking, ACLs and
//! state lookups shared by the client and federation paths.

pub mod receipt;
pub mod state;
pub mod timeline;
pub mod typing;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use wildmatch::WildMatch;

use crate::core::events::StateEventType;
use crate::core::events::room::{
    JoinRule, RoomJoinRulesEventContent, RoomMemberEventContent, RoomPowerLevelsEventContent,
    RoomServerAclEventContent,
};
use crate::core::identifiers::{RoomId, ServerName, UserId};
use crate::core::state::power_levels;
use crate::event::PduEvent;
use crate::{AppResult, MatrixError, data};

/// Serializes writes per room so `prev_events` and `depth` computations see
/// a consistent forward frontier.
pub type RoomMutexGuard = tokio::sync::OwnedMutexGuard<()>;

static ROOM_MUTEXES: LazyLock<Mutex<HashMap<crate::core::identifiers::OwnedRoomId, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(Default::default);

pub async fn lock_state(room_id: &RoomId) -> RoomMutexGuard {
    let mutex = {
        let mut mutexes = ROOM_MUTEXES.lock().unwrap();
        mutexes
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    };
    mutex.lock_owned().await
}

/// The current state event in the given slot, if any.
pub fn current_state_event(
    room_id: &RoomId,
    kind: &StateEventType,
    state_key: &str,
) -> Option<Arc<PduEvent>> {
    let event_id = data::room::current_state_id(room_id, kind, state_key)?;
    data::event::get(&event_id)
}

/// Enforces the room's `m.room.server_acl` against a federating peer.
pub fn acl_check(server: &ServerName, room_id: &RoomId) -> AppResult<()> {
    let Some(acl_event) = current_state_event(room_id, &StateEventType::RoomServerAcl, "")
    else {
        return Ok(());
    };
    let Ok(acl) = serde_json::from_value::<RoomServerAclEventContent>(acl_event.content.clone())
    else {
        // An unreadable ACL event does not lock the room.
        return Ok(());
    };

    if !acl.allow_ip_literals && server.is_ip_literal() {
        return Err(MatrixError::forbidden("Server is an IP literal and the room forbids them.")
            .into());
    }

    let host = server.host();
    if acl.deny.iter().any(|glob| WildMatch::new(glob).matches(host)) {
        return Err(MatrixError::forbidden("Server is denied by the room's ACL.").into());
    }
    if !acl.allow.is_empty()
        && !acl.allow.iter().any(|glob| WildMatch::new(glob).matches(host))
    {
        return Err(MatrixError::forbidden("Server is not allowed by the room's ACL.").into());
    }
    Ok(())
}

pub fn get_join_rule(room_id: &RoomId) -> JoinRule {
    current_state_event(room_id, &StateEventType::RoomJoinRules, "")
        .and_then(|event| {
            serde_json::from_value::<RoomJoinRulesEventContent>(event.content.clone()).ok()
        })
        .map(|content| content.join_rule)
        .unwrap_or(JoinRule::Invite)
}

pub fn get_member(room_id: &RoomId, user_id: &UserId) -> Option<RoomMemberEventContent> {
    current_state_event(room_id, &StateEventType::RoomMember, user_id.as_str())
        .and_then(|event| serde_json::from_value(event.content.clone()).ok())
}

/// The user's power in the room per its current state.
pub fn user_power(room_id: &RoomId, user_id: &UserId) -> i64 {
    let levels = current_state_event(room_id, &StateEventType::RoomPowerLevels, "")
        .and_then(|event| {
            serde_json::from_value::<RoomPowerLevelsEventContent>(event.content.clone()).ok()
        });
    let creator = data::room::get_room(room_id).and_then(|room| room.creator);
    power_levels::user_power(levels.as_ref(), creator.as_deref(), user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::room::RoomServerAclEventContent;

    #[test]
    fn acl_globs() {
        let acl = RoomServerAclEventContent {
            allow_ip_literals: false,
            allow: vec!["*".into()],
            deny: vec!["evil.*".into()],
        };
        let matches = |name: &str| {
            let host = ServerName::parse(name).unwrap();
            let denied = acl
                .deny
                .iter()
                .any(|glob| WildMatch::new(glob).matches(host.host()));
            let allowed = acl
                .allow
                .iter()
                .any(|glob| WildMatch::new(glob).matches(host.host()));
            !denied && allowed
        };
        assert!(matches("good.example"));
        assert!(!matches("evil.example"));
    }
}
