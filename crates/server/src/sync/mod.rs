//! Sync fan-out: per-user deltas against an opaque `next_batch` token.
//!
//! The token encodes one position on the global sequence; every stream
//! (room events, membership, typing, receipts, presence, to-device,
//! device lists, account data) records its changes against that sequence,
//! so a single integer describes a consistent cut across all of them.

use std::sync::LazyLock;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use crate::core::Seqnum;
use crate::core::client::sync::{
    AccountData, DeviceLists, Ephemeral, InviteState, InvitedRoom, JoinedRoom, KnockedRoom,
    LeftRoom, Presence, Rooms, State, SyncResBody, Timeline, ToDevice,
};
use crate::core::events::room::MembershipState;
use crate::core::identifiers::{DeviceId, RoomId, UserId};
use crate::{AppResult, MatrixError, data};

/// The timeline window per room per sync.
const TIMELINE_LIMIT: usize = 10;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_TIMEOUT_MS: u64 = 60_000;

static NOTIFY: LazyLock<Notify> = LazyLock::new(Notify::new);

/// Wakes every long-polling sync; publishers call this after any stream
/// advances.
pub fn notify() {
    NOTIFY.notify_waiters();
}

#[derive(Debug, Default)]
pub struct SyncArgs {
    pub since: Option<String>,
    pub timeout_ms: Option<u64>,
    pub full_state: bool,
    pub use_state_after: bool,
}

fn parse_token(token: &str) -> AppResult<Seqnum> {
    token
        .strip_prefix('s')
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid `since` token").into())
}

fn format_token(sn: Seqnum) -> String {
    format!("s{sn}")
}

/// Long-polls for changes past `since`, waiting up to the requested
/// timeout (capped at 60 s). Cancellation-safe: dropping the future
/// leaves every store untouched.
pub async fn sync_events(
    user_id: &UserId,
    device_id: &DeviceId,
    args: SyncArgs,
) -> AppResult<SyncResBody> {
    let since = match &args.since {
        Some(token) => parse_token(token)?,
        None => 0,
    };
    let timeout_ms = args
        .timeout_ms
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .min(MAX_TIMEOUT_MS);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        let next = data::current_sn();
        let response = build_response(user_id, device_id, since, next, &args)?;

        let changed = !response.rooms.is_empty()
            || !response.presence.is_empty()
            || !response.account_data.is_empty()
            || !response.to_device.is_empty()
            || !response.device_lists.is_empty();
        if changed || tokio::time::Instant::now() >= deadline {
            return Ok(response);
        }

        let wakeup = NOTIFY.notified();
        tokio::select! {
            _ = wakeup => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

fn build_response(
    user_id: &UserId,
    device_id: &DeviceId,
    since: Seqnum,
    next: Seqnum,
    args: &SyncArgs,
) -> AppResult<SyncResBody> {
    let mut rooms = Rooms::default();

    for room_id in data::room::joined_rooms(user_id) {
        let joined = build_joined_room(&room_id, since, args)?;
        if since == 0 || !joined.timeline.is_empty() || !joined.state.is_empty()
            || !joined.ephemeral.is_empty()
        {
            rooms.join.insert(room_id, joined);
        }
    }

    for (_, room_id, membership) in data::room::membership_changes_since(user_id, since) {
        match membership {
            MembershipState::Invite => {
                rooms.invite.insert(
                    room_id.clone(),
                    InvitedRoom {
                        invite_state: InviteState {
                            events: data::room::invite_state(&room_id, user_id),
                        },
                    },
                );
            }
            MembershipState::Leave | MembershipState::Ban => {
                rooms.join.remove(&room_id);
                rooms.leave.insert(room_id, LeftRoom::default());
            }
            MembershipState::Knock => {
                rooms.knock.insert(
                    room_id.clone(),
                    KnockedRoom {
                        knock_state: InviteState {
                            events: data::room::knock_state(&room_id, user_id),
                        },
                    },
                );
            }
            MembershipState::Join => {}
        }
    }
    if since == 0 {
        for room_id in data::room::rooms_of(user_id, MembershipState::Invite) {
            rooms.invite.entry(room_id.clone()).or_insert_with(|| InvitedRoom {
                invite_state: InviteState {
                    events: data::room::invite_state(&room_id, user_id),
                },
            });
        }
    }

    let to_device_events = data::user::to_device_events_since(user_id, device_id, since)
        .into_iter()
        .map(|(_, event)| event)
        .collect::<Vec<_>>();

    Ok(SyncResBody {
        next_batch: format_token(next),
        rooms,
        presence: Presence {
            events: crate::presence::presence_since(since),
        },
        account_data: AccountData {
            events: data::user::account_data_since(user_id, since)
                .into_iter()
                .map(|(data_type, content)| json!({"type": data_type, "content": content}))
                .collect(),
        },
        to_device: ToDevice {
            events: to_device_events,
        },
        device_lists: DeviceLists {
            changed: data::user::device_list_changes_since(since),
            left: Vec::new(),
        },
    })
}

fn build_joined_room(
    room_id: &RoomId,
    since: Seqnum,
    args: &SyncArgs,
) -> AppResult<JoinedRoom> {
    let mut all_since = data::event::events_since(room_id, since, usize::MAX);
    let limited = all_since.len() > TIMELINE_LIMIT;
    let window = all_since.split_off(all_since.len().saturating_sub(TIMELINE_LIMIT));
    let prev_batch = window
        .first()
        .map(|(sn, _)| format_token(sn - 1));

    let timeline_ids: std::collections::HashSet<_> =
        window.iter().map(|(_, pdu)| pdu.event_id.clone()).collect();

    // State delta: everything that entered the current state since the
    // token and is not already visible in the timeline window.
    let state_events = if since == 0 || args.full_state {
        crate::room::state::current_full(room_id)
            .into_values()
            .filter(|pdu| !timeline_ids.contains(&pdu.event_id))
            .map(|pdu| pdu.to_state_event())
            .collect()
    } else {
        data::room::state_changes_since(room_id, since)
            .into_iter()
            .filter(|id| !timeline_ids.contains(id))
            .filter_map(|id| data::event::get(&id))
            .map(|pdu| pdu.to_state_event())
            .collect()
    };

    let state_after = if args.use_state_after {
        Some(State {
            events: crate::room::state::current_full(room_id)
                .into_values()
                .map(|pdu| pdu.to_state_event())
                .collect(),
        })
    } else {
        None
    };

    let mut ephemeral_events = Vec::new();
    if crate::room::typing::last_change(room_id) > since {
        ephemeral_events.push(json!({
            "type": "m.typing",
            "content": {"user_ids": crate::room::typing::typing_users(room_id)}
        }));
    }
    let receipts = crate::room::receipt::receipts_since(room_id, since);
    if !receipts.is_empty() {
        let mut content = serde_json::Map::new();
        for (user, receipt) in receipts {
            for event_id in &receipt.event_ids {
                content
                    .entry(event_id.as_str().to_owned())
                    .or_insert_with(|| json!({"m.read": {}}))["m.read"]
                    [user.as_str()] = json!({"ts": receipt.data.ts});
            }
        }
        ephemeral_events.push(json!({"type": "m.receipt", "content": content}));
    }

    Ok(JoinedRoom {
        state: State { events: state_events },
        state_after,
        timeline: Timeline {
            events: window
                .iter()
                .map(|(_, pdu)| pdu.to_sync_room_event())
                .collect(),
            limited,
            prev_batch,
        },
        ephemeral: Ephemeral {
            events: ephemeral_events,
        },
        account_data: AccountData::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        assert_eq!(parse_token("s42").unwrap(), 42);
        assert_eq!(format_token(42), "s42");
        assert!(parse_token("42").is_err());
        assert!(parse_token("sforty").is_err());
    }
}
