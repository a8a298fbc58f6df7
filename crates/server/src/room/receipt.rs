//! Read receipts: last-writer-wins per (room, user).

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use crate::core::events::edu::{Receipt, ReceiptData};
use crate::core::identifiers::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use crate::core::{Seqnum, UnixMillis};
use crate::{AppResult, data};

#[derive(Clone, Debug)]
pub struct UserReceipt {
    pub event_id: OwnedEventId,
    pub ts: Option<UnixMillis>,
}

static RECEIPTS: LazyLock<
    RwLock<HashMap<OwnedRoomId, HashMap<OwnedUserId, (Seqnum, UserReceipt)>>>,
> = LazyLock::new(Default::default);

/// Records the user's read position in the room, replacing any earlier
/// one.
pub fn update_read(
    user_id: &UserId,
    room_id: &RoomId,
    event_id: &crate::core::identifiers::EventId,
    ts: Option<UnixMillis>,
) -> AppResult<()> {
    RECEIPTS
        .write()
        .unwrap()
        .entry(room_id.to_owned())
        .or_default()
        .insert(
            user_id.to_owned(),
            (
                data::next_sn(),
                UserReceipt {
                    event_id: event_id.to_owned(),
                    ts,
                },
            ),
        );
    crate::sync::notify();
    Ok(())
}

/// Receipts in the room updated after `since`, as `(user, data)` pairs.
pub fn receipts_since(room_id: &RoomId, since: Seqnum) -> Vec<(OwnedUserId, ReceiptData)> {
    RECEIPTS
        .read()
        .unwrap()
        .get(room_id)
        .map(|room| {
            room.iter()
                .filter(|(_, (sn, _))| *sn > since)
                .map(|(user, (_, receipt))| {
                    (
                        user.clone(),
                        ReceiptData {
                            data: Receipt { ts: receipt.ts },
                            event_ids: vec![receipt.event_id.clone()],
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipts_are_last_writer_wins() {
        let room: OwnedRoomId = "!receipts:test.example".try_into().unwrap();
        let user: OwnedUserId = "@reader:test.example".try_into().unwrap();
        let e1: OwnedEventId = "$receipt_e1".try_into().unwrap();
        let e2: OwnedEventId = "$receipt_e2".try_into().unwrap();

        update_read(&user, &room, &e1, Some(UnixMillis(1))).unwrap();
        update_read(&user, &room, &e2, Some(UnixMillis(2))).unwrap();

        let receipts = receipts_since(&room, 0);
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].1.event_ids, vec![e2]);
    }
}
