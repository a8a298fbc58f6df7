//! Client-side membership bodies: join, leave, invite, kick, ban.

use serde::{Deserialize, Serialize};

use crate::identifiers::{OwnedRoomId, OwnedUserId};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinRoomReqBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRoomResBody {
    pub room_id: OwnedRoomId,
}

impl JoinRoomResBody {
    pub fn new(room_id: OwnedRoomId) -> Self {
        Self { room_id }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeaveRoomReqBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviteUserReqBody {
    pub user_id: OwnedUserId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinedRoomsResBody {
    pub joined_rooms: Vec<OwnedRoomId>,
}
