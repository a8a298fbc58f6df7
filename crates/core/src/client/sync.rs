//! `GET /_matrix/client/v3/sync` response structures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identifiers::{OwnedRoomId, OwnedUserId};

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncResBody {
    /// Opaque position token; pass back as `since` to get the delta.
    pub next_batch: String,

    #[serde(default, skip_serializing_if = "Rooms::is_empty")]
    pub rooms: Rooms,

    #[serde(default, skip_serializing_if = "Presence::is_empty")]
    pub presence: Presence,

    #[serde(default, skip_serializing_if = "AccountData::is_empty")]
    pub account_data: AccountData,

    #[serde(default, skip_serializing_if = "ToDevice::is_empty")]
    pub to_device: ToDevice,

    #[serde(default, skip_serializing_if = "DeviceLists::is_empty")]
    pub device_lists: DeviceLists,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub knock: BTreeMap<OwnedRoomId, KnockedRoom>,
}

impl Rooms {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty()
            && self.invite.is_empty()
            && self.leave.is_empty()
            && self.knock.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinedRoom {
    #[serde(default, skip_serializing_if = "State::is_empty")]
    pub state: State,

    /// The resolved state after the timeline window, when the client opted
    /// into `use_state_after`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_after: Option<State>,

    #[serde(default, skip_serializing_if = "Timeline::is_empty")]
    pub timeline: Timeline,

    #[serde(default, skip_serializing_if = "Ephemeral::is_empty")]
    pub ephemeral: Ephemeral,

    #[serde(default, skip_serializing_if = "AccountData::is_empty")]
    pub account_data: AccountData,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<JsonValue>,

    /// True when more events exist between `since` and the window start.
    #[serde(default, skip_serializing_if = "is_false")]
    pub limited: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

impl Timeline {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && !self.limited
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

impl State {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ephemeral {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

impl Ephemeral {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvitedRoom {
    #[serde(default, skip_serializing_if = "InviteState::is_empty")]
    pub invite_state: InviteState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InviteState {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

impl InviteState {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeftRoom {
    #[serde(default, skip_serializing_if = "State::is_empty")]
    pub state: State,

    #[serde(default, skip_serializing_if = "Timeline::is_empty")]
    pub timeline: Timeline,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KnockedRoom {
    #[serde(default, skip_serializing_if = "InviteState::is_empty")]
    pub knock_state: InviteState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Presence {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

impl Presence {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountData {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

impl AccountData {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToDevice {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

impl ToDevice {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub changed: Vec<OwnedUserId>,

    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub left: Vec<OwnedUserId>,
}

impl DeviceLists {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.left.is_empty()
    }
}
