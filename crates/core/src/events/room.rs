//! Content types of the state events the protocol engine interprets.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identifiers::{OwnedEventId, OwnedRoomId, OwnedUserId};
use crate::room_version::{DEFAULT_ROOM_VERSION, RoomVersionId};

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn default_room_version() -> RoomVersionId {
    DEFAULT_ROOM_VERSION
}

fn power_default_50() -> i64 {
    50
}

fn power_default_100() -> i64 {
    100
}

fn is_power_50(value: &i64) -> bool {
    *value == 50
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// The content of an `m.room.create` event, the root of every room graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomCreateEventContent {
    /// The room creator. Absent from room version 11 on, where the sender
    /// of the create event is the creator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<OwnedUserId>,

    /// Whether servers other than the creating one may participate.
    #[serde(rename = "m.federate", default = "default_true", skip_serializing_if = "is_true")]
    pub federate: bool,

    #[serde(default = "default_room_version")]
    pub room_version: RoomVersionId,
}

impl RoomCreateEventContent {
    pub fn new(room_version: RoomVersionId, creator: Option<OwnedUserId>) -> Self {
        Self { creator, federate: true, room_version }
    }
}

/// The `membership` a member event assigns to its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    Ban,
    Invite,
    Join,
    Knock,
    Leave,
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ban => "ban",
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Knock => "knock",
            Self::Leave => "leave",
        };
        f.write_str(s)
    }
}

/// The content of an `m.room.member` event; the state key is the target
/// user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomMemberEventContent {
    pub membership: MembershipState,

    #[serde(rename = "displayname", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// The local user through whom a restricted join was authorised.
    #[serde(
        rename = "join_authorised_via_users_server",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub join_authorized_via_users_server: Option<OwnedUserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub third_party_invite: Option<JsonValue>,
}

impl RoomMemberEventContent {
    pub fn new(membership: MembershipState) -> Self {
        Self {
            membership,
            display_name: None,
            avatar_url: None,
            is_direct: None,
            reason: None,
            join_authorized_via_users_server: None,
            third_party_invite: None,
        }
    }
}

/// The content of an `m.room.power_levels` event.
///
/// Field defaults apply when the event exists but omits a field; the
/// no-event-at-all defaults live with the auth rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomPowerLevelsEventContent {
    #[serde(default = "power_default_50", skip_serializing_if = "is_power_50")]
    pub ban: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub events: BTreeMap<String, i64>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub events_default: i64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub invite: i64,

    #[serde(default = "power_default_50", skip_serializing_if = "is_power_50")]
    pub kick: i64,

    #[serde(default = "power_default_50", skip_serializing_if = "is_power_50")]
    pub redact: i64,

    #[serde(default = "power_default_50", skip_serializing_if = "is_power_50")]
    pub state_default: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<OwnedUserId, i64>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub users_default: i64,
}

impl Default for RoomPowerLevelsEventContent {
    fn default() -> Self {
        Self {
            ban: 50,
            events: BTreeMap::new(),
            events_default: 0,
            invite: 0,
            kick: 50,
            redact: 50,
            state_default: 50,
            users: BTreeMap::new(),
            users_default: 0,
        }
    }
}

impl RoomPowerLevelsEventContent {
    /// The initial power levels of a newly created room: the creator at 100.
    pub fn initial(creator: OwnedUserId) -> Self {
        Self {
            users: BTreeMap::from([(creator, power_default_100())]),
            ..Default::default()
        }
    }

    pub fn user_power(&self, user_id: &crate::identifiers::UserId) -> i64 {
        self.users.get(user_id).copied().unwrap_or(self.users_default)
    }

    pub fn event_power(&self, kind: &str, is_state: bool) -> i64 {
        self.events.get(kind).copied().unwrap_or(if is_state {
            self.state_default
        } else {
            self.events_default
        })
    }
}

/// Who may join a room without an invite, and through what.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "join_rule", rename_all = "snake_case")]
pub enum JoinRule {
    Public,
    Invite,
    Private,
    Knock,
    Restricted {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allow: Vec<AllowRule>,
    },
    KnockRestricted {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allow: Vec<AllowRule>,
    },
}

impl JoinRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Invite => "invite",
            Self::Private => "private",
            Self::Knock => "knock",
            Self::Restricted { .. } => "restricted",
            Self::KnockRestricted { .. } => "knock_restricted",
        }
    }

    /// The rooms membership of which satisfies a restricted join.
    pub fn restriction_rooms(&self) -> Vec<OwnedRoomId> {
        match self {
            Self::Restricted { allow } | Self::KnockRestricted { allow } => allow
                .iter()
                .filter_map(|rule| match rule {
                    AllowRule::RoomMembership { room_id } => Some(room_id.clone()),
                    AllowRule::Unknown => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One entry of a restricted join rule's `allow` list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AllowRule {
    #[serde(rename = "m.room_membership")]
    RoomMembership { room_id: OwnedRoomId },

    #[serde(other)]
    Unknown,
}

/// The content of an `m.room.join_rules` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinRulesEventContent {
    #[serde(flatten)]
    pub join_rule: JoinRule,
}

impl RoomJoinRulesEventContent {
    pub fn new(join_rule: JoinRule) -> Self {
        Self { join_rule }
    }
}

/// Who may read a room's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibility {
    Invited,
    Joined,
    Shared,
    WorldReadable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomHistoryVisibilityEventContent {
    pub history_visibility: HistoryVisibility,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomTopicEventContent {
    pub topic: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomNameEventContent {
    pub name: String,
}

/// The content of an `m.room.server_acl` event, matched against the server
/// name of every federating peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomServerAclEventContent {
    #[serde(default = "default_true")]
    pub allow_ip_literals: bool,

    #[serde(default)]
    pub allow: Vec<String>,

    #[serde(default)]
    pub deny: Vec<String>,
}

/// The content of an `m.room.redaction` event.
///
/// The target lives at the event level in older room versions and moves
/// into the content with the updated redaction rules.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomRedactionEventContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rule_wire_format() {
        let content = RoomJoinRulesEventContent::new(JoinRule::Public);
        assert_eq!(
            serde_json::to_string(&content).unwrap(),
            r#"{"join_rule":"public"}"#
        );

        let restricted: RoomJoinRulesEventContent = serde_json::from_str(
            r#"{"join_rule":"restricted","allow":[{"type":"m.room_membership","room_id":"!a:s1"}]}"#,
        )
        .unwrap();
        assert_eq!(
            restricted.join_rule.restriction_rooms(),
            vec![OwnedRoomId::try_from("!a:s1").unwrap()]
        );
    }

    #[test]
    fn power_levels_defaults() {
        let content: RoomPowerLevelsEventContent = serde_json::from_str("{}").unwrap();
        assert_eq!(content.ban, 50);
        assert_eq!(content.state_default, 50);
        assert_eq!(content.events_default, 0);
        assert_eq!(content.invite, 0);

        let alice = OwnedUserId::try_from("@alice:s1").unwrap();
        let initial = RoomPowerLevelsEventContent::initial(alice.clone());
        assert_eq!(initial.user_power(&alice), 100);
        assert_eq!(
            initial.user_power(crate::identifiers::UserId::parse("@bob:s1").unwrap()),
            0
        );
    }

    #[test]
    fn member_content_renames() {
        let content = RoomMemberEventContent {
            display_name: Some("Alice".into()),
            ..RoomMemberEventContent::new(MembershipState::Join)
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["membership"], "join");
        assert_eq!(json["displayname"], "Alice");
        assert!(json.get("join_authorised_via_users_server").is_none());
    }

    #[test]
    fn create_content_federate_default() {
        let content: RoomCreateEventContent =
            serde_json::from_str(r#"{"room_version":"10"}"#).unwrap();
        assert!(content.federate);
        assert_eq!(content.room_version, RoomVersionId::V10);
    }
}
