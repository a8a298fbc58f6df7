//! Per-event authorization against a candidate state.

use serde_json::Value as JsonValue;

use super::error::StateError;
use super::power_levels::{deserialize_power_levels, required_power, user_power};
use super::{Event, TypeStateKey};
use crate::RoomVersionRules;
use crate::events::room::{
    JoinRule, MembershipState, RoomCreateEventContent, RoomJoinRulesEventContent,
    RoomMemberEventContent, RoomPowerLevelsEventContent,
};
use crate::events::{StateEventType, TimelineEventType};
use crate::identifiers::{OwnedUserId, UserId};

/// Selects the state keys an event of this shape must cite as its
/// `auth_events`.
pub fn auth_types_for_event(
    kind: &TimelineEventType,
    sender: &UserId,
    state_key: Option<&str>,
    content: &JsonValue,
) -> Result<Vec<TypeStateKey>, StateError> {
    if *kind == TimelineEventType::RoomCreate {
        return Ok(Vec::new());
    }

    let mut auth_types = vec![
        (StateEventType::RoomCreate, String::new()),
        (StateEventType::RoomPowerLevels, String::new()),
        (StateEventType::RoomMember, sender.as_str().to_owned()),
    ];

    if *kind == TimelineEventType::RoomMember {
        let target = state_key
            .ok_or_else(|| StateError::invalid_pdu("member event without state key"))?;

        let content: RoomMemberEventContent = serde_json::from_value(content.clone())
            .map_err(|e| StateError::invalid_pdu(format!("bad member content: {e}")))?;

        match content.membership {
            MembershipState::Join | MembershipState::Invite | MembershipState::Knock => {
                let key = (StateEventType::RoomJoinRules, String::new());
                if !auth_types.contains(&key) {
                    auth_types.push(key);
                }
            }
            _ => {}
        }

        let key = (StateEventType::RoomMember, target.to_owned());
        if !auth_types.contains(&key) {
            auth_types.push(key);
        }

        if let Some(authorizing_user) = content.join_authorized_via_users_server {
            let key = (StateEventType::RoomMember, authorizing_user.as_str().to_owned());
            if !auth_types.contains(&key) {
                auth_types.push(key);
            }
        }
    }

    Ok(auth_types)
}

struct AuthState<E> {
    create: Option<E>,
    power_levels: Option<RoomPowerLevelsEventContent>,
    creator: Option<OwnedUserId>,
}

impl<E: Event> AuthState<E> {
    fn load(
        rules: &RoomVersionRules,
        fetch_state: &impl Fn(&StateEventType, &str) -> Option<E>,
    ) -> Result<Self, StateError> {
        let create = fetch_state(&StateEventType::RoomCreate, "");

        let creator = match &create {
            Some(event) if rules.implicit_room_creator => Some(event.sender().to_owned()),
            Some(event) => {
                let content: RoomCreateEventContent =
                    serde_json::from_value(event.content().clone()).map_err(|e| {
                        StateError::invalid_pdu(format!("bad create content: {e}"))
                    })?;
                content.creator
            }
            None => None,
        };

        let power_levels = match fetch_state(&StateEventType::RoomPowerLevels, "") {
            Some(event) => Some(deserialize_power_levels(event.content(), rules)?),
            None => None,
        };

        Ok(Self { create, power_levels, creator })
    }

    fn sender_power(&self, sender: &UserId) -> i64 {
        user_power(self.power_levels.as_ref(), self.creator.as_deref(), sender)
    }

    fn membership(
        &self,
        fetch_state: &impl Fn(&StateEventType, &str) -> Option<E>,
        user_id: &str,
    ) -> MembershipState {
        fetch_state(&StateEventType::RoomMember, user_id)
            .and_then(|event| {
                serde_json::from_value::<RoomMemberEventContent>(event.content().clone()).ok()
            })
            .map(|content| content.membership)
            .unwrap_or(MembershipState::Leave)
    }
}

/// Decides whether `incoming` is allowed against the candidate state served
/// by `fetch_state`.
///
/// Rejections carry a sub-reason describing the failed rule.
pub fn auth_check<E: Event>(
    rules: &RoomVersionRules,
    incoming: &E,
    fetch_state: impl Fn(&StateEventType, &str) -> Option<E>,
) -> Result<(), StateError> {
    if *incoming.event_type() == TimelineEventType::RoomCreate {
        return check_room_create(rules, incoming, &fetch_state);
    }

    let state = AuthState::load(rules, &fetch_state)?;

    let Some(create) = &state.create else {
        return Err(StateError::auth_failed("room has no create event"));
    };
    if create.room_id() != incoming.room_id() {
        return Err(StateError::auth_failed("create event is for another room"));
    }

    // A non-federated room only accepts events from the creating server.
    let create_content: RoomCreateEventContent =
        serde_json::from_value(create.content().clone())
            .map_err(|e| StateError::invalid_pdu(format!("bad create content: {e}")))?;
    if !create_content.federate
        && incoming.sender().server_name() != create.sender().server_name()
    {
        return Err(StateError::auth_failed("room is not federated"));
    }

    if *incoming.event_type() == TimelineEventType::RoomMember {
        return check_room_member(rules, incoming, &state, &fetch_state);
    }

    let sender_membership = state.membership(&fetch_state, incoming.sender().as_str());
    if sender_membership != MembershipState::Join {
        return Err(StateError::auth_failed("sender is not joined"));
    }

    let sender_power = state.sender_power(incoming.sender());
    let required = required_power(
        state.power_levels.as_ref(),
        incoming.event_type().as_str(),
        incoming.state_key().is_some(),
    );
    if sender_power < required {
        return Err(StateError::auth_failed(format!(
            "sender power {sender_power} below required {required}"
        )));
    }

    // State events with a user id as state key may only be sent by that
    // user; membership is the one exception and was handled above.
    if let Some(state_key) = incoming.state_key() {
        if state_key.starts_with('@') && state_key != incoming.sender().as_str() {
            return Err(StateError::auth_failed(
                "state key refers to another user",
            ));
        }
    }

    if *incoming.event_type() == TimelineEventType::RoomPowerLevels {
        check_power_levels_change(rules, incoming, &state, sender_power)?;
    }

    Ok(())
}

fn check_room_create<E: Event>(
    rules: &RoomVersionRules,
    incoming: &E,
    fetch_state: &impl Fn(&StateEventType, &str) -> Option<E>,
) -> Result<(), StateError> {
    if fetch_state(&StateEventType::RoomCreate, "").is_some() {
        return Err(StateError::auth_failed("room already has a create event"));
    }
    if !incoming.prev_events().is_empty() {
        return Err(StateError::auth_failed("create event has prev_events"));
    }
    if incoming.state_key() != Some("") {
        return Err(StateError::auth_failed("create event has a state key"));
    }

    let room_server = incoming
        .room_id()
        .server_name()
        .map_err(|_| StateError::invalid_pdu("room id has no server part"))?;
    if room_server != incoming.sender().server_name() {
        return Err(StateError::auth_failed(
            "room id does not belong to the sender's server",
        ));
    }

    if !rules.implicit_room_creator {
        let content: RoomCreateEventContent =
            serde_json::from_value(incoming.content().clone())
                .map_err(|e| StateError::invalid_pdu(format!("bad create content: {e}")))?;
        if content.creator.is_none() {
            return Err(StateError::auth_failed("create event has no creator"));
        }
    }

    Ok(())
}

fn check_room_member<E: Event>(
    rules: &RoomVersionRules,
    incoming: &E,
    state: &AuthState<E>,
    fetch_state: &impl Fn(&StateEventType, &str) -> Option<E>,
) -> Result<(), StateError> {
    let target = incoming
        .state_key()
        .ok_or_else(|| StateError::invalid_pdu("member event without state key"))?;
    let target_user = UserId::parse(target)
        .map_err(|_| StateError::invalid_pdu("member state key is not a user id"))?;

    let content: RoomMemberEventContent =
        serde_json::from_value(incoming.content().clone())
            .map_err(|e| StateError::invalid_pdu(format!("bad member content: {e}")))?;

    let sender = incoming.sender();
    let sender_membership = state.membership(fetch_state, sender.as_str());
    let target_membership = state.membership(fetch_state, target);
    let sender_power = state.sender_power(sender);
    let target_power = user_power(
        state.power_levels.as_ref(),
        state.creator.as_deref(),
        target_user,
    );

    let join_rule = fetch_state(&StateEventType::RoomJoinRules, "")
        .and_then(|event| {
            serde_json::from_value::<RoomJoinRulesEventContent>(event.content().clone()).ok()
        })
        .map(|content| content.join_rule)
        .unwrap_or(JoinRule::Invite);

    match content.membership {
        MembershipState::Join => {
            if sender != target_user {
                return Err(StateError::auth_failed("cannot join on behalf of another user"));
            }

            // The creator's first join follows the create event directly.
            let first_join = state
                .create
                .as_ref()
                .is_some_and(|create| {
                    incoming.prev_events().len() == 1
                        && incoming.prev_events()[0] == *create.event_id()
                });
            if first_join && state.creator.as_deref() == Some(target_user) {
                return Ok(());
            }

            if target_membership == MembershipState::Ban {
                return Err(StateError::auth_failed("user is banned"));
            }

            match &join_rule {
                JoinRule::Public => Ok(()),
                JoinRule::Invite | JoinRule::Knock => {
                    if matches!(
                        target_membership,
                        MembershipState::Join | MembershipState::Invite
                    ) {
                        Ok(())
                    } else {
                        Err(StateError::auth_failed("user has no invite to this room"))
                    }
                }
                JoinRule::Restricted { .. } | JoinRule::KnockRestricted { .. } => {
                    let supported = match &join_rule {
                        JoinRule::Restricted { .. } => rules.restricted_join_rule,
                        _ => rules.knock_restricted_join_rule,
                    };
                    if !supported {
                        return Err(StateError::auth_failed(
                            "join rule not available in this room version",
                        ));
                    }
                    if matches!(
                        target_membership,
                        MembershipState::Join | MembershipState::Invite
                    ) {
                        return Ok(());
                    }
                    check_restricted_join(state, fetch_state, content.join_authorized_via_users_server.as_deref())
                }
                JoinRule::Private => Err(StateError::auth_failed("room is private")),
            }
        }

        MembershipState::Invite => {
            if content.third_party_invite.is_some() {
                return Err(StateError::auth_failed("third party invites are not supported"));
            }
            if sender_membership != MembershipState::Join {
                return Err(StateError::auth_failed("inviter is not joined"));
            }
            if matches!(
                target_membership,
                MembershipState::Join | MembershipState::Ban
            ) {
                return Err(StateError::auth_failed("user is already joined or banned"));
            }
            let invite_level = state
                .power_levels
                .as_ref()
                .map(|levels| levels.invite)
                .unwrap_or(0);
            if sender_power < invite_level {
                return Err(StateError::auth_failed("sender cannot invite"));
            }
            Ok(())
        }

        MembershipState::Leave => {
            if sender == target_user {
                if matches!(
                    sender_membership,
                    MembershipState::Join | MembershipState::Invite | MembershipState::Knock
                ) {
                    Ok(())
                } else {
                    Err(StateError::auth_failed("user is not in the room"))
                }
            } else {
                if sender_membership != MembershipState::Join {
                    return Err(StateError::auth_failed("kicker is not joined"));
                }
                let levels = state.power_levels.as_ref();
                let ban_level = levels.map(|l| l.ban).unwrap_or(50);
                let kick_level = levels.map(|l| l.kick).unwrap_or(50);
                if target_membership == MembershipState::Ban && sender_power < ban_level {
                    return Err(StateError::auth_failed("sender cannot lift a ban"));
                }
                if sender_power >= kick_level && sender_power > target_power {
                    Ok(())
                } else {
                    Err(StateError::auth_failed("sender cannot kick this user"))
                }
            }
        }

        MembershipState::Ban => {
            if sender_membership != MembershipState::Join {
                return Err(StateError::auth_failed("sender is not joined"));
            }
            let ban_level = state
                .power_levels
                .as_ref()
                .map(|levels| levels.ban)
                .unwrap_or(50);
            if sender_power >= ban_level && sender_power > target_power {
                Ok(())
            } else {
                Err(StateError::auth_failed("sender cannot ban this user"))
            }
        }

        MembershipState::Knock => {
            if !rules.knock_join_rule {
                return Err(StateError::auth_failed(
                    "knocking is not available in this room version",
                ));
            }
            let knockable = match &join_rule {
                JoinRule::Knock => true,
                JoinRule::KnockRestricted { .. } => rules.knock_restricted_join_rule,
                _ => false,
            };
            if !knockable {
                return Err(StateError::auth_failed("room is not knockable"));
            }
            if sender != target_user {
                return Err(StateError::auth_failed("cannot knock on behalf of another user"));
            }
            if matches!(
                sender_membership,
                MembershipState::Ban | MembershipState::Join
            ) {
                return Err(StateError::auth_failed("user is banned or already joined"));
            }
            Ok(())
        }
    }
}

/// A restricted join is valid when an already-joined user with invite power
/// vouches for it via `join_authorised_via_users_server`.
fn check_restricted_join<E: Event>(
    state: &AuthState<E>,
    fetch_state: &impl Fn(&StateEventType, &str) -> Option<E>,
    authorizing_user: Option<&UserId>,
) -> Result<(), StateError> {
    let Some(authorizing_user) = authorizing_user else {
        return Err(StateError::auth_failed(
            "restricted join carries no authorising user",
        ));
    };

    if state.membership(fetch_state, authorizing_user.as_str()) != MembershipState::Join {
        return Err(StateError::auth_failed("authorising user is not joined"));
    }

    let invite_level = state
        .power_levels
        .as_ref()
        .map(|levels| levels.invite)
        .unwrap_or(0);
    if state.sender_power(authorizing_user) < invite_level {
        return Err(StateError::auth_failed("authorising user cannot invite"));
    }

    Ok(())
}

/// A user may not raise any level above their own, nor touch levels of
/// users whose current level equals or exceeds theirs.
fn check_power_levels_change<E: Event>(
    rules: &RoomVersionRules,
    incoming: &E,
    state: &AuthState<E>,
    sender_power: i64,
) -> Result<(), StateError> {
    let new_levels = deserialize_power_levels(incoming.content(), rules)?;
    let old_levels = state.power_levels.clone().unwrap_or_default();

    let scalar_pairs = [
        ("ban", old_levels.ban, new_levels.ban),
        ("events_default", old_levels.events_default, new_levels.events_default),
        ("invite", old_levels.invite, new_levels.invite),
        ("kick", old_levels.kick, new_levels.kick),
        ("redact", old_levels.redact, new_levels.redact),
        ("state_default", old_levels.state_default, new_levels.state_default),
        ("users_default", old_levels.users_default, new_levels.users_default),
    ];
    for (name, old, new) in scalar_pairs {
        check_level_change(name, Some(old), Some(new), sender_power)?;
    }

    let event_keys = old_levels
        .events
        .keys()
        .chain(new_levels.events.keys())
        .collect::<std::collections::BTreeSet<_>>();
    for key in event_keys {
        check_level_change(
            key,
            old_levels.events.get(key).copied(),
            new_levels.events.get(key).copied(),
            sender_power,
        )?;
    }

    let user_keys = old_levels
        .users
        .keys()
        .chain(new_levels.users.keys())
        .collect::<std::collections::BTreeSet<_>>();
    for user in user_keys {
        let old = old_levels.users.get(user).copied();
        let new = new_levels.users.get(user).copied();
        if old == new {
            continue;
        }
        // Another user's entry may only be changed from strictly below the
        // sender's own level.
        if user.as_str() != incoming.sender().as_str() {
            if let Some(old) = old {
                if old >= sender_power {
                    return Err(StateError::auth_failed(format!(
                        "cannot change the level of {user} at or above own power"
                    )));
                }
            }
        }
        if let Some(new) = new {
            if new > sender_power {
                return Err(StateError::auth_failed(format!(
                    "cannot grant {user} a level above own power"
                )));
            }
        }
    }

    Ok(())
}

fn check_level_change(
    name: &str,
    old: Option<i64>,
    new: Option<i64>,
    sender_power: i64,
) -> Result<(), StateError> {
    if old == new {
        return Ok(());
    }
    if let Some(old) = old {
        if old > sender_power {
            return Err(StateError::auth_failed(format!(
                "cannot change `{name}` from above own power"
            )));
        }
    }
    if let Some(new) = new {
        if new > sender_power {
            return Err(StateError::auth_failed(format!(
                "cannot raise `{name}` above own power"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::RoomVersionId;
    use crate::state::test_support::{TestEvent, TestState};

    fn rules() -> RoomVersionRules {
        RoomVersionId::V10.rules()
    }

    #[test]
    fn auth_types_for_message() {
        let types = auth_types_for_event(
            &TimelineEventType::RoomMessage,
            UserId::parse("@a:s1").unwrap(),
            None,
            &json!({"body": "hi"}),
        )
        .unwrap();
        assert_eq!(
            types,
            vec![
                (StateEventType::RoomCreate, String::new()),
                (StateEventType::RoomPowerLevels, String::new()),
                (StateEventType::RoomMember, "@a:s1".to_owned()),
            ]
        );
    }

    #[test]
    fn auth_types_for_invite_include_join_rules_and_target() {
        let types = auth_types_for_event(
            &TimelineEventType::RoomMember,
            UserId::parse("@a:s1").unwrap(),
            Some("@b:s2"),
            &json!({"membership": "invite"}),
        )
        .unwrap();
        assert!(types.contains(&(StateEventType::RoomJoinRules, String::new())));
        assert!(types.contains(&(StateEventType::RoomMember, "@b:s2".to_owned())));
    }

    #[test]
    fn create_must_be_first() {
        let state = TestState::new();
        let create = TestEvent::create("@alice:s1", "!r:s1");
        auth_check(&rules(), &create, |t, k| state.fetch(t, k)).unwrap();

        // A second create in the same room is rejected.
        let mut with_create = TestState::new();
        with_create.insert(create.clone());
        let another = TestEvent::create("@alice:s1", "!r:s1");
        assert!(auth_check(&rules(), &another, |t, k| with_create.fetch(t, k)).is_err());

        // A create for a room on a foreign server is rejected.
        let foreign = TestEvent::create("@alice:s1", "!r:elsewhere");
        assert!(auth_check(&rules(), &foreign, |t, k| state.fetch(t, k)).is_err());
    }

    #[test]
    fn creator_first_join_is_allowed() {
        let mut state = TestState::new();
        let create = TestEvent::create("@alice:s1", "!r:s1");
        let create_id = create.event_id.clone();
        state.insert(create);

        let join = TestEvent::member("@alice:s1", "@alice:s1", "join", "!r:s1")
            .with_prev(vec![create_id]);
        auth_check(&rules(), &join, |t, k| state.fetch(t, k)).unwrap();
    }

    #[test]
    fn public_room_join_and_banned_join() {
        let mut state = TestState::room_with("@alice:s1", "!r:s1");
        state.insert(TestEvent::join_rules("@alice:s1", "!r:s1", json!({"join_rule": "public"})));

        let join = TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1");
        auth_check(&rules(), &join, |t, k| state.fetch(t, k)).unwrap();

        state.insert(TestEvent::member("@alice:s1", "@bob:s2", "ban", "!r:s1"));
        let rejoin = TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1");
        assert!(auth_check(&rules(), &rejoin, |t, k| state.fetch(t, k)).is_err());
    }

    #[test]
    fn invite_only_room_requires_invite() {
        let state = TestState::room_with("@alice:s1", "!r:s1");

        let join = TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1");
        assert!(auth_check(&rules(), &join, |t, k| state.fetch(t, k)).is_err());

        let mut invited = state.clone();
        invited.insert(TestEvent::member("@alice:s1", "@bob:s2", "invite", "!r:s1"));
        let join = TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1");
        auth_check(&rules(), &join, |t, k| invited.fetch(t, k)).unwrap();
    }

    #[test]
    fn invite_requires_joined_sender_with_power() {
        let mut state = TestState::room_with("@alice:s1", "!r:s1");
        state.insert(TestEvent::power_levels(
            "@alice:s1",
            "!r:s1",
            json!({"invite": 50, "users": {"@alice:s1": 100}}),
        ));

        let invite = TestEvent::member("@alice:s1", "@bob:s2", "invite", "!r:s1");
        auth_check(&rules(), &invite, |t, k| state.fetch(t, k)).unwrap();

        // Bob, not in the room, cannot invite.
        let invite = TestEvent::member("@bob:s2", "@carol:s3", "invite", "!r:s1");
        assert!(auth_check(&rules(), &invite, |t, k| state.fetch(t, k)).is_err());

        // A joined user below the invite level cannot invite either.
        state.insert(TestEvent::member("@alice:s1", "@bob:s2", "invite", "!r:s1"));
        state.insert(TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1"));
        let invite = TestEvent::member("@bob:s2", "@carol:s3", "invite", "!r:s1");
        assert!(auth_check(&rules(), &invite, |t, k| state.fetch(t, k)).is_err());
    }

    #[test]
    fn kick_and_ban_power_rules() {
        let mut state = TestState::room_with("@alice:s1", "!r:s1");
        state.insert(TestEvent::power_levels(
            "@alice:s1",
            "!r:s1",
            json!({"users": {"@alice:s1": 100, "@mod:s1": 50, "@bob:s2": 50}}),
        ));
        state.insert(TestEvent::member("@mod:s1", "@mod:s1", "join", "!r:s1"));
        state.insert(TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1"));

        // A moderator cannot kick a user of equal power.
        let kick = TestEvent::member("@mod:s1", "@bob:s2", "leave", "!r:s1");
        assert!(auth_check(&rules(), &kick, |t, k| state.fetch(t, k)).is_err());

        // The admin can.
        let kick = TestEvent::member("@alice:s1", "@bob:s2", "leave", "!r:s1");
        auth_check(&rules(), &kick, |t, k| state.fetch(t, k)).unwrap();

        let ban = TestEvent::member("@alice:s1", "@bob:s2", "ban", "!r:s1");
        auth_check(&rules(), &ban, |t, k| state.fetch(t, k)).unwrap();

        // Self-leave is always fine for a joined user.
        let leave = TestEvent::member("@bob:s2", "@bob:s2", "leave", "!r:s1");
        auth_check(&rules(), &leave, |t, k| state.fetch(t, k)).unwrap();
    }

    #[test]
    fn knock_requires_knockable_room_and_version() {
        let mut state = TestState::room_with("@alice:s1", "!r:s1");
        state.insert(TestEvent::join_rules("@alice:s1", "!r:s1", json!({"join_rule": "knock"})));

        let knock = TestEvent::member("@bob:s2", "@bob:s2", "knock", "!r:s1");
        auth_check(&rules(), &knock, |t, k| state.fetch(t, k)).unwrap();
        assert!(
            auth_check(&RoomVersionId::V6.rules(), &knock, |t, k| state.fetch(t, k)).is_err()
        );

        let mut invite_only = TestState::room_with("@alice:s1", "!r:s1");
        invite_only
            .insert(TestEvent::join_rules("@alice:s1", "!r:s1", json!({"join_rule": "invite"})));
        assert!(auth_check(&rules(), &knock, |t, k| invite_only.fetch(t, k)).is_err());
    }

    #[test]
    fn restricted_join_needs_authorising_user() {
        let mut state = TestState::room_with("@alice:s1", "!r:s1");
        state.insert(TestEvent::join_rules(
            "@alice:s1",
            "!r:s1",
            json!({
                "join_rule": "restricted",
                "allow": [{"type": "m.room_membership", "room_id": "!other:s1"}]
            }),
        ));

        let bare = TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1");
        assert!(auth_check(&rules(), &bare, |t, k| state.fetch(t, k)).is_err());

        let vouched = TestEvent::member_with_content(
            "@bob:s2",
            "@bob:s2",
            "!r:s1",
            json!({
                "membership": "join",
                "join_authorised_via_users_server": "@alice:s1"
            }),
        );
        auth_check(&rules(), &vouched, |t, k| state.fetch(t, k)).unwrap();
    }

    #[test]
    fn message_requires_membership_and_power() {
        let mut state = TestState::room_with("@alice:s1", "!r:s1");
        state.insert(TestEvent::power_levels(
            "@alice:s1",
            "!r:s1",
            json!({"events_default": 25, "users": {"@alice:s1": 100}}),
        ));

        let outsider = TestEvent::message("@bob:s2", "!r:s1", json!({"body": "hi"}));
        assert!(auth_check(&rules(), &outsider, |t, k| state.fetch(t, k)).is_err());

        state.insert(TestEvent::member("@alice:s1", "@bob:s2", "invite", "!r:s1"));
        state.insert(TestEvent::member("@bob:s2", "@bob:s2", "join", "!r:s1"));
        let low_power = TestEvent::message("@bob:s2", "!r:s1", json!({"body": "hi"}));
        assert!(auth_check(&rules(), &low_power, |t, k| state.fetch(t, k)).is_err());

        let admin = TestEvent::message("@alice:s1", "!r:s1", json!({"body": "hi"}));
        auth_check(&rules(), &admin, |t, k| state.fetch(t, k)).unwrap();
    }

    #[test]
    fn power_levels_cannot_exceed_own() {
        let mut state = TestState::room_with("@alice:s1", "!r:s1");
        state.insert(TestEvent::power_levels(
            "@alice:s1",
            "!r:s1",
            json!({"users": {"@alice:s1": 100, "@mod:s1": 50}}),
        ));
        state.insert(TestEvent::member("@mod:s1", "@mod:s1", "join", "!r:s1"));

        // The moderator may not grant a level above 50.
        let raise = TestEvent::power_levels(
            "@mod:s1",
            "!r:s1",
            json!({"users": {"@alice:s1": 100, "@mod:s1": 50, "@bob:s2": 75}}),
        );
        assert!(auth_check(&rules(), &raise, |t, k| state.fetch(t, k)).is_err());

        // Nor demote the admin, whose level exceeds theirs.
        let demote = TestEvent::power_levels(
            "@mod:s1",
            "!r:s1",
            json!({"users": {"@alice:s1": 25, "@mod:s1": 50}}),
        );
        assert!(auth_check(&rules(), &demote, |t, k| state.fetch(t, k)).is_err());

        // Granting at or below their own level is fine.
        let grant = TestEvent::power_levels(
            "@mod:s1",
            "!r:s1",
            json!({"users": {"@alice:s1": 100, "@mod:s1": 50, "@bob:s2": 25}}),
        );
        auth_check(&rules(), &grant, |t, k| state.fetch(t, k)).unwrap();
    }
}
