//! Interpreting `m.room.power_levels` content during authorization.

use serde_json::Value as JsonValue;

use super::error::StateError;
use crate::RoomVersionRules;
use crate::events::room::RoomPowerLevelsEventContent;
use crate::identifiers::UserId;

/// The power a user holds when the room has no power-levels event at all:
/// the creator is at 100, everyone else at 0.
pub fn default_user_power(user_id: &UserId, creator: Option<&UserId>) -> i64 {
    if creator.is_some_and(|c| c == user_id) { 100 } else { 0 }
}

/// Deserializes power-levels content.
///
/// Room versions before 10 tolerate stringified integers; from 10 on the
/// values must be actual JSON integers.
pub fn deserialize_power_levels(
    content: &JsonValue,
    rules: &RoomVersionRules,
) -> Result<RoomPowerLevelsEventContent, StateError> {
    let value = if rules.integer_power_levels {
        content.clone()
    } else {
        let mut value = content.clone();
        coerce_string_integers(&mut value);
        value
    };

    serde_json::from_value(value)
        .map_err(|e| StateError::invalid_pdu(format!("bad power levels content: {e}")))
}

/// Converts stringified integers in the well-known power-levels fields to
/// JSON integers.
fn coerce_string_integers(value: &mut JsonValue) {
    const SCALAR_FIELDS: &[&str] = &[
        "ban",
        "events_default",
        "invite",
        "kick",
        "redact",
        "state_default",
        "users_default",
    ];
    const MAP_FIELDS: &[&str] = &["events", "users"];

    let Some(object) = value.as_object_mut() else {
        return;
    };

    for field in SCALAR_FIELDS {
        if let Some(entry) = object.get_mut(*field) {
            coerce_one(entry);
        }
    }
    for field in MAP_FIELDS {
        if let Some(JsonValue::Object(map)) = object.get_mut(*field) {
            for entry in map.values_mut() {
                coerce_one(entry);
            }
        }
    }
}

fn coerce_one(value: &mut JsonValue) {
    if let JsonValue::String(s) = value {
        if let Ok(int) = s.trim().parse::<i64>() {
            *value = JsonValue::Number(int.into());
        }
    }
}

/// Resolves a user's power from optional power-levels content, falling back
/// to the creator rule.
pub fn user_power(
    power_levels: Option<&RoomPowerLevelsEventContent>,
    creator: Option<&UserId>,
    user_id: &UserId,
) -> i64 {
    match power_levels {
        Some(content) => content.user_power(user_id),
        None => default_user_power(user_id, creator),
    }
}

/// The power required to send an event of `kind` when power-levels content
/// is absent: zero for everything.
pub fn required_power(
    power_levels: Option<&RoomPowerLevelsEventContent>,
    kind: &str,
    is_state: bool,
) -> i64 {
    match power_levels {
        Some(content) => content.event_power(kind, is_state),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::RoomVersionId;

    #[test]
    fn string_levels_tolerated_before_v10() {
        let content = json!({"users_default": "25", "users": {"@a:s": "75"}});
        let levels =
            deserialize_power_levels(&content, &RoomVersionId::V9.rules()).unwrap();
        assert_eq!(levels.users_default, 25);
        assert_eq!(
            levels.user_power(UserId::parse("@a:s").unwrap()),
            75
        );
    }

    #[test]
    fn string_levels_rejected_from_v10() {
        let content = json!({"users_default": "25"});
        assert!(deserialize_power_levels(&content, &RoomVersionId::V10.rules()).is_err());
    }

    #[test]
    fn creator_default() {
        let creator = UserId::parse("@creator:s").unwrap();
        let other = UserId::parse("@other:s").unwrap();
        assert_eq!(user_power(None, Some(creator), creator), 100);
        assert_eq!(user_power(None, Some(creator), other), 0);
    }
}
