//! Room versions and the behaviour flags attached to them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::UnknownVersionError;

/// A room version understood by this server.
///
/// Versions 1 and 2 derive event ids from a server-local scheme instead of
/// the reference hash and are not supported; everything from version 3 up
/// shares the content-addressed event identity and differs only in the
/// behaviour captured by [`RoomVersionRules`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoomVersionId {
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    V10,
    V11,
}

/// The room version used when a client does not ask for one.
pub const DEFAULT_ROOM_VERSION: RoomVersionId = RoomVersionId::V10;

impl RoomVersionId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V3 => "3",
            Self::V4 => "4",
            Self::V5 => "5",
            Self::V6 => "6",
            Self::V7 => "7",
            Self::V8 => "8",
            Self::V9 => "9",
            Self::V10 => "10",
            Self::V11 => "11",
        }
    }

    /// All versions this server can participate in, oldest first.
    pub fn supported() -> Vec<RoomVersionId> {
        vec![
            Self::V3,
            Self::V4,
            Self::V5,
            Self::V6,
            Self::V7,
            Self::V8,
            Self::V9,
            Self::V10,
            Self::V11,
        ]
    }

    pub fn rules(&self) -> RoomVersionRules {
        RoomVersionRules {
            special_case_aliases_auth: *self <= Self::V5,
            strict_canonical_json: *self >= Self::V6,
            knock_join_rule: *self >= Self::V7,
            restricted_join_rule: *self >= Self::V8,
            restricted_join_rule_fix: *self >= Self::V9,
            knock_restricted_join_rule: *self >= Self::V10,
            integer_power_levels: *self >= Self::V10,
            updated_redaction_rules: *self >= Self::V11,
            implicit_room_creator: *self >= Self::V11,
        }
    }
}

/// The behaviour switches distinguishing the supported room versions.
///
/// Everything that branches on a room version goes through one of these
/// flags, never through the version id itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoomVersionRules {
    /// `m.room.aliases` has its own authorization rule (versions up to 5).
    pub special_case_aliases_auth: bool,

    /// Events failing canonical JSON validation are rejected instead of
    /// tolerated (version 6 and up).
    pub strict_canonical_json: bool,

    /// The `knock` join rule is available (version 7 and up).
    pub knock_join_rule: bool,

    /// The `restricted` join rule is available (version 8 and up).
    pub restricted_join_rule: bool,

    /// Joins authorised via another user's server carry that user in the
    /// membership event and keep it through redaction (version 9 and up).
    pub restricted_join_rule_fix: bool,

    /// The `knock_restricted` join rule is available (version 10 and up).
    pub knock_restricted_join_rule: bool,

    /// Power levels must be integers, never stringified numbers
    /// (version 10 and up).
    pub integer_power_levels: bool,

    /// The redaction algorithm keeps the whole `m.room.create` content and
    /// honours `content.redacts` on redaction events (version 11 and up).
    pub updated_redaction_rules: bool,

    /// The room creator is the sender of `m.room.create`; the `creator`
    /// content field is gone (version 11 and up).
    pub implicit_room_creator: bool,
}

impl fmt::Display for RoomVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomVersionId {
    type Err = UnknownVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3" => Ok(Self::V3),
            "4" => Ok(Self::V4),
            "5" => Ok(Self::V5),
            "6" => Ok(Self::V6),
            "7" => Ok(Self::V7),
            "8" => Ok(Self::V8),
            "9" => Ok(Self::V9),
            "10" => Ok(Self::V10),
            "11" => Ok(Self::V11),
            _ => Err(UnknownVersionError),
        }
    }
}

impl TryFrom<&str> for RoomVersionId {
    type Error = UnknownVersionError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Serialize for RoomVersionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomVersionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| {
            de::Error::custom(format!("unsupported room version `{s}`"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gates() {
        assert!(!RoomVersionId::V6.rules().knock_join_rule);
        assert!(RoomVersionId::V7.rules().knock_join_rule);
        assert!(!RoomVersionId::V9.rules().knock_restricted_join_rule);
        assert!(RoomVersionId::V10.rules().integer_power_levels);
        assert!(RoomVersionId::V11.rules().updated_redaction_rules);
        assert!(RoomVersionId::V5.rules().special_case_aliases_auth);
        assert!(!RoomVersionId::V6.rules().special_case_aliases_auth);
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("10".parse::<RoomVersionId>().unwrap(), RoomVersionId::V10);
        assert_eq!(RoomVersionId::V4.to_string(), "4");
        assert!("1".parse::<RoomVersionId>().is_err());
        assert!("org.example.custom".parse::<RoomVersionId>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let json = serde_json::to_string(&RoomVersionId::V11).unwrap();
        assert_eq!(json, "\"11\"");
        let back: RoomVersionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RoomVersionId::V11);
    }
}
