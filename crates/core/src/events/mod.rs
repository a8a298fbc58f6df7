//! Typed event layer.
//!
//! Events travel as untyped canonical JSON at the hashing/signing boundary;
//! above it they are tagged by `type` and their content deserializes into
//! the structs in [`room`] and [`edu`].

pub mod edu;
pub mod room;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! event_type_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $string:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant,)+
            _Custom(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $string,)+
                    Self::_Custom(string) => string,
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $($string => Self::$variant,)+
                    _ => Self::_Custom(s.to_owned()),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::from(s.as_str())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::from(s))
            }
        }
    };
}

event_type_enum! {
    /// The `type` of any event that can appear in a room timeline.
    TimelineEventType {
        RoomAliases => "m.room.aliases",
        RoomCanonicalAlias => "m.room.canonical_alias",
        RoomCreate => "m.room.create",
        RoomHistoryVisibility => "m.room.history_visibility",
        RoomJoinRules => "m.room.join_rules",
        RoomMember => "m.room.member",
        RoomMessage => "m.room.message",
        RoomName => "m.room.name",
        RoomPowerLevels => "m.room.power_levels",
        RoomRedaction => "m.room.redaction",
        RoomServerAcl => "m.room.server_acl",
        RoomTombstone => "m.room.tombstone",
        RoomTopic => "m.room.topic",
    }
}

event_type_enum! {
    /// The `type` of a state event.
    StateEventType {
        RoomAliases => "m.room.aliases",
        RoomCanonicalAlias => "m.room.canonical_alias",
        RoomCreate => "m.room.create",
        RoomHistoryVisibility => "m.room.history_visibility",
        RoomJoinRules => "m.room.join_rules",
        RoomMember => "m.room.member",
        RoomName => "m.room.name",
        RoomPowerLevels => "m.room.power_levels",
        RoomServerAcl => "m.room.server_acl",
        RoomTombstone => "m.room.tombstone",
        RoomTopic => "m.room.topic",
    }
}

impl From<&TimelineEventType> for StateEventType {
    fn from(kind: &TimelineEventType) -> Self {
        Self::from(kind.as_str())
    }
}

impl From<&StateEventType> for TimelineEventType {
    fn from(kind: &StateEventType) -> Self {
        Self::from(kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_custom_types() {
        assert_eq!(TimelineEventType::from("m.room.member"), TimelineEventType::RoomMember);
        let custom = TimelineEventType::from("com.example.game_move");
        assert_eq!(custom.as_str(), "com.example.game_move");
        assert_eq!(
            serde_json::to_string(&TimelineEventType::RoomCreate).unwrap(),
            "\"m.room.create\""
        );
        let parsed: StateEventType = serde_json::from_str("\"m.room.topic\"").unwrap();
        assert_eq!(parsed, StateEventType::RoomTopic);
    }
}
