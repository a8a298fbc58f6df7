//! Sending messages and paginating a room's timeline.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identifiers::OwnedEventId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendMessageResBody {
    pub event_id: OwnedEventId,
}

/// Pagination direction for `/messages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Backwards, from newest to oldest.
    #[serde(rename = "b")]
    Backward,

    /// Forwards, from oldest to newest.
    #[serde(rename = "f")]
    Forward,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Backward
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesResBody {
    /// The token the walk started from.
    pub start: String,

    /// Token to continue from; absent when the walk hit the room's edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,

    #[serde(default)]
    pub chunk: Vec<JsonValue>,

    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub state: Vec<JsonValue>,
}
