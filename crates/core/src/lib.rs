//! Core protocol types for the hearth homeserver.
//!
//! This crate holds everything that is pure protocol: identifiers, canonical
//! JSON, event content types, hashing and signing, the per-event
//! authorization rules, state resolution and the wire types exchanged over
//! the client and federation APIs. Nothing in here performs I/O or touches
//! storage; the server crate wires these pieces to the network and to its
//! data layer.

pub mod client;
pub mod error;
pub mod events;
pub mod federation;
pub mod identifiers;
pub mod room_version;
pub mod sending;
pub mod serde;
pub mod signatures;
pub mod state;
mod time;

pub use error::{ErrorKind, MatrixError};
pub use identifiers::*;
pub use room_version::{RoomVersionId, RoomVersionRules};
pub use time::UnixMillis;

/// A monotonically increasing sequence number assigned to persisted events.
pub type Seqnum = i64;

/// An empty JSON object, `{}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ::serde::Serialize, ::serde::Deserialize)]
pub struct EmptyObject {}
