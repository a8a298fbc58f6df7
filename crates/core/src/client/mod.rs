//! Request and response types of the client-server API surface this engine
//! exposes.

pub mod membership;
pub mod message;
pub mod room;
pub mod state;
pub mod sync;
