//! The data layer: in-process services owning all persisted state.
//!
//! Writes go through module functions guarding their own maps; readers get
//! snapshots. One global sequence numbers every mutation, so stream
//! positions are totally ordered across all streams and sync tokens are a
//! single integer.

pub mod event;
pub mod room;
pub mod server_key;
pub mod user;

use std::sync::atomic::{AtomicI64, Ordering};

use crate::core::Seqnum;

static NEXT_SN: AtomicI64 = AtomicI64::new(1);

/// Claims the next global sequence number.
pub fn next_sn() -> Seqnum {
    NEXT_SN.fetch_add(1, Ordering::SeqCst)
}

/// The most recently claimed sequence number.
pub fn current_sn() -> Seqnum {
    NEXT_SN.load(Ordering::SeqCst) - 1
}
