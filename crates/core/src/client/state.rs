//! Reading and writing room state from the client API.

use serde::{Deserialize, Serialize};

use crate::identifiers::OwnedEventId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendStateEventResBody {
    pub event_id: OwnedEventId,
}
