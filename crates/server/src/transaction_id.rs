//! Idempotency bookkeeping for client transaction ids and federated
//! to-device message ids.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use crate::core::identifiers::{
    DeviceId, OwnedDeviceId, OwnedEventId, OwnedTransactionId, OwnedUserId, TransactionId, UserId,
};

type Key = (OwnedTransactionId, OwnedUserId, Option<OwnedDeviceId>);

static SEEN: LazyLock<RwLock<HashMap<Key, Option<OwnedEventId>>>> =
    LazyLock::new(Default::default);

pub fn add_txn_id(
    txn_id: &TransactionId,
    user_id: &UserId,
    device_id: Option<&DeviceId>,
    event_id: Option<OwnedEventId>,
) {
    SEEN.write().unwrap().insert(
        (
            txn_id.to_owned(),
            user_id.to_owned(),
            device_id.map(ToOwned::to_owned),
        ),
        event_id,
    );
}

/// `Some(..)` when the transaction was seen before; the inner value is the
/// event it produced, if any.
pub fn existing_txn_id(
    txn_id: &TransactionId,
    user_id: &UserId,
    device_id: Option<&DeviceId>,
) -> Option<Option<OwnedEventId>> {
    SEEN.read()
        .unwrap()
        .get(&(
            txn_id.to_owned(),
            user_id.to_owned(),
            device_id.map(ToOwned::to_owned),
        ))
        .cloned()
}

pub fn txn_id_exists(
    txn_id: &TransactionId,
    user_id: &UserId,
    device_id: Option<&DeviceId>,
) -> bool {
    existing_txn_id(txn_id, user_id, device_id).is_some()
}
