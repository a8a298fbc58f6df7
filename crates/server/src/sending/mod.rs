//! Outbound federation: one FIFO queue and one worker per destination.
//!
//! A destination has at most one transaction in flight. Queue items are
//! removed only after the peer acknowledged the transaction with a 200;
//! transport failures back off exponentially with jitter (1 s doubling to
//! a 60 minute cap) and leave the items at the head for retry. EDUs older
//! than five minutes are dropped at batch time, PDUs are retried for as
//! long as the destination stays relevant.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;

use crate::core::UnixMillis;
use crate::core::federation::transaction::{
    EDU_LIMIT, Edu, PDU_LIMIT, SendMessageReqBody, SendMessageResBody, send_message_request,
};
use crate::core::identifiers::{EventId, OwnedEventId, OwnedServerName, RoomId, ServerName};
use crate::{AppError, AppResult, config, data};

/// EDUs unsent after this long are dropped.
const EDU_MAX_AGE_MS: u64 = 5 * 60 * 1000;

const BACKOFF_CAP: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
enum QueueItem {
    Pdu(OwnedEventId),
    Edu(Vec<u8>, UnixMillis),
}

struct DestinationQueue {
    server: OwnedServerName,
    pending: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    worker_running: AtomicBool,
    txn_counter: AtomicU64,
    consecutive_failures: AtomicU32,
}

static QUEUES: LazyLock<Mutex<HashMap<OwnedServerName, Arc<DestinationQueue>>>> =
    LazyLock::new(Default::default);

fn queue_for(server: &ServerName) -> Arc<DestinationQueue> {
    QUEUES
        .lock()
        .unwrap()
        .entry(server.to_owned())
        .or_insert_with(|| {
            Arc::new(DestinationQueue {
                server: server.to_owned(),
                pending: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                worker_running: AtomicBool::new(false),
                txn_counter: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
            })
        })
        .clone()
}

fn enqueue(server: &ServerName, item: QueueItem) {
    let queue = queue_for(server);
    queue.pending.lock().unwrap().push_back(item);
    queue.notify.notify_one();
    if !queue.worker_running.swap(true, Ordering::SeqCst) {
        tokio::spawn(run_worker(queue));
    }
}

/// Queues a PDU for every server resident in the room except ourselves.
pub fn send_pdu_room(room_id: &RoomId, event_id: &EventId) -> AppResult<()> {
    let servers = data::room::joined_servers(room_id)
        .into_iter()
        .filter(|server| **server != *config::server_name());
    send_pdu_servers(servers, event_id)
}

pub fn send_pdu_servers<S: Iterator<Item = OwnedServerName>>(
    servers: S,
    event_id: &EventId,
) -> AppResult<()> {
    for server in servers {
        if *server == *config::server_name() {
            continue;
        }
        enqueue(&server, QueueItem::Pdu(event_id.to_owned()));
    }
    Ok(())
}

pub fn send_edu_room(room_id: &RoomId, edu: &Edu) -> AppResult<()> {
    let serialized = serde_json::to_vec(edu)?;
    for server in data::room::joined_servers(room_id) {
        if *server == *config::server_name() {
            continue;
        }
        enqueue(&server, QueueItem::Edu(serialized.clone(), UnixMillis::now()));
    }
    Ok(())
}

pub fn send_edu_server(server: &ServerName, edu: &Edu) -> AppResult<()> {
    if *server == *config::server_name() {
        return Ok(());
    }
    let serialized = serde_json::to_vec(edu)?;
    enqueue(server, QueueItem::Edu(serialized, UnixMillis::now()));
    Ok(())
}

/// Executes one federation request with the transaction deadline applied.
pub async fn send_federation_request(
    destination: &ServerName,
    request: reqwest::Request,
    timeout_secs: Option<u64>,
) -> AppResult<reqwest::Response> {
    tokio::time::timeout(
        Duration::from_secs(timeout_secs.unwrap_or(60)),
        crate::federation::send_request(destination, request),
    )
    .await
    .map_err(|_| AppError::public(format!("timeout waiting for {destination}")))?
}

async fn run_worker(queue: Arc<DestinationQueue>) {
    loop {
        let batch = take_batch(&queue);
        if batch.is_empty() {
            // Park until new work arrives; give up the task after an idle
            // window, re-checking for the enqueue race before exiting.
            let notified = queue.notify.notified();
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {
                    queue.worker_running.store(false, Ordering::SeqCst);
                    if queue.pending.lock().unwrap().is_empty()
                        || queue.worker_running.swap(true, Ordering::SeqCst)
                    {
                        return;
                    }
                    continue;
                }
            }
        }

        match send_transaction(&queue, &batch).await {
            Ok(response) => {
                queue.consecutive_failures.store(0, Ordering::SeqCst);
                pop_batch(&queue, batch.len());
                for (event_id, result) in response.pdus {
                    if let Err(error) = result {
                        warn!(destination = %queue.server, %event_id, %error, "peer rejected pdu");
                    }
                }
            }
            Err(error) => {
                let failures = queue.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let backoff = backoff_with_jitter(failures);
                warn!(
                    destination = %queue.server,
                    %error,
                    failures,
                    backoff_secs = backoff.as_secs(),
                    "transaction failed, backing off"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Exponential backoff starting at one second, doubling to the cap, with
/// up to 25% random jitter on top.
fn backoff_with_jitter(failures: u32) -> Duration {
    let base = Duration::from_secs(1)
        .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1).min(12)))
        .min(BACKOFF_CAP);
    let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter_ms)
}

/// Clones the next transaction's worth of items off the queue head,
/// discarding expired EDUs for good.
fn take_batch(queue: &DestinationQueue) -> Vec<QueueItem> {
    let mut pending = queue.pending.lock().unwrap();
    let now = UnixMillis::now();
    pending.retain(|item| match item {
        QueueItem::Edu(_, queued_at) => queued_at.elapsed_until(now) < EDU_MAX_AGE_MS,
        QueueItem::Pdu(_) => true,
    });

    let mut batch = Vec::new();
    let (mut pdus, mut edus) = (0usize, 0usize);
    for item in pending.iter() {
        match item {
            QueueItem::Pdu(_) if pdus < PDU_LIMIT => pdus += 1,
            QueueItem::Edu(..) if edus < EDU_LIMIT => edus += 1,
            _ => break,
        }
        batch.push(item.clone());
    }
    batch
}

fn pop_batch(queue: &DestinationQueue, count: usize) {
    let mut pending = queue.pending.lock().unwrap();
    for _ in 0..count {
        pending.pop_front();
    }
}

async fn send_transaction(
    queue: &DestinationQueue,
    batch: &[QueueItem],
) -> AppResult<SendMessageResBody> {
    let mut pdus = Vec::new();
    let mut edus = Vec::new();
    for item in batch {
        match item {
            QueueItem::Pdu(event_id) => {
                match crate::room::timeline::outgoing_federation_json(event_id) {
                    Ok(json) => pdus.push(json),
                    Err(e) => {
                        error!(%event_id, error = %e, "queued pdu missing from the store");
                    }
                }
            }
            QueueItem::Edu(bytes, _) => {
                if let Ok(edu) = serde_json::from_slice::<Edu>(bytes) {
                    edus.push(edu);
                }
            }
        }
    }

    let txn_id = format!(
        "{}.{}",
        queue.txn_counter.fetch_add(1, Ordering::SeqCst),
        UnixMillis::now().get()
    );
    let base_url = crate::federation::resolver::origin(&queue.server).await?;
    let request = send_message_request(
        &base_url,
        &txn_id,
        SendMessageReqBody {
            origin: config::server_name().to_owned(),
            origin_server_ts: UnixMillis::now(),
            pdus,
            edus,
        },
    )?
    .into_inner();

    let response = send_federation_request(&queue.server, request, Some(60)).await?;
    Ok(response.json::<SendMessageResBody>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        assert!(backoff_with_jitter(1) >= Duration::from_secs(1));
        assert!(backoff_with_jitter(1) < Duration::from_secs(2));
        assert!(backoff_with_jitter(3) >= Duration::from_secs(4));
        assert!(backoff_with_jitter(30) <= BACKOFF_CAP + BACKOFF_CAP / 4);
    }

    #[test]
    fn batches_respect_the_limits_and_drop_stale_edus() {
        let queue = DestinationQueue {
            server: "peer.example".try_into().unwrap(),
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            worker_running: AtomicBool::new(true),
            txn_counter: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        };

        {
            let mut pending = queue.pending.lock().unwrap();
            for index in 0..3 {
                pending.push_back(QueueItem::Pdu(
                    format!("$pdu{index}").try_into().unwrap(),
                ));
            }
            pending.push_back(QueueItem::Edu(
                b"{}".to_vec(),
                UnixMillis::now().saturating_sub(EDU_MAX_AGE_MS + 1),
            ));
            pending.push_back(QueueItem::Edu(b"{}".to_vec(), UnixMillis::now()));
        }

        let batch = take_batch(&queue);
        let pdus = batch
            .iter()
            .filter(|item| matches!(item, QueueItem::Pdu(_)))
            .count();
        let edus = batch
            .iter()
            .filter(|item| matches!(item, QueueItem::Edu(..)))
            .count();
        assert_eq!(pdus, 3);
        assert_eq!(edus, 1, "the expired edu is dropped, the fresh one rides along");
        // The stale EDU is gone from the queue entirely.
        assert_eq!(queue.pending.lock().unwrap().len(), 4);

        // A full queue is split at the PDU cap, preserving FIFO order.
        {
            let mut pending = queue.pending.lock().unwrap();
            pending.clear();
            for index in 0..60 {
                pending.push_back(QueueItem::Pdu(
                    format!("$bulk{index}").try_into().unwrap(),
                ));
            }
        }
        let batch = take_batch(&queue);
        assert_eq!(batch.len(), PDU_LIMIT);
    }
}
