use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp};
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result};
use crate::handoff::try_move;
use crate::naming::decode_timestamp;

/// A single-shot latch: the first caller to [`Latch::claim`] wins, every
/// later caller observes `false`. Used so `Item::ack`, `Item::nack`, and the
/// keepalive task can race against each other without any of them running
/// its transaction twice.
#[derive(Debug, Default)]
struct Latch(AtomicBool);

impl Latch {
    fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The current in-flight key and the revision it was put at. Mutated only
/// by the keepalive task and by `ack`/`nack`, which is why access is
/// serialized through `Shared::position` rather than duplicated per-field.
struct Position {
    key: Vec<u8>,
    revision: i64,
}

struct Shared {
    client: Client,
    work_prefix: Vec<u8>,
    value: Vec<u8>,
    timestamp: u64,
    position: StdMutex<Position>,
    latch: Latch,
}

/// A handle to a single dequeued item, returned by [`crate::Queue::dequeue`].
///
/// Exactly one of `ack`, `nack`, or expiry-driven reaping eventually takes
/// effect for a given handle; later calls are no-ops. Dropping an `Item`
/// without acking or nacking it stops its keepalive
/// task, so the item will be reaped after `item_timeout` just as if the
/// consumer's process had crashed.
pub struct Item {
    shared: Arc<Shared>,
    keepalive: Option<tokio::task::JoinHandle<()>>,
}

impl Item {
    pub(crate) fn new(
        client: Client,
        work_prefix: Vec<u8>,
        key: Vec<u8>,
        revision: i64,
        value: Vec<u8>,
    ) -> Self {
        let timestamp = decode_timestamp(&key).unwrap_or(0);
        Item {
            shared: Arc::new(Shared {
                client,
                work_prefix,
                value,
                timestamp,
                position: StdMutex::new(Position { key, revision }),
                latch: Latch::default(),
            }),
            keepalive: None,
        }
    }

    /// Starts the keepalive task bound to `cancel`. Called once by
    /// `Queue::dequeue` right after a successful hand-off.
    pub(crate) fn start_keepalive(&mut self, cancel: CancellationToken, interval: Duration) {
        let shared = Arc::clone(&self.shared);
        self.keepalive = Some(tokio::spawn(async move {
            keepalive_loop(shared, cancel, interval).await;
        }));
    }

    /// The item's payload.
    pub fn value(&self) -> &[u8] {
        &self.shared.value
    }

    /// The item's current in-flight key.
    pub fn key(&self) -> Vec<u8> {
        self.shared.position.lock().unwrap().key.clone()
    }

    /// Nanosecond wall-clock timestamp embedded in the key at acquisition
    /// time. Keepalive relocates the key but does not change this value.
    pub fn timestamp(&self) -> u64 {
        self.shared.timestamp
    }

    /// Acknowledges the item: deletes it from the in-flight lane, guarded
    /// on its current revision. Idempotent: calling this more than once, or
    /// after `nack`, is a no-op returning `Ok(())`.
    pub async fn ack(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.shared.latch.claim() {
            return Ok(());
        }

        let position = {
            let guard = self.shared.position.lock().unwrap();
            Position {
                key: guard.key.clone(),
                revision: guard.revision,
            }
        };

        let mut client = self.shared.client.clone();
        let when = vec![Compare::mod_revision(
            position.key.clone(),
            CompareOp::Equal,
            position.revision,
        )];
        let and_then = vec![TxnOp::delete(position.key.clone(), None)];

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            resp = client.txn(Txn::new().when(when).and_then(and_then)) => resp?,
        };

        if resp.succeeded() {
            Ok(())
        } else {
            Err(QueueError::StaleHandle)
        }
    }

    /// Returns the item to the work lane and deletes it from the in-flight
    /// lane, in a single transaction. Idempotent like `ack`.
    pub async fn nack(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.shared.latch.claim() {
            return Ok(());
        }

        let position = {
            let guard = self.shared.position.lock().unwrap();
            Position {
                key: guard.key.clone(),
                revision: guard.revision,
            }
        };

        let mut client = self.shared.client.clone();
        let moved = tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            moved = try_move(
                &mut client,
                &position.key,
                position.revision,
                &self.shared.value,
                &self.shared.work_prefix,
            ) => moved?,
        };

        match moved {
            Some(_moved) => Ok(()),
            // Another actor (a concurrent reap, most likely) already moved
            // this key; the handle is stale but nack still "succeeded" in
            // spirit, since the payload is already back in the work lane.
            None => Err(QueueError::StaleHandle),
        }
    }
}

impl Drop for Item {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
    }
}

async fn keepalive_loop(shared: Arc<Shared>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("keepalive stopped: scope cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        if shared.latch.is_claimed() {
            tracing::debug!("keepalive stopped: handle already ack/nack'd");
            return;
        }

        let position = {
            let guard = shared.position.lock().unwrap();
            Position {
                key: guard.key.clone(),
                revision: guard.revision,
            }
        };

        let in_flight_prefix = {
            // The in-flight prefix is the position key's own prefix, minus
            // the trailing "/<8 bytes>" suffix `handoff::join` appended.
            let len = position.key.len().saturating_sub(crate::naming::KEY_WIDTH + 1);
            position.key[..len].to_vec()
        };

        let mut client = shared.client.clone();
        match try_move(
            &mut client,
            &position.key,
            position.revision,
            &shared.value,
            &in_flight_prefix,
        )
        .await
        {
            Ok(Some(moved)) => {
                let mut guard = shared.position.lock().unwrap();
                *guard = Position {
                    key: moved.key,
                    revision: moved.revision,
                };
            }
            Ok(None) => {
                // Lost the race: the reaper already moved this item back to
                // work, or the handle was ack/nack'd between our latch
                // check and the transaction. Either way, the handle is
                // defunct.
                tracing::warn!(
                    key = ?position.key,
                    "keepalive transaction lost its race, handle is defunct"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(?err, key = ?position.key, "keepalive transaction failed");
                return;
            }
        }
    }
}
