use std::time::Duration;

use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, SortOrder, SortTarget, Txn, TxnOp,
    WatchOptions,
};
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result};
use crate::handoff::{join, try_move};
use crate::item::Item;
use crate::naming::unique_name;
use crate::reap::reap_expired;

/// Per-queue configuration. `keepalive_interval` and `root` are exposed so
/// tests can run faster cycles and so multiple queue families can share an
/// etcd cluster without colliding, without changing the bit-exact key
/// layout an item's name encodes (they only change what's joined in front
/// of it).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Duration after which an un-refreshed in-flight item is reaped back
    /// to the work lane.
    pub item_timeout: Duration,
    /// How often a held item's keepalive task refreshes its lease.
    pub keepalive_interval: Duration,
    /// Root namespace prefix under which all queues live, e.g. `/sensu.io`.
    pub root: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            item_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(1),
            root: "/sensu.io".to_string(),
        }
    }
}

/// A durable FIFO work queue backed by etcd. See the crate docs for the
/// overall contract.
pub struct Queue {
    client: Client,
    work_prefix: Vec<u8>,
    in_flight_prefix: Vec<u8>,
    item_timeout: Duration,
    keepalive_interval: Duration,
}

impl Queue {
    /// Returns a new `Queue` named `name`, using `client` to talk to etcd.
    pub fn new(name: impl AsRef<str>, client: Client, item_timeout: Duration) -> Self {
        Self::with_config(
            name,
            client,
            QueueConfig {
                item_timeout,
                ..Default::default()
            },
        )
    }

    /// Returns a new `Queue` with full control over [`QueueConfig`].
    pub fn with_config(name: impl AsRef<str>, client: Client, config: QueueConfig) -> Self {
        let name = name.as_ref();
        let work_prefix = format!("{}/queue/{}/work", config.root, name).into_bytes();
        let in_flight_prefix = format!("{}/queue/{}/inflight", config.root, name).into_bytes();

        Queue {
            client,
            work_prefix,
            in_flight_prefix,
            item_timeout: config.item_timeout,
            keepalive_interval: config.keepalive_interval,
        }
    }

    /// The work lane's key prefix, e.g. `/sensu.io/queue/checks/work`.
    pub fn work_prefix(&self) -> &[u8] {
        &self.work_prefix
    }

    /// The in-flight lane's key prefix.
    pub fn in_flight_prefix(&self) -> &[u8] {
        &self.in_flight_prefix
    }

    /// Places `value` into the work lane. Retries transparently on key
    /// collision; surfaces cancellation and store errors.
    pub async fn enqueue(&self, cancel: &CancellationToken, value: impl Into<Vec<u8>>) -> Result<()> {
        let value = value.into();
        let mut client = self.client.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let key = join(&self.work_prefix, &unique_name()?);
            let when = vec![Compare::version(key.clone(), CompareOp::Equal, 0)];
            let and_then = vec![TxnOp::put(key.clone(), value.clone(), None)];

            let resp = client.txn(Txn::new().when(when).and_then(and_then)).await?;

            if resp.succeeded() {
                tracing::debug!(key = ?key, "enqueued item");
                return Ok(());
            }
            tracing::trace!(key = ?key, "enqueue key collided, retrying");
        }
    }

    /// Reaps expired in-flight items, then returns the next item in FIFO
    /// order, blocking on a watch if the work lane is currently empty. The
    /// returned [`Item`]'s keepalive task is bound to `cancel` and stops
    /// when `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Item> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let mut client = self.client.clone();
            reap_expired(
                &mut client,
                &self.work_prefix,
                &self.in_flight_prefix,
                self.item_timeout,
            )
            .await?;

            let probe = client
                .get(
                    self.work_prefix.clone(),
                    Some(
                        GetOptions::new()
                            .with_prefix()
                            .with_sort(SortTarget::Key, SortOrder::Ascend)
                            .with_limit(1),
                    ),
                )
                .await?;

            if let Some(kv) = probe.kvs().first() {
                match try_move(
                    &mut client,
                    kv.key(),
                    kv.mod_revision(),
                    kv.value(),
                    &self.in_flight_prefix,
                )
                .await?
                {
                    Some(moved) => {
                        return Ok(self.acquired(client, moved.key, moved.revision, kv.value().to_vec(), cancel));
                    }
                    // Another consumer already took this key; fall through
                    // and retry.
                    None => continue,
                }
            }

            if probe.more() {
                // The store promised more keys than it returned; retry the
                // probe rather than trusting the (possibly stale) single
                // result we didn't get.
                continue;
            }

            match self.wait_for_put(&mut client, cancel).await? {
                Some(event) => {
                    match try_move(
                        &mut client,
                        &event.key,
                        event.mod_revision,
                        &event.value,
                        &self.in_flight_prefix,
                    )
                    .await?
                    {
                        Some(moved) => {
                            return Ok(self.acquired(client, moved.key, moved.revision, event.value, cancel));
                        }
                        // Someone else won the hand-off for the item the
                        // watch told us about; go back to reaping + probing.
                        None => continue,
                    }
                }
                // The watch stream ended without the scope being cancelled
                // (e.g. the server closed it). Treat it like "no event yet"
                // rather than surfacing an error.
                None => continue,
            }
        }
    }

    fn acquired(
        &self,
        client: Client,
        key: Vec<u8>,
        revision: i64,
        value: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Item {
        let mut item = Item::new(client, self.work_prefix.clone(), key, revision, value);
        item.start_keepalive(cancel.clone(), self.keepalive_interval);
        item
    }

    /// Waits for the next PUT event under the work prefix. Returns `Ok(None)`
    /// if the watch stream ends on its own; returns `Err(Cancelled)` if
    /// `cancel` fires first.
    async fn wait_for_put(
        &self,
        client: &mut Client,
        cancel: &CancellationToken,
    ) -> Result<Option<RawEvent>> {
        let (mut watcher, mut stream) = client
            .watch(
                self.work_prefix.clone(),
                Some(WatchOptions::new().with_prefix()),
            )
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = watcher.cancel().await;
                    return Err(QueueError::Cancelled);
                }
                message = stream.message() => {
                    let Some(resp) = message? else {
                        return Ok(None);
                    };
                    for event in resp.events() {
                        if event.event_type() != EventType::Put {
                            continue;
                        }
                        if let Some(kv) = event.kv() {
                            return Ok(Some(RawEvent {
                                key: kv.key().to_vec(),
                                value: kv.value().to_vec(),
                                mod_revision: kv.mod_revision(),
                            }));
                        }
                    }
                }
            }
        }
    }
}

struct RawEvent {
    key: Vec<u8>,
    value: Vec<u8>,
    mod_revision: i64,
}
