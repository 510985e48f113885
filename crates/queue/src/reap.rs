//! Reaping of abandoned in-flight items.
//!
//! There is no separate reaper task: `reap_expired` runs inline at the
//! start of every `Queue::dequeue`, which couples recovery latency to
//! dequeue activity. That's acceptable because a queue with no active
//! consumer has no one to deliver to anyway.

use std::time::Duration;

use etcd_client::{Client, GetOptions};

use crate::error::Result;
use crate::handoff::try_move;
use crate::naming::{decode_timestamp, now_nanos};

pub(crate) async fn reap_expired(
    client: &mut Client,
    work_prefix: &[u8],
    in_flight_prefix: &[u8],
    item_timeout: Duration,
) -> Result<()> {
    let resp = client
        .get(in_flight_prefix, Some(GetOptions::new().with_prefix()))
        .await?;

    let now = now_nanos()?;
    let timeout_nanos = item_timeout.as_nanos() as u64;

    for kv in resp.kvs() {
        let Some(item_timestamp) = decode_timestamp(kv.key()) else {
            // A key under the in-flight prefix that doesn't decode to a
            // timestamp shouldn't happen; skip it rather than panic, since
            // some other actor may be mid-write.
            continue;
        };

        if now.saturating_sub(item_timestamp) <= timeout_nanos {
            continue;
        }

        // Per-item transaction failures mean another actor (a concurrent
        // reap pass, a keepalive, an ack) won the race for this key.
        // Ignored: the item is already handled by whoever won.
        let _ = try_move(
            client,
            kv.key(),
            kv.mod_revision(),
            kv.value(),
            work_prefix,
        )
        .await?;
    }

    Ok(())
}
