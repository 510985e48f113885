//! A durable FIFO work queue backed by etcd.
//!
//! Producers [`Queue::enqueue`] opaque byte payloads; competing consumers
//! [`Queue::dequeue`] them, and [`Item::ack`] or [`Item::nack`] the returned
//! handle. An item held in flight longer than `item_timeout` without a
//! successful keepalive is automatically returned to the work lane by the
//! next consumer to call `dequeue`.
//!
//! All coordination is delegated to etcd's transactional compare-and-swap
//! (on key modification revision) and create-only (version == 0) guards —
//! there are no in-process locks standing in for them, since correctness
//! across multiple producer/consumer processes depends on etcd being the
//! sole arbiter of every lane hand-off.

mod error;
mod handoff;
mod item;
mod naming;
mod queue;
mod reap;

pub use error::{QueueError, Result};
pub use item::Item;
pub use queue::{Queue, QueueConfig};
