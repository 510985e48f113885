//! Transactional hand-off between lanes.
//!
//! Every lane transition — work → in-flight (dequeue), in-flight → work
//! (nack, reap), in-flight → in-flight (keepalive) — goes through
//! [`try_move`], a single atomic transaction guarded by (a) the source
//! key's current modification revision and (b) the destination key's
//! non-existence. An implementer must not substitute an in-process lock for
//! these guards: correctness across processes depends on etcd being the
//! sole arbiter of who wins a race for the same source key.

use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp, TxnOpResponse};

use crate::error::Result;
use crate::naming::unique_name;

/// The result of a hand-off that committed.
pub(crate) struct Moved {
    pub key: Vec<u8>,
    pub revision: i64,
}

/// Moves the value at `source_key` (currently at `source_revision`) to a
/// fresh key under `dest_prefix`, atomically deleting the source.
///
/// Returns `Ok(None)` — not an error — when the transaction's `if` guard
/// fails: either another actor already moved `source_key`, or the freshly
/// generated destination key collided with an existing one. Both are
/// "lost the race" outcomes that the caller is expected to retry or ignore.
pub(crate) async fn try_move(
    client: &mut Client,
    source_key: &[u8],
    source_revision: i64,
    value: &[u8],
    dest_prefix: &[u8],
) -> Result<Option<Moved>> {
    let dest_key = join(dest_prefix, &unique_name()?);

    let when = vec![
        Compare::mod_revision(source_key.to_vec(), CompareOp::Equal, source_revision),
        Compare::version(dest_key.clone(), CompareOp::Equal, 0),
    ];
    let and_then = vec![
        TxnOp::put(dest_key.clone(), value.to_vec(), Some(PutOptions::new())),
        TxnOp::delete(source_key.to_vec(), None),
    ];

    let resp = client.txn(Txn::new().when(when).and_then(and_then)).await?;

    if !resp.succeeded() {
        return Ok(None);
    }

    let revision = resp
        .op_responses()
        .into_iter()
        .find_map(|op| match op {
            TxnOpResponse::Put(put) => Some(put.header().map(|h| h.revision()).unwrap_or(0)),
            _ => None,
        })
        .unwrap_or(0);

    Ok(Some(Moved {
        key: dest_key,
        revision,
    }))
}

/// Joins a lane prefix with a raw key suffix (e.g. the 8-byte timestamp).
pub(crate) fn join(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + suffix.len());
    key.extend_from_slice(prefix);
    key.push(b'/');
    key.extend_from_slice(suffix);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_inserts_a_single_separator() {
        assert_eq!(join(b"queue/q/work", b"\x01\x02"), b"queue/q/work/\x01\x02".to_vec());
    }
}
