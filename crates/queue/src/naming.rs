use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{QueueError, Result};

/// Width in bytes of an item key's timestamp component.
pub const KEY_WIDTH: usize = 8;

/// Returns the big-endian encoding of the current wall-clock time in
/// nanoseconds since the Unix epoch.
///
/// The etcd store totally orders keys lexicographically, so big-endian
/// timestamps yield chronological order within a lane. Two calls within the
/// same nanosecond produce the same bytes; callers detect this via the
/// create-only transaction guard (version == 0) and retry.
pub fn unique_name() -> Result<[u8; KEY_WIDTH]> {
    Ok(now_nanos()?.to_be_bytes())
}

/// The current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .map_err(QueueError::Encoding)
}

/// Decodes the trailing `KEY_WIDTH` bytes of `key` as a big-endian
/// nanosecond timestamp. `key` is the full lane-prefixed key, e.g.
/// `queue/<name>/inflight/<8 bytes>`.
pub fn decode_timestamp(key: &[u8]) -> Option<u64> {
    if key.len() < KEY_WIDTH {
        return None;
    }
    let tail = &key[key.len() - KEY_WIDTH..];
    let mut buf = [0u8; KEY_WIDTH];
    buf.copy_from_slice(tail);
    Some(u64::from_be_bytes(buf))
}
