//! Shared LMDB plumbing for the local and relay stores.
//!
//! LMDB is copy-on-write with MVCC: readers see a consistent snapshot and
//! never block the single writer, and a commit either lands entirely or not
//! at all, so a crash mid-write cannot corrupt previously committed records.

use std::path::Path;

use commander_core::{MessageEnvelope, StorageError};
use heed::{Env, EnvOpenOptions};

/// Default map size for a store, in megabytes.
pub const DEFAULT_MAP_SIZE_MB: usize = 512;

/// Open (or create) an LMDB environment at `path`.
pub(crate) fn open_env(path: &Path, map_size_mb: usize, max_dbs: u32) -> Result<Env, StorageError> {
    std::fs::create_dir_all(path).map_err(|e| StorageError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    // SAFETY: each store owns its directory and opens it exactly once.
    unsafe {
        EnvOpenOptions::new()
            .map_size(map_size_mb * 1024 * 1024)
            .max_dbs(max_dbs)
            .open(path)
    }
    .map_err(lmdb_err)
}

pub(crate) fn lmdb_err(e: heed::Error) -> StorageError {
    StorageError::Lmdb {
        reason: e.to_string(),
    }
}

/// Sort key that orders envelopes by creation time.
///
/// `created_at` in microseconds, zero padded, then the UUIDv7 id, which is
/// monotonic within a process and breaks same-microsecond ties in creation
/// order.
pub fn order_key(envelope: &MessageEnvelope) -> String {
    let micros = envelope.created_at.timestamp_micros().max(0) as u64;
    format!("{:020}|{}", micros, envelope.id.simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::MessageType;

    #[test]
    fn test_order_key_follows_creation_order() {
        let keys: Vec<String> = (0..20)
            .map(|i| {
                let env = MessageEnvelope::builder("main", "relay", MessageType::Event)
                    .payload(vec![i])
                    .build();
                order_key(&env)
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
