//! Durable central relay store.
//!
//! The relay is a passive sink. Inserts are idempotent on content hash,
//! batch inserts run in a single write transaction, and a batch id that was
//! already acknowledged is answered from the recorded ack without touching
//! the envelopes again. Callers only see an ack after commit.

use std::path::Path;

use chrono::Utc;
use commander_core::{
    BatchAck, EnvelopeQuery, MessageEnvelope, RelayBatch, StorageError, Timestamp,
};
use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, RwTxn};
use serde::{Deserialize, Serialize};

use crate::lmdb::{lmdb_err, open_env, order_key};

/// Envelope as held by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub envelope: MessageEnvelope,
    pub received_at: Timestamp,
}

/// Result of a single relay insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInsert {
    Stored,
    Duplicate,
}

/// One page of a relay query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPage {
    pub envelopes: Vec<MessageEnvelope>,
    /// Offset to request the next page with, if more results exist.
    pub next_offset: Option<usize>,
}

/// Relay-side LMDB store.
pub struct RelayStore {
    env: Env,
    envelopes: Database<Str, SerdeBincode<RelayRecord>>,
    order: Database<Str, Str>,
    batches: Database<Str, SerdeBincode<BatchAck>>,
}

impl RelayStore {
    pub fn open(path: impl AsRef<Path>, map_size_mb: usize) -> Result<Self, StorageError> {
        let env = open_env(path.as_ref(), map_size_mb, 4)?;

        let mut wtxn = env.write_txn().map_err(lmdb_err)?;
        let envelopes = env
            .create_database(&mut wtxn, Some("relay_envelopes"))
            .map_err(lmdb_err)?;
        let order = env
            .create_database(&mut wtxn, Some("relay_order"))
            .map_err(lmdb_err)?;
        let batches = env
            .create_database(&mut wtxn, Some("relay_batches"))
            .map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;

        Ok(Self {
            env,
            envelopes,
            order,
            batches,
        })
    }

    fn put_envelope(
        &self,
        wtxn: &mut RwTxn,
        envelope: &MessageEnvelope,
    ) -> Result<RelayInsert, StorageError> {
        if self
            .envelopes
            .get(wtxn, &envelope.content_hash)
            .map_err(lmdb_err)?
            .is_some()
        {
            return Ok(RelayInsert::Duplicate);
        }
        let record = RelayRecord {
            envelope: envelope.clone(),
            received_at: Utc::now(),
        };
        self.envelopes
            .put(wtxn, &envelope.content_hash, &record)
            .map_err(lmdb_err)?;
        self.order
            .put(wtxn, &order_key(envelope), &envelope.content_hash)
            .map_err(lmdb_err)?;
        Ok(RelayInsert::Stored)
    }

    /// Insert one envelope durably.
    pub fn insert(&self, envelope: &MessageEnvelope) -> Result<RelayInsert, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let outcome = self.put_envelope(&mut wtxn, envelope)?;
        if outcome == RelayInsert::Stored {
            wtxn.commit().map_err(lmdb_err)?;
        }
        Ok(outcome)
    }

    /// Insert a batch in one transaction. Retrying a batch id returns the
    /// original ack flagged `replayed`.
    pub fn insert_batch(&self, batch: &RelayBatch) -> Result<BatchAck, StorageError> {
        let batch_key = batch.batch_id.to_string();
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        if let Some(mut ack) = self.batches.get(&wtxn, &batch_key).map_err(lmdb_err)? {
            ack.replayed = true;
            return Ok(ack);
        }

        let mut ack = BatchAck {
            batch_id: batch.batch_id,
            accepted: 0,
            duplicates: 0,
            replayed: false,
        };
        for envelope in &batch.envelopes {
            match self.put_envelope(&mut wtxn, envelope)? {
                RelayInsert::Stored => ack.accepted += 1,
                RelayInsert::Duplicate => ack.duplicates += 1,
            }
        }
        self.batches.put(&mut wtxn, &batch_key, &ack).map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;
        Ok(ack)
    }

    pub fn get(&self, content_hash: &str) -> Result<Option<MessageEnvelope>, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        Ok(self
            .envelopes
            .get(&rtxn, content_hash)
            .map_err(lmdb_err)?
            .map(|r| r.envelope))
    }

    /// Envelopes matching `query` in creation order, paginated.
    pub fn query(&self, query: &EnvelopeQuery) -> Result<RelayPage, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut envelopes = Vec::new();
        let mut matched = 0usize;
        let mut more = false;
        for item in self.order.iter(&rtxn).map_err(lmdb_err)? {
            let (_, hash) = item.map_err(lmdb_err)?;
            let Some(record) = self.envelopes.get(&rtxn, hash).map_err(lmdb_err)? else {
                continue;
            };
            if !query.matches(&record.envelope) {
                continue;
            }
            matched += 1;
            if matched <= query.offset {
                continue;
            }
            if envelopes.len() >= limit {
                more = true;
                break;
            }
            envelopes.push(record.envelope);
        }
        let next_offset = more.then(|| query.offset + envelopes.len());
        Ok(RelayPage {
            envelopes,
            next_offset,
        })
    }

    pub fn count(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        self.envelopes.len(&rtxn).map_err(lmdb_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::MessageType;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn store() -> (TempDir, RelayStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = RelayStore::open(dir.path(), 16).expect("open relay store");
        (dir, store)
    }

    fn envelope(sender: &str, n: u8) -> MessageEnvelope {
        MessageEnvelope::builder(sender, "relay", MessageType::Event)
            .payload(vec![n])
            .build()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (_dir, store) = store();
        let env = envelope("main", 1);
        assert_eq!(store.insert(&env).expect("insert"), RelayInsert::Stored);
        assert_eq!(store.insert(&env).expect("insert"), RelayInsert::Duplicate);
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn test_batch_replay_acks_without_reinsert() {
        let (_dir, store) = store();
        let existing = envelope("main", 0);
        store.insert(&existing).expect("insert");

        let batch = RelayBatch {
            batch_id: Uuid::now_v7(),
            node_id: "main".to_string(),
            envelopes: vec![existing, envelope("main", 1), envelope("main", 2)],
        };
        let ack = store.insert_batch(&batch).expect("batch");
        assert_eq!(ack.accepted, 2);
        assert_eq!(ack.duplicates, 1);
        assert!(!ack.replayed);

        let again = store.insert_batch(&batch).expect("batch retry");
        assert!(again.replayed);
        assert_eq!(again.accepted, 2);
        assert_eq!(store.count().expect("count"), 3);
    }

    #[test]
    fn test_query_filters_and_paginates_in_order() {
        let (_dir, store) = store();
        let mine: Vec<_> = (0..5).map(|n| envelope("main", n)).collect();
        for (i, env) in mine.iter().enumerate() {
            store.insert(env).expect("insert");
            store.insert(&envelope("htpc", i as u8)).expect("insert");
        }

        let page = store
            .query(&EnvelopeQuery {
                node_id: Some("main".to_string()),
                limit: Some(3),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(page.envelopes, mine[..3].to_vec());
        assert_eq!(page.next_offset, Some(3));

        let rest = store
            .query(&EnvelopeQuery {
                node_id: Some("main".to_string()),
                offset: 3,
                limit: Some(3),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(rest.envelopes, mine[3..].to_vec());
        assert_eq!(rest.next_offset, None);
    }
}
