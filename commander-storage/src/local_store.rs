//! Node-local durable envelope store with its outbox.
//!
//! Four named databases live in one LMDB environment:
//!
//! - `envelopes`: content hash -> [`LocalRecord`]
//! - `order`: order key -> content hash (creation-time index)
//! - `outbox`: order key -> [`OutboxRecord`]
//!
//! A fresh write puts the envelope, its index entry and its outbox record in
//! one transaction. An ack removes the outbox record and marks the envelope
//! synced in one transaction. Either way a durable envelope is always either
//! synced or has exactly one outbox record.

use std::collections::HashSet;
use std::ops::Bound;
use std::path::Path;

use chrono::Utc;
use commander_core::{
    EnvelopeQuery, MessageEnvelope, OutboxRecord, OutboxStatus, RetryConfig, StorageError,
    Timestamp,
};
use heed::types::{SerdeBincode, Str};
use heed::{Database, Env};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lmdb::{lmdb_err, open_env, order_key};

/// Relay delivery state of a locally stored envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Not yet acknowledged by the relay; an outbox record exists.
    Pending,
    /// Acknowledged by the relay, or fetched from it.
    Synced,
}

/// An envelope as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub envelope: MessageEnvelope,
    pub sync_state: SyncState,
    pub order_key: String,
    pub stored_at: Timestamp,
}

/// Result of a local insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Newly stored; carries the order key of the envelope and its outbox record.
    Inserted { order_key: String },
    /// Content hash already present; nothing changed.
    Duplicate,
}

/// Outbox counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub sending: u64,
    pub failed: u64,
    pub oldest_pending: Option<Timestamp>,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.sending + self.failed
    }
}

/// Why a delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Relay unreachable, timed out or overloaded. Retried with capped
    /// backoff for as long as it takes; never spends the retry budget.
    Transient,
    /// The relay answered and refused the payload. Spends the retry budget.
    Rejected,
}

/// Outcome of recording a failed delivery attempt for one outbox record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub order_key: String,
    pub retry_count: u32,
    /// True when the retry budget is exhausted and the record is now failed.
    pub exhausted: bool,
}

/// Local durable store.
pub struct LocalStore {
    env: Env,
    envelopes: Database<Str, SerdeBincode<LocalRecord>>,
    order: Database<Str, Str>,
    outbox: Database<Str, SerdeBincode<OutboxRecord>>,
}

impl LocalStore {
    /// Open or create the store at `path`.
    ///
    /// Records left in `sending` by a crash are returned to `pending`.
    pub fn open(path: impl AsRef<Path>, map_size_mb: usize) -> Result<Self, StorageError> {
        let env = open_env(path.as_ref(), map_size_mb, 4)?;

        let mut wtxn = env.write_txn().map_err(lmdb_err)?;
        let envelopes = env
            .create_database(&mut wtxn, Some("envelopes"))
            .map_err(lmdb_err)?;
        let order = env.create_database(&mut wtxn, Some("order")).map_err(lmdb_err)?;
        let outbox = env.create_database(&mut wtxn, Some("outbox")).map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;

        let store = Self {
            env,
            envelopes,
            order,
            outbox,
        };
        store.recover_sending()?;
        Ok(store)
    }

    // ========================================================================
    // ENVELOPES
    // ========================================================================

    /// Store a locally produced envelope and queue it for the relay.
    ///
    /// The outbox record is held back until `first_attempt_at` so the
    /// uploader does not race the immediate push.
    pub fn insert_local(
        &self,
        node_id: &str,
        envelope: &MessageEnvelope,
        first_attempt_at: Timestamp,
    ) -> Result<InsertOutcome, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        if self
            .envelopes
            .get(&wtxn, &envelope.content_hash)
            .map_err(lmdb_err)?
            .is_some()
        {
            return Ok(InsertOutcome::Duplicate);
        }

        let key = order_key(envelope);
        let record = LocalRecord {
            envelope: envelope.clone(),
            sync_state: SyncState::Pending,
            order_key: key.clone(),
            stored_at: Utc::now(),
        };
        let mut outbox = OutboxRecord::pending(node_id, envelope.clone());
        outbox.next_attempt_at = Some(first_attempt_at);

        self.envelopes
            .put(&mut wtxn, &envelope.content_hash, &record)
            .map_err(lmdb_err)?;
        self.order
            .put(&mut wtxn, &key, &envelope.content_hash)
            .map_err(lmdb_err)?;
        self.outbox.put(&mut wtxn, &key, &outbox).map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;

        Ok(InsertOutcome::Inserted { order_key: key })
    }

    /// Cache envelopes fetched from the relay. They are already synced, so no
    /// outbox record is created. Returns how many were new.
    pub fn cache_remote(&self, envelopes: &[MessageEnvelope]) -> Result<usize, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let mut added = 0;
        for envelope in envelopes {
            if self
                .envelopes
                .get(&wtxn, &envelope.content_hash)
                .map_err(lmdb_err)?
                .is_some()
            {
                continue;
            }
            let key = order_key(envelope);
            let record = LocalRecord {
                envelope: envelope.clone(),
                sync_state: SyncState::Synced,
                order_key: key.clone(),
                stored_at: Utc::now(),
            };
            self.envelopes
                .put(&mut wtxn, &envelope.content_hash, &record)
                .map_err(lmdb_err)?;
            self.order
                .put(&mut wtxn, &key, &envelope.content_hash)
                .map_err(lmdb_err)?;
            added += 1;
        }
        wtxn.commit().map_err(lmdb_err)?;
        Ok(added)
    }

    pub fn get(&self, content_hash: &str) -> Result<Option<LocalRecord>, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        self.envelopes.get(&rtxn, content_hash).map_err(lmdb_err)
    }

    /// Envelopes matching `query`, in creation order.
    pub fn query(&self, query: &EnvelopeQuery) -> Result<Vec<MessageEnvelope>, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut skipped = 0;
        for item in self.order.iter(&rtxn).map_err(lmdb_err)? {
            let (_, hash) = item.map_err(lmdb_err)?;
            let Some(record) = self.envelopes.get(&rtxn, hash).map_err(lmdb_err)? else {
                continue;
            };
            if !query.matches(&record.envelope) {
                continue;
            }
            if skipped < query.offset {
                skipped += 1;
                continue;
            }
            out.push(record.envelope);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Up to `limit` envelopes with an order key after `cursor`, oldest first.
    pub fn since(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, MessageEnvelope)>, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        let range: (Bound<&str>, Bound<&str>) = match cursor {
            Some(c) => (Bound::Excluded(c), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let mut out = Vec::new();
        for item in self.order.range(&rtxn, &range).map_err(lmdb_err)? {
            let (key, hash) = item.map_err(lmdb_err)?;
            if let Some(record) = self.envelopes.get(&rtxn, hash).map_err(lmdb_err)? {
                out.push((key.to_string(), record.envelope));
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// The newest `limit` envelopes, oldest first, with the newest order key.
    pub fn recent(&self, limit: usize) -> Result<(Vec<MessageEnvelope>, Option<String>), StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        let mut out = Vec::new();
        let mut newest = None;
        for item in self.order.rev_iter(&rtxn).map_err(lmdb_err)? {
            if out.len() >= limit {
                break;
            }
            let (key, hash) = item.map_err(lmdb_err)?;
            if newest.is_none() {
                newest = Some(key.to_string());
            }
            if let Some(record) = self.envelopes.get(&rtxn, hash).map_err(lmdb_err)? {
                out.push(record.envelope);
            }
        }
        out.reverse();
        Ok((out, newest))
    }

    pub fn envelope_count(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        self.envelopes.len(&rtxn).map_err(lmdb_err)
    }

    /// Delete synced envelopes created before `cutoff`. Pending envelopes are
    /// never pruned.
    pub fn prune_synced(&self, cutoff: Timestamp) -> Result<usize, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let mut doomed = Vec::new();
        for item in self.order.iter(&wtxn).map_err(lmdb_err)? {
            let (key, hash) = item.map_err(lmdb_err)?;
            let Some(record) = self.envelopes.get(&wtxn, hash).map_err(lmdb_err)? else {
                continue;
            };
            if record.envelope.created_at >= cutoff {
                break;
            }
            if record.sync_state == SyncState::Synced {
                doomed.push((key.to_string(), hash.to_string()));
            }
        }
        for (key, hash) in &doomed {
            self.order.delete(&mut wtxn, key).map_err(lmdb_err)?;
            self.envelopes.delete(&mut wtxn, hash).map_err(lmdb_err)?;
        }
        wtxn.commit().map_err(lmdb_err)?;
        Ok(doomed.len())
    }

    // ========================================================================
    // OUTBOX
    // ========================================================================

    /// Mark a record delivered: drop its outbox entry and flag the envelope
    /// synced, atomically. Unknown keys are ignored.
    pub fn ack(&self, order_keys: &[String]) -> Result<usize, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let mut acked = 0;
        for key in order_keys {
            let Some(record) = self.outbox.get(&wtxn, key).map_err(lmdb_err)? else {
                continue;
            };
            self.outbox.delete(&mut wtxn, key).map_err(lmdb_err)?;
            if let Some(mut local) = self
                .envelopes
                .get(&wtxn, &record.content_hash)
                .map_err(lmdb_err)?
            {
                local.sync_state = SyncState::Synced;
                self.envelopes
                    .put(&mut wtxn, &record.content_hash, &local)
                    .map_err(lmdb_err)?;
            }
            acked += 1;
        }
        wtxn.commit().map_err(lmdb_err)?;
        Ok(acked)
    }

    /// Make a record immediately due after its first push failed.
    pub fn release_for_upload(&self, order_key: &str, reason: &str) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        if let Some(mut record) = self.outbox.get(&wtxn, order_key).map_err(lmdb_err)? {
            if record.status == OutboxStatus::Pending {
                record.next_attempt_at = Some(Utc::now());
                record.last_error = Some(reason.to_string());
                self.outbox.put(&mut wtxn, order_key, &record).map_err(lmdb_err)?;
            }
        }
        wtxn.commit().map_err(lmdb_err)
    }

    /// Due pending records in creation order, at most `limit`.
    ///
    /// A node whose oldest undelivered record is not yet due, in flight or
    /// failed contributes nothing further, so records of one node are always
    /// delivered in creation order.
    pub fn due_outbox(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<(String, OutboxRecord)>, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for item in self.outbox.iter(&rtxn).map_err(lmdb_err)? {
            let (key, record) = item.map_err(lmdb_err)?;
            if blocked.contains(&record.node_id) {
                continue;
            }
            if record.is_due(now) {
                out.push((key.to_string(), record));
                if out.len() >= limit {
                    break;
                }
            } else {
                blocked.insert(record.node_id.clone());
            }
        }
        Ok(out)
    }

    /// Flag records as in flight under `batch_id`.
    pub fn mark_sending(&self, order_keys: &[String], batch_id: Uuid) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        for key in order_keys {
            if let Some(mut record) = self.outbox.get(&wtxn, key).map_err(lmdb_err)? {
                record.status = OutboxStatus::Sending;
                record.batch_id = batch_id;
                record.last_attempt = Some(now);
                self.outbox.put(&mut wtxn, key, &record).map_err(lmdb_err)?;
            }
        }
        wtxn.commit().map_err(lmdb_err)
    }

    /// Record a failed attempt: schedule a backoff retry, or flag the record
    /// failed once rejections have spent the budget.
    pub fn record_failure(
        &self,
        order_keys: &[String],
        reason: &str,
        kind: FailureKind,
        retry: &RetryConfig,
        now: Timestamp,
    ) -> Result<Vec<AttemptFailure>, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let mut results = Vec::with_capacity(order_keys.len());
        for key in order_keys {
            let Some(mut record) = self.outbox.get(&wtxn, key).map_err(lmdb_err)? else {
                continue;
            };
            record.attempts = record.attempts.saturating_add(1);
            if kind == FailureKind::Rejected {
                record.retry_count += 1;
            }
            record.last_error = Some(reason.to_string());
            let exhausted =
                kind == FailureKind::Rejected && record.retry_count >= retry.max_retries;
            if exhausted {
                record.status = OutboxStatus::Failed;
                record.next_attempt_at = None;
            } else {
                record.status = OutboxStatus::Pending;
                let delay = chrono::Duration::from_std(retry.backoff_for(record.attempts))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                record.next_attempt_at = Some(now + delay);
            }
            self.outbox.put(&mut wtxn, key, &record).map_err(lmdb_err)?;
            results.push(AttemptFailure {
                order_key: key.clone(),
                retry_count: record.retry_count,
                exhausted,
            });
        }
        wtxn.commit().map_err(lmdb_err)?;
        Ok(results)
    }

    /// Return every failed record to pending. Returns how many were reset.
    pub fn replay_failed(&self) -> Result<usize, StorageError> {
        self.rewrite_outbox(|record| {
            if record.status == OutboxStatus::Failed {
                record.reset_for_replay();
                true
            } else {
                false
            }
        })
    }

    fn recover_sending(&self) -> Result<usize, StorageError> {
        self.rewrite_outbox(|record| {
            if record.status == OutboxStatus::Sending {
                record.status = OutboxStatus::Pending;
                true
            } else {
                false
            }
        })
    }

    fn rewrite_outbox<F>(&self, mut f: F) -> Result<usize, StorageError>
    where
        F: FnMut(&mut OutboxRecord) -> bool,
    {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let mut changed = Vec::new();
        for item in self.outbox.iter(&wtxn).map_err(lmdb_err)? {
            let (key, mut record) = item.map_err(lmdb_err)?;
            if f(&mut record) {
                changed.push((key.to_string(), record));
            }
        }
        for (key, record) in &changed {
            self.outbox.put(&mut wtxn, key, record).map_err(lmdb_err)?;
        }
        wtxn.commit().map_err(lmdb_err)?;
        Ok(changed.len())
    }

    /// All outbox records in creation order.
    pub fn outbox_records(&self) -> Result<Vec<OutboxRecord>, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        let mut out = Vec::new();
        for item in self.outbox.iter(&rtxn).map_err(lmdb_err)? {
            let (_, record) = item.map_err(lmdb_err)?;
            out.push(record);
        }
        Ok(out)
    }

    pub fn outbox_stats(&self) -> Result<OutboxStats, StorageError> {
        let mut stats = OutboxStats::default();
        for record in self.outbox_records()? {
            match record.status {
                OutboxStatus::Pending => {
                    stats.pending += 1;
                    if stats.oldest_pending.is_none() {
                        stats.oldest_pending = Some(record.created_at);
                    }
                }
                OutboxStatus::Sending => stats.sending += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Acked => {}
            }
        }
        Ok(stats)
    }

    pub fn outbox_len(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        self.outbox.len(&rtxn).map_err(lmdb_err)
    }
}
