//! Per-transaction participant for one backing store.
//!
//! A `Datastore` buffers the transaction's reads and writes for its store
//! and runs the store-local half of two-phase commit. The backend is only
//! touched by `prepare`, `commit`, `abort`, and reads that miss both
//! caches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use weave_common::{Result, TxnError, TxnState};
use weave_hlc::wall_ms;

use crate::connector::{Connector, SharedConnector};
use crate::item::DataItem;
use crate::resolver::{validate_predicates, Predicate, Resolver};
use crate::transaction::TxnContext;

/// One prepared record, as referenced by the facade's commit request:
/// the key and the version its PREPARED head carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommitEntry {
    pub key: String,
    pub version: String,
}

/// A buffered write. `base` is the snapshot the write was made against;
/// its version is the compare-and-swap token prepare will be keyed on.
#[derive(Debug, Clone)]
struct PendingWrite {
    value: String,
    is_deleted: bool,
    base: Option<DataItem>,
}

/// One store joined to a transaction.
pub struct Datastore {
    name: String,
    conn: SharedConnector,
    read_cache: HashMap<String, DataItem>,
    write_cache: HashMap<String, PendingWrite>,
    /// Head items successfully written by prepare, carrying their stored
    /// versions; drained by the commit phase.
    prepared: Vec<DataItem>,
    /// Assumptions recorded by reads under AssumeCommit/AssumeAbort,
    /// keyed by the owning transaction id; re-checked during prepare.
    validations: HashMap<String, Predicate>,
}

impl Datastore {
    pub fn new(name: impl Into<String>, conn: SharedConnector) -> Self {
        Self {
            name: name.into(),
            conn,
            read_cache: HashMap::new(),
            write_cache: HashMap::new(),
            prepared: Vec::new(),
            validations: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn connector(&self) -> SharedConnector {
        self.conn.clone()
    }

    /// Reset per-transaction state and make sure the backend is reachable.
    pub async fn start(&mut self) -> Result<()> {
        self.conn.connect().await?;
        self.read_cache.clear();
        self.write_cache.clear();
        self.prepared.clear();
        self.validations.clear();
        Ok(())
    }

    /// Read a record: own writes first, then the read snapshot, then the
    /// backend (resolving foreign PREPARED heads on the way).
    pub async fn read(&mut self, ctx: &TxnContext, key: &str) -> Result<DataItem> {
        if let Some(pending) = self.write_cache.get(key) {
            if pending.is_deleted {
                return Err(TxnError::KeyNotFound);
            }
            return Ok(DataItem::new(key, pending.value.clone())
                .with_txn_id(&*ctx.txn_id)
                .with_t_valid(ctx.start_time));
        }
        if let Some(item) = self.read_cache.get(key) {
            return Ok(item.clone());
        }

        let resolver = Resolver::new(&*self.conn, &*ctx.global, ctx.read_strategy);
        let resolved = resolver.fetch(key, ctx.start_time).await?;
        if let Some((owner, predicate)) = resolved.assumption {
            self.validations.insert(owner, predicate);
        }
        self.read_cache.insert(key.to_string(), resolved.item.clone());
        Ok(resolved.item)
    }

    /// Buffer a write; the backend is untouched until prepare.
    pub fn write(&mut self, key: &str, value: String) {
        let base = self.base_for(key);
        self.write_cache.insert(
            key.to_string(),
            PendingWrite {
                value,
                is_deleted: false,
                base,
            },
        );
    }

    /// Buffer a deletion as a tombstone write.
    pub fn delete(&mut self, key: &str) {
        let base = self.base_for(key);
        self.write_cache.insert(
            key.to_string(),
            PendingWrite {
                value: String::new(),
                is_deleted: true,
                base,
            },
        );
    }

    /// Rewriting a key keeps the original base snapshot so the prepare
    /// stays keyed on the version actually read.
    fn base_for(&self, key: &str) -> Option<DataItem> {
        match self.write_cache.get(key) {
            Some(pending) => pending.base.clone(),
            None => self.read_cache.get(key).cloned(),
        }
    }

    /// Store-local prepare: take PREPARED ownership of every buffered
    /// write with one conditional update each. Any version mismatch fails
    /// the whole prepare.
    pub async fn prepare(&mut self, ctx: &TxnContext) -> Result<()> {
        self.validate_assumptions(ctx).await?;

        let lease = wall_ms() + ctx.lease_ms;
        let writes: Vec<(String, PendingWrite)> = self
            .write_cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, pending) in writes {
            let item = self.build_head(ctx, &key, &pending, TxnState::Prepared, lease)?;
            let do_create = pending.base.is_none();
            let mut stored = item.clone();
            stored.version = self
                .conn
                .conditional_update(&key, item, do_create)
                .await?;
            self.prepared.push(stored);
        }
        debug!(ds = %self.name, records = self.prepared.len(), "prepare phase done");
        Ok(())
    }

    /// Flip every prepared record to COMMITTED. A mismatch means a reader
    /// already rolled us forward and is absorbed.
    pub async fn commit(&mut self) -> Result<()> {
        let work = std::mem::take(&mut self.prepared);
        commit_records(&*self.conn, work).await;
        self.write_cache.clear();
        Ok(())
    }

    /// Best-effort rollback of records still PREPARED by this transaction.
    ///
    /// With `has_committed`, the transaction was forced off its TSR after
    /// the sync point; committed records are left untouched (the state
    /// check below does that) and the commit may be partially visible.
    pub async fn abort(&mut self, ctx: &TxnContext, has_committed: bool) -> Result<()> {
        if has_committed {
            warn!(
                ds = %self.name,
                txn_id = %ctx.txn_id,
                "aborting past the sync point; commit may be partially visible"
            );
        }
        let keys: Vec<String> = self.write_cache.keys().cloned().collect();
        rollback_keys(&*self.conn, &ctx.txn_id, &keys).await;
        self.read_cache.clear();
        self.write_cache.clear();
        self.prepared.clear();
        self.validations.clear();
        Ok(())
    }

    /// Single-write fast path: jump straight to a COMMITTED head. No
    /// PREPARED intermediate, no TSR.
    pub async fn one_phase_commit(&mut self, ctx: &TxnContext) -> Result<()> {
        let writes: Vec<(String, PendingWrite)> = self
            .write_cache
            .drain()
            .collect();
        for (key, pending) in writes {
            let item = self.build_head(ctx, &key, &pending, TxnState::Committed, 0)?;
            let do_create = pending.base.is_none();
            self.conn.conditional_update(&key, item, do_create).await?;
        }
        Ok(())
    }

    /// Hand the prepared records over for a detached commit phase.
    pub(crate) fn take_commit_work(&mut self) -> Vec<DataItem> {
        self.write_cache.clear();
        std::mem::take(&mut self.prepared)
    }

    pub(crate) fn write_keys(&self) -> Vec<String> {
        self.write_cache.keys().cloned().collect()
    }

    fn build_head(
        &self,
        ctx: &TxnContext,
        key: &str,
        pending: &PendingWrite,
        state: TxnState,
        lease: i64,
    ) -> Result<DataItem> {
        let mut item = DataItem::new(key, pending.value.clone())
            .with_txn_id(&*ctx.txn_id)
            .with_txn_state(state)
            .with_t_valid(ctx.commit_time)
            .with_t_lease(lease)
            .deleted(pending.is_deleted);
        if let Some(base) = &pending.base {
            item.set_prev_item(base)?;
            item.truncate_chain(ctx.max_record_len)?;
            item.version = base.version.clone();
        }
        Ok(item)
    }

    /// Re-check every read-time assumption against the TSR; a contradicted
    /// assumption fails the prepare like any other stale precondition.
    async fn validate_assumptions(&self, ctx: &TxnContext) -> Result<()> {
        validate_predicates(&*ctx.global, &self.validations).await
    }
}

/// Commit-phase update for a batch of prepared records. Errors are logged,
/// never raised: the transaction is already durable behind its TSR and any
/// reader will finish the job.
pub(crate) async fn commit_records(conn: &dyn Connector, items: Vec<DataItem>) {
    for mut item in items {
        item.txn_state = TxnState::Committed;
        let key = item.key.clone();
        match conn.conditional_update(&key, item, false).await {
            Ok(_) => {}
            Err(TxnError::VersionMismatch) => {
                debug!(key = %key, "record already rolled forward by a reader");
            }
            Err(e) => warn!(key = %key, error = %e, "commit-phase update failed"),
        }
    }
}

/// Abort-side rollback of whatever is still PREPARED by `txn_id` among
/// `keys`. Best-effort by design.
pub async fn rollback_keys(conn: &dyn Connector, txn_id: &str, keys: &[String]) {
    for key in keys {
        let head = match conn.get_item(key).await {
            Ok(item) => item,
            Err(TxnError::KeyNotFound) => continue,
            Err(e) => {
                warn!(key = %key, error = %e, "abort: fetch failed");
                continue;
            }
        };
        if head.txn_id != txn_id || head.txn_state != TxnState::Prepared {
            continue;
        }
        match head.prev_item() {
            Ok(Some(mut prev)) => {
                prev.version = head.version.clone();
                match conn.conditional_update(key, prev, false).await {
                    Ok(_) => debug!(key = %key, "abort: rolled back to previous version"),
                    Err(TxnError::VersionMismatch) => {
                        debug!(key = %key, "abort: record already resolved elsewhere");
                    }
                    Err(e) => warn!(key = %key, error = %e, "abort: rollback failed"),
                }
            }
            Ok(None) => {
                if let Err(e) = conn.delete(key).await {
                    warn!(key = %key, error = %e, "abort: delete failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "abort: corrupt previous version"),
        }
    }
}
