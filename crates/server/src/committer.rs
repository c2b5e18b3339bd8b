//! Server-side prepare, commit, and abort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use weave_common::{RecordConfig, Result, Timestamp, TxnError, TxnState};
use weave_hlc::{wall_ms, TimeMode, TimeSource};
use weave_txn::{
    rollback_keys, validate_predicates, CommitEntry, DataItem, Predicate, SharedConnector,
};

use crate::cacher::ItemCache;

/// Runs the write-side protocol steps on behalf of remote coordinators.
pub struct Committer {
    conns: HashMap<String, SharedConnector>,
    cache: Arc<ItemCache>,
    time_source: Arc<dyn TimeSource>,
    lease: Duration,
}

impl Committer {
    pub fn new(
        conns: HashMap<String, SharedConnector>,
        cache: Arc<ItemCache>,
        time_source: Arc<dyn TimeSource>,
        lease: Duration,
    ) -> Self {
        Self {
            conns,
            cache,
            time_source,
            lease,
        }
    }

    fn conn(&self, ds_name: &str) -> Result<&SharedConnector> {
        self.conns
            .get(ds_name)
            .ok_or_else(|| TxnError::Config(format!("datastore not found: {}", ds_name)))
    }

    /// Validate assumptions, allocate the commit timestamp, and take
    /// PREPARED ownership of every item. The items arrive fully linked
    /// (prev, txn id) from the client; the server stamps times and leases.
    pub async fn prepare(
        &self,
        ds_name: &str,
        items: Vec<DataItem>,
        _start_time: Timestamp,
        config: &RecordConfig,
        validation_map: &HashMap<String, Predicate>,
    ) -> Result<(HashMap<String, String>, Timestamp)> {
        let conn = self.conn(ds_name)?.clone();
        let global = self.conn(&config.global_name)?.clone();

        validate_predicates(&*global, validation_map).await?;

        let t_commit = self.time_source.get_time(TimeMode::Commit).await?;
        let lease = wall_ms() + self.lease.as_millis() as i64;

        let mut ver_map = HashMap::new();
        for mut item in items {
            item.txn_state = TxnState::Prepared;
            item.t_valid = t_commit;
            item.t_lease = lease;
            item.truncate_chain(config.max_record_len)?;
            let do_create = item.version.is_empty();
            let key = item.key.clone();
            let version = conn.conditional_update(&key, item, do_create).await?;
            self.cache.invalidate(ds_name, &key);
            ver_map.insert(key, version);
        }
        debug!(ds_name, records = ver_map.len(), t_commit, "prepared");
        Ok((ver_map, t_commit))
    }

    /// Flip prepared records to COMMITTED. Mismatches mean a reader beat
    /// us to it and are absorbed; this path must stay idempotent.
    pub async fn commit(
        &self,
        ds_name: &str,
        list: Vec<CommitEntry>,
        _t_commit: Timestamp,
    ) -> Result<()> {
        let conn = self.conn(ds_name)?.clone();
        for entry in list {
            match conn.get_item(&entry.key).await {
                Ok(head)
                    if head.version == entry.version && head.txn_state == TxnState::Prepared =>
                {
                    let mut committed = head;
                    committed.txn_state = TxnState::Committed;
                    match conn
                        .conditional_update(&entry.key, committed, false)
                        .await
                    {
                        Ok(_) => {}
                        Err(TxnError::VersionMismatch) => {
                            debug!(key = %entry.key, "record already rolled forward by a reader");
                        }
                        Err(e) => warn!(key = %entry.key, error = %e, "commit update failed"),
                    }
                }
                Ok(_) => debug!(key = %entry.key, "record already resolved"),
                Err(TxnError::KeyNotFound) => debug!(key = %entry.key, "record gone"),
                Err(e) => warn!(key = %entry.key, error = %e, "commit fetch failed"),
            }
            self.cache.invalidate(ds_name, &entry.key);
        }
        Ok(())
    }

    /// Roll back whatever `txn_id` still holds PREPARED among `key_list`.
    pub async fn abort(&self, ds_name: &str, key_list: &[String], txn_id: &str) -> Result<()> {
        let conn = self.conn(ds_name)?.clone();
        rollback_keys(&*conn, txn_id, key_list).await;
        for key in key_list {
            self.cache.invalidate(ds_name, key);
        }
        Ok(())
    }
}
