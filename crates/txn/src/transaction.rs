//! The transaction coordinator.
//!
//! Owns the participant map and the state machine, allocates ids and
//! timestamps, and serializes the commit through the TSR on the global
//! store. A `Transaction` belongs to exactly one logical worker; the
//! connectors underneath it are the shared, thread-safe layer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, warn};

use weave_common::{
    AsyncLevel, ConcurrentOptimizationLevel, Config, IdGenerator, ReadStrategy, Result, Timestamp,
    TxnError, TxnState, UuidIdGenerator,
};
use weave_hlc::{LocalTimeSource, TimeMode, TimeSource};

use crate::connector::SharedConnector;
use crate::datastore::{commit_records, rollback_keys, Datastore};
use crate::item::DataItem;
use crate::tsr::{Tsr, TsrCreate};

/// The transaction's identity as handed to participants: ids, timestamps,
/// the relevant configuration, and the TSR capability (the global store's
/// connector, looked up by name rather than owned).
#[derive(Clone)]
pub struct TxnContext {
    pub txn_id: String,
    pub start_time: Timestamp,
    pub commit_time: Timestamp,
    pub global: SharedConnector,
    pub read_strategy: ReadStrategy,
    pub max_record_len: usize,
    pub lease_ms: i64,
}

/// A single logical transaction across several datastores.
pub struct Transaction {
    txn_id: String,
    start_time: Timestamp,
    commit_time: Timestamp,
    state: TxnState,
    is_read_only: bool,
    write_count: usize,
    stores: HashMap<String, Datastore>,
    global_name: Option<String>,
    time_source: Arc<dyn TimeSource>,
    id_generator: Arc<dyn IdGenerator>,
    config: Config,
}

impl Transaction {
    /// Create a transaction with the default configuration and a local
    /// hybrid clock. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            txn_id: String::new(),
            start_time: 0,
            commit_time: 0,
            state: TxnState::Empty,
            is_read_only: true,
            write_count: 0,
            stores: HashMap::new(),
            global_name: None,
            time_source: Arc::new(LocalTimeSource::new()),
            id_generator: Arc::new(UuidIdGenerator),
            config,
        }
    }

    /// Swap in a different timestamp authority (e.g. the remote oracle).
    pub fn set_time_source(&mut self, time_source: Arc<dyn TimeSource>) {
        self.time_source = time_source;
    }

    pub fn set_id_generator(&mut self, id_generator: Arc<dyn IdGenerator>) {
        self.id_generator = id_generator;
    }

    /// Join a datastore to the transaction. Names must be unique.
    pub fn add_datastore(&mut self, ds: Datastore) -> Result<()> {
        if self.stores.contains_key(ds.name()) {
            return Err(TxnError::Config(format!(
                "duplicated datastore name: {}",
                ds.name()
            )));
        }
        self.stores.insert(ds.name().to_string(), ds);
        Ok(())
    }

    /// Designate the participant hosting the TSR namespace.
    pub fn set_global_datastore(&mut self, name: &str) -> Result<()> {
        if !self.stores.contains_key(name) {
            return Err(TxnError::Config(format!("datastore not found: {}", name)));
        }
        self.global_name = Some(name.to_string());
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.txn_id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn commit_time(&self) -> Timestamp {
        self.commit_time
    }

    /// Begin the transaction: allocate an id, fetch the start timestamp,
    /// and reset every participant.
    pub async fn start(&mut self) -> Result<()> {
        if self.stores.is_empty() {
            return Err(TxnError::Config("no datastores added".into()));
        }
        if self.global_name.is_none() {
            return Err(TxnError::Config("global datastore not set".into()));
        }
        self.set_state(TxnState::Started)?;

        self.txn_id = self.id_generator.generate_id();
        self.start_time = self.time_source.get_time(TimeMode::Start).await?;
        info!(txn_id = %self.txn_id, "starting transaction");
        for ds in self.stores.values_mut() {
            ds.start().await?;
        }
        Ok(())
    }

    /// Read `key` from the named datastore and decode the payload.
    pub async fn read<T: DeserializeOwned>(&mut self, ds_name: &str, key: &str) -> Result<T> {
        self.check_state(TxnState::Started)?;
        let ctx = self.ctx()?;
        let deadline = self.config.operation_timeout;
        let ds = self
            .stores
            .get_mut(ds_name)
            .ok_or_else(|| TxnError::Config(format!("datastore not found: {}", ds_name)))?;
        let item = with_deadline(deadline, ds.read(&ctx, key)).await?;
        Ok(serde_json::from_str(&item.value)?)
    }

    /// Buffer a write; nothing reaches the backend until commit.
    pub fn write<T: Serialize>(&mut self, ds_name: &str, key: &str, value: &T) -> Result<()> {
        self.check_state(TxnState::Started)?;
        let payload = serde_json::to_string(value)?;
        let ds = self
            .stores
            .get_mut(ds_name)
            .ok_or_else(|| TxnError::Config(format!("datastore not found: {}", ds_name)))?;
        ds.write(key, payload);
        self.is_read_only = false;
        self.write_count += 1;
        Ok(())
    }

    /// Buffer a deletion as a tombstone write.
    pub fn delete(&mut self, ds_name: &str, key: &str) -> Result<()> {
        self.check_state(TxnState::Started)?;
        let ds = self
            .stores
            .get_mut(ds_name)
            .ok_or_else(|| TxnError::Config(format!("datastore not found: {}", ds_name)))?;
        ds.delete(key);
        self.is_read_only = false;
        self.write_count += 1;
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// Read-only transactions return immediately: no PREPARED state, no
    /// TSR. Otherwise the prepare phase runs on every participant, the
    /// atomic TSR creation is the commit point, and the commit phase is
    /// recovery-idempotent behind it.
    pub async fn commit(&mut self) -> Result<()> {
        self.set_state(TxnState::Committed)?;

        if self.is_read_only {
            info!(txn_id = %self.txn_id, "read-only transaction, commit complete");
            return Ok(());
        }

        self.commit_time = self.time_source.get_time(TimeMode::Commit).await?;

        if self.config.enable_one_phase && self.write_count == 1 {
            return self.one_phase_commit().await;
        }

        // ---- Prepare phase -------------------------------------------
        let ctx = self.ctx()?;
        let deadline = self.config.operation_timeout;
        let mut first_failure: Option<(String, TxnError)> = None;
        match self.config.concurrent_optimization_level {
            ConcurrentOptimizationLevel::ParallelizeOnPrepare => {
                let results = join_all(self.stores.iter_mut().map(|(name, ds)| {
                    let ctx = ctx.clone();
                    async move { (name.clone(), with_deadline(deadline, ds.prepare(&ctx)).await) }
                }))
                .await;
                for (name, result) in results {
                    if let Err(e) = result {
                        if first_failure.is_none() {
                            first_failure = Some((name, e));
                        }
                    }
                }
            }
            ConcurrentOptimizationLevel::Default => {
                for (name, ds) in self.stores.iter_mut() {
                    if let Err(e) = with_deadline(deadline, ds.prepare(&ctx)).await {
                        if first_failure.is_none() {
                            first_failure = Some((name.clone(), e));
                        }
                    }
                }
            }
        }
        if let Some((ds_name, cause)) = first_failure {
            error!(txn_id = %self.txn_id, ds = %ds_name, error = %cause, "prepare phase failed");
            self.spawn_abort();
            return Err(cause);
        }

        // ---- Sync point ----------------------------------------------
        // The insert-if-absent on the TSR slot is the commit point; a
        // pre-existing record means a racer already decided us.
        match Tsr::new(&*ctx.global)
            .create(&self.txn_id, TxnState::Committed)
            .await
        {
            Ok(TsrCreate::Created) => {}
            Ok(TsrCreate::Exists(state)) => {
                error!(txn_id = %self.txn_id, tsr = %state, "lost the TSR slot");
                self.spawn_abort();
                return Err(TxnError::Backend(
                    "transaction aborted by another transaction".into(),
                ));
            }
            Err(e) => {
                self.spawn_abort();
                return Err(e);
            }
        }

        // ---- Commit phase --------------------------------------------
        match self.config.async_level {
            AsyncLevel::Two => {
                let work: Vec<(SharedConnector, Vec<DataItem>)> = self
                    .stores
                    .values_mut()
                    .map(|ds| (ds.connector(), ds.take_commit_work()))
                    .collect();
                let global = ctx.global.clone();
                let txn_id = self.txn_id.clone();
                tokio::spawn(async move {
                    join_all(work.into_iter().map(|(conn, items)| async move {
                        commit_records(&*conn, items).await;
                    }))
                    .await;
                    if let Err(e) = Tsr::new(&*global).delete(&txn_id).await {
                        warn!(txn_id = %txn_id, error = %e, "TSR delete failed");
                    }
                });
            }
            level => {
                let _ = join_all(self.stores.values_mut().map(|ds| ds.commit())).await;
                let global = ctx.global.clone();
                let txn_id = self.txn_id.clone();
                if level == AsyncLevel::One {
                    tokio::spawn(async move {
                        if let Err(e) = Tsr::new(&*global).delete(&txn_id).await {
                            warn!(txn_id = %txn_id, error = %e, "TSR delete failed");
                        }
                    });
                } else if let Err(e) = Tsr::new(&*global).delete(&self.txn_id).await {
                    // The transaction is already durable; a lingering TSR
                    // is garbage but harmless.
                    warn!(txn_id = %self.txn_id, error = %e, "TSR delete failed");
                }
            }
        }
        info!(txn_id = %self.txn_id, "transaction committed");
        Ok(())
    }

    /// Abort the transaction. Best-effort: participant failures are
    /// logged, never propagated.
    pub async fn abort(&mut self) -> Result<()> {
        let last = self.state;
        self.set_state(TxnState::Aborted)?;
        let has_committed = last == TxnState::Committed;
        info!(txn_id = %self.txn_id, has_committed, "aborting transaction");

        let ctx = self.ctx()?;
        if let Err(e) = Tsr::new(&*ctx.global)
            .write(&self.txn_id, TxnState::Aborted)
            .await
        {
            warn!(txn_id = %self.txn_id, error = %e, "failed to write ABORTED TSR");
        }
        for ds in self.stores.values_mut() {
            if let Err(e) = ds.abort(&ctx, has_committed).await {
                error!(txn_id = %self.txn_id, ds = %ds.name(), error = %e, "abort failed");
            }
        }
        Ok(())
    }

    /// Single-write fast path; jumps straight to COMMITTED heads.
    async fn one_phase_commit(&mut self) -> Result<()> {
        let ctx = self.ctx()?;
        let mut failure: Option<(String, TxnError)> = None;
        for ds in self.stores.values_mut() {
            if let Err(e) = ds.one_phase_commit(&ctx).await {
                failure = Some((ds.name().to_string(), e));
                break;
            }
        }
        if let Some((ds_name, cause)) = failure {
            error!(txn_id = %self.txn_id, ds = %ds_name, error = %cause, "one-phase commit failed");
            self.spawn_abort();
            return Err(cause);
        }
        info!(txn_id = %self.txn_id, "transaction committed in one phase");
        Ok(())
    }

    /// Drive the transaction into abort without blocking the caller; the
    /// rollback work is handed to a detached task. Readers chasing these
    /// records are the backstop if the task dies with the process.
    fn spawn_abort(&mut self) {
        let last = self.state;
        if self.set_state(TxnState::Aborted).is_err() {
            return;
        }
        let has_committed = last == TxnState::Committed;
        let ctx = match self.ctx() {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        let work: Vec<(SharedConnector, Vec<String>)> = self
            .stores
            .values()
            .map(|ds| (ds.connector(), ds.write_keys()))
            .collect();
        let txn_id = self.txn_id.clone();
        tokio::spawn(async move {
            info!(txn_id = %txn_id, has_committed, "aborting transaction in background");
            if let Err(e) = Tsr::new(&*ctx.global).write(&txn_id, TxnState::Aborted).await {
                warn!(txn_id = %txn_id, error = %e, "failed to write ABORTED TSR");
            }
            for (conn, keys) in work {
                rollback_keys(&*conn, &txn_id, &keys).await;
            }
        });
    }

    fn ctx(&self) -> Result<TxnContext> {
        let global_name = self
            .global_name
            .as_ref()
            .ok_or_else(|| TxnError::Config("global datastore not set".into()))?;
        let global = self
            .stores
            .get(global_name)
            .ok_or_else(|| TxnError::Config(format!("datastore not found: {}", global_name)))?
            .connector();
        Ok(TxnContext {
            txn_id: self.txn_id.clone(),
            start_time: self.start_time,
            commit_time: self.commit_time,
            global,
            read_strategy: self.config.read_strategy,
            max_record_len: self.config.max_record_len,
            lease_ms: self.config.lease_duration.as_millis() as i64,
        })
    }

    fn set_state(&mut self, next: TxnState) -> Result<()> {
        let legal = matches!(
            (self.state, next),
            (TxnState::Empty, TxnState::Started)
                | (TxnState::Started, TxnState::Committed)
                | (TxnState::Started, TxnState::Aborted)
                | (TxnState::Committed, TxnState::Aborted)
        );
        if !legal {
            return Err(TxnError::StateViolation(format!(
                "{} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn check_state(&self, expected: TxnState) -> Result<()> {
        if self.state != expected {
            return Err(TxnError::StateViolation(format!(
                "expected {}, found {}",
                expected, self.state
            )));
        }
        Ok(())
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Cap a backend operation with the configured deadline; expiry becomes a
/// transient backend error, which the commit path treats as a prepare
/// failure.
async fn with_deadline<T>(deadline: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TxnError::Backend("operation deadline exceeded".into())),
    }
}
