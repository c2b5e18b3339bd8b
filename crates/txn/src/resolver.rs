//! Version-chain resolution for the read path.
//!
//! A reader that fetches a record may find its head owned by some other,
//! possibly dead, transaction. Resolution consults the owner's TSR and
//! either rolls the record forward to COMMITTED, rolls it back to its
//! previous version, or (when the owner cannot be decided yet) applies
//! the configured read strategy. Both the local datastore participant and
//! the remote facade's reader go through this path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use weave_common::{ReadStrategy, Result, Timestamp, TxnError, TxnState};
use weave_hlc::wall_ms;

use crate::connector::Connector;
use crate::item::DataItem;
use crate::tsr::{Tsr, TsrCreate};

/// Bound on re-reads after losing a conditional-update race.
const MAX_RESOLUTION_ATTEMPTS: usize = 8;

/// A condition attached to a read served under AssumeCommit/AssumeAbort:
/// the assumed outcome must hold at prepare time or the transaction fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    /// Key whose head record the assumption was made about.
    pub item_key: String,
    /// Assumed outcome of the owning transaction.
    pub state: TxnState,
    /// Lease deadline observed on the assumed record.
    pub lease_time: i64,
}

/// Result of a resolved fetch.
#[derive(Debug, Clone)]
pub struct ResolvedRead {
    pub item: DataItem,
    /// Strategy that actually produced the item; `Normal` unless an
    /// assumption was applied.
    pub strategy: ReadStrategy,
    /// Owning transaction id and predicate recorded for an assumption.
    pub assumption: Option<(String, Predicate)>,
}

enum Resolution {
    /// The head is settled (possibly after our own roll-forward/back).
    Settled(DataItem),
    /// Rollback removed the only version; the key no longer exists.
    Gone,
    /// Lost a conditional-update race; re-read and try again.
    Race,
    /// Unresolvable head bridged by a read-strategy assumption.
    Assumed {
        item: DataItem,
        strategy: ReadStrategy,
        owner: String,
        predicate: Predicate,
    },
}

/// Fetches the deepest version visible at a given start time, resolving
/// foreign PREPARED heads along the way.
pub struct Resolver<'a> {
    conn: &'a dyn Connector,
    global: &'a dyn Connector,
    strategy: ReadStrategy,
}

impl<'a> Resolver<'a> {
    pub fn new(conn: &'a dyn Connector, global: &'a dyn Connector, strategy: ReadStrategy) -> Self {
        Self {
            conn,
            global,
            strategy,
        }
    }

    /// Fetch the latest COMMITTED version with `t_valid <= start_time`.
    ///
    /// `KeyNotFound` when no such version exists or it is a tombstone;
    /// `ReadFailed` when the head cannot be decided or races exhaust the
    /// retry budget. `ReadFailed` is transient, the caller may retry.
    pub async fn fetch(&self, key: &str, start_time: Timestamp) -> Result<ResolvedRead> {
        for _ in 0..MAX_RESOLUTION_ATTEMPTS {
            let head = self.conn.get_item(key).await?;
            let (candidate, strategy, assumption) = match head.txn_state {
                TxnState::Committed => (head, ReadStrategy::Normal, None),
                TxnState::Prepared => match self.resolve_prepared(key, head).await? {
                    Resolution::Settled(item) => (item, ReadStrategy::Normal, None),
                    Resolution::Gone => return Err(TxnError::KeyNotFound),
                    Resolution::Race => continue,
                    Resolution::Assumed {
                        item,
                        strategy,
                        owner,
                        predicate,
                    } => (item, strategy, Some((owner, predicate))),
                },
                other => {
                    return Err(TxnError::Backend(format!(
                        "record {} persisted in state {}",
                        key, other
                    )))
                }
            };
            let item = Self::latest_visible(candidate, start_time)?;
            return Ok(ResolvedRead {
                item,
                strategy,
                assumption,
            });
        }
        Err(TxnError::ReadFailed)
    }

    async fn resolve_prepared(&self, key: &str, head: DataItem) -> Result<Resolution> {
        let tsr = Tsr::new(self.global);
        let owner = head.txn_id.clone();
        match tsr.read(&owner).await? {
            Some(TxnState::Committed) => self.roll_forward(key, head).await,
            Some(_) => self.roll_back(key, head).await,
            None if wall_ms() > head.t_lease => {
                // The owner left a PREPARED record past its lease without
                // reaching the sync point; seize the slot and decide it.
                match tsr.create(&owner, TxnState::Aborted).await? {
                    TsrCreate::Created => self.roll_back(key, head).await,
                    TsrCreate::Exists(TxnState::Committed) => self.roll_forward(key, head).await,
                    TsrCreate::Exists(_) => self.roll_back(key, head).await,
                }
            }
            None => match self.strategy {
                ReadStrategy::Normal => Err(TxnError::ReadFailed),
                ReadStrategy::AssumeCommit => {
                    let predicate = Predicate {
                        item_key: key.to_string(),
                        state: TxnState::Committed,
                        lease_time: head.t_lease,
                    };
                    let mut assumed = head;
                    assumed.txn_state = TxnState::Committed;
                    Ok(Resolution::Assumed {
                        item: assumed,
                        strategy: ReadStrategy::AssumeCommit,
                        owner,
                        predicate,
                    })
                }
                ReadStrategy::AssumeAbort => {
                    let predicate = Predicate {
                        item_key: key.to_string(),
                        state: TxnState::Aborted,
                        lease_time: head.t_lease,
                    };
                    match head.prev_item()? {
                        Some(prev) => Ok(Resolution::Assumed {
                            item: prev,
                            strategy: ReadStrategy::AssumeAbort,
                            owner,
                            predicate,
                        }),
                        // Assumed abort of the first-ever version: nothing
                        // to fall back to. A later write to this key will
                        // fail its insert anyway, so no predicate needed.
                        None => Err(TxnError::KeyNotFound),
                    }
                }
            },
        }
    }

    /// Rewrite a PREPARED head as COMMITTED on behalf of its owner.
    /// Idempotent: a lost race means someone else already did it.
    async fn roll_forward(&self, key: &str, head: DataItem) -> Result<Resolution> {
        let mut committed = head;
        committed.txn_state = TxnState::Committed;
        match self
            .conn
            .conditional_update(key, committed.clone(), false)
            .await
        {
            Ok(new_version) => {
                debug!(key, owner = %committed.txn_id, "rolled record forward");
                committed.version = new_version;
                Ok(Resolution::Settled(committed))
            }
            Err(TxnError::VersionMismatch) => Ok(Resolution::Race),
            Err(e) => Err(e),
        }
    }

    /// Replace a PREPARED head with its previous version, or delete the
    /// record when there is none.
    async fn roll_back(&self, key: &str, head: DataItem) -> Result<Resolution> {
        match head.prev_item()? {
            Some(mut prev) => {
                // The stored version token keeps counting through the
                // rollback so concurrent updates still serialize.
                prev.version = head.version.clone();
                match self.conn.conditional_update(key, prev.clone(), false).await {
                    Ok(new_version) => {
                        debug!(key, owner = %head.txn_id, "rolled record back");
                        prev.version = new_version;
                        Ok(Resolution::Settled(prev))
                    }
                    Err(TxnError::VersionMismatch) => Ok(Resolution::Race),
                    Err(e) => Err(e),
                }
            }
            None => {
                self.conn.delete(key).await?;
                debug!(key, owner = %head.txn_id, "rolled first version back");
                Ok(Resolution::Gone)
            }
        }
    }

    /// Walk the chain for the deepest COMMITTED version visible at
    /// `start_time`.
    fn latest_visible(head: DataItem, start_time: Timestamp) -> Result<DataItem> {
        let mut cur = head;
        loop {
            if cur.txn_state == TxnState::Committed && cur.t_valid <= start_time {
                if cur.is_deleted {
                    return Err(TxnError::KeyNotFound);
                }
                return Ok(cur);
            }
            match cur.prev_item()? {
                Some(prev) => cur = prev,
                None => return Err(TxnError::KeyNotFound),
            }
        }
    }
}

/// Re-check read-time assumptions against the TSR on the global store.
///
/// A contradicted assumption fails like any other stale precondition:
/// `VersionMismatch`, which the prepare phase turns into an abort. An
/// assumed abort whose owner is still silent past its lease is settled
/// here by seizing the TSR slot.
pub async fn validate_predicates(
    global: &dyn Connector,
    predicates: &HashMap<String, Predicate>,
) -> Result<()> {
    let tsr = Tsr::new(global);
    for (owner, predicate) in predicates {
        let holds = match predicate.state {
            TxnState::Committed => {
                matches!(tsr.read(owner).await?, Some(TxnState::Committed))
            }
            TxnState::Aborted => match tsr.read(owner).await? {
                Some(TxnState::Aborted) => true,
                None if wall_ms() > predicate.lease_time => matches!(
                    tsr.create(owner, TxnState::Aborted).await?,
                    TsrCreate::Created | TsrCreate::Exists(TxnState::Aborted)
                ),
                _ => false,
            },
            other => {
                return Err(TxnError::Config(format!(
                    "predicate with non-terminal state {}",
                    other
                )))
            }
        };
        if !holds {
            debug!(owner = %owner, key = %predicate.item_key, "read assumption contradicted");
            return Err(TxnError::VersionMismatch);
        }
    }
    Ok(())
}
