//! Transaction Status Record maintenance.
//!
//! The TSR is a single small record keyed by transaction id on the global
//! store, whose value is COMMITTED or ABORTED. Its atomic insert-if-absent
//! creation is the one mutually-exclusive critical section of the whole
//! protocol: whoever creates it decides the transaction.

use tracing::debug;

use weave_common::{Result, TxnError, TxnState};

use crate::connector::Connector;
use crate::item::DataItem;

/// Outcome of a create attempt on the TSR slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsrCreate {
    /// We won the slot; the passed state is now the transaction's truth.
    Created,
    /// Someone else decided the transaction first.
    Exists(TxnState),
}

/// Capability view over the global store's connector.
///
/// Borrowed, never owned: the global store is an ordinary participant and
/// this struct is just the TSR-shaped window onto it.
pub struct Tsr<'a> {
    conn: &'a dyn Connector,
}

impl<'a> Tsr<'a> {
    pub fn new(conn: &'a dyn Connector) -> Self {
        Self { conn }
    }

    /// Atomically create the TSR if absent.
    ///
    /// Realized as a conditional update expecting no stored record; the
    /// backend's insert-if-absent is the linearization point, so exactly
    /// one caller per transaction id ever sees `Created`.
    pub async fn create(&self, txn_id: &str, state: TxnState) -> Result<TsrCreate> {
        let item = DataItem::new(txn_id, state.to_string()).with_txn_state(TxnState::Committed);
        match self.conn.conditional_update(txn_id, item, true).await {
            Ok(_) => {
                debug!(txn_id, %state, "TSR created");
                Ok(TsrCreate::Created)
            }
            Err(TxnError::VersionMismatch) => match self.read(txn_id).await? {
                Some(existing) => Ok(TsrCreate::Exists(existing)),
                // Deleted between our attempt and the re-read; the
                // transaction it belonged to is already settled.
                None => Err(TxnError::ReadFailed),
            },
            Err(e) => Err(e),
        }
    }

    /// Read the recorded state, or `None` when no TSR exists.
    pub async fn read(&self, txn_id: &str) -> Result<Option<TxnState>> {
        match self.conn.get_item(txn_id).await {
            Ok(item) => Ok(Some(item.value.parse()?)),
            Err(TxnError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Unconditionally record `state` for `txn_id`.
    pub async fn write(&self, txn_id: &str, state: TxnState) -> Result<()> {
        let item = DataItem::new(txn_id, state.to_string()).with_txn_state(TxnState::Committed);
        self.conn.put_item(txn_id, item).await?;
        Ok(())
    }

    /// Remove the TSR. A lingering record is garbage but harmless.
    pub async fn delete(&self, txn_id: &str) -> Result<()> {
        self.conn.delete(txn_id).await
    }
}
