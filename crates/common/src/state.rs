//! Transaction and record state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TxnError;

/// State of a transaction, and of the versioned records it owns.
///
/// The coordinator moves EMPTY → STARTED → {COMMITTED, ABORTED}. Persisted
/// records only ever carry PREPARED or COMMITTED; aborts are realized by
/// rolling a PREPARED record back to its previous version, so ABORTED and
/// STARTED never reach a backend. The TSR value is COMMITTED or ABORTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnState {
    Empty,
    Started,
    Prepared,
    Committed,
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::Empty => "EMPTY",
            TxnState::Started => "STARTED",
            TxnState::Prepared => "PREPARED",
            TxnState::Committed => "COMMITTED",
            TxnState::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TxnState {
    type Err = TxnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMPTY" => Ok(TxnState::Empty),
            "STARTED" => Ok(TxnState::Started),
            "PREPARED" => Ok(TxnState::Prepared),
            "COMMITTED" => Ok(TxnState::Committed),
            "ABORTED" => Ok(TxnState::Aborted),
            other => Err(TxnError::Deserialize(format!("unknown state: {}", other))),
        }
    }
}
