//! Error taxonomy for the transaction core.
//!
//! One enum covers every failure kind the protocol distinguishes; the
//! propagation policy (what is retried, what is absorbed, what aborts the
//! transaction) lives with the callers.

use thiserror::Error;

/// Errors surfaced by connectors, datastores, and the coordinator.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Logical absence of a key.
    #[error("key not found")]
    KeyNotFound,

    /// Compare-and-swap precondition failed.
    #[error("version mismatch")]
    VersionMismatch,

    /// Reader observed a PREPARED record whose outcome cannot be decided.
    #[error("dirty read")]
    DirtyRead,

    /// Transient failure while resolving a record owned by another
    /// transaction; the caller may retry at a later start time.
    #[error("read failed due to unknown txn status")]
    ReadFailed,

    /// Operation invoked in the wrong transaction state.
    #[error("invalid transaction state: {0}")]
    StateViolation(String),

    /// Missing global store, duplicate participant name, and the like.
    #[error("configuration error: {0}")]
    Config(String),

    /// A record or payload failed to decode.
    #[error("deserialize error: {0}")]
    Deserialize(String),

    /// Any transport or backend failure not covered above.
    #[error("backend error: {0}")]
    Backend(String),
}

impl TxnError {
    /// Map an error message from the remote facade back onto the taxonomy.
    ///
    /// The facade carries non-transport errors as strings in the response
    /// body; well-known kinds round-trip so client-side retry logic can
    /// match on them.
    pub fn from_remote(msg: &str) -> Self {
        match msg {
            "key not found" => TxnError::KeyNotFound,
            "version mismatch" => TxnError::VersionMismatch,
            "dirty read" => TxnError::DirtyRead,
            "read failed due to unknown txn status" => TxnError::ReadFailed,
            other => TxnError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TxnError {
    fn from(e: serde_json::Error) -> Self {
        TxnError::Deserialize(e.to_string())
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, TxnError>;
