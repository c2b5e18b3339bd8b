//! The versioned record envelope persisted per key.

use serde::{Deserialize, Serialize};

use weave_common::{Result, Timestamp, TxnState};

/// One version of one record, as stored in a participant.
///
/// The head record at a key embeds its predecessors through `prev`, a
/// serialized copy of the immediately previous item; `linked_len` counts
/// the chain (head included) and is capped by truncating the tail.
/// `version` is the compare-and-swap token every conditional update is
/// keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataItem {
    pub key: String,
    pub value: String,
    pub txn_id: String,
    pub txn_state: TxnState,
    pub t_valid: Timestamp,
    /// Wall-clock deadline (epoch milliseconds) after which a PREPARED
    /// record may be treated as abandoned by any reader.
    pub t_lease: i64,
    /// Serialized previous item, or empty at the tail of the chain.
    pub prev: String,
    pub linked_len: usize,
    pub is_deleted: bool,
    pub version: String,
}

impl DataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            txn_id: String::new(),
            txn_state: TxnState::Committed,
            t_valid: 0,
            t_lease: 0,
            prev: String::new(),
            linked_len: 1,
            is_deleted: false,
            version: String::new(),
        }
    }

    pub fn with_txn_id(mut self, txn_id: impl Into<String>) -> Self {
        self.txn_id = txn_id.into();
        self
    }

    pub fn with_txn_state(mut self, state: TxnState) -> Self {
        self.txn_state = state;
        self
    }

    pub fn with_t_valid(mut self, t_valid: Timestamp) -> Self {
        self.t_valid = t_valid;
        self
    }

    pub fn with_t_lease(mut self, t_lease: i64) -> Self {
        self.t_lease = t_lease;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn deleted(mut self, is_deleted: bool) -> Self {
        self.is_deleted = is_deleted;
        self
    }

    /// Parse the previous item out of `prev`, if the chain continues.
    pub fn prev_item(&self) -> Result<Option<DataItem>> {
        if self.prev.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&self.prev)?))
    }

    /// Link `base` in as this item's predecessor.
    pub fn set_prev_item(&mut self, base: &DataItem) -> Result<()> {
        self.prev = serde_json::to_string(base)?;
        self.linked_len = base.linked_len + 1;
        Ok(())
    }

    /// Drop chain tail entries beyond `max_len` versions (head included).
    ///
    /// Truncation only ever discards the oldest versions; the head and the
    /// order of survivors are untouched.
    pub fn truncate_chain(&mut self, max_len: usize) -> Result<()> {
        if self.linked_len <= max_len || max_len == 0 {
            return Ok(());
        }
        // Walk down to the node that becomes the new tail and cut below it.
        let mut chain = vec![self.clone()];
        let mut cursor = self.prev_item()?;
        while let Some(node) = cursor {
            cursor = node.prev_item()?;
            chain.push(node);
        }
        chain.truncate(max_len);

        // Rebuild prev links from the tail up.
        let mut tail: Option<DataItem> = None;
        for mut node in chain.into_iter().rev() {
            match &tail {
                Some(t) => {
                    node.prev = serde_json::to_string(t)?;
                    node.linked_len = t.linked_len + 1;
                }
                None => {
                    node.prev = String::new();
                    node.linked_len = 1;
                }
            }
            tail = Some(node);
        }
        if let Some(head) = tail {
            *self = head;
        }
        Ok(())
    }
}

/// Increment the decimal compare-and-swap counter by exactly one.
///
/// An absent or empty version counts as zero, so the first stored version
/// of a record is "1".
pub fn bump_version(version: &str) -> String {
    let n: u64 = version.parse().unwrap_or(0);
    (n + 1).to_string()
}
