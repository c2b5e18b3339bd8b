//! In-memory stand-in for a real backend driver.
//!
//! Every record lives in one map behind one mutex, which makes the
//! conditional update genuinely atomic, the same guarantee a production
//! driver gets from a Lua script or a findAndModify filter. Used by the
//! test suites and the demo facade server; real deployments plug their
//! own drivers in behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use weave_common::{Result, TxnError};
use weave_txn::{bump_version, Connector, DataItem};

/// Thread-safe in-memory connector. Cloning shares the underlying map, so
/// several participants (or several transactions) can point at the same
/// "store".
#[derive(Clone, Default)]
pub struct MemoryConnector {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored. Test helper.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn decode(bytes: &[u8]) -> Result<DataItem> {
        serde_json::from_slice(bytes).map_err(|e| TxnError::Deserialize(e.to_string()))
    }

    fn encode(item: &DataItem) -> Result<Vec<u8>> {
        serde_json::to_vec(item).map_err(|e| TxnError::Deserialize(e.to_string()))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn get_item(&self, key: &str) -> Result<DataItem> {
        let records = self.records.lock();
        match records.get(key) {
            Some(bytes) => Self::decode(bytes),
            None => Err(TxnError::KeyNotFound),
        }
    }

    async fn put_item(&self, key: &str, item: DataItem) -> Result<String> {
        let version = item.version.clone();
        let bytes = Self::encode(&item)?;
        self.records.lock().insert(key.to_string(), bytes);
        Ok(version)
    }

    async fn conditional_update(
        &self,
        key: &str,
        mut item: DataItem,
        do_create: bool,
    ) -> Result<String> {
        // One lock span around check-and-swap is what makes this atomic.
        let mut records = self.records.lock();
        match records.get(key) {
            Some(bytes) => {
                let stored = Self::decode(bytes)?;
                if stored.version != item.version {
                    return Err(TxnError::VersionMismatch);
                }
                item.version = bump_version(&stored.version);
            }
            None => {
                if !do_create {
                    return Err(TxnError::VersionMismatch);
                }
                item.version = bump_version(&item.version);
            }
        }
        let version = item.version.clone();
        let bytes = Self::encode(&item)?;
        records.insert(key.to_string(), bytes);
        Ok(version)
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let records = self.records.lock();
        records
            .get(name)
            .cloned()
            .ok_or(TxnError::KeyNotFound)
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<()> {
        self.records.lock().insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.records.lock().remove(name);
        Ok(())
    }
}
