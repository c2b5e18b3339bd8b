//! Server-side read path.

use std::collections::HashMap;
use std::sync::Arc;

use weave_common::{ReadStrategy, RecordConfig, Result, Timestamp, TxnError};
use weave_txn::{ResolvedRead, Resolver, SharedConnector};

use crate::cacher::{CacheStats, ItemCache};

/// Resolves reads against the hosted connectors, short-circuiting through
/// the item cache for repeated reads from the same snapshot.
pub struct Reader {
    conns: HashMap<String, SharedConnector>,
    cache: Arc<ItemCache>,
}

impl Reader {
    pub fn new(conns: HashMap<String, SharedConnector>, cache: Arc<ItemCache>) -> Self {
        Self { conns, cache }
    }

    fn conn(&self, ds_name: &str) -> Result<&SharedConnector> {
        self.conns
            .get(ds_name)
            .ok_or_else(|| TxnError::Config(format!("datastore not found: {}", ds_name)))
    }

    pub async fn read(
        &self,
        ds_name: &str,
        key: &str,
        start_time: Timestamp,
        config: &RecordConfig,
    ) -> Result<ResolvedRead> {
        let conn = self.conn(ds_name)?;
        let global = self.conn(&config.global_name)?;

        if let Some(item) = self.cache.lookup(ds_name, key, start_time) {
            return Ok(ResolvedRead {
                item,
                strategy: ReadStrategy::Normal,
                assumption: None,
            });
        }

        let resolved = Resolver::new(&**conn, &**global, config.read_strategy)
            .fetch(key, start_time)
            .await?;
        self.cache
            .insert(ds_name, key, start_time, resolved.item.clone());
        Ok(resolved)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
