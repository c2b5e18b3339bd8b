//! The backend adapter interface the core consumes.

use std::sync::Arc;

use async_trait::async_trait;

use weave_common::Result;

use crate::item::DataItem;

/// Uniform adapter over one backing store.
///
/// Implementations wrap a Redis-like store, a document store, a
/// wide-column store, and so on. They must be thread-safe; one connector
/// is shared by every concurrent transaction touching that backend.
///
/// `conditional_update` is the load-bearing call: it must be realized as a
/// single atomic backend operation (a Lua script, a findAndModify filter,
/// a lightweight transaction, …). Without that atomicity two transactions
/// could both take PREPARED ownership of the same key.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish whatever resources are needed. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Fetch the record stored at `key`, or `KeyNotFound`.
    async fn get_item(&self, key: &str) -> Result<DataItem>;

    /// Unconditionally replace the record at `key`; returns the stored
    /// version.
    async fn put_item(&self, key: &str, item: DataItem) -> Result<String>;

    /// Replace the record at `key` only if its stored version equals
    /// `item.version`; the stored version becomes version+1 and is
    /// returned. With `do_create`, an absent record is inserted as an
    /// atomic insert-if-absent. Every other case is `VersionMismatch`.
    async fn conditional_update(
        &self,
        key: &str,
        item: DataItem,
        do_create: bool,
    ) -> Result<String>;

    /// Raw byte read, outside the versioned-record format.
    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Raw byte write.
    async fn put(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Remove whatever is stored at `name`; absent keys are not an error.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Connectors are shared across transactions and threads.
pub type SharedConnector = Arc<dyn Connector>;
