//! Coordinator-as-a-service facade.
//!
//! Hosts the backend connections in one process and exposes the
//! per-datastore transaction operations (read, prepare, commit, abort)
//! over HTTP, so thin clients can drive transactions without their own
//! connection pools. The wire shapes live in `weave-client`, shared with
//! the client side.

mod cacher;
mod committer;
mod reader;
mod routes;

pub use cacher::{CacheStats, ItemCache};
pub use committer::Committer;
pub use reader::Reader;
pub use routes::{router, AppState};
