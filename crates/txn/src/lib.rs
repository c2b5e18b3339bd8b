//! Cross-datastore transaction core.
//!
//! A [`Transaction`] reads and writes records spread over several
//! heterogeneous stores and commits them atomically with two-phase commit.
//! The participating stores only need per-key conditional writes; the
//! ground truth of every commit is a single Transaction Status Record on
//! the participant designated as the global store.

mod connector;
mod datastore;
mod item;
mod resolver;
mod transaction;
mod tsr;

pub use connector::{Connector, SharedConnector};
pub use datastore::{rollback_keys, CommitEntry, Datastore};
pub use item::{bump_version, DataItem};
pub use resolver::{validate_predicates, Predicate, ResolvedRead, Resolver};
pub use transaction::{Transaction, TxnContext};
pub use tsr::{Tsr, TsrCreate};
