//! Configuration surface of the coordinator.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether the prepare phase fans out to all participants at once or walks
/// them one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrentOptimizationLevel {
    /// Sequential prepare. Deterministic, easier to debug.
    Default,
    /// One task per participant, join on all.
    ParallelizeOnPrepare,
}

/// Where control returns to the caller during the commit phase.
///
/// The transaction is durable-committed as soon as the TSR exists; every
/// level after that trades visibility latency for caller latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncLevel {
    /// Wait for all participant commits, delete the TSR, then return.
    Zero,
    /// Wait for all participant commits, delete the TSR in the background.
    One,
    /// Fire-and-forget participant commits and TSR deletion.
    Two,
}

/// Read-time resolution policy for a PREPARED head record whose owning
/// transaction cannot yet be decided (no TSR, lease still live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadStrategy {
    /// Fail the read with a transient error; the caller may retry.
    Normal,
    /// Treat the unresolvable record as committed, validated at prepare.
    AssumeCommit,
    /// Treat the unresolvable record as aborted, validated at prepare.
    AssumeAbort,
}

/// Coordinator-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub concurrent_optimization_level: ConcurrentOptimizationLevel,
    pub async_level: AsyncLevel,
    /// Cap on the length of a record's previous-version chain; older
    /// versions are truncated beyond this.
    pub max_record_len: usize,
    pub read_strategy: ReadStrategy,
    /// Default TLease window granted to PREPARED records.
    pub lease_duration: Duration,
    /// Deadline applied to each backend operation; expiry surfaces as a
    /// transient error, which the commit path treats as a prepare failure.
    pub operation_timeout: Duration,
    /// Activates the single-write one-phase-commit fast path.
    pub enable_one_phase: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent_optimization_level: ConcurrentOptimizationLevel::Default,
            async_level: AsyncLevel::Zero,
            max_record_len: 2,
            read_strategy: ReadStrategy::Normal,
            lease_duration: Duration::from_millis(100),
            operation_timeout: Duration::from_secs(5),
            enable_one_phase: false,
        }
    }
}

/// The subset of configuration that travels with facade requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordConfig {
    /// Name of the participant hosting the TSR namespace.
    pub global_name: String,
    pub max_record_len: usize,
    pub read_strategy: ReadStrategy,
    pub concurrent_optimization_level: ConcurrentOptimizationLevel,
}

impl RecordConfig {
    pub fn from_config(global_name: impl Into<String>, config: &Config) -> Self {
        Self {
            global_name: global_name.into(),
            max_record_len: config.max_record_len,
            read_strategy: config.read_strategy,
            concurrent_optimization_level: config.concurrent_optimization_level,
        }
    }
}
