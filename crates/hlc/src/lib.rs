//! Hybrid logical clock for transaction timestamps.
//!
//! Timestamps are packed 64-bit values: physical milliseconds in the high
//! bits, a logical counter in the low [`LOGICAL_BITS`] bits. Two sources
//! implement the same contract: a local clock serialized by a mutex, and a
//! remote oracle fetched over HTTP for deployments that need one timestamp
//! authority across coordinators.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use weave_common::{Result, Timestamp, TxnError};

/// Width of the logical counter in the low bits of a timestamp.
pub const LOGICAL_BITS: u32 = 6;

const MAX_LOGICAL: i64 = (1 << LOGICAL_BITS) - 1;

/// When the logical counter gets this close to its maximum, the physical
/// component is refreshed early instead of letting the counter wrap.
const REFRESH_WINDOW: i64 = 10;

/// What the timestamp is for. The oracle may account start and commit
/// fetches separately; the local clock ignores the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    Start,
    Commit,
}

impl std::fmt::Display for TimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeMode::Start => write!(f, "start"),
            TimeMode::Commit => write!(f, "commit"),
        }
    }
}

/// Source of transaction timestamps.
///
/// Successive calls on one instance return strictly increasing values;
/// ties in physical time are broken by the logical counter.
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn get_time(&self, mode: TimeMode) -> Result<Timestamp>;
}

/// Pack a physical millisecond reading and a logical counter.
pub fn pack(physical_ms: i64, logical: i64) -> Timestamp {
    (physical_ms << LOGICAL_BITS) | (logical & MAX_LOGICAL)
}

/// Physical milliseconds component of a packed timestamp.
pub fn physical(ts: Timestamp) -> i64 {
    ts >> LOGICAL_BITS
}

/// Logical counter component of a packed timestamp.
pub fn logical(ts: Timestamp) -> i64 {
    ts & MAX_LOGICAL
}

/// Current wall-clock reading in epoch milliseconds. Lease deadlines are
/// computed and checked against this.
pub fn wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct ClockState {
    physical: i64,
    logical: i64,
}

/// Local hybrid clock.
///
/// A background task refreshes the physical component every millisecond and
/// zeroes the counter whenever the wall clock has actually advanced, so the
/// counter only climbs under burst load within a single millisecond.
pub struct LocalTimeSource {
    state: Arc<Mutex<ClockState>>,
    refresher: JoinHandle<()>,
}

impl LocalTimeSource {
    /// Create a new local clock. Must be called inside a tokio runtime;
    /// the refresh task is aborted when the clock is dropped.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(ClockState {
            physical: wall_ms(),
            logical: 0,
        }));

        let refresher = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(1));
                loop {
                    tick.tick().await;
                    let now = wall_ms();
                    let mut s = state.lock();
                    if now > s.physical {
                        s.physical = now;
                        s.logical = 0;
                    }
                }
            })
        };

        Self { state, refresher }
    }
}

impl Default for LocalTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalTimeSource {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

#[async_trait]
impl TimeSource for LocalTimeSource {
    async fn get_time(&self, _mode: TimeMode) -> Result<Timestamp> {
        let mut s = self.state.lock();
        if s.logical >= MAX_LOGICAL - REFRESH_WINDOW {
            let now = wall_ms();
            if now > s.physical {
                s.physical = now;
            } else {
                // Counter exhausted within one wall-clock millisecond;
                // borrowing the next millisecond keeps the stream strict.
                s.physical += 1;
            }
            s.logical = 0;
        }
        s.logical += 1;
        Ok(pack(s.physical, s.logical))
    }
}

/// Remote timestamp oracle.
///
/// Issues `GET {base_url}/timestamp/{mode}` and parses the integer body.
/// Failures surface as backend errors for the caller to propagate.
pub struct OracleTimeSource {
    base_url: String,
    client: reqwest::Client,
}

impl OracleTimeSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TimeSource for OracleTimeSource {
    async fn get_time(&self, mode: TimeMode) -> Result<Timestamp> {
        let url = format!("{}/timestamp/{}", self.base_url, mode);
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| TxnError::Backend(format!("time oracle: {}", e)))?
            .text()
            .await
            .map_err(|e| TxnError::Backend(format!("time oracle: {}", e)))?;

        body.trim()
            .parse()
            .map_err(|_| TxnError::Backend(format!("time oracle returned non-integer: {}", body)))
    }
}
