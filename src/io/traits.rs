// src/io/traits.rs
//
// The contract every transport satisfies. The manager and any monitoring UI
// depend only on this trait, never on a concrete backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::store::ChannelStats;
use super::types::{LinkState, Sample, TimedSample, Transport};
use crate::error::Result;

/// A sample source with its own background worker.
///
/// All methods take `&self`; backends keep their mutable state behind locks
/// so a single instance can be shared between the manager and readers.
#[async_trait]
pub trait SensorBackend: Send + Sync {
    /// Which transport this backend speaks
    fn transport(&self) -> Transport;

    /// Spawn the worker and return immediately. A no-op if already running.
    async fn start(&self) -> Result<()>;

    /// Signal the worker, wait a bounded time for it, release the connection.
    async fn stop(&self) -> Result<()>;

    /// Most recent sample, without waiting on I/O
    fn latest(&self) -> Option<Sample>;

    /// Time of the last successful decode
    fn last_timestamp(&self) -> Option<DateTime<Utc>>;

    /// How long ago the last sample was decoded; `None` before the first one
    fn sample_age(&self) -> Option<Duration>;

    /// Newest `n` timestamped samples, oldest first (empty without history)
    fn history(&self, n: usize) -> Vec<TimedSample>;

    /// Per-channel min/max/mean over the newest `n` history entries
    fn channel_stats(&self, n: usize) -> Vec<ChannelStats>;

    fn state(&self) -> LinkState;

    /// Best-effort host-to-device command. Failures are logged, never raised.
    fn send_command(&self, command: &str);

    /// Synthetic key input. Only the simulator reacts to it.
    fn handle_char(&self, ch: char, pressed: bool);
}
