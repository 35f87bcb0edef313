// src/io/types.rs
//
// Shared types for all transports: the sample itself, its provenance tag,
// and the connection state each backend reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;
use std::sync::Arc;

// ============================================================================
// Samples
// ============================================================================

/// One reading per force channel, already range-checked.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample(Vec<u32>);

impl Sample {
    pub fn new(values: Vec<u32>) -> Self {
        Sample(values)
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }

    pub fn channels(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u32>> for Sample {
    fn from(values: Vec<u32>) -> Self {
        Sample(values)
    }
}

impl<const N: usize> From<[u32; N]> for Sample {
    fn from(values: [u32; N]) -> Self {
        Sample(values.to_vec())
    }
}

impl Index<usize> for Sample {
    type Output = u32;

    fn index(&self, channel: usize) -> &u32 {
        &self.0[channel]
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for v in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", v)?;
            first = false;
        }
        Ok(())
    }
}

/// A sample with the wall-clock time it was decoded
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TimedSample {
    pub timestamp: DateTime<Utc>,
    pub sample: Sample,
}

// ============================================================================
// Provenance and state
// ============================================================================

/// Which transport produced a sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Serial,
    Wifi,
    Bluetooth,
    Simulator,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Serial => "serial",
            Transport::Wifi => "wifi",
            Transport::Bluetooth => "bluetooth",
            Transport::Simulator => "simulator",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one backend's worker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Constructed, never started
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Sleeping out the reconnect delay
    Backoff,
    Stopped,
}

/// Callback a backend invokes for every decoded sample. Injected by the manager.
pub type SampleCallback = Arc<dyn Fn(Sample) + Send + Sync>;
