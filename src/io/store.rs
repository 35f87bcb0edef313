// src/io/store.rs
//
// Latest-value cell plus the optional bounded history ring.
// One mutex guards both; the owning worker is the only writer and holds the
// lock just long enough to assign.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::types::{Sample, TimedSample};

/// Per-channel summary over a window of samples
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelStats {
    pub min: u32,
    pub max: u32,
    pub mean: f64,
}

#[derive(Default)]
struct StoreInner {
    latest: Option<Sample>,
    last_timestamp: Option<DateTime<Utc>>,
    history: VecDeque<TimedSample>,
}

pub struct SampleStore {
    inner: Mutex<StoreInner>,
    history_size: Option<usize>,
}

impl SampleStore {
    pub fn new(history_size: Option<usize>) -> Self {
        let capacity = history_size.unwrap_or(0);
        Self {
            inner: Mutex::new(StoreInner {
                history: VecDeque::with_capacity(capacity),
                ..StoreInner::default()
            }),
            history_size: history_size.filter(|&n| n > 0),
        }
    }

    /// Store a freshly decoded sample and return the timestamp it was given.
    pub fn record(&self, sample: Sample) -> DateTime<Utc> {
        let now = Utc::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(limit) = self.history_size {
            while inner.history.len() >= limit {
                inner.history.pop_front();
            }
            inner.history.push_back(TimedSample {
                timestamp: now,
                sample: sample.clone(),
            });
        }
        inner.latest = Some(sample);
        inner.last_timestamp = Some(now);
        now
    }

    pub fn latest(&self) -> Option<Sample> {
        self.inner.lock().ok().and_then(|inner| inner.latest.clone())
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().ok().and_then(|inner| inner.last_timestamp)
    }

    /// Time since the last decoded sample, `None` if nothing arrived yet
    pub fn sample_age(&self) -> Option<Duration> {
        let last = self.last_timestamp()?;
        (Utc::now() - last).to_std().ok().or(Some(Duration::ZERO))
    }

    /// Newest `n` history entries, oldest first. Empty when history is disabled.
    pub fn history(&self, n: usize) -> Vec<TimedSample> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let skip = inner.history.len().saturating_sub(n);
        inner.history.iter().skip(skip).cloned().collect()
    }

    /// Per-channel min/max/mean over the newest `n` history entries.
    pub fn channel_stats(&self, n: usize) -> Vec<ChannelStats> {
        let window = self.history(n);
        let Some(first) = window.first() else {
            return Vec::new();
        };

        let channels = first.sample.channels();
        (0..channels)
            .map(|ch| {
                let values = window
                    .iter()
                    .filter_map(|entry| entry.sample.values().get(ch).copied());
                let mut min = u32::MAX;
                let mut max = 0;
                let mut sum = 0u64;
                let mut count = 0u64;
                for v in values {
                    min = min.min(v);
                    max = max.max(v);
                    sum += u64::from(v);
                    count += 1;
                }
                ChannelStats {
                    min,
                    max,
                    mean: if count > 0 { sum as f64 / count as f64 } else { 0.0 },
                }
            })
            .collect()
    }
}
