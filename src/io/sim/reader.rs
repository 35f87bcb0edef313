// src/io/sim/reader.rs
//
// Simulator backend: a software twin of the sensor driven by key events.
// No I/O and no reconnect loop; the worker just integrates the ramp model
// on a fixed tick and publishes the result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::model::RampModel;
use crate::config::{DecodeConfig, SimConfig};
use crate::error::Result;
use crate::io::store::{ChannelStats, SampleStore};
use crate::io::traits::SensorBackend;
use crate::io::types::{LinkState, Sample, SampleCallback, TimedSample, Transport};
use crate::io::worker::{LinkStateCell, Publisher, WorkerSlot};

pub struct SimBackend {
    config: SimConfig,
    decode: DecodeConfig,
    store: Arc<SampleStore>,
    on_sample: SampleCallback,
    state: LinkStateCell,
    worker: WorkerSlot,
    pressed: Arc<Mutex<HashSet<char>>>,
    model: Arc<Mutex<RampModel>>,
}

impl SimBackend {
    pub fn new(
        config: SimConfig,
        decode: DecodeConfig,
        history_size: Option<usize>,
        on_sample: SampleCallback,
    ) -> Self {
        let model = RampModel::new(config.clone(), decode.channels);
        Self {
            config,
            decode,
            store: Arc::new(SampleStore::new(history_size)),
            on_sample,
            state: LinkStateCell::default(),
            worker: WorkerSlot::new(),
            pressed: Arc::new(Mutex::new(HashSet::new())),
            model: Arc::new(Mutex::new(model)),
        }
    }
}

#[async_trait]
impl SensorBackend for SimBackend {
    fn transport(&self) -> Transport {
        Transport::Simulator
    }

    async fn start(&self) -> Result<()> {
        let store = self.store.clone();
        let on_sample = self.on_sample.clone();
        let decode = self.decode.clone();
        let state = self.state.clone();
        let pressed = self.pressed.clone();
        let model = self.model.clone();
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        let jitter = i64::from(self.config.jitter);

        if self.worker.spawn("sim", move |cancel| {
            let publisher = Publisher::new("sim", store, on_sample, decode, cancel);
            async move {
                run_simulation(publisher, pressed, model, tick, jitter).await;
                state.set(LinkState::Stopped);
            }
        })? {
            self.state.set(LinkState::Connected);
            tracing::info!("[sim] Started ({:?} tick)", tick);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.worker.stop("sim").await;
        self.state.set(LinkState::Stopped);
        Ok(())
    }

    fn latest(&self) -> Option<Sample> {
        self.store.latest()
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.store.last_timestamp()
    }

    fn sample_age(&self) -> Option<Duration> {
        self.store.sample_age()
    }

    fn history(&self, n: usize) -> Vec<TimedSample> {
        self.store.history(n)
    }

    fn channel_stats(&self, n: usize) -> Vec<ChannelStats> {
        self.store.channel_stats(n)
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    fn send_command(&self, command: &str) {
        if command.trim().eq_ignore_ascii_case("reset") {
            if let Ok(mut model) = self.model.lock() {
                model.reset();
            }
            tracing::info!("[sim] Channels reset to floor");
        } else {
            tracing::debug!("[sim] Ignoring command {:?}", command);
        }
    }

    fn handle_char(&self, ch: char, pressed: bool) {
        let key = ch.to_ascii_lowercase();
        if let Ok(mut keys) = self.pressed.lock() {
            if pressed {
                keys.insert(key);
            } else {
                keys.remove(&key);
            }
        }
    }
}

async fn run_simulation(
    publisher: Publisher,
    pressed: Arc<Mutex<HashSet<char>>>,
    model: Arc<Mutex<RampModel>>,
    tick: Duration,
    jitter: i64,
) {
    let cancel = publisher.cancel().clone();
    let min = i64::from(publisher.decode_config().min_value);
    let max = i64::from(publisher.decode_config().max_value);
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f64();
                last = now;

                // Snapshot the key set so the lock is not held during the math
                let keys = pressed.lock().map(|k| k.clone()).unwrap_or_default();
                let levels = match model.lock() {
                    Ok(mut m) => {
                        m.step(dt, &keys);
                        m.levels().to_vec()
                    }
                    Err(_) => break,
                };

                let values = levels
                    .iter()
                    .map(|&level| {
                        let noise = if jitter > 0 { rng.gen_range(-jitter..=jitter) } else { 0 };
                        (level.round() as i64 + noise).clamp(min, max) as u32
                    })
                    .collect();
                publisher.publish(Sample::new(values));
            }
        }
    }
}
