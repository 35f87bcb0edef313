// src/io/ble/reader.rs
//
// BLE backend: find the sensor by advertised name, subscribe to its notify
// characteristic, decode one CSV sample per notification.
//
// Connect is two-phase. Resolving the peripheral by name needs a scan, so the
// resolved id is cached and later reconnects go straight to GATT connect.
// Every failed connect counts against the cached id, whether the id no longer
// resolves or GATT setup fails. After `max_cached_failures` in a row the id is
// evicted so a device that reappears under a new id is found again by name.

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Central, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ble_common;
use crate::config::{BleConfig, DecodeConfig};
use crate::error::{BackendError, Result};
use crate::io::store::{ChannelStats, SampleStore};
use crate::io::traits::SensorBackend;
use crate::io::types::{LinkState, Sample, SampleCallback, TimedSample, Transport};
use crate::io::worker::{run_reconnect_loop, Connector, LinkStateCell, Publisher, WorkerSlot};

const SCAN_POLL: Duration = Duration::from_millis(250);
const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Address cache
// ============================================================================

/// Resolved peripheral id plus its run of consecutive connect failures
#[derive(Debug)]
pub(crate) struct AddressCache<Id> {
    id: Option<Id>,
    failures: u32,
}

impl<Id: Clone> AddressCache<Id> {
    pub(crate) fn new() -> Self {
        Self { id: None, failures: 0 }
    }

    pub(crate) fn get(&self) -> Option<Id> {
        self.id.clone()
    }

    pub(crate) fn remember(&mut self, id: Id) {
        self.id = Some(id);
        self.failures = 0;
    }

    pub(crate) fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Count a failed connect. Returns true if the cached id was evicted.
    pub(crate) fn record_failure(&mut self, max_failures: u32) -> bool {
        if self.id.is_none() {
            return false;
        }
        self.failures += 1;
        if self.failures >= max_failures.max(1) {
            self.id = None;
            self.failures = 0;
            return true;
        }
        false
    }
}

type SharedCache = Arc<Mutex<AddressCache<PeripheralId>>>;

fn with_cache<Id, R>(cache: &Mutex<AddressCache<Id>>, f: impl FnOnce(&mut AddressCache<Id>) -> R) -> Option<R> {
    cache.lock().ok().map(|mut guard| f(&mut guard))
}

/// The two connect phases, separated from btleplug so the cache policy in
/// `connect_cached` runs against any directory of devices.
#[async_trait]
pub(crate) trait DeviceDirectory: Sync {
    type Id: Clone + std::fmt::Debug + Send + Sync;
    type Device: Send;
    type Link: Send;

    /// Look up a previously resolved id without scanning
    async fn lookup(&self, id: &Self::Id) -> Result<Self::Device>;

    /// Scan for the device by name
    async fn scan(&self) -> Result<(Self::Id, Self::Device)>;

    /// Connect and subscribe
    async fn open(&self, device: &Self::Device) -> Result<Self::Link>;
}

/// Resolve (cached id first, else scan) then open, keeping the cache's
/// failure count for the attempt as a whole.
pub(crate) async fn connect_cached<D: DeviceDirectory>(
    directory: &D,
    cache: &Mutex<AddressCache<D::Id>>,
    max_failures: u32,
) -> Result<(D::Device, D::Link)> {
    let cached = with_cache(cache, |c| c.get()).flatten();

    let attempt: Result<(D::Device, D::Link)> = async {
        let device = match cached {
            Some(id) => directory.lookup(&id).await?,
            None => {
                let (id, device) = directory.scan().await?;
                with_cache(cache, |c| c.remember(id));
                device
            }
        };
        let link = directory.open(&device).await?;
        Ok::<_, BackendError>((device, link))
    }
    .await;

    match &attempt {
        Ok(_) => {
            with_cache(cache, |c| c.record_success());
        }
        Err(_) => {
            if with_cache(cache, |c| c.record_failure(max_failures)).unwrap_or(false) {
                tracing::warn!("[ble] Forgetting cached device after repeated failures, will rescan");
            }
        }
    }
    attempt
}

// ============================================================================
// BLE Backend
// ============================================================================

pub struct BleBackend {
    config: BleConfig,
    decode: DecodeConfig,
    store: Arc<SampleStore>,
    on_sample: SampleCallback,
    state: LinkStateCell,
    worker: WorkerSlot,
    /// Survives stop/start so a restart can skip the scan
    cache: SharedCache,
}

impl BleBackend {
    pub fn new(
        config: BleConfig,
        decode: DecodeConfig,
        history_size: Option<usize>,
        on_sample: SampleCallback,
    ) -> Self {
        Self {
            config,
            decode,
            store: Arc::new(SampleStore::new(history_size)),
            on_sample,
            state: LinkStateCell::default(),
            worker: WorkerSlot::new(),
            cache: Arc::new(Mutex::new(AddressCache::new())),
        }
    }
}

#[async_trait]
impl SensorBackend for BleBackend {
    fn transport(&self) -> Transport {
        Transport::Bluetooth
    }

    async fn start(&self) -> Result<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let adapter = ble_common::ensure_adapter().await?;

        let store = self.store.clone();
        let on_sample = self.on_sample.clone();
        let decode = self.decode.clone();
        let state = self.state.clone();
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let connector = BleConnector {
            config: self.config.clone(),
            adapter,
            cache: self.cache.clone(),
        };

        if self.worker.spawn("ble", move |cancel| {
            let publisher = Publisher::new("ble", store, on_sample, decode, cancel);
            async move {
                run_reconnect_loop(connector, publisher, state, delay).await;
            }
        })? {
            tracing::info!("[ble] Starting, looking for {:?}", self.config.device_name);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.worker.stop("ble").await;
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
        // The firmware exposes no writable characteristic
        tracing::debug!("[ble] Commands unsupported, ignoring {:?}", command);
    }

    fn handle_char(&self, _ch: char, _pressed: bool) {}
}

// ============================================================================
// Connect / read cycle
// ============================================================================

struct BleConnector {
    config: BleConfig,
    adapter: Adapter,
    cache: SharedCache,
}

#[async_trait]
impl DeviceDirectory for BleConnector {
    type Id = PeripheralId;
    type Device = Peripheral;
    type Link = Characteristic;

    async fn lookup(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.adapter
            .peripheral(id)
            .await
            .map_err(|e| BackendError::Connect(format!("Cached device {:?} unavailable: {e}", id)))
    }

    async fn scan(&self) -> Result<(PeripheralId, Peripheral)> {
        let name = self.config.device_name.as_str();
        tracing::info!("[ble] Scanning for {:?}", name);
        let found = ble_common::scan_peripherals(
            &self.adapter,
            Duration::from_millis(self.config.scan_timeout_ms),
            SCAN_POLL,
            |local_name| local_name == Some(name),
        )
        .await?;

        let peripheral = found
            .into_iter()
            .find(|(_, local_name, _)| local_name.as_deref() == Some(name))
            .map(|(p, _, _)| p)
            .ok_or_else(|| BackendError::NoDeviceFound(format!("no device advertising {:?}", name)))?;

        tracing::info!("[ble] Found {:?} at {}", name, peripheral.id());
        Ok((peripheral.id(), peripheral))
    }

    /// GATT connect, locate the notify characteristic, subscribe.
    async fn open(&self, peripheral: &Peripheral) -> Result<Characteristic> {
        peripheral
            .connect()
            .await
            .map_err(|e| BackendError::Connect(format!("Failed to connect: {e}")))?;

        if let Err(e) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(BackendError::Connect(format!("Failed to discover services: {e}")));
        }

        let characteristic = match ble_common::find_characteristic(
            peripheral,
            self.config.service_uuid,
            self.config.notify_uuid,
        ) {
            Some(c) if c.properties.contains(CharPropFlags::NOTIFY) => c,
            _ => {
                let _ = peripheral.disconnect().await;
                return Err(BackendError::Connect(format!(
                    "Notify characteristic {} not found in service {}",
                    self.config.notify_uuid, self.config.service_uuid
                )));
            }
        };

        if let Err(e) = peripheral.subscribe(&characteristic).await {
            let _ = peripheral.disconnect().await;
            return Err(BackendError::Connect(format!("Failed to subscribe: {e}")));
        }
        Ok(characteristic)
    }
}

#[async_trait]
impl Connector for BleConnector {
    type Session = (Peripheral, Characteristic);

    async fn connect(&mut self) -> Result<Self::Session> {
        connect_cached(&*self, &self.cache, self.config.max_cached_failures).await
    }

    async fn run_session(&mut self, session: Self::Session, publisher: &Publisher) -> Result<()> {
        let (peripheral, characteristic) = session;
        let cancel = publisher.cancel().clone();

        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(BackendError::Connect(format!("Failed to open notification stream: {e}")));
            }
        };

        let mut link_check = tokio::time::interval(LINK_CHECK_INTERVAL);
        link_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                notification = stream.next() => match notification {
                    Some(n) if n.uuid == characteristic.uuid => {
                        publisher.publish_payload(&n.value);
                    }
                    Some(_) => {}
                    None => break Err(BackendError::Connect("Notification stream ended".to_string())),
                },
                _ = link_check.tick() => {
                    if !peripheral.is_connected().await.unwrap_or(false) {
                        break Err(BackendError::Connect("Peripheral disconnected".to_string()));
                    }
                }
            }
        };

        let _ = peripheral.unsubscribe(&characteristic).await;
        let _ = peripheral.disconnect().await;
        result
    }
}
