// src/manager.rs
//
// BackendManager: owns at most one active backend, switches transports, and
// fans every decoded sample out to registered listeners tagged with the
// transport that produced it.
//
// Lifecycle operations (select/start/stop) are serialised by an async mutex.
// Read-side accessors go through a separate std lock and never wait on I/O.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{BackendConfig, BleConfig, SerialConfig, SimConfig, TransportConfig, WifiConfig};
use crate::dispatch::{ListenerHandle, ListenerSet};
use crate::error::Result;
use crate::io::{
    self, ChannelStats, LinkState, Sample, SampleCallback, SensorBackend, TimedSample, Transport,
};

pub struct BackendManager {
    /// Last-selected configuration; also serialises lifecycle calls
    selected: Mutex<BackendConfig>,
    current: RwLock<Option<Arc<dyn SensorBackend>>>,
    listeners: Arc<ListenerSet>,
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

impl BackendManager {
    /// Create a manager with no backend yet. `start()` builds one from
    /// `config` unless `select_transport` is called first.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            selected: Mutex::new(config),
            current: RwLock::new(None),
            listeners: Arc::new(ListenerSet::new()),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Replace the active backend with a fresh, stopped one built from `config`.
    ///
    /// Selecting the configuration the current backend was built from keeps
    /// it, worker included. Errors stopping the old backend are logged and
    /// never block adopting the new one.
    pub async fn select_transport(&self, config: BackendConfig) -> Result<()> {
        let mut selected = self.selected.lock().await;

        let old = self.current();
        if let Some(backend) = old.as_ref() {
            if *selected == config {
                tracing::debug!("[manager] {} already selected with identical config", backend.transport());
                return Ok(());
            }
        }

        let transport = config.transport.transport();
        let backend = io::create_backend(config.clone(), self.dispatch_callback(transport))?;

        if let Some(old) = old {
            if let Err(e) = old.stop().await {
                tracing::warn!("[manager] Error stopping {} backend: {}", old.transport(), e);
            }
        }

        self.set_current(Some(backend));
        *selected = config;
        tracing::info!("[manager] Selected {} transport", transport);
        Ok(())
    }

    /// Start the current backend, building it from the last-selected config
    /// first if none exists. Starting a running backend is a no-op.
    pub async fn start(&self) -> Result<()> {
        let selected = self.selected.lock().await;

        let backend = match self.current() {
            Some(backend) => backend,
            None => {
                let transport = selected.transport.transport();
                let backend = io::create_backend(selected.clone(), self.dispatch_callback(transport))?;
                self.set_current(Some(backend.clone()));
                backend
            }
        };
        backend.start().await
    }

    /// Stop the current backend. Always safe to call; failures are logged.
    pub async fn stop(&self) {
        let _selected = self.selected.lock().await;
        if let Some(backend) = self.current() {
            match backend.stop().await {
                Ok(()) => tracing::info!("[manager] Stopped {} backend", backend.transport()),
                Err(e) => tracing::warn!("[manager] Error stopping {} backend: {}", backend.transport(), e),
            }
        }
    }

    /// Select a transport, keeping the current decode and history settings,
    /// and start it.
    async fn use_transport(&self, transport: TransportConfig) -> Result<()> {
        let base = self.config().await;
        let config = BackendConfig { transport, ..base };
        self.select_transport(config).await?;
        self.start().await
    }

    pub async fn use_serial(&self, config: SerialConfig) -> Result<()> {
        self.use_transport(TransportConfig::Serial(config)).await
    }

    pub async fn use_wifi(&self, config: WifiConfig) -> Result<()> {
        self.use_transport(TransportConfig::Wifi(config)).await
    }

    pub async fn use_bluetooth(&self, config: BleConfig) -> Result<()> {
        self.use_transport(TransportConfig::Bluetooth(config)).await
    }

    pub async fn use_simulator(&self, config: SimConfig) -> Result<()> {
        self.use_transport(TransportConfig::Simulator(config)).await
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a listener. Adding one twice has no effect.
    pub fn add_listener(&self, listener: ListenerHandle) -> bool {
        self.listeners.add(listener)
    }

    /// Unregister a listener. Removing an absent one is not an error.
    pub fn remove_listener(&self, listener: &ListenerHandle) -> bool {
        self.listeners.remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // ========================================================================
    // Read side
    // ========================================================================

    /// The active backend, if any
    pub fn current(&self) -> Option<Arc<dyn SensorBackend>> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    /// Last-selected configuration
    pub async fn config(&self) -> BackendConfig {
        self.selected.lock().await.clone()
    }

    pub fn active_transport(&self) -> Option<Transport> {
        self.current().map(|b| b.transport())
    }

    pub fn state(&self) -> LinkState {
        self.current().map(|b| b.state()).unwrap_or(LinkState::Idle)
    }

    pub fn latest(&self) -> Option<Sample> {
        self.current().and_then(|b| b.latest())
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.current().and_then(|b| b.last_timestamp())
    }

    /// Time since the active backend last decoded a sample
    pub fn sample_age(&self) -> Option<Duration> {
        self.current().and_then(|b| b.sample_age())
    }

    pub fn history(&self, n: usize) -> Vec<TimedSample> {
        self.current().map(|b| b.history(n)).unwrap_or_default()
    }

    pub fn channel_stats(&self, n: usize) -> Vec<ChannelStats> {
        self.current().map(|b| b.channel_stats(n)).unwrap_or_default()
    }

    pub fn send_command(&self, command: &str) {
        match self.current() {
            Some(backend) => backend.send_command(command),
            None => tracing::debug!("[manager] No backend, dropping command {:?}", command),
        }
    }

    pub fn handle_char(&self, ch: char, pressed: bool) {
        if let Some(backend) = self.current() {
            backend.handle_char(ch, pressed);
        }
    }

    /// Serial port a UI can suggest. `None` rather than an error when nothing
    /// is found or serial support is not built in.
    pub fn guess_serial_port() -> Option<String> {
        io::guess_serial_port()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Callback injected into every backend this manager builds
    fn dispatch_callback(&self, transport: Transport) -> SampleCallback {
        let listeners = self.listeners.clone();
        Arc::new(move |sample: Sample| {
            listeners.dispatch(&sample, transport);
        })
    }

    fn set_current(&self, backend: Option<Arc<dyn SensorBackend>>) {
        match self.current.write() {
            Ok(mut guard) => *guard = backend,
            Err(poisoned) => *poisoned.into_inner() = backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_sim() -> SimConfig {
        SimConfig {
            jitter: 0,
            ..SimConfig::default()
        }
    }

    #[tokio::test]
    async fn test_no_backend_accessors_are_safe() {
        let manager = BackendManager::default();
        assert!(manager.active_transport().is_none());
        assert_eq!(manager.state(), LinkState::Idle);
        assert!(manager.latest().is_none());
        assert!(manager.sample_age().is_none());
        assert!(manager.history(10).is_empty());
        manager.send_command("TARE");
        manager.handle_char('1', true);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_builds_from_initial_config() {
        let manager = BackendManager::new(BackendConfig::simulator(quiet_sim()));
        manager.start().await.unwrap();
        assert_eq!(manager.active_transport(), Some(Transport::Simulator));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.latest(), Some(Sample::from([400, 400, 400, 400])));
        manager.stop().await;
        assert_eq!(manager.state(), LinkState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_select_keeps_backend() {
        let manager = BackendManager::default();
        let config = BackendConfig::simulator(quiet_sim());
        manager.select_transport(config.clone()).await.unwrap();
        manager.start().await.unwrap();
        let first = manager.current().unwrap();

        manager.select_transport(config).await.unwrap();
        let second = manager.current().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), LinkState::Connected);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_stops_old_backend() {
        let manager = BackendManager::default();
        manager.use_simulator(quiet_sim()).await.unwrap();
        let old = manager.current().unwrap();

        let changed = SimConfig {
            tick_ms: 10,
            ..quiet_sim()
        };
        manager
            .select_transport(BackendConfig::simulator(changed))
            .await
            .unwrap();
        assert_eq!(old.state(), LinkState::Stopped);

        let new = manager.current().unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        // Freshly selected backends start stopped
        assert_eq!(new.state(), LinkState::Idle);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_failed_select_keeps_previous_backend() {
        let manager = BackendManager::new(BackendConfig::simulator(quiet_sim()));
        manager.start().await.unwrap();

        let bad = BackendConfig::simulator(SimConfig {
            floor: 5000.0,
            ceiling: 100.0,
            ..quiet_sim()
        });
        assert!(manager.select_transport(bad).await.is_err());
        assert_eq!(manager.active_transport(), Some(Transport::Simulator));
        assert_eq!(manager.state(), LinkState::Connected);
        manager.stop().await;
    }
}
