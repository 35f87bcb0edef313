// src/io/worker.rs
//
// Background worker plumbing shared by every backend:
// - CancelFlag: cooperative stop signal observable from blocking and async code
// - Publisher: store-then-dispatch path for decoded samples
// - Connector + run_reconnect_loop: the connect/read/backoff state machine
// - WorkerSlot: at most one live worker per backend instance

use async_trait::async_trait;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::DecodeConfig;
use crate::error::{BackendError, Result};
use crate::io::codec::{decode_line, decode_payload};
use crate::io::store::SampleStore;
use crate::io::types::{LinkState, Sample, SampleCallback};

/// How long `stop()` waits for a worker to wind down before abandoning it
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Resolves once `cancel()` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a cancel between the two is not lost
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `delay` unless cancelled first. Returns true if cancelled.
    pub async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_cancelled(),
            _ = self.cancelled() => true,
        }
    }
}

// ============================================================================
// Link state
// ============================================================================

/// Shared, lock-guarded `LinkState` written by the worker and read by callers
#[derive(Clone, Default)]
pub struct LinkStateCell(Arc<Mutex<LinkState>>);

impl LinkStateCell {
    pub fn get(&self) -> LinkState {
        self.0.lock().map(|s| *s).unwrap_or(LinkState::Stopped)
    }

    pub fn set(&self, state: LinkState) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = state;
        }
    }
}

// ============================================================================
// Publishing
// ============================================================================

/// Everything a session needs to turn inbound units into dispatched samples.
#[derive(Clone)]
pub struct Publisher {
    label: &'static str,
    store: Arc<SampleStore>,
    on_sample: SampleCallback,
    decode: DecodeConfig,
    cancel: CancelFlag,
}

impl Publisher {
    pub fn new(
        label: &'static str,
        store: Arc<SampleStore>,
        on_sample: SampleCallback,
        decode: DecodeConfig,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            label,
            store,
            on_sample,
            decode,
            cancel,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn decode_config(&self) -> &DecodeConfig {
        &self.decode
    }

    pub fn cancel(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Record the sample as latest, then hand it to the injected callback.
    /// Samples produced after `stop()` was requested are discarded.
    pub fn publish(&self, sample: Sample) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.store.record(sample.clone());
        (self.on_sample)(sample);
    }

    /// Decode one text unit and publish it. Malformed units are dropped.
    pub fn publish_line(&self, line: &str) -> bool {
        match decode_line(line, &self.decode) {
            Ok(sample) => {
                self.publish(sample);
                true
            }
            Err(e) => {
                tracing::debug!("[{}] Dropped unit {:?}: {}", self.label, line, e);
                false
            }
        }
    }

    /// Decode one binary payload and publish it. Malformed payloads are dropped.
    pub fn publish_payload(&self, payload: &[u8]) -> bool {
        match decode_payload(payload, &self.decode) {
            Ok(sample) => {
                self.publish(sample);
                true
            }
            Err(e) => {
                tracing::debug!("[{}] Dropped payload ({} bytes): {}", self.label, payload.len(), e);
                false
            }
        }
    }
}

// ============================================================================
// Reconnect loop
// ============================================================================

/// One transport's connect and read phases. The loop around them is shared.
#[async_trait]
pub trait Connector: Send + 'static {
    type Session: Send;

    /// A single open/connect attempt. Failures are retried after the delay.
    async fn connect(&mut self) -> Result<Self::Session>;

    /// Read until the link drops or the publisher's cancel flag is raised.
    /// Must observe cancellation promptly and release the session itself.
    async fn run_session(&mut self, session: Self::Session, publisher: &Publisher) -> Result<()>;
}

/// Run `connect -> read -> backoff` until cancelled. Returns the number of
/// connect attempts made.
pub async fn run_reconnect_loop<C: Connector>(
    mut connector: C,
    publisher: Publisher,
    state: LinkStateCell,
    delay: Duration,
) -> u64 {
    let label = publisher.label();
    let cancel = publisher.cancel().clone();
    let mut attempts = 0u64;

    while !cancel.is_cancelled() {
        state.set(LinkState::Connecting);
        attempts += 1;

        let connected = tokio::select! {
            result = connector.connect() => Some(result),
            _ = cancel.cancelled() => None,
        };

        match connected {
            None => break,
            Some(Ok(session)) => {
                state.set(LinkState::Connected);
                tracing::info!("[{}] Connected (attempt {})", label, attempts);
                match connector.run_session(session, &publisher).await {
                    Ok(()) => tracing::info!("[{}] Disconnected", label),
                    Err(e) => tracing::warn!("[{}] Session ended: {}", label, e),
                }
            }
            Some(Err(e)) if !e.is_transient() => {
                tracing::error!("[{}] Giving up, retrying cannot fix: {}", label, e);
                break;
            }
            Some(Err(e)) => {
                tracing::warn!("[{}] Connect attempt {} failed: {}", label, attempts, e);
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        state.set(LinkState::Backoff);
        tracing::debug!("[{}] Retrying in {:?}", label, delay);
        if cancel.sleep_or_cancel(delay).await {
            break;
        }
    }

    state.set(LinkState::Stopped);
    tracing::info!("[{}] Worker stopped after {} attempt(s)", label, attempts);
    attempts
}

// ============================================================================
// Worker slot
// ============================================================================

struct Worker {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

/// Holds the single background task of one backend instance.
#[derive(Default)]
pub struct WorkerSlot {
    inner: Mutex<Option<Worker>>,
}

impl WorkerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .map(|w| w.as_ref().map(|w| !w.handle.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Spawn the worker built by `make` unless one is already running.
    /// Returns `Ok(false)` for the idempotent no-op case.
    pub fn spawn<F, Fut>(&self, label: &str, make: F) -> Result<bool>
    where
        F: FnOnce(CancelFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BackendError::UnsupportedTransport(format!("{} backend needs a tokio runtime", label))
        })?;

        let mut guard = self
            .inner
            .lock()
            .map_err(|e| BackendError::Config(format!("Worker slot poisoned: {}", e)))?;
        if let Some(worker) = guard.as_ref() {
            if !worker.handle.is_finished() {
                return Ok(false);
            }
        }

        let cancel = CancelFlag::new();
        let handle = runtime.spawn(make(cancel.clone()));
        *guard = Some(Worker { cancel, handle });
        Ok(true)
    }

    /// Signal the worker and wait a bounded time for it to exit.
    pub async fn stop(&self, label: &str) {
        let worker = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut worker) = worker else {
            return;
        };

        worker.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, &mut worker.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("[{}] Worker task failed: {}", label, e),
            Err(_) => {
                tracing::warn!("[{}] Worker did not exit within {:?}, aborting", label, STOP_TIMEOUT);
                worker.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    struct FlakyConnector {
        failures_left: u32,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Session = ();

        async fn connect(&mut self) -> Result<()> {
            self.attempts.lock().unwrap().push(Instant::now());
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(BackendError::Connect("refused".into()));
            }
            Ok(())
        }

        async fn run_session(&mut self, _session: (), publisher: &Publisher) -> Result<()> {
            publisher.publish_line("1,2,3,4");
            publisher.cancel().cancelled().await;
            Ok(())
        }
    }

    fn publisher(cancel: CancelFlag) -> (Publisher, Arc<SampleStore>, Arc<Mutex<Vec<Sample>>>) {
        let store = Arc::new(SampleStore::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: SampleCallback = Arc::new(move |s| sink.lock().unwrap().push(s));
        let publisher = Publisher::new("test", store.clone(), callback, DecodeConfig::default(), cancel);
        (publisher, store, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_spacing_and_recovery() {
        let cancel = CancelFlag::new();
        let (publisher, store, seen) = publisher(cancel.clone());
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let connector = FlakyConnector {
            failures_left: 3,
            attempts: attempts.clone(),
        };
        let state = LinkStateCell::default();
        let delay = Duration::from_millis(500);

        let handle = tokio::spawn(run_reconnect_loop(connector, publisher, state.clone(), delay));

        while state.get() != LinkState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Let the session publish
        tokio::task::yield_now().await;

        let times = attempts.lock().unwrap().clone();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
        assert_eq!(store.latest(), Some(Sample::from([1, 2, 3, 4])));
        assert_eq!(seen.lock().unwrap().len(), 1);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 4);
        assert_eq!(state.get(), LinkState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancelFlag::new();
        let (publisher, _store, _seen) = publisher(cancel.clone());
        let connector = FlakyConnector {
            failures_left: u32::MAX,
            attempts: Arc::new(Mutex::new(Vec::new())),
        };
        let state = LinkStateCell::default();

        let handle = tokio::spawn(run_reconnect_loop(
            connector,
            publisher,
            state.clone(),
            Duration::from_secs(60),
        ));
        while state.get() != LinkState::Backoff {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        cancel.cancel();
        let attempts = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker ignored cancellation during backoff")
            .unwrap();
        assert_eq!(attempts, 1);
    }

    struct MisconfiguredConnector;

    #[async_trait]
    impl Connector for MisconfiguredConnector {
        type Session = ();

        async fn connect(&mut self) -> Result<()> {
            Err(BackendError::Config("baud rate 0".into()))
        }

        async fn run_session(&mut self, _session: (), _publisher: &Publisher) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_ends_worker() {
        let cancel = CancelFlag::new();
        let (publisher, _store, _seen) = publisher(cancel.clone());
        let state = LinkStateCell::default();

        let attempts = run_reconnect_loop(
            MisconfiguredConnector,
            publisher,
            state.clone(),
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(attempts, 1);
        assert_eq!(state.get(), LinkState::Stopped);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_publish_after_cancel_is_dropped() {
        let cancel = CancelFlag::new();
        let (publisher, store, seen) = publisher(cancel.clone());
        assert!(publisher.publish_line("5,6,7,8"));
        cancel.cancel();
        publisher.publish(Sample::from([9, 9, 9, 9]));
        assert_eq!(store.latest(), Some(Sample::from([5, 6, 7, 8])));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!publisher.publish_line("garbage"));
    }

    #[test]
    fn test_spawn_without_runtime_is_unsupported() {
        let slot = WorkerSlot::new();
        let result = slot.spawn("test", |_cancel| async {});
        assert!(matches!(result, Err(BackendError::UnsupportedTransport(_))));
    }

    #[tokio::test]
    async fn test_slot_is_idempotent() {
        let slot = WorkerSlot::new();
        let started = slot
            .spawn("test", |cancel| async move { cancel.cancelled().await })
            .unwrap();
        assert!(started);
        let again = slot
            .spawn("test", |cancel| async move { cancel.cancelled().await })
            .unwrap();
        assert!(!again);
        assert!(slot.is_running());

        slot.stop("test").await;
        assert!(!slot.is_running());
        // Stopping twice is harmless
        slot.stop("test").await;
    }
}
