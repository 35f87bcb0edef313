// grip-monitor: stream samples from the configured transport to the log.
//
// Usage: grip-monitor [settings.toml]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use grip_link::logging::init_logging;
use grip_link::{BackendManager, GripSettings, ListenerHandle, Sample, Transport};

/// Log at most one sample per this interval
const LOG_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => GripSettings::load(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => GripSettings::default(),
    };

    let _guard = init_logging(&settings.logging).context("Failed to initialise logging")?;

    if let Some(port) = BackendManager::guess_serial_port() {
        tracing::info!("[monitor] Suggested serial port: {}", port);
    }

    let manager = BackendManager::new(settings.backend.clone());
    manager.add_listener(throttled_logger());
    manager.start().await.context("Failed to start backend")?;
    tracing::info!(
        "[monitor] Streaming from {} (Ctrl-C to quit)",
        settings.backend.transport.transport()
    );

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    tracing::info!("[monitor] Shutting down");
    manager.stop().await;
    Ok(())
}

/// Listener that logs the first sample of every `LOG_INTERVAL` window.
fn throttled_logger() -> ListenerHandle {
    let started = std::time::Instant::now();
    let last_logged_ms = AtomicU64::new(0);
    let count = AtomicU64::new(0);

    Arc::new(move |sample: &Sample, source: Transport| -> anyhow::Result<()> {
        let n = count.fetch_add(1, Ordering::Relaxed) + 1;
        let now_ms = started.elapsed().as_millis() as u64;
        let last = last_logged_ms.load(Ordering::Relaxed);
        if n == 1 || now_ms.saturating_sub(last) >= LOG_INTERVAL.as_millis() as u64 {
            last_logged_ms.store(now_ms, Ordering::Relaxed);
            tracing::info!("[{}] #{} {}", source, n, sample);
        }
        Ok(())
    })
}
