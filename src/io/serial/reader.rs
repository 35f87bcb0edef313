// src/io/serial/reader.rs
//
// Serial backend: newline-delimited CSV over a USB-serial port.
// Port I/O is blocking and runs on the blocking pool; the per-read timeout
// bounds how long a stop request can go unobserved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::framer::LineFramer;
use super::utils::{
    auto_detect_port, line_settings, to_serialport_data_bits, to_serialport_parity,
    to_serialport_stop_bits,
};
use crate::config::{DecodeConfig, SerialConfig};
use crate::error::{BackendError, Result};
use crate::io::codec::encode_command;
use crate::io::store::{ChannelStats, SampleStore};
use crate::io::traits::SensorBackend;
use crate::io::types::{LinkState, Sample, SampleCallback, TimedSample, Transport};
use crate::io::worker::{run_reconnect_loop, Connector, LinkStateCell, Publisher, WorkerSlot};

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

// ============================================================================
// Serial Backend
// ============================================================================

pub struct SerialBackend {
    config: SerialConfig,
    decode: DecodeConfig,
    store: Arc<SampleStore>,
    on_sample: SampleCallback,
    state: LinkStateCell,
    worker: WorkerSlot,
    /// Cloned handle of the open port used only for writes
    writer: SharedPort,
}

impl SerialBackend {
    pub fn new(
        config: SerialConfig,
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
            writer: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl SensorBackend for SerialBackend {
    fn transport(&self) -> Transport {
        Transport::Serial
    }

    async fn start(&self) -> Result<()> {
        let store = self.store.clone();
        let on_sample = self.on_sample.clone();
        let decode = self.decode.clone();
        let state = self.state.clone();
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let connector = SerialConnector {
            config: self.config.clone(),
            writer: self.writer.clone(),
        };

        let started = self.worker.spawn("serial", move |cancel| {
            let publisher = Publisher::new("serial", store, on_sample, decode, cancel);
            async move {
                run_reconnect_loop(connector, publisher, state, delay).await;
            }
        })?;

        if started {
            tracing::info!(
                "[serial] Starting on {} at {} baud ({})",
                self.config.port.as_deref().unwrap_or("auto-detected port"),
                self.config.baud_rate,
                line_settings(self.config.data_bits, self.config.parity, self.config.stop_bits)
            );
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.worker.stop("serial").await;
        if let Ok(mut guard) = self.writer.lock() {
            *guard = None;
        }
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
        let mut guard = match self.writer.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("[serial] Writer lock poisoned: {}", e);
                return;
            }
        };
        let Some(port) = guard.as_mut() else {
            tracing::debug!("[serial] Not connected, dropping command {:?}", command);
            return;
        };
        let bytes = encode_command(command);
        if let Err(e) = port.write_all(&bytes).and_then(|_| port.flush()) {
            tracing::warn!("[serial] Write error: {}", e);
        }
    }

    fn handle_char(&self, _ch: char, _pressed: bool) {}
}

// ============================================================================
// Connect / read cycle
// ============================================================================

struct SerialConnector {
    config: SerialConfig,
    writer: SharedPort,
}

#[async_trait]
impl Connector for SerialConnector {
    type Session = (Box<dyn SerialPort>, String);

    async fn connect(&mut self) -> Result<Self::Session> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || open_port(&config))
            .await
            .map_err(|e| BackendError::Connect(format!("Open task failed: {}", e)))?
    }

    async fn run_session(&mut self, session: Self::Session, publisher: &Publisher) -> Result<()> {
        let (port, name) = session;

        match port.try_clone() {
            Ok(writer) => {
                if let Ok(mut guard) = self.writer.lock() {
                    *guard = Some(writer);
                }
            }
            Err(e) => tracing::warn!("[serial] {} is read-only, commands disabled: {}", name, e),
        }

        let publisher = publisher.clone();
        let result = tokio::task::spawn_blocking(move || read_lines_blocking(port, &name, &publisher)).await;

        if let Ok(mut guard) = self.writer.lock() {
            *guard = None;
        }

        match result {
            Ok(inner) => inner,
            Err(e) => {
                tracing::error!("[serial] Read task panicked: {:?}", e);
                Err(BackendError::Io(std::io::Error::other(e.to_string())))
            }
        }
    }
}

/// Resolve the port name (auto-detecting if unset) and open it.
fn open_port(config: &SerialConfig) -> Result<(Box<dyn SerialPort>, String)> {
    let name = match &config.port {
        Some(port) => port.clone(),
        None => auto_detect_port()?,
    };

    let port = serialport::new(&name, config.baud_rate)
        .data_bits(to_serialport_data_bits(config.data_bits))
        .stop_bits(to_serialport_stop_bits(config.stop_bits))
        .parity(to_serialport_parity(config.parity))
        .timeout(Duration::from_millis(config.read_timeout_ms.max(1)))
        .open()
        .map_err(|e| BackendError::Connect(format!("Failed to open {}: {}", name, e)))?;

    tracing::info!("[serial] Opened {} at {} baud", name, config.baud_rate);
    Ok((port, name))
}

/// Blocking read loop. Timeouts just re-check the cancel flag; any other
/// read error, or end of stream, ends the session.
fn read_lines_blocking(mut port: Box<dyn SerialPort>, name: &str, publisher: &Publisher) -> Result<()> {
    let cancel = publisher.cancel();
    let mut framer = LineFramer::default();
    let mut buf = [0u8; 256];

    let result = loop {
        if cancel.is_cancelled() {
            tracing::debug!("[serial] Closing {}", name);
            break Ok(());
        }

        match port.read(&mut buf) {
            Ok(0) => {
                break Err(BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} closed", name),
                )));
            }
            Ok(n) => {
                for line in framer.feed(&buf[..n]) {
                    publisher.publish_line(&line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(BackendError::Io(e)),
        }
    };

    if framer.discarded() > 0 {
        tracing::warn!(
            "[serial] {} over-long line(s) without a newline discarded on {}",
            framer.discarded(),
            name
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(port: &str) -> SerialBackend {
        let config = SerialConfig {
            reconnect_delay_ms: 50,
            ..SerialConfig::with_port(port)
        };
        SerialBackend::new(config, DecodeConfig::default(), None, Arc::new(|_| {}))
    }

    #[tokio::test]
    async fn test_missing_port_keeps_retrying_until_stopped() {
        let backend = backend("/dev/grip-link-missing-port");
        assert_eq!(backend.state(), LinkState::Idle);
        backend.start().await.unwrap();
        // Second start is a no-op
        backend.start().await.unwrap();

        let mut saw_backoff = false;
        for _ in 0..200 {
            if backend.state() == LinkState::Backoff {
                saw_backoff = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(saw_backoff);
        assert!(backend.latest().is_none());

        backend.stop().await.unwrap();
        assert_eq!(backend.state(), LinkState::Stopped);
    }

    #[tokio::test]
    async fn test_command_while_disconnected_is_dropped() {
        let backend = backend("/dev/grip-link-missing-port");
        backend.send_command("TARE");
        backend.handle_char('1', true);
        backend.stop().await.unwrap();
    }
}
