// src/io/wifi/reader.rs
//
// WebSocket backend. Each text frame (or UTF-8 binary frame) is one CSV
// sample. Commands travel back as text frames over the same socket.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::config::{DecodeConfig, WifiConfig};
use crate::error::{BackendError, Result};
use crate::io::codec::encode_command;
use crate::io::store::{ChannelStats, SampleStore};
use crate::io::traits::SensorBackend;
use crate::io::types::{LinkState, Sample, SampleCallback, TimedSample, Transport};
use crate::io::worker::{run_reconnect_loop, Connector, LinkStateCell, Publisher, WorkerSlot};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type CommandSlot = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

pub struct WifiBackend {
    config: WifiConfig,
    decode: DecodeConfig,
    store: Arc<SampleStore>,
    on_sample: SampleCallback,
    state: LinkStateCell,
    worker: WorkerSlot,
    /// Sender into the live session's write half; `None` while disconnected
    commands: CommandSlot,
}

impl WifiBackend {
    pub fn new(
        config: WifiConfig,
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
            commands: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl SensorBackend for WifiBackend {
    fn transport(&self) -> Transport {
        Transport::Wifi
    }

    async fn start(&self) -> Result<()> {
        let store = self.store.clone();
        let on_sample = self.on_sample.clone();
        let decode = self.decode.clone();
        let state = self.state.clone();
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let connector = WifiConnector {
            config: self.config.clone(),
            commands: self.commands.clone(),
        };

        if self.worker.spawn("wifi", move |cancel| {
            let publisher = Publisher::new("wifi", store, on_sample, decode, cancel);
            async move {
                run_reconnect_loop(connector, publisher, state, delay).await;
            }
        })? {
            tracing::info!("[wifi] Starting client for {}", self.config.uri);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.worker.stop("wifi").await;
        if let Ok(mut guard) = self.commands.lock() {
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
        let tx = self.commands.lock().ok().and_then(|guard| guard.clone());
        match tx {
            Some(tx) => {
                if tx.send(command.to_string()).is_err() {
                    tracing::warn!("[wifi] Session closed, dropping command {:?}", command);
                }
            }
            None => tracing::debug!("[wifi] Not connected, dropping command {:?}", command),
        }
    }

    fn handle_char(&self, _ch: char, _pressed: bool) {}
}

// ============================================================================
// Connect / read cycle
// ============================================================================

struct WifiConnector {
    config: WifiConfig,
    commands: CommandSlot,
}

#[async_trait]
impl Connector for WifiConnector {
    type Session = WsStream;

    async fn connect(&mut self) -> Result<WsStream> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        tracing::info!("[wifi] Connecting to {}", self.config.uri);
        match tokio::time::timeout(timeout, connect_async(self.config.uri.as_str())).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(BackendError::Connect(format!("{}: {}", self.config.uri, e))),
            Err(_) => Err(BackendError::Connect(format!(
                "{}: timed out after {:?}",
                self.config.uri, timeout
            ))),
        }
    }

    async fn run_session(&mut self, ws: WsStream, publisher: &Publisher) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Ok(mut guard) = self.commands.lock() {
            *guard = Some(tx);
        }

        let (mut write, mut read) = ws.split();
        let cancel = publisher.cancel().clone();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(());
                }
                Some(command) = rx.recv() => {
                    let text = String::from_utf8_lossy(&encode_command(&command)).into_owned();
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break Err(BackendError::Io(std::io::Error::other(e.to_string())));
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        publisher.publish_line(text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        publisher.publish_payload(&data);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("[wifi] Server closed connection: {:?}", frame);
                        break Ok(());
                    }
                    // Ping/pong are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break Err(BackendError::Io(std::io::Error::other(e.to_string())));
                    }
                    None => break Ok(()),
                },
            }
        };

        if let Ok(mut guard) = self.commands.lock() {
            *guard = None;
        }
        result
    }
}
