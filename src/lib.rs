// grip-link: transport layer for the Cardinal Grip four-channel force sensor.
//
// One `BackendManager` owns a single active backend (serial, WebSocket, BLE
// or simulator) and fans each decoded sample out to listeners, tagged with
// the transport that produced it.

#[cfg(feature = "bluetooth")]
pub mod ble_common;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod logging;
pub mod manager;

pub use config::{
    BackendConfig, BleConfig, DecodeConfig, GripSettings, LoggingConfig, SerialConfig, SimConfig,
    TransportConfig, WifiConfig,
};
pub use dispatch::{ListenerHandle, ListenerSet, SampleListener};
pub use error::{BackendError, DecodeError, Result};
pub use io::{create_backend, LinkState, Sample, SensorBackend, TimedSample, Transport};
pub use manager::BackendManager;
