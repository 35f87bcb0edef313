// src/io/mod.rs
//
// Transport backends behind the `SensorBackend` contract, and the factory
// that builds one from a `BackendConfig`.
//
// Each hardware transport lives behind a cargo feature so its client library
// is optional. Asking for a transport whose feature is compiled out reports
// `UnsupportedTransport` instead of failing to build.

use std::sync::Arc;

pub mod codec;
pub mod sim;
pub mod store;
pub mod traits;
pub mod types;
pub mod worker;

#[cfg(feature = "bluetooth")]
pub mod ble;
#[cfg(all(
    feature = "serial",
    any(target_os = "windows", target_os = "macos", target_os = "linux")
))]
pub mod serial;
#[cfg(feature = "wifi")]
pub mod wifi;

pub use codec::{decode_line, decode_payload, encode_command};
pub use sim::SimBackend;
pub use store::{ChannelStats, SampleStore};
pub use traits::SensorBackend;
pub use types::{LinkState, Sample, SampleCallback, TimedSample, Transport};

use crate::config::{BackendConfig, TransportConfig};
use crate::error::{BackendError, Result};

/// Build a backend for `config`. It is returned stopped; the caller starts it.
pub fn create_backend(config: BackendConfig, on_sample: SampleCallback) -> Result<Arc<dyn SensorBackend>> {
    config.validate()?;
    let BackendConfig {
        transport,
        decode,
        history_size,
    } = config;

    match transport {
        TransportConfig::Simulator(sim) => Ok(Arc::new(SimBackend::new(sim, decode, history_size, on_sample))),

        #[cfg(all(
            feature = "serial",
            any(target_os = "windows", target_os = "macos", target_os = "linux")
        ))]
        TransportConfig::Serial(serial) => Ok(Arc::new(serial::SerialBackend::new(
            serial,
            decode,
            history_size,
            on_sample,
        ))),

        #[cfg(feature = "wifi")]
        TransportConfig::Wifi(wifi) => Ok(Arc::new(wifi::WifiBackend::new(wifi, decode, history_size, on_sample))),

        #[cfg(feature = "bluetooth")]
        TransportConfig::Bluetooth(ble) => Ok(Arc::new(ble::BleBackend::new(ble, decode, history_size, on_sample))),

        #[allow(unreachable_patterns)]
        other => Err(BackendError::UnsupportedTransport(format!(
            "{} support is not compiled into this build",
            other.transport()
        ))),
    }
}

/// Auto-detect the sensor's serial port. `None` when detection is not
/// available in this build or nothing suitable is plugged in.
pub fn guess_serial_port() -> Option<String> {
    #[cfg(all(
        feature = "serial",
        any(target_os = "windows", target_os = "macos", target_os = "linux")
    ))]
    {
        match serial::auto_detect_port() {
            Ok(port) => Some(port),
            Err(e) => {
                tracing::debug!("[serial] No port recommendation: {}", e);
                None
            }
        }
    }
    #[cfg(not(all(
        feature = "serial",
        any(target_os = "windows", target_os = "macos", target_os = "linux")
    )))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecodeConfig, SimConfig};

    #[test]
    fn test_factory_tags_transport() {
        let backend = create_backend(BackendConfig::simulator(SimConfig::default()), Arc::new(|_| {})).unwrap();
        assert_eq!(backend.transport(), Transport::Simulator);
        assert_eq!(backend.state(), LinkState::Idle);
        assert!(backend.latest().is_none());
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = BackendConfig::simulator(SimConfig::default()).with_decode(DecodeConfig {
            min_value: 10,
            max_value: 5,
            ..DecodeConfig::default()
        });
        assert!(matches!(
            create_backend(config, Arc::new(|_| {})),
            Err(BackendError::Config(_))
        ));
    }

    #[cfg(not(feature = "wifi"))]
    #[test]
    fn test_disabled_transport_is_unsupported() {
        use crate::config::WifiConfig;
        let result = create_backend(BackendConfig::wifi(WifiConfig::default()), Arc::new(|_| {}));
        assert!(matches!(result, Err(BackendError::UnsupportedTransport(_))));
    }
}
