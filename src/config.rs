// src/config.rs
//
// Per-transport connection parameters and the TOML settings file.
// A config is immutable for the lifetime of one backend instance; the manager
// builds a fresh backend whenever the selected config changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{BackendError, Result};
use crate::io::Transport;

// ============================================================================
// Decoding
// ============================================================================

/// How inbound text is turned into a sample: channel count and valid range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeConfig {
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default)]
    pub min_value: u32,
    #[serde(default = "default_max_value")]
    pub max_value: u32,
    /// Clamp out-of-range values into range. When false they drop the unit.
    #[serde(default = "default_true")]
    pub clamp: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            min_value: 0,
            max_value: default_max_value(),
            clamp: true,
        }
    }
}

impl DecodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(BackendError::Config("channel count must be at least 1".into()));
        }
        if self.min_value > self.max_value {
            return Err(BackendError::Config(format!(
                "min_value {} exceeds max_value {}",
                self.min_value, self.max_value
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Transports
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// USB-serial connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path; `None` auto-detects on every connect attempt
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Per-read timeout; bounds how long `stop()` takes to be observed
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl SerialConfig {
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }
}

/// WebSocket connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    #[serde(default = "default_wifi_uri")]
    pub uri: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            uri: default_wifi_uri(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl WifiConfig {
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }
}

/// Nordic-UART style service the firmware advertises
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
/// Notify-only TX characteristic carrying one CSV sample per notification
pub const DEFAULT_NOTIFY_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// BLE connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_notify_uuid")]
    pub notify_uuid: Uuid,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Consecutive connect failures before the cached address is forgotten
    #[serde(default = "default_max_cached_failures")]
    pub max_cached_failures: u32,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_uuid: DEFAULT_SERVICE_UUID,
            notify_uuid: DEFAULT_NOTIFY_UUID,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
            max_cached_failures: default_max_cached_failures(),
        }
    }
}

impl BleConfig {
    pub fn with_device_name(name: impl Into<String>) -> Self {
        Self {
            device_name: name.into(),
            ..Self::default()
        }
    }
}

/// Keys driving one simulated channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKeys {
    pub slow: char,
    pub fast: char,
}

/// Keyboard-driven simulator parameters. Rates are ADC units per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_floor")]
    pub floor: f64,
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,
    #[serde(default = "default_slow_rate")]
    pub slow_rate: f64,
    #[serde(default = "default_fast_rate")]
    pub fast_rate: f64,
    #[serde(default = "default_release_rate")]
    pub release_rate: f64,
    #[serde(default = "default_fast_release_rate")]
    pub fast_release_rate: f64,
    /// Jitter amplitude added after integration (uniform in `-jitter..=jitter`)
    #[serde(default = "default_jitter")]
    pub jitter: u32,
    #[serde(default = "default_channel_keys")]
    pub channel_keys: Vec<ChannelKeys>,
    #[serde(default = "default_raise_all_key")]
    pub raise_all_key: char,
    #[serde(default = "default_drop_all_key")]
    pub drop_all_key: char,
}

impl SimConfig {
    /// Levels and rates must be finite, and the floor must not exceed the ceiling.
    pub fn validate(&self) -> Result<()> {
        let params = [
            ("floor", self.floor),
            ("ceiling", self.ceiling),
            ("slow_rate", self.slow_rate),
            ("fast_rate", self.fast_rate),
            ("release_rate", self.release_rate),
            ("fast_release_rate", self.fast_release_rate),
        ];
        if let Some((name, value)) = params.iter().find(|(_, v)| !v.is_finite()) {
            return Err(BackendError::Config(format!("simulator {} must be finite, got {}", name, value)));
        }
        if self.floor > self.ceiling {
            return Err(BackendError::Config("simulator floor above ceiling".into()));
        }
        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            floor: default_floor(),
            ceiling: default_ceiling(),
            slow_rate: default_slow_rate(),
            fast_rate: default_fast_rate(),
            release_rate: default_release_rate(),
            fast_release_rate: default_fast_release_rate(),
            jitter: default_jitter(),
            channel_keys: default_channel_keys(),
            raise_all_key: default_raise_all_key(),
            drop_all_key: default_drop_all_key(),
        }
    }
}

/// Transport selection plus its connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial(SerialConfig),
    Wifi(WifiConfig),
    Bluetooth(BleConfig),
    Simulator(SimConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Serial(SerialConfig::default())
    }
}

impl TransportConfig {
    pub fn transport(&self) -> Transport {
        match self {
            TransportConfig::Serial(_) => Transport::Serial,
            TransportConfig::Wifi(_) => Transport::Wifi,
            TransportConfig::Bluetooth(_) => Transport::Bluetooth,
            TransportConfig::Simulator(_) => Transport::Simulator,
        }
    }
}

/// Everything needed to construct one backend instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    /// Bounded `(timestamp, sample)` history; `None` keeps only the latest
    #[serde(default)]
    pub history_size: Option<usize>,
}

impl BackendConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            decode: DecodeConfig::default(),
            history_size: None,
        }
    }

    pub fn serial(config: SerialConfig) -> Self {
        Self::new(TransportConfig::Serial(config))
    }

    pub fn wifi(config: WifiConfig) -> Self {
        Self::new(TransportConfig::Wifi(config))
    }

    pub fn bluetooth(config: BleConfig) -> Self {
        Self::new(TransportConfig::Bluetooth(config))
    }

    pub fn simulator(config: SimConfig) -> Self {
        Self::new(TransportConfig::Simulator(config))
    }

    pub fn with_history(mut self, size: usize) -> Self {
        self.history_size = Some(size);
        self
    }

    pub fn with_decode(mut self, decode: DecodeConfig) -> Self {
        self.decode = decode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.decode.validate()?;
        if let TransportConfig::Simulator(sim) = &self.transport {
            if sim.channel_keys.len() > self.decode.channels {
                return Err(BackendError::Config(format!(
                    "simulator binds {} channels but samples carry {}",
                    sim.channel_keys.len(),
                    self.decode.channels
                )));
            }
            sim.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// Settings file
// ============================================================================

/// Logging configuration consumed by `logging::init_logging`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for timestamped log files; console only when `None`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
            ansi: true,
        }
    }
}

/// Top-level settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GripSettings {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GripSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: GripSettings =
            toml::from_str(text).map_err(|e| BackendError::Config(format!("Invalid settings: {}", e)))?;
        settings.backend.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BackendError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}

fn default_channels() -> usize {
    4
}
fn default_max_value() -> u32 {
    4095 // 12-bit ADC
}
fn default_true() -> bool {
    true
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_read_timeout_ms() -> u64 {
    50
}
fn default_wifi_uri() -> String {
    "ws://cardinal-grip.local:81/".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_device_name() -> String {
    "CardinalGrip_S3".to_string()
}
fn default_service_uuid() -> Uuid {
    DEFAULT_SERVICE_UUID
}
fn default_notify_uuid() -> Uuid {
    DEFAULT_NOTIFY_UUID
}
fn default_scan_timeout_ms() -> u64 {
    5000
}
fn default_max_cached_failures() -> u32 {
    3
}
fn default_tick_ms() -> u64 {
    20
}
fn default_floor() -> f64 {
    400.0
}
fn default_ceiling() -> f64 {
    3800.0
}
fn default_slow_rate() -> f64 {
    1200.0
}
fn default_fast_rate() -> f64 {
    3600.0
}
fn default_release_rate() -> f64 {
    1500.0
}
fn default_fast_release_rate() -> f64 {
    6000.0
}
fn default_jitter() -> u32 {
    20
}
fn default_channel_keys() -> Vec<ChannelKeys> {
    ["1q", "2w", "3e", "4r"]
        .iter()
        .map(|pair| {
            let mut chars = pair.chars();
            ChannelKeys {
                slow: chars.next().unwrap_or('1'),
                fast: chars.next().unwrap_or('q'),
            }
        })
        .collect()
}
fn default_raise_all_key() -> char {
    ' '
}
fn default_drop_all_key() -> char {
    '0'
}
fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_firmware() {
        let serial = SerialConfig::default();
        assert_eq!(serial.baud_rate, 115_200);
        assert!(serial.port.is_none());

        let ble = BleConfig::default();
        assert_eq!(ble.device_name, "CardinalGrip_S3");
        assert_eq!(
            ble.notify_uuid.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );

        assert_eq!(WifiConfig::default().uri, "ws://cardinal-grip.local:81/");
        assert_eq!(DecodeConfig::default().max_value, 4095);
    }

    #[test]
    fn test_tagged_transport_from_toml() {
        let text = r#"
            [backend]
            history_size = 500

            [backend.transport]
            kind = "wifi"
            uri = "ws://192.168.1.73:81/"

            [backend.decode]
            channels = 4
            clamp = false
        "#;
        let settings = GripSettings::from_toml_str(text).unwrap();
        assert_eq!(settings.backend.history_size, Some(500));
        assert!(!settings.backend.decode.clamp);
        match settings.backend.transport {
            TransportConfig::Wifi(ref wifi) => {
                assert_eq!(wifi.uri, "ws://192.168.1.73:81/");
                assert_eq!(wifi.reconnect_delay_ms, 3000);
            }
            ref other => panic!("expected wifi, got {:?}", other),
        }
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_empty_settings_default_to_serial() {
        let settings = GripSettings::from_toml_str("").unwrap();
        assert_eq!(settings.backend.transport.transport(), Transport::Serial);
    }

    #[test]
    fn test_invalid_decode_rejected() {
        let text = r#"
            [backend.transport]
            kind = "simulator"

            [backend.decode]
            channels = 0
        "#;
        assert!(matches!(
            GripSettings::from_toml_str(text),
            Err(BackendError::Config(_))
        ));
    }

    #[test]
    fn test_simulator_needs_enough_channels() {
        let config = BackendConfig::simulator(SimConfig::default()).with_decode(DecodeConfig {
            channels: 2,
            ..DecodeConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_finite_simulator_rates_rejected() {
        for bad in [f64::NAN, f64::INFINITY] {
            let sim = SimConfig {
                slow_rate: bad,
                ..SimConfig::default()
            };
            assert!(matches!(
                BackendConfig::simulator(sim).validate(),
                Err(BackendError::Config(_))
            ));
        }
        let nan_floor = SimConfig {
            floor: f64::NAN,
            ..SimConfig::default()
        };
        assert!(nan_floor.validate().is_err());
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[backend.transport]\nkind = \"serial\"\nport = \"/dev/ttyACM0\"\nbaud_rate = 921600"
        )
        .unwrap();
        let settings = GripSettings::load(file.path()).unwrap();
        assert_eq!(
            settings.backend.transport,
            TransportConfig::Serial(SerialConfig {
                port: Some("/dev/ttyACM0".into()),
                baud_rate: 921_600,
                ..SerialConfig::default()
            })
        );
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = GripSettings::load(Path::new("/nonexistent/grip.toml")).unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }
}
