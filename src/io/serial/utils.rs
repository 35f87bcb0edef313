// src/io/serial/utils.rs
//
// Serial port helpers: conversions to serialport crate types, port
// enumeration, and auto-detection of the sensor's USB-serial port.

use serde::Serialize;
use serialport::{DataBits, Parity as SpParity, StopBits};

use crate::config::Parity;
use crate::error::{BackendError, Result};

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits count to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Short `8N1`-style summary for log lines
pub fn line_settings(data_bits: u8, parity: Parity, stop_bits: u8) -> String {
    let p = match parity {
        Parity::None => 'N',
        Parity::Odd => 'O',
        Parity::Even => 'E',
    };
    format!("{}{}{}", data_bits, p, stop_bits)
}

// ============================================================================
// Port Enumeration
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// List available serial ports.
/// On macOS, /dev/tty.* duplicates are skipped in favour of /dev/cu.*, which
/// do not block on open waiting for carrier detect.
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| BackendError::NoDeviceFound(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

// ============================================================================
// Auto-detection
// ============================================================================

/// Heuristic score of how likely `port` is the sensor's USB-serial bridge.
/// `None` means the port is a Bluetooth virtual port and never a candidate.
pub fn score_port(port: &SerialPortInfo) -> Option<u32> {
    let combo = format!(
        "{} {} {} {}",
        port.port_name,
        port.manufacturer.as_deref().unwrap_or(""),
        port.product.as_deref().unwrap_or(""),
        port.serial_number.as_deref().unwrap_or(""),
    )
    .to_lowercase();

    if port.port_type == "Bluetooth" || combo.contains("bluetooth") {
        return None;
    }

    let has = |needles: &[&str]| needles.iter().any(|n| combo.contains(n));
    let mut score = 0;
    if has(&["usbserial", "usb modem", "usbmodem"]) {
        score += 3;
    }
    if has(&["cp210", "ch340", "wchusb"]) {
        score += 2;
    }
    if has(&["esp32", "feather", "arduino"]) {
        score += 2;
    }
    if combo.contains("usb") {
        score += 1;
    }
    if port.port_type == "USB" {
        score += 1;
    }
    Some(score)
}

/// Candidate ports, best first. Equal scores keep enumeration order.
pub fn rank_ports(ports: &[SerialPortInfo]) -> Vec<(u32, &SerialPortInfo)> {
    let mut ranked: Vec<(u32, &SerialPortInfo)> = ports
        .iter()
        .filter_map(|p| score_port(p).map(|score| (score, p)))
        .collect();
    // Stable sort keeps enumeration order for ties
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    ranked
}

/// Pick a port from an already-enumerated list.
pub fn pick_port(ports: &[SerialPortInfo]) -> Result<String> {
    rank_ports(ports)
        .first()
        .map(|(_, p)| p.port_name.clone())
        .ok_or_else(|| BackendError::NoDeviceFound("no serial ports available".to_string()))
}

/// Enumerate the system's ports and pick the most likely sensor port.
pub fn auto_detect_port() -> Result<String> {
    let ports = list_ports()?;
    let port = pick_port(&ports)?;
    tracing::debug!("[serial] Auto-detected {} among {} port(s)", port, ports.len());
    Ok(port)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, port_type: &str, product: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: port_type.to_string(),
            manufacturer: None,
            product: product.map(str::to_string),
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    #[test]
    fn test_prefers_usb_modem() {
        let ports = vec![
            port("/dev/cu.debug-console", "Unknown", None),
            port("/dev/cu.usbmodem14101", "USB", Some("ESP32-S3")),
        ];
        assert_eq!(pick_port(&ports).unwrap(), "/dev/cu.usbmodem14101");
    }

    #[test]
    fn test_bluetooth_ports_excluded() {
        let ports = vec![
            port("/dev/cu.Bluetooth-Incoming-Port", "Unknown", None),
            port("/dev/rfcomm0", "Bluetooth", None),
        ];
        assert!(matches!(pick_port(&ports), Err(BackendError::NoDeviceFound(_))));
    }

    #[test]
    fn test_unscored_port_is_fallback() {
        let ports = vec![
            port("/dev/cu.Bluetooth-Incoming-Port", "Unknown", None),
            port("/dev/ttyS0", "Unknown", None),
        ];
        assert_eq!(pick_port(&ports).unwrap(), "/dev/ttyS0");
    }

    #[test]
    fn test_ties_keep_enumeration_order() {
        let ports = vec![
            port("/dev/ttyACM0", "USB", None),
            port("/dev/ttyACM1", "USB", None),
        ];
        let ranked = rank_ports(&ports);
        assert_eq!(ranked[0].1.port_name, "/dev/ttyACM0");
        assert_eq!(ranked[0].0, ranked[1].0);
    }

    #[test]
    fn test_bridge_chip_scores() {
        let cp210 = port("COM4", "USB", Some("Silicon Labs CP210x USB to UART Bridge"));
        let plain = port("COM3", "USB", None);
        assert!(score_port(&cp210).unwrap() > score_port(&plain).unwrap());
        assert!(pick_port(&[]).is_err());
    }

    #[test]
    fn test_to_serialport_conversions() {
        assert!(matches!(to_serialport_parity(Parity::Odd), SpParity::Odd));
        assert!(matches!(to_serialport_data_bits(7), DataBits::Seven));
        assert!(matches!(to_serialport_data_bits(9), DataBits::Eight)); // default
        assert!(matches!(to_serialport_stop_bits(2), StopBits::Two));
        assert!(matches!(to_serialport_stop_bits(0), StopBits::One)); // default
        assert_eq!(line_settings(8, Parity::None, 1), "8N1");
    }
}
