// src/io/ble/scan.rs
//
// One-shot scan for device pickers, independent of any running backend.

use btleplug::api::Peripheral as _;
use serde::Serialize;
use std::time::Duration;

use crate::ble_common;
use crate::error::Result;

const SCAN_POLL: Duration = Duration::from_millis(500);

/// A nearby advertising device
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BleDeviceInfo {
    pub name: Option<String>,
    /// Platform peripheral id (a MAC address on Linux/Windows, a UUID on macOS)
    pub address: String,
    pub rssi: Option<i16>,
}

/// Scan for `timeout` and list every device seen, strongest signal first.
pub async fn scan_devices(timeout: Duration) -> Result<Vec<BleDeviceInfo>> {
    let adapter = ble_common::ensure_adapter().await?;
    tracing::info!("[ble] Scanning for {:?}", timeout);

    let found = ble_common::scan_peripherals(&adapter, timeout, SCAN_POLL, |_| false).await?;
    let mut devices: Vec<BleDeviceInfo> = found
        .into_iter()
        .map(|(peripheral, name, rssi)| BleDeviceInfo {
            name,
            address: peripheral.id().to_string(),
            rssi,
        })
        .collect();
    sort_by_signal(&mut devices);

    tracing::info!("[ble] Scan finished, {} device(s)", devices.len());
    Ok(devices)
}

fn sort_by_signal(devices: &mut [BleDeviceInfo]) {
    devices.sort_by(|a, b| b.rssi.unwrap_or(i16::MIN).cmp(&a.rssi.unwrap_or(i16::MIN)));
}
