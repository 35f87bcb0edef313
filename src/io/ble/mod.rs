// src/io/ble/mod.rs
//
// Bluetooth Low Energy transport (notify-only GATT stream).

pub mod reader;
pub mod scan;

pub use reader::BleBackend;
pub use scan::{scan_devices, BleDeviceInfo};
