// src/io/wifi/mod.rs
//
// WebSocket transport to the sensor's on-board server.

pub mod reader;

pub use reader::WifiBackend;
