// src/io/serial/mod.rs
//
// USB-serial transport.

pub mod framer;
pub mod reader;
pub mod utils;

pub use reader::SerialBackend;
pub use utils::{auto_detect_port, list_ports, SerialPortInfo};
