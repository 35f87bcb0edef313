// src/io/sim/mod.rs
//
// Simulated sensor for development without hardware.

pub mod model;
pub mod reader;

pub use model::RampModel;
pub use reader::SimBackend;
