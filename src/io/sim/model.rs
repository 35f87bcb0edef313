// src/io/sim/model.rs
//
// Keyboard-driven ramp model. Pure and clock-free: the caller supplies the
// elapsed time, so the same key timeline gives the same curve at any tick rate.

use std::collections::HashSet;

use crate::config::{ChannelKeys, SimConfig};

#[derive(Debug, Clone)]
pub struct RampModel {
    config: SimConfig,
    levels: Vec<f64>,
}

impl RampModel {
    /// Model `channels` channels; channels without key bindings stay at the floor.
    pub fn new(config: SimConfig, channels: usize) -> Self {
        let levels = vec![config.floor; channels];
        Self { config, levels }
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }

    /// Snap every channel back to the resting floor.
    pub fn reset(&mut self) {
        for level in &mut self.levels {
            *level = self.config.floor;
        }
    }

    /// Upward drive rate for `channel` given the held keys. Zero means releasing.
    pub fn drive_rate(&self, channel: usize, pressed: &HashSet<char>) -> f64 {
        let held = |key: char| pressed.contains(&key.to_ascii_lowercase());
        let mut rate = match self.config.channel_keys.get(channel) {
            Some(ChannelKeys { slow, fast }) => match (held(*slow), held(*fast)) {
                (true, true) => (self.config.slow_rate + self.config.fast_rate) / 2.0,
                (true, false) => self.config.slow_rate,
                (false, true) => self.config.fast_rate,
                (false, false) => 0.0,
            },
            None => 0.0,
        };
        if held(self.config.raise_all_key) {
            rate = rate.max(self.config.slow_rate);
        }
        rate
    }

    /// Rate at which released channels decay toward the floor
    pub fn release_rate(&self, pressed: &HashSet<char>) -> f64 {
        if pressed.contains(&self.config.drop_all_key.to_ascii_lowercase()) {
            self.config.fast_release_rate
        } else {
            self.config.release_rate
        }
    }

    /// Advance every channel by `dt_secs` of wall-clock time.
    pub fn step(&mut self, dt_secs: f64, pressed: &HashSet<char>) {
        let dt = dt_secs.max(0.0);
        let down = self.release_rate(pressed);
        for channel in 0..self.levels.len() {
            let up = self.drive_rate(channel, pressed);
            let level = self.levels[channel];
            self.levels[channel] = if up > 0.0 {
                (level + up * dt).min(self.config.ceiling)
            } else {
                (level - down * dt).max(self.config.floor)
            };
        }
    }
}
