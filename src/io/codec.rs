// src/io/codec.rs
//
// Wire decoding shared by the serial, WebSocket and BLE transports.
//
// Every inbound unit (a text line, a WebSocket text frame, or a GATT
// notification payload) is comma-separated. Only the trailing `channels`
// fields are channel values; anything before them is device metadata such as
// a sequence number or firmware timestamp and is ignored.

use std::num::IntErrorKind;

use crate::config::DecodeConfig;
use crate::error::DecodeError;
use crate::io::Sample;

/// Decode one text unit into a sample.
pub fn decode_line(line: &str, config: &DecodeConfig) -> Result<Sample, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < config.channels {
        return Err(DecodeError::TooFewFields {
            required: config.channels,
            found: fields.len(),
        });
    }

    let mut values = Vec::with_capacity(config.channels);
    for field in &fields[fields.len() - config.channels..] {
        let field = field.trim();
        values.push(apply_range(parse_field(field)?, config)?);
    }

    Ok(Sample::new(values))
}

/// Decode a binary payload (BLE notification, binary WebSocket frame).
/// Non-ASCII bytes are replaced rather than failing the whole unit.
pub fn decode_payload(payload: &[u8], config: &DecodeConfig) -> Result<Sample, DecodeError> {
    decode_line(&String::from_utf8_lossy(payload), config)
}

/// Encode a host-to-device command as one newline-terminated UTF-8 line.
pub fn encode_command(command: &str) -> Vec<u8> {
    let trimmed = command.trim_end_matches(['\r', '\n']);
    let mut bytes = Vec::with_capacity(trimmed.len() + 1);
    bytes.extend_from_slice(trimmed.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Integers too large for `i64` saturate so they are range-checked like any
/// other out-of-range value.
fn parse_field(field: &str) -> Result<i64, DecodeError> {
    field.parse::<i64>().or_else(|e| match e.kind() {
        IntErrorKind::PosOverflow => Ok(i64::MAX),
        IntErrorKind::NegOverflow => Ok(i64::MIN),
        _ => Err(DecodeError::NotAnInteger {
            field: field.to_string(),
        }),
    })
}

fn apply_range(raw: i64, config: &DecodeConfig) -> Result<u32, DecodeError> {
    let min = i64::from(config.min_value);
    let max = i64::from(config.max_value);
    if raw < min || raw > max {
        if !config.clamp {
            return Err(DecodeError::OutOfRange {
                value: raw,
                min: config.min_value,
                max: config.max_value,
            });
        }
        return Ok(raw.clamp(min, max) as u32);
    }
    Ok(raw as u32)
}
