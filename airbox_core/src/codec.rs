//! 22-byte uplink frame: eleven big-endian 16-bit fields in channel order.
//!
//! Each value is clipped to its channel bounds, multiplied by the channel
//! scale, rounded and stored as `i16` (temperature) or `u16` (everything else).

use crate::schema::{Channel, ChannelMap, Reading, CHANNEL_COUNT};
use thiserror::Error;

/// Encoded frame length in bytes.
pub const FRAME_LEN: usize = CHANNEL_COUNT * 2;

/// Illuminance is carried as a plain u16 lux count.
const LUX_WIRE_MAX: f64 = 65535.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Invalid hex payload: {0}")]
    InvalidHex(String),
}

fn wire_bounds(channel: Channel) -> (f64, f64) {
    let spec = channel.spec();
    match channel {
        Channel::Illuminance => (spec.lo, spec.hi.min(LUX_WIRE_MAX)),
        _ => (spec.lo, spec.hi),
    }
}

/// Encodes a reading into its wire frame.
pub fn encode(reading: &Reading) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    for channel in Channel::ALL {
        let spec = channel.spec();
        let value = match channel {
            Channel::Serial => reading.get(channel),
            _ => {
                let (lo, hi) = wire_bounds(channel);
                reading.get(channel).clamp(lo, hi)
            }
        };
        let scaled = (value * spec.scale).round();
        let bytes = if spec.signed {
            (scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16).to_be_bytes()
        } else {
            (scaled.clamp(0.0, f64::from(u16::MAX)) as u16).to_be_bytes()
        };
        let at = channel.index() * 2;
        frame[at..at + 2].copy_from_slice(&bytes);
    }
    frame
}

/// Decodes a wire frame back into engineering units.
pub fn decode(bytes: &[u8]) -> Result<Reading, CodecError> {
    if bytes.len() != FRAME_LEN {
        return Err(CodecError::LengthMismatch {
            expected: FRAME_LEN,
            actual: bytes.len(),
        });
    }

    let mut values = ChannelMap::zeros();
    for channel in Channel::ALL {
        let spec = channel.spec();
        let at = channel.index() * 2;
        let raw = [bytes[at], bytes[at + 1]];
        let wire = if spec.signed {
            f64::from(i16::from_be_bytes(raw))
        } else {
            f64::from(u16::from_be_bytes(raw))
        };
        let (lo, hi) = wire_bounds(channel);
        values[channel] = (wire / spec.scale).clamp(lo, hi);
    }
    Ok(Reading::from_values(&values))
}

/// Upper-case hex rendering of a frame.
pub fn to_hex(frame: &[u8]) -> String {
    frame.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Parses a hex payload (either case, surrounding whitespace ignored).
pub fn from_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    let text = text.trim();
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(CodecError::InvalidHex(text.to_string()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| CodecError::InvalidHex(text.to_string())))
        .collect()
}
