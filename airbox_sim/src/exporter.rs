//! JSON exporter for simulated reading windows.
//!
//! Each frame carries the decoded reading next to its 22-byte wire frame in hex.

use airbox_core::{decode, encode, from_hex, to_hex, CodecError, EnvironmentSimulator, Profile, Reading, SimulatorConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A single tick of an exported window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowFrame {
    /// Tick timestamp
    pub time: DateTime<Utc>,

    /// Reading as produced by the simulator
    pub reading: Reading,

    /// Upper-case hex of the encoded frame
    pub frame_hex: String,
}

/// Complete window export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowExport {
    pub profile: Profile,
    pub seed: u64,
    pub start: DateTime<Utc>,
    pub period_minutes: f64,
    pub frames: Vec<WindowFrame>,
}

impl WindowExport {
    /// Runs a fresh simulator over `hours` starting at `start`.
    pub fn generate(config: SimulatorConfig, start: DateTime<Utc>, hours: f64) -> Self {
        let mut sim = EnvironmentSimulator::new(config.clone());
        let frames = sim
            .generate_window(start, hours)
            .into_iter()
            .map(|(time, reading)| WindowFrame {
                time,
                reading,
                frame_hex: to_hex(&encode(&reading)),
            })
            .collect();

        Self {
            profile: config.profile,
            seed: config.seed,
            start,
            period_minutes: config.period_minutes,
            frames,
        }
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// Decodes one hex-encoded wire frame, as captured from a gateway log.
pub fn decode_frame_hex(text: &str) -> Result<Reading, CodecError> {
    let text = text.trim();
    let text = text.strip_prefix("0x").unwrap_or(text);
    decode(&from_hex(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use airbox_core::FRAME_LEN;
    use std::time::{Duration, UNIX_EPOCH};

    fn start() -> DateTime<Utc> {
        DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(1_710_237_600))
    }

    #[test]
    fn test_export_frames_match_window() {
        let config = SimulatorConfig {
            seed: 9,
            serial: Some(0x1234),
            ..SimulatorConfig::default()
        };
        let export = WindowExport::generate(config, start(), 1.0);

        assert_eq!(export.frames.len(), 12);
        assert_eq!(export.frames[0].time, start());
        assert_eq!(export.frames[1].time - export.frames[0].time, chrono::Duration::minutes(5));
        for frame in &export.frames {
            assert_eq!(frame.frame_hex.len(), FRAME_LEN * 2);
            assert!(frame.frame_hex.starts_with("1234"));
            let decoded = decode_frame_hex(&frame.frame_hex).unwrap();
            assert_eq!(decoded.serial, frame.reading.serial);
        }
    }

    #[test]
    fn test_export_writes_json() {
        let export = WindowExport::generate(SimulatorConfig::default(), start(), 0.5);
        let path = std::env::temp_dir().join(format!("airbox-export-{}.json", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        export.write_to_file(&path_str).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["profile"], "intermittent");
        assert_eq!(value["frames"].as_array().unwrap().len(), 6);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_decode_frame_hex_input_forms() {
        let config = SimulatorConfig {
            seed: 3,
            serial: Some(0xBEEF),
            ..SimulatorConfig::default()
        };
        let export = WindowExport::generate(config, start(), 0.5);
        let hex = &export.frames[0].frame_hex;

        let plain = decode_frame_hex(hex).unwrap();
        assert_eq!(plain.serial, 0xBEEF);
        assert_eq!(decode_frame_hex(&format!(" 0x{} \n", hex.to_lowercase())).unwrap(), plain);

        assert!(matches!(
            decode_frame_hex(&hex[..40]),
            Err(CodecError::LengthMismatch { expected: 22, actual: 20 })
        ));
        assert!(matches!(decode_frame_hex("XYZ0"), Err(CodecError::InvalidHex(_))));
    }
}
