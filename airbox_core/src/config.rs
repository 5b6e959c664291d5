//! Declarative fleet configuration: document model, typed box definitions and
//! the file-backed store with registration updates.

use crate::box_env::EnvironmentParams;
use crate::simulator::Profile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Config is missing the boxes list")]
    MissingBoxes,

    #[error("Serial number not found in config: {0}")]
    UnknownSerial(String),

    #[error("period_seconds must be a finite number of at most {max} s, got {value}")]
    InvalidPeriod { value: f64, max: f64 },
}

/// Seed given in a box definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedSource {
    Int(u64),
    Text(String),
}

/// First 8 bytes of SHA-256, big-endian.
pub fn hash_u64(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{:02x}", b)).collect()
}

fn default_true() -> bool {
    true
}

/// One virtual sensor of a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub sensor_type: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, alias = "serial_number", skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Static metadata (`min`, `max`, anything else is forwarded to the backend)
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// One box in the fleet document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub householder: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default)]
    pub registered: bool,

    #[serde(default, deserialize_with = "lenient_profile")]
    pub profile: Profile,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<SeedSource>,

    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,

    /// Position in the document's boxes list
    #[serde(skip)]
    pub index: usize,
}

fn lenient_profile<'de, D>(deserializer: D) -> Result<Profile, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw {
        None => Profile::default(),
        Some(text) => text.parse().unwrap_or_else(|_| {
            warn!(profile = %text, "Unknown profile, using intermittent");
            Profile::Intermittent
        }),
    })
}

impl BoxDefinition {
    /// Box key: serial number, else name, else `box_<index>`.
    pub fn key(&self) -> String {
        match (&self.serial_number, self.name.is_empty()) {
            (Some(serial), _) if !serial.is_empty() => serial.clone(),
            (_, false) => self.name.clone(),
            _ => format!("box_{}", self.index),
        }
    }

    /// SHA-256 over the normalized JSON of the typed definition.
    pub fn signature(&self) -> String {
        match serde_json::to_vec(self) {
            Ok(bytes) => hex_digest(&bytes),
            Err(_) => hex_digest(format!("{:?}", self).as_bytes()),
        }
    }

    /// Simulator seed: explicit int, else hash of the seed text, serial or name.
    pub fn seed_value(&self) -> u64 {
        match &self.seed {
            Some(SeedSource::Int(seed)) => *seed,
            Some(SeedSource::Text(text)) => hash_u64(text),
            None => hash_u64(self.serial_number.as_deref().unwrap_or(&self.name)),
        }
    }

    /// Reported serial: last five characters of the serial number read as base 36,
    /// clipped to the 16-bit serial channel.
    pub fn reported_serial(&self) -> Option<u16> {
        let serial = self.serial_number.as_deref()?;
        let chars: Vec<char> = serial.chars().collect();
        let tail: String = chars[chars.len().saturating_sub(5)..].iter().collect();
        let value = u64::from_str_radix(&tail, 36).ok()?;
        Some(value.min(u64::from(u16::MAX)) as u16)
    }

    pub fn environment_params(&self, period: Duration) -> EnvironmentParams {
        EnvironmentParams {
            profile: self.profile,
            seed: self.seed_value(),
            serial: self.reported_serial(),
            period_seconds: period.as_secs_f64(),
        }
    }
}

/// Longest accepted tick period.
pub const MAX_PERIOD_SECONDS: f64 = 86_400.0;

fn default_period_seconds() -> f64 {
    60.0
}

fn default_phase_max_ms() -> u64 {
    10_000
}

fn default_max_inflight() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
struct DocumentHeader {
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default = "default_period_seconds")]
    period_seconds: f64,
    #[serde(default = "default_phase_max_ms")]
    phase_max_ms: u64,
    #[serde(default = "default_max_inflight")]
    max_inflight: usize,
}

/// The fleet configuration document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    pub period_seconds: f64,
    pub phase_max_ms: u64,
    pub max_inflight: usize,
    pub boxes: Vec<BoxDefinition>,
}

impl Default for FleetDocument {
    fn default() -> Self {
        Self {
            server_url: None,
            period_seconds: default_period_seconds(),
            phase_max_ms: default_phase_max_ms(),
            max_inflight: default_max_inflight(),
            boxes: Vec::new(),
        }
    }
}

impl FleetDocument {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Parses a document, skipping box definitions that do not parse.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let raw_boxes = match value.get("boxes") {
            Some(Value::Array(items)) => items.clone(),
            _ => return Err(ConfigError::MissingBoxes),
        };
        let header: DocumentHeader = serde_json::from_value(value)?;
        if !header.period_seconds.is_finite() || header.period_seconds > MAX_PERIOD_SECONDS {
            return Err(ConfigError::InvalidPeriod {
                value: header.period_seconds,
                max: MAX_PERIOD_SECONDS,
            });
        }

        let mut boxes = Vec::with_capacity(raw_boxes.len());
        for (index, raw) in raw_boxes.into_iter().enumerate() {
            match serde_json::from_value::<BoxDefinition>(raw) {
                Ok(mut definition) => {
                    definition.index = index;
                    boxes.push(definition);
                }
                Err(e) => warn!(index = index, error = %e, "Skipping invalid box definition"),
            }
        }

        Ok(Self {
            server_url: header.server_url,
            period_seconds: header.period_seconds,
            phase_max_ms: header.phase_max_ms,
            max_inflight: header.max_inflight.min(Semaphore::MAX_PERMITS),
            boxes,
        })
    }

    pub fn globals(&self) -> GlobalSettings {
        let period_secs = if self.period_seconds.is_finite() {
            self.period_seconds.clamp(1.0, MAX_PERIOD_SECONDS)
        } else {
            default_period_seconds()
        };
        GlobalSettings {
            server_url: self.server_url.clone(),
            period: Duration::from_secs_f64(period_secs),
            phase_max_ms: self.phase_max_ms,
            max_inflight: self.max_inflight.clamp(1, Semaphore::MAX_PERMITS),
        }
    }
}

/// Fleet-wide scheduling parameters; any change restarts every runner.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub server_url: Option<String>,
    pub period: Duration,
    pub phase_max_ms: u64,
    pub max_inflight: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        FleetDocument::default().globals()
    }
}

/// Anything that can produce the current fleet document.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<FleetDocument, ConfigError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldAction {
    Set,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub action: FieldAction,
    #[serde(default)]
    pub value: Option<Value>,
}

impl FieldUpdate {
    pub fn set(value: impl Into<Value>) -> Self {
        Self { action: FieldAction::Set, value: Some(value.into()) }
    }

    pub fn clear() -> Self {
        Self { action: FieldAction::Clear, value: None }
    }
}

/// A field's state before an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub present: bool,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationUpdate {
    pub serial_number: String,
    pub house_id: FieldUpdate,
    pub registered: FieldUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub house_id: FieldState,
    pub registered: FieldState,
}

fn apply_field_update(target: &mut Map<String, Value>, key: &str, update: &FieldUpdate) -> FieldState {
    let previous = match update.action {
        FieldAction::Set => target.insert(key.to_string(), update.value.clone().unwrap_or(Value::Null)),
        FieldAction::Clear => target.remove(key),
    };
    FieldState {
        present: previous.is_some(),
        value: previous,
    }
}

/// Applies a registration update to a raw document in place.
pub fn apply_registration(document: &mut Value, update: &RegistrationUpdate) -> Result<RegistrationOutcome, ConfigError> {
    let boxes = match document.get_mut("boxes") {
        Some(Value::Array(items)) => items,
        _ => return Err(ConfigError::MissingBoxes),
    };
    let target = boxes
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .find(|b| b.get("serial_number").and_then(Value::as_str) == Some(update.serial_number.as_str()))
        .ok_or_else(|| ConfigError::UnknownSerial(update.serial_number.clone()))?;

    Ok(RegistrationOutcome {
        house_id: apply_field_update(target, "house_id", &update.house_id),
        registered: apply_field_update(target, "registered", &update.registered),
    })
}

/// JSON configuration file guarded by a store-wide lock.
pub struct FileConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sets or clears `house_id` / `registered` on the box with the given serial
    /// and persists the document. Returns both fields' previous state.
    pub async fn update_registration(&self, update: &RegistrationUpdate) -> Result<RegistrationOutcome, ConfigError> {
        let _guard = self.lock.lock().await;
        let text = tokio::fs::read_to_string(&self.path).await?;
        let mut document: Value = serde_json::from_str(&text)?;
        let outcome = apply_registration(&mut document, update)?;
        self.write_document(&document).await?;
        info!(serial = %update.serial_number, "Registration updated");
        Ok(outcome)
    }

    async fn write_document(&self, document: &Value) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut text = serde_json::to_string_pretty(document)?;
        text.push('\n');

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &text).await?;
        match tokio::fs::rename(&tmp, &self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ResourceBusy => {
                // Bind-mounted target cannot be replaced; overwrite in place
                let contents = tokio::fs::read(&tmp).await?;
                tokio::fs::write(&self.path, contents).await?;
                tokio::fs::remove_file(&tmp).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConfigSource for FileConfigStore {
    async fn load(&self) -> Result<FleetDocument, ConfigError> {
        let _guard = self.lock.lock().await;
        let text = tokio::fs::read_to_string(&self.path).await?;
        FleetDocument::parse(&text)
    }
}
