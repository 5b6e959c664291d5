//! Common types shared between the fleet engine and its backends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Server-assigned identifier of a provisioned sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub Uuid);

impl SensorId {
    /// Creates a new random SensorId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SensorId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-form sensor metadata as stored by the backend.
pub type SensorSettings = Map<String, Value>;

/// One reading posted to the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub sensor_id: SensorId,
    pub value: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl IngestRecord {
    /// Creates a record without attributes.
    pub fn new(sensor_id: SensorId, value: f64) -> Self {
        Self {
            sensor_id,
            value,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds one attribute.
    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Request to provision one sensor under a household.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRegistration {
    /// Household the sensor belongs to (sent as a query parameter)
    #[serde(skip)]
    pub house_id: String,

    /// Display name, `<box>_<sensor>`
    pub name: String,

    /// Declared sensor type (e.g. `co2`, `temperature`)
    #[serde(rename = "type")]
    pub sensor_type: String,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub metadata: SensorSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// Backend response to a provisioning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredSensor {
    pub id: SensorId,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_id_from_seed_is_stable() {
        assert_eq!(SensorId::from_seed(7), SensorId::from_seed(7));
        assert_ne!(SensorId::from_seed(7), SensorId::from_seed(8));
    }

    #[test]
    fn test_ingest_record_wire_shape() {
        let id = SensorId::from_seed(1);
        let record = IngestRecord::new(id, 21.5)
            .with_attribute("unit", "temperature")
            .with_attribute("simulated", true);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sensor_id"], Value::String(id.to_string()));
        assert_eq!(json["value"], 21.5);
        assert_eq!(json["attributes"]["unit"], "temperature");
        assert_eq!(json["attributes"]["simulated"], true);
    }

    #[test]
    fn test_registration_skips_house_id() {
        let registration = SensorRegistration {
            house_id: "H001".into(),
            name: "kitchen_co2".into(),
            sensor_type: "co2".into(),
            location: None,
            metadata: SensorSettings::new(),
            serial_number: None,
        };
        let json = serde_json::to_value(&registration).unwrap();
        assert!(json.get("house_id").is_none());
        assert_eq!(json["type"], "co2");
        assert!(json.get("serial_number").is_none());
    }
}
