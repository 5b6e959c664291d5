//! HTTP implementation of the ingestion backend.

use airbox_env::{EnvError, IngestBackend, IngestRecord, RegisteredSensor, SensorId, SensorRegistration, SensorSettings};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Household lookup endpoints, tried in order.
const HOUSEHOLD_PATHS: [&str; 3] = ["/households", "/api/households/resolve", "/api/households"];

#[derive(Debug, Deserialize)]
struct CreatedSensor {
    id: Uuid,
    #[serde(default)]
    name: Option<String>,
}

/// reqwest-backed client for the ingestion API.
pub struct HttpBackend {
    http: Client,
    base_url: RwLock<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: RwLock::new(normalize_base(base_url)),
        }
    }

    pub fn base_url(&self) -> String {
        match self.base_url.read() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Points subsequent requests at another server.
    pub fn set_base_url(&self, base_url: &str) {
        let normalized = normalize_base(base_url);
        let mut guard = match self.base_url.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != normalized {
            debug!(from = %guard, to = %normalized, "Backend base URL changed");
            *guard = normalized;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

fn normalize_base(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

fn transport_error(e: reqwest::Error) -> EnvError {
    if e.is_timeout() {
        EnvError::Timeout(REQUEST_TIMEOUT.as_millis() as u64)
    } else if e.is_connect() {
        EnvError::connection(e.to_string())
    } else if e.is_decode() {
        EnvError::Serialization(e.to_string())
    } else {
        EnvError::protocol(e.to_string())
    }
}

/// Extracts `house_id` from an object, or from the first list entry carrying one.
pub fn household_from(value: &Value) -> Option<String> {
    let id_of = |v: &Value| match v.get("house_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    match value {
        Value::Array(items) => items.iter().find_map(id_of),
        other => id_of(other),
    }
}

/// Settings are the sensor object's `meta`, falling back to `metadata`.
pub fn settings_from(value: &Value) -> SensorSettings {
    ["meta", "metadata"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_object))
        .cloned()
        .unwrap_or_default()
}

async fn json_body(response: Response) -> Result<Value, EnvError> {
    response.json::<Value>().await.map_err(transport_error)
}

#[async_trait]
impl IngestBackend for HttpBackend {
    async fn resolve_household(&self, householder: &str) -> Result<Option<String>, EnvError> {
        let mut last_error = None;
        for path in HOUSEHOLD_PATHS {
            let response = match self
                .http
                .get(self.url(path))
                .query(&[("householder", householder)])
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(transport_error(e));
                    continue;
                }
            };
            if !response.status().is_success() {
                debug!(path, status = response.status().as_u16(), "Household lookup missed");
                continue;
            }
            match json_body(response).await {
                Ok(body) => {
                    if let Some(id) = household_from(&body) {
                        return Ok(Some(id));
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn create_sensor(&self, registration: &SensorRegistration) -> Result<RegisteredSensor, EnvError> {
        let response = self
            .http
            .post(self.url("/sensors/"))
            .query(&[("house_id", registration.house_id.as_str())])
            .json(registration)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnvError::Status(status.as_u16()));
        }
        let created = response.json::<CreatedSensor>().await.map_err(transport_error)?;
        Ok(RegisteredSensor {
            id: SensorId(created.id),
            name: created.name.unwrap_or_else(|| registration.name.clone()),
        })
    }

    async fn fetch_sensor_settings(&self, sensor_id: &SensorId) -> Result<Option<SensorSettings>, EnvError> {
        let response = self
            .http
            .get(self.url(&format!("/sensors/{}", sensor_id)))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().as_u16() != 200 {
            return Ok(None);
        }
        let body = json_body(response).await?;
        Ok(Some(settings_from(&body)))
    }

    async fn ingest(&self, record: &IngestRecord) -> Result<u16, EnvError> {
        let response = self
            .http
            .post(self.url("/ingest"))
            .json(record)
            .send()
            .await
            .map_err(transport_error)?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_household_from_object_and_list() {
        assert_eq!(household_from(&json!({"house_id": "H001"})), Some("H001".to_string()));
        assert_eq!(household_from(&json!({"house_id": 17})), Some("17".to_string()));
        assert_eq!(
            household_from(&json!([{"name": "x"}, {"house_id": "H002"}])),
            Some("H002".to_string())
        );
        assert_eq!(household_from(&json!({"house_id": ""})), None);
        assert_eq!(household_from(&json!([])), None);
    }

    #[test]
    fn test_settings_prefer_meta() {
        let both = json!({"meta": {"min": 1}, "metadata": {"min": 2}});
        assert_eq!(settings_from(&both)["min"], 1);

        let fallback = json!({"metadata": {"max": 9}});
        assert_eq!(settings_from(&fallback)["max"], 9);

        assert!(settings_from(&json!({"id": "x"})).is_empty());
    }

    #[test]
    fn test_base_url_normalized_and_replaced() {
        let backend = HttpBackend::new("http://backend:8000/");
        assert_eq!(backend.url("/ingest"), "http://backend:8000/ingest");

        backend.set_base_url(" https://api.example.org ");
        assert_eq!(backend.base_url(), "https://api.example.org");
    }

    #[test]
    fn test_transport_errors_are_transient() {
        // Nothing listens on the discard port; connection is refused
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let backend = HttpBackend::new("http://127.0.0.1:9");
        let err = rt
            .block_on(backend.ingest(&IngestRecord::new(SensorId::from_seed(1), 1.0)))
            .unwrap_err();
        assert!(err.is_transient());
    }
}
