//! Backend abstraction: sensor provisioning, settings lookup and ingestion.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{IngestRecord, RegisteredSensor, SensorId, SensorRegistration, SensorSettings};

/// Abstraction for the telemetry backend a fleet delivers to.
///
/// # Implementations
///
/// - **Production**: HTTP client against the ingestion API
/// - **Simulation**: in-memory store with configurable faults
///
/// # Reading Flow
///
/// ```text
/// Worker                     Backend
///   |                           |
///   |-- fetch_sensor_settings ->|   (cached by the worker)
///   |<-------- min/max ---------|
///   |                           |
///   |-- ingest(record) -------->|
///   |<-------- status ----------|   2xx / 429,5xx (retry) / 4xx (drop)
/// ```
#[async_trait]
pub trait IngestBackend: Send + Sync + 'static {
    /// Looks up the household id for a householder name.
    ///
    /// # Returns
    /// * `Ok(Some(id))` - the backend knows the householder
    /// * `Ok(None)` - no match
    async fn resolve_household(&self, householder: &str) -> Result<Option<String>, EnvError>;

    /// Provisions a sensor and returns its server-assigned identifier.
    async fn create_sensor(&self, registration: &SensorRegistration) -> Result<RegisteredSensor, EnvError>;

    /// Fetches the remote settings (metadata) of a sensor.
    ///
    /// # Returns
    /// * `Ok(Some(settings))` - the backend answered with the sensor object
    /// * `Ok(None)` - the backend answered with a non-success status
    /// * `Err(_)` - transport failure
    async fn fetch_sensor_settings(&self, sensor_id: &SensorId) -> Result<Option<SensorSettings>, EnvError>;

    /// Posts one reading.
    ///
    /// # Returns
    /// The HTTP-style status of the response. Transport failures are errors.
    async fn ingest(&self, record: &IngestRecord) -> Result<u16, EnvError>;
}

/// Marker trait for backend controllers in simulation.
///
/// Allows injecting faults like outages and flaky responses.
pub trait BackendController: Send + Sync {
    /// Makes every ingestion answer with `status` until healed.
    fn set_outage(&self, status: u16);

    /// Sets the probability (0.0 - 1.0) that an ingestion answers 503.
    fn set_error_rate(&self, rate: f64);

    /// Clears all injected faults.
    fn heal_all(&self);
}
