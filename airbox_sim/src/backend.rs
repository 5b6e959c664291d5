//! Simulated ingestion backend with fault injection.

use airbox_env::{
    BackendController, EnvError, IngestBackend, IngestRecord, RegisteredSensor, SensorId, SensorRegistration,
    SensorSettings,
};
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One injected failure for the next ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Status(u16),
    Timeout,
    Connection,
}

/// Backend controller for fault injection.
pub struct SimBackendController {
    /// Faults consumed one per ingestion, before outage/error rate
    scripted: Mutex<VecDeque<Fault>>,

    /// Status every ingestion answers with while set
    outage: Mutex<Option<u16>>,

    /// Probability (0.0 - 1.0) that an ingestion answers 503
    error_rate: Mutex<f64>,

    /// Remaining sensor provisioning requests that fail with 500
    registration_failures: Mutex<u32>,

    /// Transport failures for every call while set
    unreachable: Mutex<bool>,
}

impl SimBackendController {
    /// Creates a new controller with no faults.
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            outage: Mutex::new(None),
            error_rate: Mutex::new(0.0),
            registration_failures: Mutex::new(0),
            unreachable: Mutex::new(false),
        }
    }

    /// Queues faults for the next ingestions.
    pub fn script(&self, faults: impl IntoIterator<Item = Fault>) {
        lock(&self.scripted).extend(faults);
    }

    /// Fails the next `count` provisioning requests.
    pub fn fail_registrations(&self, count: u32) {
        *lock(&self.registration_failures) = count;
    }

    /// Makes every call fail at the transport level.
    pub fn set_unreachable(&self, unreachable: bool) {
        *lock(&self.unreachable) = unreachable;
    }

    pub fn outage(&self) -> Option<u16> {
        *lock(&self.outage)
    }

    pub fn error_rate(&self) -> f64 {
        *lock(&self.error_rate)
    }

    fn is_unreachable(&self) -> bool {
        *lock(&self.unreachable)
    }

    fn next_scripted(&self) -> Option<Fault> {
        lock(&self.scripted).pop_front()
    }

    fn take_registration_failure(&self) -> bool {
        let mut remaining = lock(&self.registration_failures);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for SimBackendController {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendController for SimBackendController {
    fn set_outage(&self, status: u16) {
        *lock(&self.outage) = Some(status);
    }

    fn set_error_rate(&self, rate: f64) {
        *lock(&self.error_rate) = rate.clamp(0.0, 1.0);
    }

    fn heal_all(&self) {
        lock(&self.scripted).clear();
        *lock(&self.outage) = None;
        *lock(&self.error_rate) = 0.0;
        *lock(&self.registration_failures) = 0;
        *lock(&self.unreachable) = false;
    }
}

/// A record the backend accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredRecord {
    /// Simulation time of acceptance
    pub at: Duration,
    pub record: IngestRecord,
}

#[derive(Default)]
struct BackendState {
    delivered: Vec<DeliveredRecord>,
    sensors: HashMap<SensorId, SensorRegistration>,
    settings: HashMap<SensorId, SensorSettings>,
    households: HashMap<String, String>,
    attempts: u64,
}

/// In-memory ingestion backend.
pub struct SimBackend {
    controller: Arc<SimBackendController>,
    latency: Duration,
    origin: tokio::time::Instant,
    rng: Mutex<ChaCha8Rng>,
    state: Mutex<BackendState>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimBackend {
    /// Creates a backend with its own fault controller.
    pub fn new(seed: u64) -> Self {
        Self::with_controller(seed, Arc::new(SimBackendController::new()))
    }

    pub fn with_controller(seed: u64, controller: Arc<SimBackendController>) -> Self {
        Self {
            controller,
            latency: Duration::from_millis(20),
            origin: tokio::time::Instant::now(),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed ^ 0x9e3779b97f4a7c15)),
            state: Mutex::new(BackendState::default()),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sets the simulated round-trip time of every ingestion.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn controller(&self) -> Arc<SimBackendController> {
        self.controller.clone()
    }

    pub fn add_household(&self, householder: &str, house_id: &str) {
        lock(&self.state)
            .households
            .insert(householder.to_string(), house_id.to_string());
    }

    /// Sets the remote settings of a provisioned sensor.
    pub fn set_sensor_settings(&self, sensor_id: SensorId, settings: SensorSettings) {
        lock(&self.state).settings.insert(sensor_id, settings);
    }

    /// Provisioned sensors whose name matches `name`.
    pub fn sensors_named(&self, name: &str) -> Vec<SensorId> {
        let state = lock(&self.state);
        let mut ids: Vec<SensorId> = state
            .sensors
            .iter()
            .filter(|(_, reg)| reg.name == name)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn sensor_count(&self) -> usize {
        lock(&self.state).sensors.len()
    }

    pub fn delivered(&self) -> Vec<DeliveredRecord> {
        lock(&self.state).delivered.clone()
    }

    /// Accepted records whose `box` attribute equals `box_name`.
    pub fn delivered_for_box(&self, box_name: &str) -> Vec<DeliveredRecord> {
        lock(&self.state)
            .delivered
            .iter()
            .filter(|d| d.record.attributes.get("box").and_then(|v| v.as_str()) == Some(box_name))
            .cloned()
            .collect()
    }

    /// Ingestion calls received, accepted or not.
    pub fn attempts(&self) -> u64 {
        lock(&self.state).attempts
    }

    /// Highest number of ingestions observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn roll_error(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        match Bernoulli::new(rate) {
            Ok(dist) => dist.sample(&mut *lock(&self.rng)),
            Err(_) => false,
        }
    }

    fn answer(&self, record: &IngestRecord) -> Result<u16, EnvError> {
        let mut state = lock(&self.state);
        state.attempts += 1;

        if let Some(fault) = self.controller.next_scripted() {
            return match fault {
                Fault::Status(status) => Ok(status),
                Fault::Timeout => Err(EnvError::Timeout(20_000)),
                Fault::Connection => Err(EnvError::connection("connection reset by peer")),
            };
        }
        if let Some(status) = self.controller.outage() {
            return Ok(status);
        }
        if self.roll_error(self.controller.error_rate()) {
            return Ok(503);
        }
        if !state.sensors.contains_key(&record.sensor_id) {
            return Ok(404);
        }

        state.delivered.push(DeliveredRecord {
            at: self.origin.elapsed(),
            record: record.clone(),
        });
        Ok(201)
    }
}

#[async_trait]
impl IngestBackend for SimBackend {
    async fn resolve_household(&self, householder: &str) -> Result<Option<String>, EnvError> {
        if self.controller.is_unreachable() {
            return Err(EnvError::connection("backend unreachable"));
        }
        Ok(lock(&self.state).households.get(householder).cloned())
    }

    async fn create_sensor(&self, registration: &SensorRegistration) -> Result<RegisteredSensor, EnvError> {
        if self.controller.is_unreachable() {
            return Err(EnvError::connection("backend unreachable"));
        }
        if self.controller.take_registration_failure() {
            return Err(EnvError::Status(500));
        }
        let id = SensorId::from_seed(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.state).sensors.insert(id, registration.clone());
        Ok(RegisteredSensor {
            id,
            name: registration.name.clone(),
        })
    }

    async fn fetch_sensor_settings(&self, sensor_id: &SensorId) -> Result<Option<SensorSettings>, EnvError> {
        if self.controller.is_unreachable() {
            return Err(EnvError::connection("backend unreachable"));
        }
        let state = lock(&self.state);
        if let Some(settings) = state.settings.get(sensor_id) {
            return Ok(Some(settings.clone()));
        }
        Ok(state.sensors.get(sensor_id).map(|reg| reg.metadata.clone()))
    }

    async fn ingest(&self, record: &IngestRecord) -> Result<u16, EnvError> {
        if self.controller.is_unreachable() {
            return Err(EnvError::connection("backend unreachable"));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.latency).await;
        let answer = self.answer(record);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registration(name: &str) -> SensorRegistration {
        SensorRegistration {
            house_id: "H".into(),
            name: name.into(),
            sensor_type: "co2".into(),
            location: None,
            metadata: serde_json::from_value(json!({"min": 400})).unwrap(),
            serial_number: None,
        }
    }

    #[test]
    fn test_controller_heal() {
        let controller = SimBackendController::new();
        controller.set_outage(503);
        controller.set_error_rate(2.0);
        assert_eq!(controller.outage(), Some(503));
        assert_eq!(controller.error_rate(), 1.0);

        controller.heal_all();
        assert_eq!(controller.outage(), None);
        assert_eq!(controller.error_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_accepts_known_sensors_only() {
        let backend = SimBackend::new(1);
        let created = backend.create_sensor(&registration("kitchen_co2")).await.unwrap();
        assert_eq!(backend.sensors_named("kitchen_co2"), vec![created.id]);

        assert_eq!(backend.ingest(&IngestRecord::new(created.id, 500.0)).await.unwrap(), 201);
        assert_eq!(backend.ingest(&IngestRecord::new(SensorId::from_seed(999), 1.0)).await.unwrap(), 404);
        assert_eq!(backend.delivered().len(), 1);
        assert_eq!(backend.attempts(), 2);

        // Settings default to the provisioned metadata
        let settings = backend.fetch_sensor_settings(&created.id).await.unwrap().unwrap();
        assert_eq!(settings["min"], json!(400));
        assert!(backend.fetch_sensor_settings(&SensorId::from_seed(999)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_faults_then_outage() {
        let backend = SimBackend::new(1);
        let id = backend.create_sensor(&registration("s")).await.unwrap().id;
        let controller = backend.controller();
        controller.script([Fault::Timeout, Fault::Status(429), Fault::Connection]);

        let record = IngestRecord::new(id, 1.0);
        assert!(matches!(backend.ingest(&record).await, Err(EnvError::Timeout(_))));
        assert_eq!(backend.ingest(&record).await.unwrap(), 429);
        assert!(matches!(backend.ingest(&record).await, Err(EnvError::Connection(_))));

        controller.set_outage(502);
        assert_eq!(backend.ingest(&record).await.unwrap(), 502);
        controller.heal_all();
        assert_eq!(backend.ingest(&record).await.unwrap(), 201);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_error_rate_always_fails() {
        let backend = SimBackend::new(3);
        let id = backend.create_sensor(&registration("s")).await.unwrap().id;
        backend.controller().set_error_rate(1.0);
        for _ in 0..10 {
            assert_eq!(backend.ingest(&IngestRecord::new(id, 1.0)).await.unwrap(), 503);
        }
        assert!(backend.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_failures_and_unreachable() {
        let backend = SimBackend::new(1);
        backend.controller().fail_registrations(1);
        assert!(matches!(
            backend.create_sensor(&registration("s")).await,
            Err(EnvError::Status(500))
        ));
        assert!(backend.create_sensor(&registration("s")).await.is_ok());

        backend.controller().set_unreachable(true);
        assert!(backend.resolve_household("Ada").await.unwrap_err().is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peak_in_flight_tracks_concurrency() {
        let backend = Arc::new(SimBackend::new(1).with_latency(Duration::from_millis(100)));
        let id = backend.create_sensor(&registration("s")).await.unwrap().id;
        let mut handles = Vec::new();
        for _ in 0..5 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move { backend.ingest(&IngestRecord::new(id, 1.0)).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 201);
        }
        assert_eq!(backend.peak_in_flight(), 5);
    }
}
