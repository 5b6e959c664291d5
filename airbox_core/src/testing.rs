//! In-crate test doubles for the context and backend traits.

use airbox_env::{
    AirboxContext, EnvError, IngestBackend, IngestRecord, RegisteredSensor, SensorId, SensorRegistration,
    SensorSettings,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// 2024-03-12T10:00:00Z
pub const TEST_EPOCH_SECS: u64 = 1_710_237_600;

/// Fixed epoch over tokio's clock; jitter draws are always zero.
pub struct MockContext {
    origin: tokio::time::Instant,
}

impl MockContext {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
        })
    }
}

#[async_trait]
impl AirboxContext for MockContext {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(TEST_EPOCH_SECS) + self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, _name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future)
    }

    fn random_unit(&self) -> f64 {
        0.0
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[derive(Default)]
struct MockState {
    ingest_script: VecDeque<Result<u16, EnvError>>,
    settings_script: VecDeque<Result<Option<SensorSettings>, EnvError>>,
    settings: SensorSettings,
    records: Vec<IngestRecord>,
    registrations: Vec<SensorRegistration>,
    households: HashMap<String, String>,
    create_failures: u32,
    ingest_calls: usize,
    settings_calls: usize,
}

/// Scriptable backend; unscripted calls succeed.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockBackend {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the queue of ingest answers.
    pub fn script_ingest(&self, answers: Vec<Result<u16, EnvError>>) {
        self.state.lock().unwrap().ingest_script = answers.into();
    }

    pub fn script_settings(&self, answers: Vec<Result<Option<SensorSettings>, EnvError>>) {
        self.state.lock().unwrap().settings_script = answers.into();
    }

    pub fn set_settings(&self, settings: SensorSettings) {
        self.state.lock().unwrap().settings = settings;
    }

    pub fn add_household(&self, householder: &str, house_id: &str) {
        self.state
            .lock()
            .unwrap()
            .households
            .insert(householder.to_string(), house_id.to_string());
    }

    pub fn fail_next_creates(&self, count: u32) {
        self.state.lock().unwrap().create_failures = count;
    }

    pub fn records(&self) -> Vec<IngestRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn registrations(&self) -> Vec<SensorRegistration> {
        self.state.lock().unwrap().registrations.clone()
    }

    pub fn ingest_calls(&self) -> usize {
        self.state.lock().unwrap().ingest_calls
    }

    pub fn settings_calls(&self) -> usize {
        self.state.lock().unwrap().settings_calls
    }
}

#[async_trait]
impl IngestBackend for MockBackend {
    async fn resolve_household(&self, householder: &str) -> Result<Option<String>, EnvError> {
        Ok(self.state.lock().unwrap().households.get(householder).cloned())
    }

    async fn create_sensor(&self, registration: &SensorRegistration) -> Result<RegisteredSensor, EnvError> {
        let mut state = self.state.lock().unwrap();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(EnvError::Status(500));
        }
        state.registrations.push(registration.clone());
        let id = SensorId::from_seed(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(RegisteredSensor {
            id,
            name: registration.name.clone(),
        })
    }

    async fn fetch_sensor_settings(&self, _sensor_id: &SensorId) -> Result<Option<SensorSettings>, EnvError> {
        let mut state = self.state.lock().unwrap();
        state.settings_calls += 1;
        match state.settings_script.pop_front() {
            Some(answer) => answer,
            None => Ok(Some(state.settings.clone())),
        }
    }

    async fn ingest(&self, record: &IngestRecord) -> Result<u16, EnvError> {
        let mut state = self.state.lock().unwrap();
        state.ingest_calls += 1;
        let answer = state.ingest_script.pop_front().unwrap_or(Ok(200));
        if matches!(answer, Ok(status) if (200..300).contains(&status)) {
            state.records.push(record.clone());
        }
        answer
    }
}
