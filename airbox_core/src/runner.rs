//! Box Runner - provisions one box's sensors and supervises their workers.
//!
//! A runner restarts its box after any failure with exponential backoff
//! (5 s doubling to 60 s, reset after a clean run). Stopping is immediate,
//! including during the backoff sleep: the body future is dropped, which
//! drops its `JoinSet` and aborts every worker.

use crate::backoff::RestartBackoff;
use crate::box_env::BoxEnvironment;
use crate::config::{BoxDefinition, GlobalSettings, SensorDefinition};
use crate::worker::{BoxIdentity, SensorWorker, TickSchedule};
use airbox_env::{AirboxContext, EnvError, IngestBackend, RegisteredSensor, SensorRegistration};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Box {0} has neither house_id nor a resolvable householder")]
    MissingHousehold(String),

    #[error("Backend error: {0}")]
    Backend(#[from] EnvError),

    #[error("Sensor worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Everything a box run needs, cloned per restart.
pub struct BoxContext<Ctx, B>
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    pub ctx: Arc<Ctx>,
    pub backend: Arc<B>,
    pub environment: Arc<BoxEnvironment>,
    pub gate: Arc<Semaphore>,
    pub globals: GlobalSettings,
}

impl<Ctx, B> Clone for BoxContext<Ctx, B>
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            backend: self.backend.clone(),
            environment: self.environment.clone(),
            gate: self.gate.clone(),
            globals: self.globals.clone(),
        }
    }
}

/// Explicit `house_id`, else a backend lookup by householder.
pub async fn resolve_house_id<B: IngestBackend>(backend: &B, definition: &BoxDefinition) -> Result<String, RunnerError> {
    if let Some(house_id) = definition.house_id.as_deref().filter(|h| !h.is_empty()) {
        return Ok(house_id.to_string());
    }
    if let Some(householder) = definition.householder.as_deref().filter(|h| !h.is_empty()) {
        if let Some(house_id) = backend.resolve_household(householder).await? {
            return Ok(house_id);
        }
    }
    Err(RunnerError::MissingHousehold(definition.key()))
}

/// Builds the provisioning request for one sensor of a box.
pub fn registration_for(definition: &BoxDefinition, sensor: &SensorDefinition, house_id: &str) -> SensorRegistration {
    let mut metadata = sensor.meta.clone();
    metadata.insert("house_id".to_string(), Value::String(house_id.to_string()));
    metadata.insert("box".to_string(), Value::String(definition.name.clone()));
    SensorRegistration {
        house_id: house_id.to_string(),
        name: format!("{}_{}", definition.name, sensor.name),
        sensor_type: sensor.sensor_type.clone(),
        location: definition.location.clone(),
        metadata,
        serial_number: sensor.serial.clone().or_else(|| definition.serial_number.clone()),
    }
}

/// One run of a box: provision every sensor, then drive the workers.
///
/// Returns only on failure, or immediately for a box whose workers all end.
pub async fn run_box<Ctx, B>(definition: &BoxDefinition, parts: BoxContext<Ctx, B>) -> Result<(), RunnerError>
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    let house_id = resolve_house_id(parts.backend.as_ref(), definition).await?;

    let mut provisioned: Vec<(SensorDefinition, RegisteredSensor)> = Vec::with_capacity(definition.sensors.len());
    for sensor in &definition.sensors {
        let registration = registration_for(definition, sensor, &house_id);
        let created = parts.backend.create_sensor(&registration).await?;
        info!(
            box_key = %definition.key(),
            sensor = %created.name,
            id = %created.id,
            enabled = sensor.enabled,
            "Sensor provisioned"
        );
        provisioned.push((sensor.clone(), created));
    }

    if provisioned.is_empty() {
        info!(box_key = %definition.key(), "Box has no sensors, idling");
        std::future::pending::<()>().await;
    }

    let owner = BoxIdentity {
        name: definition.name.clone(),
        serial_number: definition.serial_number.clone(),
    };
    let mut workers = JoinSet::new();
    for (sensor, created) in provisioned {
        let schedule = TickSchedule::for_sensor(&created.id, parts.globals.period, parts.globals.phase_max_ms);
        let worker = SensorWorker::new(
            parts.ctx.clone(),
            parts.backend.clone(),
            parts.environment.clone(),
            parts.gate.clone(),
            owner.clone(),
            sensor,
            created.id,
            schedule,
        );
        workers.spawn(worker.run());
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            return Err(RunnerError::WorkerPanicked(e.to_string()));
        }
    }
    Ok(())
}

/// Handle to a supervised box task.
pub struct BoxRunner {
    key: String,
    signature: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BoxRunner {
    /// Spawns the supervised restart loop for a box.
    pub fn start<Ctx, B>(definition: BoxDefinition, parts: BoxContext<Ctx, B>) -> Self
    where
        Ctx: AirboxContext,
        B: IngestBackend,
    {
        let key = definition.key();
        let signature = definition.signature();
        let (shutdown, mut stop) = watch::channel(false);
        let ctx = parts.ctx.clone();
        let task_key = key.clone();

        let handle = ctx.spawn(&format!("box-{}", key), async move {
            let mut backoff = RestartBackoff::default();
            loop {
                let delay = tokio::select! {
                    _ = stop.changed() => break,
                    result = run_box(&definition, parts.clone()) => match result {
                        Ok(()) => {
                            backoff.reset();
                            backoff.initial()
                        }
                        Err(e) => {
                            let delay = backoff.next();
                            warn!(box_key = %task_key, error = %e, retry_in_s = delay.as_secs(), "Box run failed");
                            delay
                        }
                    },
                };
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = parts.ctx.sleep(delay) => {}
                }
            }
            info!(box_key = %task_key, "Box runner stopped");
        });

        info!(box_key = %key, "Box runner started");
        Self {
            key,
            signature,
            shutdown,
            handle,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals shutdown and waits for the task to wind down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(box_key = %self.key, error = %e, "Box runner ended abnormally");
            }
        }
    }
}
