//! Sensor Worker - one task per virtual sensor.
//!
//! # Tick Flow
//!
//! ```text
//! sleep_until(aligned boundary + phase)
//!        │
//!        ▼
//! ┌───────────────┐   disabled   ┌──────┐
//! │ static flag   │─────────────▶│ skip │
//! └───────────────┘              └──────┘
//!        │
//!        ▼
//! ┌───────────────┐   enabled=false
//! │ settings (30s │─────────────▶ skip
//! │ TTL cache)    │
//! └───────────────┘
//!        │ bounds
//!        ▼
//! ┌───────────────┐     ┌──────────────────────────────┐
//! │ BoxEnvironment│────▶│ send_reading_with_retry      │
//! │ .read(now)    │     │ (gate permit per attempt)    │
//! └───────────────┘     └──────────────────────────────┘
//! ```
//!
//! Readings are generic over [`AirboxContext`] and [`IngestBackend`], so the
//! same worker runs against the HTTP backend or the simulated one.

use crate::backoff::RetryPolicy;
use crate::box_env::BoxEnvironment;
use crate::config::{hash_u64, SensorDefinition};
use crate::schema::Channel;
use airbox_env::{epoch_secs, AirboxContext, IngestBackend, IngestRecord, SensorId, SensorSettings, StatusClass};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Remote settings are re-fetched after this long.
pub const SETTINGS_TTL: Duration = Duration::from_secs(30);

/// Attempts made when fetching remote settings.
const SETTINGS_ATTEMPTS: u32 = 4;
const SETTINGS_RETRY_BASE: Duration = Duration::from_millis(250);

/// Epoch-anchored tick grid with a per-sensor phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSchedule {
    pub period: Duration,
    pub phase: Duration,
}

impl TickSchedule {
    pub fn new(period: Duration, phase: Duration) -> Self {
        Self { period, phase }
    }

    /// Schedule with the stable phase of `sensor_id`.
    pub fn for_sensor(sensor_id: &SensorId, period: Duration, phase_max_ms: u64) -> Self {
        Self::new(period, stable_phase(&sensor_id.to_string(), phase_max_ms))
    }

    /// Next aligned boundary strictly after `now`, shifted by the phase.
    pub fn next_after(&self, now: SystemTime) -> SystemTime {
        let period = self.period.as_secs_f64().max(1e-3);
        let k = (epoch_secs(now) / period).floor() + 1.0;
        UNIX_EPOCH + Duration::from_secs_f64(k * period) + self.phase
    }
}

/// Phase offset in `[0, max_ms)` derived from the sensor id.
pub fn stable_phase(sensor_id: &str, max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(hash_u64(sensor_id) % max_ms)
}

/// How one delivery ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Accepted after `attempts` tries
    Delivered { attempts: u32 },
    /// Terminal 4xx
    Rejected(u16),
    /// Retry budget spent on retryable failures
    Exhausted,
    /// Non-retryable local failure
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Posts one record, retrying 429/5xx and transport faults with jittered backoff.
///
/// A gate permit is held only around each backend call.
pub async fn send_reading_with_retry<Ctx, B>(
    ctx: &Ctx,
    backend: &B,
    gate: &Semaphore,
    record: &IngestRecord,
    policy: &RetryPolicy,
) -> DeliveryOutcome
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    let mut retry = policy.start();
    loop {
        let result = {
            let _permit = match gate.acquire().await {
                Ok(permit) => permit,
                Err(_) => return DeliveryOutcome::Failed("delivery gate closed".to_string()),
            };
            backend.ingest(record).await
        };

        match result {
            Ok(status) => match StatusClass::from_status(status) {
                StatusClass::Accepted => {
                    return DeliveryOutcome::Delivered { attempts: retry.attempt() + 1 };
                }
                StatusClass::Retryable => {
                    debug!(sensor = %record.sensor_id, status = status, "Retryable ingest status");
                }
                StatusClass::Rejected => {
                    warn!(sensor = %record.sensor_id, status = status, "Ingest rejected");
                    return DeliveryOutcome::Rejected(status);
                }
            },
            Err(e) if e.is_transient() => {
                debug!(sensor = %record.sensor_id, error = %e, "Transient ingest error");
            }
            Err(e) => {
                warn!(sensor = %record.sensor_id, error = %e, "Ingest failed");
                return DeliveryOutcome::Failed(e.to_string());
            }
        }

        match retry.next_delay(ctx.random_unit()) {
            Some(delay) => ctx.sleep(delay).await,
            None => {
                warn!(sensor = %record.sensor_id, retries = retry.attempt(), "Ingest retries exhausted, dropping reading");
                return DeliveryOutcome::Exhausted;
            }
        }
    }
}

/// Fetches settings, retrying transient errors. Any other failure yields empty settings.
pub async fn fetch_settings_with_retry<Ctx, B>(ctx: &Ctx, backend: &B, sensor_id: &SensorId) -> SensorSettings
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    for attempt in 0..SETTINGS_ATTEMPTS {
        match backend.fetch_sensor_settings(sensor_id).await {
            Ok(settings) => return settings.unwrap_or_default(),
            Err(e) if e.is_transient() => {
                debug!(sensor = %sensor_id, error = %e, "Settings fetch failed, retrying");
                ctx.sleep(SETTINGS_RETRY_BASE * 2u32.pow(attempt)).await;
            }
            Err(e) => {
                warn!(sensor = %sensor_id, error = %e, "Settings fetch failed");
                return SensorSettings::new();
            }
        }
    }
    SensorSettings::new()
}

/// Per-worker settings cache keyed on monotonic time.
#[derive(Debug, Default)]
struct SettingsCache {
    entry: Option<(SensorSettings, Duration)>,
}

impl SettingsCache {
    fn get(&self, now: Duration) -> Option<&SensorSettings> {
        match &self.entry {
            Some((settings, expires)) if *expires > now => Some(settings),
            _ => None,
        }
    }

    fn put(&mut self, settings: SensorSettings, expires: Duration) {
        self.entry = Some((settings, expires));
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Value bounds: remote settings, else static meta, else the channel's range.
pub fn resolve_bounds(settings: &SensorSettings, sensor: &SensorDefinition, channel: Option<Channel>) -> (f64, f64) {
    let (default_lo, default_hi) = match channel {
        Some(channel) => (channel.spec().lo, channel.spec().hi),
        None => (0.0, 1.0),
    };
    let lo = number(settings.get("min"))
        .or_else(|| number(sensor.meta.get("min")))
        .unwrap_or(default_lo);
    let hi = number(settings.get("max"))
        .or_else(|| number(sensor.meta.get("max")))
        .unwrap_or(default_hi);
    if hi < lo {
        (hi, lo)
    } else {
        (lo, hi)
    }
}

/// Why a tick produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    RemoteDisabled,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Sent { value: f64, delivery: DeliveryOutcome },
}

/// Identity of the box a worker belongs to.
#[derive(Debug, Clone)]
pub struct BoxIdentity {
    pub name: String,
    pub serial_number: Option<String>,
}

/// One sensor's generation-and-delivery loop.
pub struct SensorWorker<Ctx, B>
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    ctx: Arc<Ctx>,
    backend: Arc<B>,
    environment: Arc<BoxEnvironment>,
    gate: Arc<Semaphore>,
    owner: BoxIdentity,
    sensor: SensorDefinition,
    sensor_id: SensorId,
    channel: Option<Channel>,
    schedule: TickSchedule,
    retry: RetryPolicy,
    cache: SettingsCache,
}

impl<Ctx, B> SensorWorker<Ctx, B>
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<Ctx>,
        backend: Arc<B>,
        environment: Arc<BoxEnvironment>,
        gate: Arc<Semaphore>,
        owner: BoxIdentity,
        sensor: SensorDefinition,
        sensor_id: SensorId,
        schedule: TickSchedule,
    ) -> Self {
        let channel = Channel::for_sensor_type(&sensor.sensor_type);
        Self {
            ctx,
            backend,
            environment,
            gate,
            owner,
            sensor,
            sensor_id,
            channel,
            schedule,
            retry: RetryPolicy::default(),
            cache: SettingsCache::default(),
        }
    }

    pub fn sensor_id(&self) -> SensorId {
        self.sensor_id
    }

    pub fn schedule(&self) -> TickSchedule {
        self.schedule
    }

    async fn settings(&mut self) -> SensorSettings {
        let now = self.ctx.now();
        if let Some(settings) = self.cache.get(now) {
            return settings.clone();
        }
        let settings = fetch_settings_with_retry(self.ctx.as_ref(), self.backend.as_ref(), &self.sensor_id).await;
        self.cache.put(settings.clone(), now + SETTINGS_TTL);
        settings
    }

    /// Runs one tick at the current time.
    pub async fn tick(&mut self) -> TickOutcome {
        if !self.sensor.enabled {
            return TickOutcome::Skipped(SkipReason::Disabled);
        }

        let settings = self.settings().await;
        if settings.get("enabled") == Some(&Value::Bool(false)) {
            debug!(sensor = %self.sensor_id, "Sensor disabled remotely");
            return TickOutcome::Skipped(SkipReason::RemoteDisabled);
        }

        let (lo, hi) = resolve_bounds(&settings, &self.sensor, self.channel);
        let at: DateTime<Utc> = self.ctx.system_time().into();
        let raw = match self.channel {
            Some(channel) => self.environment.read(at).await.get(channel),
            None => lo + (hi - lo) * self.ctx.random_unit(),
        };
        let value = raw.clamp(lo, hi);

        let serial = self
            .sensor
            .serial
            .clone()
            .or_else(|| self.owner.serial_number.clone());
        let mut record = IngestRecord::new(self.sensor_id, value)
            .with_attribute("unit", self.sensor.sensor_type.clone())
            .with_attribute("box", self.owner.name.clone())
            .with_attribute("serial_number", serial)
            .with_attribute("simulated", self.channel.is_some());
        if self.channel.is_some() {
            record = record
                .with_attribute("sim_profile", self.environment.profile().name())
                .with_attribute("sample_time", at.to_rfc3339());
        }

        let delivery = send_reading_with_retry(
            self.ctx.as_ref(),
            self.backend.as_ref(),
            &self.gate,
            &record,
            &self.retry,
        )
        .await;
        debug!(
            box_name = %self.owner.name,
            sensor = %self.sensor.name,
            value = value,
            delivered = delivery.is_delivered(),
            "Tick"
        );
        TickOutcome::Sent { value, delivery }
    }

    /// Ticks forever on the aligned schedule.
    pub async fn run(mut self) {
        debug!(
            sensor = %self.sensor_id,
            phase_ms = self.schedule.phase.as_millis() as u64,
            "Sensor worker started"
        );
        loop {
            let next = self.schedule.next_after(self.ctx.system_time());
            self.ctx.sleep_until(next).await;
            self.tick().await;
        }
    }
}
