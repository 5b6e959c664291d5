//! Shared per-box environment.
//!
//! All sensors of a box read from one [`EnvironmentSimulator`]. The first reader
//! in a tick slot advances the simulator; later readers of the same (or an older)
//! slot get the cached snapshot.

use crate::simulator::{EnvironmentSimulator, Profile, SimulatorConfig};
use crate::schema::Reading;
use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Parameters that identify a box's simulation; a change rebuilds the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentParams {
    pub profile: Profile,
    pub seed: u64,
    pub serial: Option<u16>,
    pub period_seconds: f64,
}

impl EnvironmentParams {
    fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            profile: self.profile,
            period_minutes: (self.period_seconds / 60.0).max(0.5),
            serial: self.serial,
            seed: self.seed,
            ..SimulatorConfig::default()
        }
    }
}

struct SlotState {
    simulator: EnvironmentSimulator,
    cached: Option<(i64, Reading)>,
}

/// One box's simulator behind a mutex, with per-slot snapshot caching.
pub struct BoxEnvironment {
    params: EnvironmentParams,
    state: Mutex<SlotState>,
}

impl BoxEnvironment {
    pub fn new(params: EnvironmentParams) -> Self {
        let simulator = EnvironmentSimulator::new(params.simulator_config());
        Self {
            params,
            state: Mutex::new(SlotState { simulator, cached: None }),
        }
    }

    pub fn params(&self) -> &EnvironmentParams {
        &self.params
    }

    pub fn profile(&self) -> Profile {
        self.params.profile
    }

    pub fn slot_of(&self, at: DateTime<Utc>) -> i64 {
        let period_ms = (self.params.period_seconds * 1000.0).max(1.0);
        (at.timestamp_millis() as f64 / period_ms).floor() as i64
    }

    /// Box reading for the tick slot containing `at`.
    pub async fn read(&self, at: DateTime<Utc>) -> Reading {
        let slot = self.slot_of(at);
        let mut state = self.state.lock().await;
        if let Some((cached_slot, reading)) = state.cached {
            if cached_slot >= slot {
                return reading;
            }
        }
        let reading = state.simulator.advance(&at.with_timezone(&Local));
        state.cached = Some((slot, reading));
        debug!(slot = slot, serial = reading.serial, "Advanced box environment");
        reading
    }
}

/// Arena of box environments keyed by box key.
#[derive(Default)]
pub struct BoxEnvironments {
    boxes: Mutex<HashMap<String, Arc<BoxEnvironment>>>,
}

impl BoxEnvironments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the environment for `key`, rebuilding it when the parameters changed.
    pub async fn get_or_create(&self, key: &str, params: EnvironmentParams) -> Arc<BoxEnvironment> {
        let mut boxes = self.boxes.lock().await;
        if let Some(existing) = boxes.get(key) {
            if existing.params == params {
                return existing.clone();
            }
            info!(box_key = %key, "Simulation parameters changed, rebuilding environment");
        }
        let env = Arc::new(BoxEnvironment::new(params));
        boxes.insert(key.to_string(), env.clone());
        env
    }

    pub async fn get(&self, key: &str) -> Option<Arc<BoxEnvironment>> {
        self.boxes.lock().await.get(key).cloned()
    }

    /// Decommissions a box's environment.
    pub async fn remove(&self, key: &str) -> bool {
        self.boxes.lock().await.remove(key).is_some()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.boxes.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params(seed: u64) -> EnvironmentParams {
        EnvironmentParams {
            profile: Profile::Chronic,
            seed,
            serial: Some(7),
            period_seconds: 60.0,
        }
    }

    #[tokio::test]
    async fn test_same_slot_returns_same_snapshot() {
        let env = BoxEnvironment::new(params(1));
        let t0 = Utc.with_ymd_and_hms(2024, 3, 12, 10, 0, 3).unwrap();
        let a = env.read(t0).await;
        let b = env.read(t0 + chrono::Duration::seconds(40)).await;
        assert_eq!(a, b);

        // Older slot also gets the cached snapshot
        let c = env.read(t0 - chrono::Duration::minutes(5)).await;
        assert_eq!(a, c);

        let d = env.read(t0 + chrono::Duration::seconds(60)).await;
        assert_ne!(a, d);
        assert_eq!(d.serial, 7);
    }

    #[tokio::test]
    async fn test_one_advance_per_slot_matches_direct_simulation() {
        let env = BoxEnvironment::new(params(9));
        let mut direct = EnvironmentSimulator::new(params(9).simulator_config());
        let t0 = Utc.with_ymd_and_hms(2024, 3, 12, 10, 0, 0).unwrap();
        for i in 0..5 {
            let t = t0 + chrono::Duration::minutes(i);
            // Several sensors reading in the same slot
            let first = env.read(t).await;
            let _ = env.read(t + chrono::Duration::seconds(5)).await;
            let expected = direct.advance(&t.with_timezone(&Local));
            assert_eq!(first, expected);
        }
    }

    #[tokio::test]
    async fn test_arena_keeps_environment_while_params_unchanged() {
        let arena = BoxEnvironments::new();
        let a = arena.get_or_create("box-1", params(1)).await;
        let b = arena.get_or_create("box-1", params(1)).await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = arena.get_or_create("box-1", params(2)).await;
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(arena.keys().await, vec!["box-1".to_string()]);

        assert!(arena.remove("box-1").await);
        assert!(arena.get("box-1").await.is_none());
        assert!(!arena.remove("box-1").await);
    }
}
