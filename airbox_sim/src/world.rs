//! SimWorld - the simulation harness container.

use crate::backend::{SimBackend, SimBackendController};
use crate::config_source::SimConfigSource;
use crate::context::SimContext;

use airbox_core::{ConfigSource, FleetSupervisor, Profile, ReconcileReport};
use airbox_env::AirboxContext;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sensor types every simulated box carries.
pub const DEFAULT_SENSOR_TYPES: [&str; 4] = ["temperature", "humidity", "co2", "pm2_5"];

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of boxes in the generated fleet
    pub num_boxes: usize,

    pub profile: Profile,

    /// Sensor tick period in seconds
    pub period_seconds: u64,

    pub phase_max_ms: u64,

    /// Fleet-wide concurrent delivery limit
    pub max_inflight: usize,

    /// Configuration re-read interval
    pub poll_interval: Duration,

    /// Simulated ingestion round-trip time
    pub backend_latency: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_boxes: 3,
            profile: Profile::Intermittent,
            period_seconds: 60,
            phase_max_ms: 10_000,
            max_inflight: 20,
            poll_interval: Duration::from_secs(60),
            backend_latency: Duration::from_millis(20),
        }
    }
}

impl SimConfig {
    /// Serial number of the `index`-th generated box.
    pub fn box_serial(&self, index: usize) -> String {
        format!("AQ-{:05}", index)
    }

    /// Name of the `index`-th generated box.
    pub fn box_name(&self, index: usize) -> String {
        format!("box-{}", index)
    }

    /// Builds the fleet document for this run; every box starts registered.
    pub fn fleet_document(&self) -> Value {
        let boxes: Vec<Value> = (0..self.num_boxes)
            .map(|i| {
                let sensors: Vec<Value> = DEFAULT_SENSOR_TYPES
                    .iter()
                    .map(|t| json!({"name": t, "type": t}))
                    .collect();
                json!({
                    "name": self.box_name(i),
                    "serial_number": self.box_serial(i),
                    "house_id": format!("H-{}", i),
                    "registered": true,
                    "profile": self.profile.name(),
                    "seed": self.seed.wrapping_add(i as u64),
                    "sensors": sensors,
                })
            })
            .collect();
        json!({
            "period_seconds": self.period_seconds,
            "phase_max_ms": self.phase_max_ms,
            "max_inflight": self.max_inflight,
            "boxes": boxes,
        })
    }
}

/// The SimWorld - container for a whole simulated fleet.
///
/// Must be created inside a tokio runtime; on a paused runtime simulated time
/// advances whenever every task is waiting on a timer.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context
    pub context: Arc<SimContext>,

    /// In-memory backend
    pub backend: Arc<SimBackend>,

    /// Backend fault injection
    pub controller: Arc<SimBackendController>,

    /// Editable fleet configuration
    pub source: Arc<SimConfigSource>,

    supervisor: FleetSupervisor<SimContext, SimBackend>,

    /// Simulation time of the next configuration poll
    next_poll: Duration,

    polls: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        // Derive separate seeds for different subsystems
        let context_seed = config.seed;
        let backend_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let context = SimContext::shared(context_seed);
        let backend = Arc::new(SimBackend::new(backend_seed).with_latency(config.backend_latency));
        let controller = backend.controller();
        let source = Arc::new(SimConfigSource::new(config.fleet_document()));
        let supervisor = FleetSupervisor::new(context.clone(), backend.clone());

        Self {
            config,
            context,
            backend,
            controller,
            source,
            supervisor,
            next_poll: Duration::ZERO,
            polls: 0,
        }
    }

    /// Reads the configuration once and reconciles.
    pub async fn poll(&mut self) -> Option<ReconcileReport> {
        self.polls += 1;
        match self.source.load().await {
            Ok(document) => Some(self.supervisor.apply_config(&document).await),
            Err(e) => {
                warn!(error = %e, "Simulated config unavailable, stopping all boxes");
                self.supervisor.stop_all().await;
                None
            }
        }
    }

    /// Lets the fleet run for `duration`, polling the configuration on schedule.
    pub async fn run_for(&mut self, duration: Duration) {
        let end = self.context.now() + duration;
        loop {
            let now = self.context.now();
            if now >= self.next_poll {
                self.poll().await;
                self.next_poll = now + self.config.poll_interval;
            }
            let now = self.context.now();
            if now >= end {
                break;
            }
            let wake = self.next_poll.min(end);
            self.context.sleep(wake.saturating_sub(now)).await;
        }
        debug!(time_s = self.time(), polls = self.polls, "Simulation window complete");
    }

    /// Stops every runner.
    pub async fn shutdown(&mut self) {
        self.supervisor.stop_all().await;
    }

    pub fn supervisor(&self) -> &FleetSupervisor<SimContext, SimBackend> {
        &self.supervisor
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn running_boxes(&self) -> Vec<String> {
        self.supervisor.running_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airbox_core::FleetDocument;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_fleet_document_parses() {
        let config = SimConfig {
            num_boxes: 3,
            ..Default::default()
        };
        let doc = FleetDocument::from_value(config.fleet_document()).unwrap();
        assert_eq!(doc.boxes.len(), 3);
        assert_eq!(doc.boxes[2].key(), "AQ-00002");
        assert!(doc.boxes.iter().all(|b| b.registered && b.sensors.len() == 4));
    }

    proptest! {
        #[test]
        fn prop_generated_boxes_have_distinct_keys_and_seeds(seed in any::<u64>(), num_boxes in 1usize..40) {
            let config = SimConfig { seed, num_boxes, ..Default::default() };
            let doc = FleetDocument::from_value(config.fleet_document()).unwrap();
            prop_assert_eq!(doc.boxes.len(), num_boxes);

            let keys: HashSet<String> = doc.boxes.iter().map(|b| b.key()).collect();
            let seeds: HashSet<u64> = doc.boxes.iter().map(|b| b.seed_value()).collect();
            prop_assert_eq!(keys.len(), num_boxes);
            prop_assert_eq!(seeds.len(), num_boxes);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_world_delivers_every_tick() {
        let config = SimConfig {
            num_boxes: 2,
            phase_max_ms: 0,
            ..Default::default()
        };
        let mut world = SimWorld::new(config);
        world.run_for(Duration::from_secs(60 * 5 + 30)).await;

        assert_eq!(world.running_boxes(), vec!["AQ-00000", "AQ-00001"]);
        assert_eq!(world.backend.sensor_count(), 8);
        // 2 boxes x 4 sensors x 5 ticks
        assert_eq!(world.backend.delivered().len(), 40);
        assert_eq!(world.polls(), 6);
        world.shutdown().await;
        assert!(world.running_boxes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_world_determinism() {
        async fn values(seed: u64) -> Vec<f64> {
            let mut world = SimWorld::new(SimConfig {
                seed,
                num_boxes: 1,
                ..Default::default()
            });
            world.run_for(Duration::from_secs(600)).await;
            world.shutdown().await;
            let mut delivered = world.backend.delivered();
            delivered.sort_by_key(|d| (d.at, d.record.sensor_id));
            delivered.iter().map(|d| d.record.value).collect()
        }
        let a = values(7).await;
        assert!(!a.is_empty());
        assert_eq!(a, values(7).await);
    }
}
