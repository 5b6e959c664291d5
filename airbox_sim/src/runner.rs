//! Scenario runner - executes simulator and fleet scenarios.

use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld, DEFAULT_SENSOR_TYPES};

use airbox_core::{EnvironmentSimulator, FieldUpdate, Profile, Reading, RegistrationUpdate, SimulatorConfig};
use airbox_env::{AirboxContext, BackendController};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info};

/// 2024-03-12T05:00:00Z, a Tuesday
const WINDOW_START_SECS: u64 = 1_710_219_600;

/// CO₂ comfort threshold (ppm).
pub const CO2_COMFORT_PPM: f64 = 1000.0;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Simulator readings generated
    pub readings: u64,

    /// Records accepted by the backend
    pub delivered: u64,

    /// Ingestion calls, accepted or not
    pub attempts: u64,

    /// Highest concurrent ingestions observed
    pub peak_in_flight: usize,
}

struct Outcome {
    failure: Option<String>,
    final_time_secs: f64,
    metrics: ScenarioMetrics,
}

impl Outcome {
    fn check(mut self, condition: bool, reason: impl FnOnce() -> String) -> Self {
        if !condition && self.failure.is_none() {
            self.failure = Some(reason());
        }
        self
    }
}

fn window_start() -> DateTime<Utc> {
    DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(WINDOW_START_SECS))
}

fn mean_co2(window: &[(DateTime<Utc>, Reading)]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|(_, r)| r.co2_ppm).sum::<f64>() / window.len() as f64
}

fn comfortable_ticks(window: &[(DateTime<Utc>, Reading)]) -> usize {
    window.iter().filter(|(_, r)| r.co2_ppm <= CO2_COMFORT_PPM).count()
}

fn fleet_metrics(world: &SimWorld) -> ScenarioMetrics {
    ScenarioMetrics {
        readings: 0,
        delivered: world.backend.delivered().len() as u64,
        attempts: world.backend.attempts(),
        peak_in_flight: world.backend.peak_in_flight(),
    }
}

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::ChronicWindow => Ok(self.run_chronic_window()),
            ScenarioId::BatteryContinuity => Ok(self.run_battery_continuity()),
            ScenarioId::Deregistration => self.block_on(Self::run_deregistration(self.seed)),
            ScenarioId::BackendOutage => self.block_on(Self::run_backend_outage(self.seed)),
            ScenarioId::Throttle => self.block_on(Self::run_throttle(self.seed)),
            ScenarioId::ConfigOutage => self.block_on(Self::run_config_outage(self.seed)),
        };

        let outcome = outcome.unwrap_or_else(|e| Outcome {
            failure: Some(format!("Runtime error: {}", e)),
            final_time_secs: 0.0,
            metrics: ScenarioMetrics::default(),
        });

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.failure.is_none(),
            final_time_secs: outcome.final_time_secs,
            failure_reason: outcome.failure,
            metrics: outcome.metrics,
        }
    }

    /// Runs a future on a fresh current-thread runtime with a paused clock.
    fn block_on<F: Future<Output = Outcome>>(&self, future: F) -> Result<Outcome, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()?;
        Ok(runtime.block_on(future))
    }

    fn run_chronic_window(&self) -> Outcome {
        let simulate = |profile| {
            let mut sim = EnvironmentSimulator::new(SimulatorConfig {
                profile,
                seed: self.seed,
                ..SimulatorConfig::default()
            });
            sim.generate_window(window_start(), 12.0)
        };
        let chronic = simulate(Profile::Chronic);
        let healthy = simulate(Profile::Healthy);

        let (chronic_mean, healthy_mean) = (mean_co2(&chronic), mean_co2(&healthy));
        let (chronic_ok, healthy_ok) = (comfortable_ticks(&chronic), comfortable_ticks(&healthy));
        debug!(chronic_mean, healthy_mean, chronic_ok, healthy_ok, "CO2 comparison");

        Outcome {
            failure: None,
            final_time_secs: 12.0 * 3600.0,
            metrics: ScenarioMetrics {
                readings: (chronic.len() + healthy.len()) as u64,
                ..ScenarioMetrics::default()
            },
        }
        .check(chronic_mean > healthy_mean, || {
            format!("Chronic mean CO2 {:.0} ppm not above healthy {:.0} ppm", chronic_mean, healthy_mean)
        })
        .check(healthy_ok > chronic_ok, || {
            format!("Healthy comfortable ticks {} not above chronic {}", healthy_ok, chronic_ok)
        })
    }

    fn run_battery_continuity(&self) -> Outcome {
        let mut sim = EnvironmentSimulator::new(SimulatorConfig {
            profile: Profile::Intermittent,
            seed: self.seed,
            ..SimulatorConfig::default()
        });
        let step = chrono::Duration::minutes(5);
        // Day one from 12:00 to 20:00, silent until 03:00, then two more days
        let day_one_end = window_start() + chrono::Duration::hours(15);
        let resume = day_one_end + chrono::Duration::hours(7);
        let end = resume + chrono::Duration::days(2);

        let mut outcome = Outcome {
            failure: None,
            final_time_secs: (end - window_start()).num_seconds() as f64,
            metrics: ScenarioMetrics::default(),
        };
        let mut previous: Option<f64> = None;
        let mut before_gap = 0.0;
        let mut t = window_start() + chrono::Duration::hours(7);
        while t <= end {
            let reading = sim.advance(&t);
            outcome.metrics.readings += 1;
            if let Some(prev) = previous {
                outcome = outcome.check(reading.bat_mv <= prev, || {
                    format!("Battery rose from {} to {} mV at {}", prev, reading.bat_mv, t)
                });
            }
            if let Some(rate) = sim.current_day_rate() {
                outcome = outcome.check((70.0..=130.0).contains(&rate), || {
                    format!("Daily drain {:.1} mV outside [70, 130]", rate)
                });
            }
            if t == day_one_end {
                before_gap = reading.bat_mv;
            }
            if t == resume {
                let drop = before_gap - reading.bat_mv;
                outcome = outcome.check((20.3..=38.0).contains(&drop), || {
                    format!("Drop over the 7 h gap was {:.1} mV", drop)
                });
            }
            previous = Some(reading.bat_mv);
            t = if t == day_one_end { resume } else { t + step };
        }
        outcome
    }

    async fn run_deregistration(seed: u64) -> Outcome {
        let config = SimConfig {
            seed,
            num_boxes: 2,
            ..SimConfig::default()
        };
        let (target_name, target_serial) = (config.box_name(1), config.box_serial(1));
        let other_name = config.box_name(0);
        let poll_interval = config.poll_interval;
        let mut world = SimWorld::new(config);

        world.run_for(Duration::from_secs(5 * 60)).await;
        let before = world.backend.delivered_for_box(&target_name).len();

        let update = RegistrationUpdate {
            serial_number: target_serial.clone(),
            house_id: FieldUpdate::clear(),
            registered: FieldUpdate::set(false),
        };
        let applied = world.source.update_registration(&update);

        world.run_for(poll_interval).await;
        let stopped = !world.running_boxes().contains(&target_serial);
        let after_poll = world.backend.delivered_for_box(&target_name).len();
        let other_before = world.backend.delivered_for_box(&other_name).len();

        world.run_for(Duration::from_secs(10 * 60)).await;
        let later = world.backend.delivered_for_box(&target_name).len();
        let other_later = world.backend.delivered_for_box(&other_name).len();
        world.shutdown().await;

        Outcome {
            failure: None,
            final_time_secs: world.time(),
            metrics: fleet_metrics(&world),
        }
        .check(applied.is_ok(), || format!("Registration update failed: {:?}", applied.err()))
        .check(before > 0, || "Target box never delivered".to_string())
        .check(stopped, || "Runner still active one poll after deregistration".to_string())
        .check(later == after_poll, || {
            format!("{} deliveries after deregistration", later.saturating_sub(after_poll))
        })
        .check(other_later > other_before, || "Registered box stopped delivering".to_string())
    }

    async fn run_backend_outage(seed: u64) -> Outcome {
        let config = SimConfig {
            seed,
            num_boxes: 1,
            ..SimConfig::default()
        };
        let sensors = DEFAULT_SENSOR_TYPES.len() as u64;
        let mut world = SimWorld::new(config);

        world.run_for(Duration::from_secs(3 * 60)).await;
        let delivered_before = world.backend.delivered().len();
        let attempts_before = world.backend.attempts();

        world.controller.set_outage(503);
        world.run_for(Duration::from_secs(3 * 60)).await;
        let delivered_during = world.backend.delivered().len();
        let attempts_during = world.backend.attempts() - attempts_before;

        world.controller.heal_all();
        world.run_for(Duration::from_secs(3 * 60)).await;
        let delivered_after = world.backend.delivered().len();
        world.shutdown().await;

        Outcome {
            failure: None,
            final_time_secs: world.time(),
            metrics: fleet_metrics(&world),
        }
        .check(delivered_before > 0, || "Nothing delivered before the outage".to_string())
        .check(delivered_during == delivered_before, || "Records accepted during outage".to_string())
        // Every tick during the outage makes 1 + 3 attempts per sensor
        .check(attempts_during >= 4 * sensors * 2, || {
            format!("Only {} ingestion attempts during the outage", attempts_during)
        })
        .check(delivered_after > delivered_during, || "Delivery did not resume after heal".to_string())
    }

    async fn run_throttle(seed: u64) -> Outcome {
        let config = SimConfig {
            seed,
            num_boxes: 10,
            phase_max_ms: 0,
            max_inflight: 3,
            backend_latency: Duration::from_millis(500),
            ..SimConfig::default()
        };
        let max_inflight = config.max_inflight;
        let expected = (config.num_boxes * DEFAULT_SENSOR_TYPES.len() * 5) as u64;
        let mut world = SimWorld::new(config);

        world.run_for(Duration::from_secs(5 * 60 + 30)).await;
        world.shutdown().await;
        let metrics = fleet_metrics(&world);
        let (peak, delivered) = (metrics.peak_in_flight, metrics.delivered);

        Outcome {
            failure: None,
            final_time_secs: world.time(),
            metrics,
        }
        .check(peak <= max_inflight, || format!("{} deliveries in flight, limit {}", peak, max_inflight))
        .check(peak == max_inflight, || format!("Gate never saturated (peak {})", peak))
        .check(delivered == expected, || format!("Delivered {} of {} readings", delivered, expected))
    }

    async fn run_config_outage(seed: u64) -> Outcome {
        let config = SimConfig {
            seed,
            num_boxes: 2,
            ..SimConfig::default()
        };
        let poll_interval = config.poll_interval;
        let document = config.fleet_document();
        let mut world = SimWorld::new(config);

        world.run_for(Duration::from_secs(3 * 60)).await;
        let running_before = world.running_boxes().len();

        world.source.clear();
        world.run_for(poll_interval).await;
        let running_during = world.running_boxes().len();
        let delivered_stop = world.backend.delivered().len();
        world.run_for(Duration::from_secs(5 * 60)).await;
        let delivered_idle = world.backend.delivered().len();

        world.source.set(document);
        world.run_for(Duration::from_secs(3 * 60)).await;
        let running_after = world.running_boxes().len();
        let delivered_after = world.backend.delivered().len();
        world.shutdown().await;

        debug!(now_s = world.context.now().as_secs(), "Config outage scenario complete");
        Outcome {
            failure: None,
            final_time_secs: world.time(),
            metrics: fleet_metrics(&world),
        }
        .check(running_before == 2, || format!("{} boxes running before outage", running_before))
        .check(running_during == 0, || format!("{} boxes still running without config", running_during))
        .check(delivered_idle == delivered_stop, || "Deliveries continued without config".to_string())
        .check(running_after == 2, || "Fleet did not resume".to_string())
        .check(delivered_after > delivered_idle, || "No deliveries after config returned".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chronic_window_seed_42() {
        let result = ScenarioRunner::new(42).run(ScenarioId::ChronicWindow);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.readings, 288);
    }

    #[test]
    fn test_battery_continuity() {
        let result = ScenarioRunner::new(42).run(ScenarioId::BatteryContinuity);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_deregistration_stops_deliveries() {
        let result = ScenarioRunner::new(7).run(ScenarioId::Deregistration);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_backend_outage_recovers() {
        let result = ScenarioRunner::new(7).run(ScenarioId::BackendOutage);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.attempts > result.metrics.delivered);
    }

    #[test]
    fn test_throttle_bound() {
        let result = ScenarioRunner::new(7).run(ScenarioId::Throttle);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.peak_in_flight, 3);
    }

    #[test]
    fn test_config_outage() {
        let result = ScenarioRunner::new(7).run(ScenarioId::ConfigOutage);
        assert!(result.passed, "{:?}", result.failure_reason);
    }
}
