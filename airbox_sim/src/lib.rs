//! Airbox Deterministic Simulation Harness
//!
//! Runs the whole fleet (config polling, box runners, sensor workers and
//! the ingestion backend) on a paused tokio clock, so hours of traffic
//! complete in milliseconds and every run is reproducible from one seed.
//!
//! # Sources of non-determinism
//!
//! - **Time**: tokio's paused clock, auto-advanced when every task is idle
//! - **Backend**: in-memory store with scripted faults, outages and latency
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                       SimWorld                        │
//! │  ┌─────────────────┐        ┌──────────────────────┐  │
//! │  │ SimConfigSource │──poll─►│   FleetSupervisor    │  │
//! │  └─────────────────┘        │  BoxRunner ... x N   │  │
//! │                             │   SensorWorker x M   │  │
//! │                             └──────────┬───────────┘  │
//! │                                        │ ingest       │
//! │                             ┌──────────▼───────────┐  │
//! │                             │ SimBackend (faults)  │  │
//! │                             └──────────────────────┘  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use airbox_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Throttle);
//! assert!(result.passed);
//! ```

mod backend;
mod config_source;
mod context;
mod exporter;
mod runner;
mod world;
pub mod scenarios;

pub use backend::{DeliveredRecord, Fault, SimBackend, SimBackendController};
pub use config_source::SimConfigSource;
pub use context::SimContext;
pub use exporter::{decode_frame_hex, WindowExport, WindowFrame};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, CO2_COMFORT_PPM};
pub use world::{SimConfig, SimWorld, DEFAULT_SENSOR_TYPES};
