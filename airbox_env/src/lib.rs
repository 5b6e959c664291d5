//! airbox Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the fleet engine
//! to run in both **Production** (tokio + HTTP) and **Simulation**
//! (seeded RNG, paused clock, in-memory backend) environments.
//!
//! # Core Concept
//!
//! Every source of non-determinism used by the delivery path is intercepted:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Backend I/O (`create_sensor()`, `fetch_sensor_settings()`, `ingest()`)
//! - Randomness (`random_unit()`)
//!
//! # Example
//!
//! ```ignore
//! use airbox_env::{AirboxContext, IngestBackend, IngestRecord};
//!
//! async fn deliver<Ctx: AirboxContext, B: IngestBackend>(ctx: &Ctx, backend: &B, record: IngestRecord) {
//!     loop {
//!         match backend.ingest(&record).await {
//!             Ok(status) if status < 300 => break,
//!             _ => ctx.sleep(Duration::from_millis(250)).await,
//!         }
//!     }
//! }
//! ```

mod backend;
mod context;
mod error;
mod tokio_impl;
mod types;

pub use backend::{BackendController, IngestBackend};
pub use context::{epoch_secs, AirboxContext};
pub use error::{EnvError, StatusClass};
pub use tokio_impl::TokioContext;
pub use types::{IngestRecord, RegisteredSensor, SensorId, SensorRegistration, SensorSettings};
