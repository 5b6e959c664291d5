//! airbox Core - simulated indoor air-quality sensor fleet
//!
//! This library generates and delivers believable telemetry for a fleet of
//! battery-powered sensor boxes:
//! 1. **Environment**: per-box continuous-state simulator with profile-dependent
//!    dynamics, transient events and cross-midnight battery drain
//! 2. **Wire format**: fixed-point 22-byte frame codec
//! 3. **Delivery**: tick-aligned sensor workers, supervised box runners and a
//!    fleet supervisor reconciling a declarative configuration

pub mod backoff;
pub mod box_env;
pub mod codec;
pub mod config;
pub mod events;
pub mod runner;
pub mod schema;
pub mod simulator;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience
pub use backoff::{RestartBackoff, RetryPolicy, RetryState};
pub use box_env::{BoxEnvironment, BoxEnvironments, EnvironmentParams};
pub use codec::{decode, encode, from_hex, to_hex, CodecError, FRAME_LEN};
pub use config::{
    BoxDefinition, ConfigError, ConfigSource, FieldAction, FieldState, FieldUpdate, FileConfigStore, FleetDocument,
    GlobalSettings, RegistrationOutcome, RegistrationUpdate, SeedSource, SensorDefinition,
};
pub use events::{Event, EventKind};
pub use runner::{BoxContext, BoxRunner, RunnerError};
pub use schema::{Channel, ChannelSpec, Reading};
pub use simulator::{EnvironmentSimulator, Profile, SimulatorConfig};
pub use supervisor::{FleetSupervisor, ReconcileReport};
pub use worker::{send_reading_with_retry, DeliveryOutcome, SensorWorker, TickOutcome, TickSchedule};
