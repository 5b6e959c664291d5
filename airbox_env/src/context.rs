//! Core environment context trait for airbox tasks.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the fleet engine can run
/// in both production (tokio wall clock) and simulation (seeded, paused clock).
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `thread_rng`
/// - **Simulation**: `SimContext` - fixed epoch over tokio's pausable clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// All methods that would normally introduce non-determinism
/// (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait AirboxContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// Used for cache expiry and duration measurements.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Tick alignment and reading timestamps are derived from this value.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Suspends execution until the given wall-clock instant.
    ///
    /// Returns immediately if the instant is already in the past.
    async fn sleep_until(&self, deadline: SystemTime) {
        if let Ok(delay) = deadline.duration_since(self.system_time()) {
            if !delay.is_zero() {
                self.sleep(delay).await;
            }
        }
    }

    /// Spawns a named background task and returns its handle.
    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Draws a uniform value in `[0, 1)`.
    ///
    /// Used for retry jitter and for sensors without a simulated channel.
    fn random_unit(&self) -> f64;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}

/// Seconds since the Unix epoch as a float, saturating at zero for pre-epoch times.
pub fn epoch_secs(at: SystemTime) -> f64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
