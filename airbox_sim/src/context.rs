//! Simulation context implementing AirboxContext for deterministic testing.

use airbox_env::AirboxContext;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// 2024-01-01 00:00:00 UTC
pub const DEFAULT_EPOCH_SECS: u64 = 1_704_067_200;

/// Simulation context backed by tokio's pausable clock and a seeded RNG.
///
/// This implements `AirboxContext` using:
/// - A fixed wall-clock epoch; `system_time()` is the epoch plus elapsed tokio time
/// - A seeded ChaCha8 RNG for retry jitter and unmapped sensor values
/// - tokio sleeps, which advance instantly on a paused runtime
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Deterministic RNG
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Wall-clock time at the origin instant
    epoch: SystemTime,

    /// tokio instant mapped to the epoch
    origin: tokio::time::Instant,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self::with_epoch(seed, UNIX_EPOCH + Duration::from_secs(DEFAULT_EPOCH_SECS))
    }

    /// Creates a context whose clock starts at `epoch`.
    pub fn with_epoch(seed: u64, epoch: SystemTime) -> Self {
        Self {
            seed,
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch,
            origin: tokio::time::Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Wall-clock time at context creation.
    pub fn epoch(&self) -> SystemTime {
        self.epoch
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
            origin: self.origin,
        }
    }
}

#[async_trait]
impl AirboxContext for SimContext {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name, seed = self.seed);
        tokio::spawn(future.instrument(span))
    }

    fn random_unit(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen::<f64>(),
            Err(poisoned) => poisoned.into_inner().gen::<f64>(),
        }
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);
        assert_eq!(ctx.system_time(), UNIX_EPOCH + Duration::from_secs(DEFAULT_EPOCH_SECS));

        ctx.sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.sleep(Duration::from_millis(500)).await;
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.system_time(), ctx.epoch() + Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_wall_clock() {
        let ctx = SimContext::new(1);
        let target = ctx.epoch() + Duration::from_secs(90);
        ctx.sleep_until(target).await;
        assert_eq!(ctx.system_time(), target);

        // Past deadlines return immediately
        ctx.sleep_until(ctx.epoch()).await;
        assert_eq!(ctx.now(), Duration::from_secs(90));
    }

    #[test]
    fn test_sim_context_deterministic_randomness() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);
        let a: Vec<f64> = (0..5).map(|_| ctx1.random_unit()).collect();
        let b: Vec<f64> = (0..5).map(|_| ctx2.random_unit()).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (0.0..1.0).contains(v)));

        // Clones share the stream
        let ctx3 = ctx1.clone();
        assert_ne!(ctx1.random_unit(), ctx3.random_unit());
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }
}
