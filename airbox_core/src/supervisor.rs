//! Fleet Supervisor - reconciles the declared fleet against running box runners.

use crate::box_env::BoxEnvironments;
use crate::config::{ConfigSource, FleetDocument, GlobalSettings};
use crate::runner::{BoxContext, BoxRunner};
use airbox_env::{AirboxContext, IngestBackend};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Keys touched by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub restarted: Vec<String>,
    /// Deregistered boxes (environment kept)
    pub stopped: Vec<String>,
    /// Boxes absent from the document (environment decommissioned)
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Owns every box runner, the global delivery gate and the environment arena.
pub struct FleetSupervisor<Ctx, B>
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    ctx: Arc<Ctx>,
    backend: Arc<B>,
    environments: Arc<BoxEnvironments>,
    runners: HashMap<String, BoxRunner>,
    globals: Option<GlobalSettings>,
    gate: Arc<Semaphore>,
}

impl<Ctx, B> FleetSupervisor<Ctx, B>
where
    Ctx: AirboxContext,
    B: IngestBackend,
{
    pub fn new(ctx: Arc<Ctx>, backend: Arc<B>) -> Self {
        let gate = Arc::new(Semaphore::new(GlobalSettings::default().max_inflight));
        Self {
            ctx,
            backend,
            environments: Arc::new(BoxEnvironments::new()),
            runners: HashMap::new(),
            globals: None,
            gate,
        }
    }

    pub fn environments(&self) -> &Arc<BoxEnvironments> {
        &self.environments
    }

    /// Current global delivery gate.
    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone()
    }

    pub fn globals(&self) -> Option<&GlobalSettings> {
        self.globals.as_ref()
    }

    pub fn running_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.runners.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Applies one fleet document.
    pub async fn apply_config(&mut self, document: &FleetDocument) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let globals = document.globals();
        let mut restarted_by_globals = HashSet::new();
        if self.globals.as_ref() != Some(&globals) {
            if self.globals.is_some() {
                info!("Global scheduling parameters changed, restarting every box");
                restarted_by_globals.extend(self.runners.keys().cloned());
                self.stop_all().await;
            }
            self.gate = Arc::new(Semaphore::new(globals.max_inflight));
            self.globals = Some(globals.clone());
        }

        let mut seen = HashSet::new();
        for definition in &document.boxes {
            let key = definition.key();
            if !seen.insert(key.clone()) {
                warn!(box_key = %key, "Duplicate box key, ignoring later definition");
                continue;
            }

            if !definition.registered {
                debug!(box_key = %key, "Box is not registered; waiting for next poll");
                if let Some(runner) = self.runners.remove(&key) {
                    runner.stop().await;
                    report.stopped.push(key);
                }
                continue;
            }

            let mut restarted = restarted_by_globals.contains(&key);
            if let Some(runner) = self.runners.remove(&key) {
                if runner.signature() == definition.signature() {
                    self.runners.insert(key.clone(), runner);
                    report.unchanged.push(key);
                    continue;
                }
                runner.stop().await;
                restarted = true;
            }

            let environment = self
                .environments
                .get_or_create(&key, definition.environment_params(globals.period))
                .await;
            let parts = BoxContext {
                ctx: self.ctx.clone(),
                backend: self.backend.clone(),
                environment,
                gate: self.gate.clone(),
                globals: globals.clone(),
            };
            self.runners.insert(key.clone(), BoxRunner::start(definition.clone(), parts));
            if restarted {
                report.restarted.push(key);
            } else {
                report.started.push(key);
            }
        }

        let absent: Vec<String> = self.runners.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        for key in absent {
            if let Some(runner) = self.runners.remove(&key) {
                runner.stop().await;
            }
        }
        for key in self.environments.keys().await {
            if !seen.contains(&key) {
                self.environments.remove(&key).await;
                report.removed.push(key);
            }
        }

        info!(
            started = report.started.len(),
            restarted = report.restarted.len(),
            stopped = report.stopped.len(),
            removed = report.removed.len(),
            running = self.runners.len(),
            "Fleet reconciled"
        );
        report
    }

    /// Stops every runner; environments are kept.
    pub async fn stop_all(&mut self) {
        for (_, runner) in self.runners.drain() {
            runner.stop().await;
        }
    }

    /// Re-reads the configuration every `interval` until `shutdown` flips.
    ///
    /// An unreadable or invalid document stops every runner.
    pub async fn poll_forever<S>(&mut self, source: &S, interval: Duration, mut shutdown: watch::Receiver<bool>)
    where
        S: ConfigSource + ?Sized,
    {
        loop {
            match source.load().await {
                Ok(document) => {
                    self.apply_config(&document).await;
                }
                Err(e) => {
                    warn!(error = %e, "Fleet configuration unavailable, stopping all boxes");
                    self.stop_all().await;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.ctx.sleep(interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        self.stop_all().await;
        info!("Fleet supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::testing::{MockBackend, MockContext};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn document(value: Value) -> FleetDocument {
        FleetDocument::from_value(value).unwrap()
    }

    fn fleet(registered_b: bool, period: u64) -> FleetDocument {
        document(json!({
            "period_seconds": period,
            "phase_max_ms": 0,
            "boxes": [
                {"name": "a", "serial_number": "A-1", "house_id": "H", "registered": true,
                 "sensors": [{"name": "co2", "type": "co2"}]},
                {"name": "b", "serial_number": "B-1", "house_id": "H", "registered": registered_b,
                 "sensors": [{"name": "rh", "type": "humidity"}]}
            ]
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_lifecycle() {
        let ctx = MockContext::shared();
        let backend = MockBackend::shared();
        let mut supervisor = FleetSupervisor::new(ctx, backend);

        let report = supervisor.apply_config(&fleet(true, 60)).await;
        assert_eq!(report.started, vec!["A-1", "B-1"]);
        assert_eq!(supervisor.running_keys(), vec!["A-1", "B-1"]);

        let report = supervisor.apply_config(&fleet(true, 60)).await;
        assert_eq!(report.unchanged, vec!["A-1", "B-1"]);

        // Deregistration keeps the environment
        let report = supervisor.apply_config(&fleet(false, 60)).await;
        assert_eq!(report.stopped, vec!["B-1"]);
        assert_eq!(supervisor.running_keys(), vec!["A-1"]);
        assert!(supervisor.environments().get("B-1").await.is_some());

        // Removal decommissions it
        let only_a = document(json!({
            "period_seconds": 60, "phase_max_ms": 0,
            "boxes": [{"name": "a", "serial_number": "A-1", "house_id": "H", "registered": true,
                       "sensors": [{"name": "co2", "type": "co2"}]}]
        }));
        let report = supervisor.apply_config(&only_a).await;
        assert_eq!(report.removed, vec!["B-1"]);
        assert!(supervisor.environments().get("B-1").await.is_none());

        supervisor.stop_all().await;
        assert!(supervisor.running_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_definition_restarts_and_keeps_environment() {
        let ctx = MockContext::shared();
        let backend = MockBackend::shared();
        let mut supervisor = FleetSupervisor::new(ctx, backend);
        supervisor.apply_config(&fleet(true, 60)).await;
        let before = supervisor.environments().get("A-1").await.unwrap();

        let edited = document(json!({
            "period_seconds": 60, "phase_max_ms": 0,
            "boxes": [
                {"name": "a", "serial_number": "A-1", "house_id": "H", "registered": true,
                 "location": "Hall", "sensors": [{"name": "co2", "type": "co2"}]},
                {"name": "b", "serial_number": "B-1", "house_id": "H", "registered": true,
                 "sensors": [{"name": "rh", "type": "humidity"}]}
            ]
        }));
        let report = supervisor.apply_config(&edited).await;
        assert_eq!(report.restarted, vec!["A-1"]);
        assert_eq!(report.unchanged, vec!["B-1"]);
        let after = supervisor.environments().get("A-1").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_globals_change_restarts_everything_and_replaces_gate() {
        let ctx = MockContext::shared();
        let backend = MockBackend::shared();
        let mut supervisor = FleetSupervisor::new(ctx, backend);
        supervisor.apply_config(&fleet(true, 60)).await;
        let gate = supervisor.gate();

        let report = supervisor.apply_config(&fleet(true, 30)).await;
        assert_eq!(report.restarted, vec!["A-1", "B-1"]);
        assert!(report.started.is_empty());
        assert!(!Arc::ptr_eq(&gate, &supervisor.gate()));
        assert_eq!(supervisor.globals().unwrap().period, Duration::from_secs(30));
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_respected() {
        let ctx = MockContext::shared();
        let backend = MockBackend::shared();
        let mut supervisor = FleetSupervisor::new(ctx, backend);
        supervisor
            .apply_config(&document(json!({"max_inflight": 3, "boxes": []})))
            .await;
        assert_eq!(supervisor.gate().available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_concurrency_limit_is_capped() {
        let ctx = MockContext::shared();
        let backend = MockBackend::shared();
        let mut supervisor = FleetSupervisor::new(ctx, backend);
        supervisor
            .apply_config(&document(json!({"max_inflight": u64::MAX, "boxes": []})))
            .await;
        assert_eq!(supervisor.gate().available_permits(), Semaphore::MAX_PERMITS);
    }

    struct FlakySource {
        documents: Mutex<Vec<Result<FleetDocument, ConfigError>>>,
    }

    #[async_trait]
    impl ConfigSource for FlakySource {
        async fn load(&self) -> Result<FleetDocument, ConfigError> {
            let mut documents = self.documents.lock().unwrap();
            if documents.is_empty() {
                Err(ConfigError::MissingBoxes)
            } else {
                documents.remove(0)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_config_stops_all_runners() {
        let ctx = MockContext::shared();
        let backend = MockBackend::shared();
        let source = Arc::new(FlakySource {
            documents: Mutex::new(vec![Ok(fleet(true, 60))]),
        });
        let (tx, rx) = watch::channel(false);

        let poll_backend = backend.clone();
        let poll_source = source.clone();
        let poller = tokio::spawn(async move {
            let mut supervisor = FleetSupervisor::new(ctx, poll_backend);
            supervisor.poll_forever(poll_source.as_ref(), Duration::from_secs(90), rx).await;
            supervisor.running_keys()
        });

        tokio::time::sleep(Duration::from_secs(85)).await;
        let delivered = backend.records().len();
        assert!(delivered >= 2);

        // Second poll fails at t=90: no further deliveries
        tokio::time::sleep(Duration::from_secs(200)).await;
        let after = backend.records().len();
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(backend.records().len(), after);

        tx.send(true).unwrap();
        assert!(poller.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_period_stops_fleet_without_panicking() {
        let ctx = MockContext::shared();
        let backend = MockBackend::shared();
        let huge_period = FleetDocument::from_value(json!({
            "period_seconds": 1e30,
            "boxes": [{"name": "a", "serial_number": "A-1", "house_id": "H", "registered": true,
                       "sensors": [{"name": "co2", "type": "co2"}]}]
        }));
        assert!(matches!(huge_period, Err(ConfigError::InvalidPeriod { .. })));
        let source = Arc::new(FlakySource {
            documents: Mutex::new(vec![Ok(fleet(true, 60)), huge_period]),
        });
        let (tx, rx) = watch::channel(false);

        let poll_backend = backend.clone();
        let poll_source = source.clone();
        let poller = tokio::spawn(async move {
            let mut supervisor = FleetSupervisor::new(ctx, poll_backend);
            supervisor.poll_forever(poll_source.as_ref(), Duration::from_secs(90), rx).await;
            supervisor.running_keys()
        });

        tokio::time::sleep(Duration::from_secs(85)).await;
        assert!(!backend.records().is_empty());

        // Invalid document read at t=90 stops every box
        tokio::time::sleep(Duration::from_secs(30)).await;
        let after = backend.records().len();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(backend.records().len(), after);
        assert!(!poller.is_finished());

        tx.send(true).unwrap();
        assert!(poller.await.unwrap().is_empty());
    }
}
