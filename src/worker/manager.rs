//! Registry of workers with start/stop fan-out and self-healing.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::WorkerError;
use crate::worker::unit::Unit;
use crate::worker::worker::{DEFAULT_STOP_TIMEOUT, Worker, WorkerSummary};

/// Shortest period a worker may be given at runtime.
pub const MIN_WORKER_PERIOD: Duration = Duration::from_secs(15);

/// Type-erased view of a [`Worker`], so workers of different units can share
/// one registry.
#[async_trait]
pub trait ManagedWorker: Send + Sync {
    fn name(&self) -> &str;
    fn is_running(&self) -> bool;
    fn period(&self) -> Duration;
    fn set_period(&mut self, period: Duration);
    fn start(&mut self);
    async fn stop(&mut self) -> bool;
    async fn reset(&mut self, start: bool) -> Result<(), WorkerError>;
    fn summary(&self) -> WorkerSummary;
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<U: Unit> ManagedWorker for Worker<U> {
    fn name(&self) -> &str {
        Worker::name(self)
    }

    fn is_running(&self) -> bool {
        Worker::is_running(self)
    }

    fn period(&self) -> Duration {
        Worker::period(self)
    }

    fn set_period(&mut self, period: Duration) {
        Worker::set_period(self, period)
    }

    fn start(&mut self) {
        Worker::start(self)
    }

    async fn stop(&mut self) -> bool {
        Worker::stop(self).await
    }

    async fn reset(&mut self, start: bool) -> Result<(), WorkerError> {
        self.reset_worker(None, start).await
    }

    fn summary(&self) -> WorkerSummary {
        Worker::summary(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Owns every worker, keyed by unit name.
///
/// All mutation goes through `&mut self`; the single driver that owns the
/// manager is the only writer.
pub struct WorkerManager {
    workers: HashMap<String, Box<dyn ManagedWorker>>,
    stop_timeout: Duration,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::with_stop_timeout(DEFAULT_STOP_TIMEOUT)
    }

    /// Manager whose workers wait up to `stop_timeout` when stopped.
    pub fn with_stop_timeout(stop_timeout: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            stop_timeout,
        }
    }

    /// Register a worker for unit `U`.
    ///
    /// Returns `Ok(false)` without effect when a worker for `U` already exists.
    pub fn add_worker<U: Unit>(
        &mut self,
        period: Duration,
        params: U::Params,
        actions: &[U::Action],
        initial_delay: Option<Duration>,
    ) -> Result<bool, WorkerError> {
        if self.workers.contains_key(U::NAME) {
            tracing::info!(worker = U::NAME, "Worker already registered");
            return Ok(false);
        }

        let worker = Worker::<U>::new(period, params, actions, initial_delay)?
            .with_stop_timeout(self.stop_timeout);
        tracing::info!(
            worker = U::NAME,
            period_secs = period.as_secs(),
            "Registered worker"
        );
        self.workers.insert(U::NAME.to_string(), Box::new(worker));
        Ok(true)
    }

    /// Rebuild and restart every worker that is not running.
    ///
    /// Returns how many workers were rebuilt. Running workers are untouched.
    pub async fn heal_workers(&mut self) -> usize {
        let mut healed = 0;
        for (name, worker) in &mut self.workers {
            if worker.is_running() {
                continue;
            }
            tracing::info!(worker = %name, "Worker not running, restarting it");
            match worker.reset(true).await {
                Ok(()) => healed += 1,
                Err(e) => tracing::error!(worker = %name, error = %e, "Failed to heal worker"),
            }
        }
        healed
    }

    pub fn start(&mut self) {
        for worker in self.workers.values_mut() {
            worker.start();
        }
    }

    /// Stop every worker concurrently. Returns whether all confirmed.
    pub async fn stop(&mut self) -> bool {
        let stops = self.workers.values_mut().map(|w| w.stop());
        let results = futures::future::join_all(stops).await;
        results.into_iter().all(|stopped| stopped)
    }

    /// Change a worker's period.
    ///
    /// Refused (and logged) when the worker is unknown or the period is below
    /// [`MIN_WORKER_PERIOD`].
    pub fn edit_period(&mut self, name: &str, period: Duration) -> bool {
        let Some(worker) = self.workers.get_mut(name) else {
            tracing::info!(worker = %name, "Worker not registered, cannot edit period");
            return false;
        };
        if period < MIN_WORKER_PERIOD {
            tracing::info!(
                worker = %name,
                period_secs = period.as_secs(),
                "Period below minimum of {}s, ignoring",
                MIN_WORKER_PERIOD.as_secs()
            );
            return false;
        }
        worker.set_period(period);
        tracing::info!(worker = %name, period_secs = period.as_secs(), "Worker period updated");
        true
    }

    /// [`edit_period`](Self::edit_period) keyed by unit type.
    pub fn edit_period_of<U: Unit>(&mut self, period: Duration) -> bool {
        self.edit_period(U::NAME, period)
    }

    pub fn period(&self, name: &str) -> Option<Duration> {
        self.workers.get(name).map(|w| w.period())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.workers.get(name).is_some_and(|w| w.is_running())
    }

    /// Shared handle on the unit registered for `U`.
    pub fn unit<U: Unit>(&self) -> Option<Arc<Mutex<U>>> {
        self.workers
            .get(U::NAME)?
            .as_any()
            .downcast_ref::<Worker<U>>()
            .map(Worker::unit)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Sorted by worker name.
    pub fn summary(&self) -> Vec<WorkerSummary> {
        let mut rows: Vec<_> = self.workers.values().map(|w| w.summary()).collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnitError;
    use crate::worker::state::WorkerState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Op {
        Run,
    }

    struct Steady;

    #[async_trait]
    impl Unit for Steady {
        type Params = Arc<AtomicUsize>;
        type Action = Op;
        const NAME: &'static str = "Steady";

        fn build(builds: &Self::Params) -> Result<Self, UnitError> {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Self)
        }

        fn capabilities() -> &'static [Op] {
            &[Op::Run]
        }

        async fn perform(&mut self, _: Op) -> Result<(), UnitError> {
            Ok(())
        }
    }

    struct Quitter;

    #[async_trait]
    impl Unit for Quitter {
        type Params = Arc<AtomicUsize>;
        type Action = Op;
        const NAME: &'static str = "Quitter";

        fn build(builds: &Self::Params) -> Result<Self, UnitError> {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Self)
        }

        fn capabilities() -> &'static [Op] {
            &[Op::Run]
        }

        async fn perform(&mut self, _: Op) -> Result<(), UnitError> {
            Err(UnitError::exit("no longer supported"))
        }
    }

    struct Stuck;

    #[async_trait]
    impl Unit for Stuck {
        type Params = Arc<AtomicUsize>;
        type Action = Op;
        const NAME: &'static str = "Stuck";

        fn build(builds: &Self::Params) -> Result<Self, UnitError> {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Self)
        }

        fn capabilities() -> &'static [Op] {
            &[Op::Run]
        }

        async fn perform(&mut self, _: Op) -> Result<(), UnitError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(())
        }
    }

    fn manager() -> (WorkerManager, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let steady = Arc::new(AtomicUsize::new(0));
        let quitter = Arc::new(AtomicUsize::new(0));
        let mut m = WorkerManager::new();
        let delay = Some(Duration::from_millis(10));
        assert!(m.add_worker::<Steady>(Duration::from_secs(20), steady.clone(), &[Op::Run], delay).unwrap());
        assert!(m.add_worker::<Quitter>(Duration::from_secs(20), quitter.clone(), &[Op::Run], delay).unwrap());
        (m, steady, quitter)
    }

    #[test]
    fn registration_is_unique_per_unit() {
        let (mut m, steady, _) = manager();
        let added = m
            .add_worker::<Steady>(Duration::from_secs(30), steady.clone(), &[Op::Run], None)
            .unwrap();
        assert!(!added);
        assert_eq!(m.len(), 2);
        assert_eq!(m.period("Steady"), Some(Duration::from_secs(20)));
        assert_eq!(steady.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn edit_period_enforces_floor() {
        let (mut m, _, _) = manager();
        assert!(!m.edit_period("Steady", Duration::from_secs(10)));
        assert_eq!(m.period("Steady"), Some(Duration::from_secs(20)));

        assert!(m.edit_period_of::<Steady>(Duration::from_secs(15)));
        assert_eq!(m.period("Steady"), Some(Duration::from_secs(15)));

        assert!(!m.edit_period("Missing", Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn heal_rebuilds_only_dead_workers() {
        let (mut m, steady, quitter) = manager();
        m.start();
        assert_eq!(m.heal_workers().await, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(m.is_running("Steady"));
        assert!(!m.is_running("Quitter"));

        assert_eq!(m.heal_workers().await, 1);
        assert_eq!(steady.load(Ordering::SeqCst), 1);
        assert_eq!(quitter.load(Ordering::SeqCst), 2);
        assert!(m.is_running("Quitter"));

        assert!(m.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn heal_starts_workers_never_started() {
        let (mut m, _, _) = manager();
        assert_eq!(m.heal_workers().await, 2);
        assert!(m.is_running("Steady"));
        assert!(m.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn summary_reports_state_and_errors() {
        let (mut m, _, _) = manager();
        m.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let rows = m.summary();
        assert_eq!(rows[0].name, "Quitter");
        assert_eq!(rows[0].error_count, 1);
        assert!(matches!(rows[0].state, WorkerState::Failed(_)));
        assert_eq!(rows[1].name, "Steady");
        assert_eq!(rows[1].state, WorkerState::Running);
        assert!(rows[1].remaining_secs.is_some());

        assert!(m.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_stop_leaves_worker_alone_until_it_ends() {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut m = WorkerManager::with_stop_timeout(Duration::from_secs(1));
        m.add_worker::<Stuck>(
            Duration::from_secs(20),
            builds.clone(),
            &[Op::Run],
            Some(Duration::from_millis(10)),
        )
        .unwrap();
        m.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!m.stop().await);
        assert!(m.is_running("Stuck"));
        // Still alive, so healing must not build a second copy.
        assert_eq!(m.heal_workers().await, 0);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!m.is_running("Stuck"));
        assert!(m.stop().await);
    }

    #[tokio::test]
    async fn typed_unit_lookup() {
        let (m, _, _) = manager();
        assert!(m.unit::<Steady>().is_some());
        assert!(m.unit::<Quitter>().is_some());
        assert!(WorkerManager::new().unit::<Steady>().is_none());
    }
}
