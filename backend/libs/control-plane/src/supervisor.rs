use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::stop::StopFlag;
use crate::store::ControlStore;

type EngineResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A supervised scraper engine.
///
/// `run` is the whole engine lifetime: it loops over cycles until the
/// stop flag is set, and returns Err only on fatal startup failures
/// (no proxies, no targets) that the supervisor should surface on the
/// control row.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// `system_control.script_name` for this engine
    fn script_name(&self) -> &'static str;

    /// `system_logs.source` the engine logs under (watchdog input)
    fn log_source(&self) -> &'static str;

    async fn run(self: Arc<Self>, stop: StopFlag) -> EngineResult;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Control-flag poll cadence
    pub check_interval: Duration,
    /// Restart the engine when its freshest log row is older than this.
    /// None disables the watchdog.
    pub hang_threshold: Option<Duration>,
    /// Pause between watchdog stop and restart
    pub restart_wait: Duration,
    /// How long a cooperative stop may take before the task is aborted
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            hang_threshold: None,
            restart_wait: Duration::from_secs(5),
            stop_grace: Duration::from_secs(30),
        }
    }
}

struct RunningEngine {
    stop: StopFlag,
    handle: JoinHandle<EngineResult>,
}

/// Poll loop that starts/stops an engine from the `system_control` flag,
/// heartbeats, and watches for hung engines.
pub struct Supervisor<C: ControlStore, E: Engine> {
    store: Arc<C>,
    engine: Arc<E>,
    config: SupervisorConfig,
    running: Option<RunningEngine>,
}

impl<C: ControlStore, E: Engine> Supervisor<C, E> {
    pub fn new(store: Arc<C>, engine: Arc<E>, config: SupervisorConfig) -> Self {
        Self {
            store,
            engine,
            config,
            running: None,
        }
    }

    /// Run until `shutdown` fires, then stop the engine and write the
    /// terminal control row.
    pub async fn run(mut self, shutdown: StopFlag) {
        let script = self.engine.script_name();
        info!(
            script,
            "supervisor running (checking every {:?})", self.config.check_interval
        );

        while shutdown.should_continue() {
            self.tick().await;
            if shutdown.sleep(self.config.check_interval).await {
                break;
            }
        }

        info!(script, "supervisor shutting down");
        self.stop_engine().await;
        if let Err(e) = self.store.mark_stopped(script).await {
            error!(script, "failed to write shutdown status: {}", e);
        }
    }

    /// One control-loop pass: reconcile desired vs. actual state,
    /// watchdog, heartbeat.
    pub async fn tick(&mut self) {
        let script = self.engine.script_name();

        // Read failure means "assume disabled" so a broken control plane
        // stops the harvest rather than letting it run unsupervised.
        let enabled = match self.store.is_enabled(script).await {
            Ok(enabled) => enabled,
            Err(e) => {
                error!(script, "failed to check enabled status: {}", e);
                false
            }
        };

        self.reap_finished().await;

        if enabled && self.running.is_none() {
            self.start_engine().await;
        } else if !enabled && self.running.is_some() {
            info!(script, "control flag cleared, stopping engine");
            self.stop_engine().await;
        }

        if enabled && self.running.is_some() {
            self.check_engine_health().await;
        }

        let status = if self.running.is_some() {
            "running"
        } else {
            "stopped"
        };
        if let Err(e) = self
            .store
            .update_heartbeat(script, std::process::id() as i32, status)
            .await
        {
            error!(script, "failed to update heartbeat: {}", e);
        }
    }

    /// Collect an engine task that exited on its own. A crashed engine is
    /// surfaced on the control row and restarted on the next enabled tick.
    async fn reap_finished(&mut self) {
        let script = self.engine.script_name();
        let finished = self
            .running
            .as_ref()
            .map(|r| r.handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return;
        }

        let Some(running) = self.running.take() else {
            return;
        };
        match running.handle.await {
            Ok(Ok(())) => info!(script, "engine exited cleanly"),
            Ok(Err(e)) => {
                error!(script, "engine failed: {}", e);
                if let Err(store_err) = self.store.mark_error(script, &e.to_string()).await {
                    error!(script, "failed to record engine error: {}", store_err);
                }
            }
            Err(join_err) => {
                error!(script, "engine task panicked: {}", join_err);
                let _ = self.store.mark_error(script, &join_err.to_string()).await;
            }
        }
    }

    async fn start_engine(&mut self) {
        let script = self.engine.script_name();
        info!(script, "starting engine");

        if let Err(e) = self
            .store
            .mark_started(script, std::process::id() as i32)
            .await
        {
            error!(script, "failed to record engine start: {}", e);
        }

        let stop = StopFlag::new();
        let handle = tokio::spawn(self.engine.clone().run(stop.clone()));
        self.running = Some(RunningEngine { stop, handle });
    }

    async fn stop_engine(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let script = self.engine.script_name();

        running.stop.stop();
        match tokio::time::timeout(self.config.stop_grace, running.handle).await {
            Ok(Ok(Ok(()))) => info!(script, "engine stopped"),
            Ok(Ok(Err(e))) => warn!(script, "engine stopped with error: {}", e),
            Ok(Err(join_err)) => error!(script, "engine task panicked on stop: {}", join_err),
            Err(_) => {
                warn!(
                    script,
                    "engine ignored stop for {:?}, abandoning task", self.config.stop_grace
                );
            }
        }
    }

    /// Log-freshness watchdog: a running engine whose last log row is
    /// older than the threshold is assumed hung and force-restarted.
    async fn check_engine_health(&mut self) {
        let Some(threshold) = self.config.hang_threshold else {
            return;
        };
        let script = self.engine.script_name();
        let source = self.engine.log_source();

        let age_secs = match self.store.seconds_since_last_log(source).await {
            Ok(Some(age)) => age,
            // Never logged yet, or the check itself failed: don't restart
            Ok(None) => return,
            Err(e) => {
                error!(script, "failed to check engine health: {}", e);
                return;
            }
        };

        if age_secs > threshold.as_secs() as i64 {
            warn!(
                script,
                "engine hung: no logs for {} minutes, restarting",
                age_secs / 60
            );
            self.stop_engine().await;
            tokio::time::sleep(self.config.restart_wait).await;
            self.start_engine().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ControlError;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        enabled: AtomicBool,
        fail_reads: AtomicBool,
        log_age_secs: AtomicI64,
        heartbeats: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl ControlStore for Arc<FakeStore> {
        async fn is_enabled(&self, _script: &str) -> Result<bool, ControlError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(ControlError::Store("connection refused".into()));
            }
            Ok(self.enabled.load(Ordering::SeqCst))
        }

        async fn mark_started(&self, _script: &str, _pid: i32) -> Result<(), ControlError> {
            Ok(())
        }

        async fn update_heartbeat(
            &self,
            _script: &str,
            _pid: i32,
            status: &str,
        ) -> Result<(), ControlError> {
            self.heartbeats.lock().unwrap().push(status.to_string());
            Ok(())
        }

        async fn mark_error(&self, _script: &str, error: &str) -> Result<(), ControlError> {
            self.errors.lock().unwrap().push(error.to_string());
            Ok(())
        }

        async fn mark_stopped(&self, _script: &str) -> Result<(), ControlError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn cycle_cooldown_secs(&self, _script: &str) -> Result<Option<u64>, ControlError> {
            Ok(None)
        }

        async fn seconds_since_last_log(&self, _source: &str) -> Result<Option<i64>, ControlError> {
            let age = self.log_age_secs.load(Ordering::SeqCst);
            Ok(if age < 0 { None } else { Some(age) })
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        starts: AtomicU32,
    }

    #[async_trait]
    impl Engine for FakeEngine {
        fn script_name(&self) -> &'static str {
            "reddit_scraper"
        }

        fn log_source(&self) -> &'static str {
            "reddit_scraper"
        }

        async fn run(self: Arc<Self>, stop: StopFlag) -> EngineResult {
            self.starts.fetch_add(1, Ordering::SeqCst);
            while stop.should_continue() {
                stop.sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        }
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            check_interval: Duration::from_millis(10),
            hang_threshold: None,
            restart_wait: Duration::from_millis(10),
            stop_grace: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn starts_engine_when_enabled() {
        let store = Arc::new(FakeStore::default());
        store.enabled.store(true, Ordering::SeqCst);
        store.log_age_secs.store(-1, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine::default());

        let mut supervisor = Supervisor::new(Arc::new(store.clone()), engine.clone(), test_config());
        supervisor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
        assert_eq!(store.heartbeats.lock().unwrap().last().unwrap(), "running");

        supervisor.stop_engine().await;
    }

    #[tokio::test]
    async fn stays_stopped_when_disabled() {
        let store = Arc::new(FakeStore::default());
        let engine = Arc::new(FakeEngine::default());

        let mut supervisor = Supervisor::new(Arc::new(store.clone()), engine.clone(), test_config());
        supervisor.tick().await;

        assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
        assert_eq!(store.heartbeats.lock().unwrap().last().unwrap(), "stopped");
    }

    #[tokio::test]
    async fn control_read_failure_fails_closed() {
        let store = Arc::new(FakeStore::default());
        store.enabled.store(true, Ordering::SeqCst);
        store.fail_reads.store(true, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine::default());

        let mut supervisor = Supervisor::new(Arc::new(store.clone()), engine.clone(), test_config());
        supervisor.tick().await;

        // Unable to read the flag ⇒ engine must not run
        assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stops_engine_when_flag_clears() {
        let store = Arc::new(FakeStore::default());
        store.enabled.store(true, Ordering::SeqCst);
        store.log_age_secs.store(-1, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine::default());

        let mut supervisor = Supervisor::new(Arc::new(store.clone()), engine.clone(), test_config());
        supervisor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.enabled.store(false, Ordering::SeqCst);
        supervisor.tick().await;

        assert_eq!(store.heartbeats.lock().unwrap().last().unwrap(), "stopped");
    }

    #[tokio::test]
    async fn watchdog_restarts_hung_engine() {
        let store = Arc::new(FakeStore::default());
        store.enabled.store(true, Ordering::SeqCst);
        store.log_age_secs.store(900, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine::default());

        let config = SupervisorConfig {
            hang_threshold: Some(Duration::from_secs(600)),
            ..test_config()
        };
        let mut supervisor = Supervisor::new(Arc::new(store.clone()), engine.clone(), config);

        // Stale logs: the same tick that starts the engine sees the
        // staleness and force-restarts it
        supervisor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);

        // Once the engine logs again the watchdog goes quiet
        store.log_age_secs.store(5, Ordering::SeqCst);
        supervisor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);

        supervisor.stop_engine().await;
    }

    /// Engine whose run fails immediately (e.g. no working proxies)
    struct CrashingEngine;

    #[async_trait]
    impl Engine for CrashingEngine {
        fn script_name(&self) -> &'static str {
            "reddit_scraper"
        }

        fn log_source(&self) -> &'static str {
            "reddit_scraper"
        }

        async fn run(self: Arc<Self>, _stop: StopFlag) -> EngineResult {
            Err("cannot start scraper: no active proxies configured".into())
        }
    }

    #[tokio::test]
    async fn failed_engine_surfaces_on_the_control_row() {
        let store = Arc::new(FakeStore::default());
        store.enabled.store(true, Ordering::SeqCst);
        store.log_age_secs.store(-1, Ordering::SeqCst);

        let mut supervisor =
            Supervisor::new(Arc::new(store.clone()), Arc::new(CrashingEngine), test_config());

        supervisor.tick().await; // start; engine fails immediately
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.tick().await; // reap the failed task

        let errors = store.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no active proxies"));
    }

    #[tokio::test]
    async fn shutdown_writes_terminal_row() {
        let store = Arc::new(FakeStore::default());
        store.enabled.store(true, Ordering::SeqCst);
        store.log_age_secs.store(-1, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine::default());

        let supervisor = Supervisor::new(Arc::new(store.clone()), engine, test_config());
        let shutdown = StopFlag::new();
        let shutdown_clone = shutdown.clone();

        let handle = tokio::spawn(supervisor.run(shutdown_clone));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.stop();
        handle.await.unwrap();

        assert!(store.stopped.load(Ordering::SeqCst));
    }
}
