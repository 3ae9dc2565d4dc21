//! Background garbage-collection task framework.
//!
//! A [`Gc`] owns a set of named [`Task`]s.  Each interval task gets its own
//! timer loop; manual tasks only run through [`Gc::run`].  Every task carries
//! an execution guard so at most one run of it is in flight: a trigger that
//! fires while the previous run is still going is dropped and counted as
//! skipped.  Runners execute on their own tokio task, so a failing, panicking
//! or timed-out runner is recorded against its task and nothing else.

pub mod runners;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics::{GcLabels, GcOutcome, MetricsRegistry};
use crate::shutdown::{ShutdownSignal, ShutdownTrigger};

/// One reclamation pass.  Implementations should be idempotent.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run_gc(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Interval(Duration),
    /// Runs only when triggered through [`Gc::run`] or [`Gc::run_all`].
    Manual,
}

pub struct Task {
    pub id: String,
    pub runner: Arc<dyn Runner>,
    pub schedule: Schedule,
    /// Runs exceeding this are aborted and counted as failures.
    pub timeout: Option<Duration>,
}

impl Task {
    pub fn interval(id: impl Into<String>, every: Duration, runner: Arc<dyn Runner>) -> Self {
        Self {
            id: id.into(),
            runner,
            schedule: Schedule::Interval(every),
            timeout: None,
        }
    }

    pub fn manual(id: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        Self {
            id: id.into(),
            runner,
            schedule: Schedule::Manual,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GcError {
    #[error("duplicate gc task name: {0}")]
    DuplicateTask(String),
    #[error("unknown gc task: {0}")]
    UnknownTask(String),
    #[error("gc task {0} has a zero interval")]
    InvalidSchedule(String),
    #[error("gc is stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Completed runs, successful or not.
    pub runs: u64,
    pub failures: u64,
    /// Triggers dropped because a run was already in flight.
    pub skipped: u64,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct TaskEntry {
    task: Task,
    running: AtomicBool,
    runs: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        Self {
            task,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> TaskStats {
        TaskStats {
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Holds a task's execution guard; released on drop, including when the
/// owning future is cancelled.
struct RunGuard(Arc<TaskEntry>);

impl RunGuard {
    fn acquire(entry: &Arc<TaskEntry>) -> Option<Self> {
        entry
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(entry)))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

struct GcInner {
    tasks: RwLock<BTreeMap<String, Arc<TaskEntry>>>,
    serving: AtomicBool,
    shutdown: ShutdownTrigger,
    loops: Mutex<Vec<JoinHandle<()>>>,
    metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Gc
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to the task set.
#[derive(Clone)]
pub struct Gc {
    inner: Arc<GcInner>,
}

impl Gc {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            inner: Arc::new(GcInner {
                tasks: RwLock::new(BTreeMap::new()),
                serving: AtomicBool::new(false),
                shutdown: ShutdownTrigger::new(),
                loops: Mutex::new(Vec::new()),
                metrics,
            }),
        }
    }

    /// Register a task.  Tasks added after [`Gc::serve`] start immediately.
    pub fn add(&self, task: Task) -> Result<(), GcError> {
        if self.inner.shutdown.is_triggered() {
            return Err(GcError::Stopped);
        }
        if task.schedule == Schedule::Interval(Duration::ZERO) {
            return Err(GcError::InvalidSchedule(task.id));
        }
        // The write lock is held across the `serving` check so a concurrent
        // serve() either sees this entry or leaves its loop to us.
        let mut tasks = self.inner.tasks.write().map_err(|_| GcError::Stopped)?;
        if tasks.contains_key(&task.id) {
            return Err(GcError::DuplicateTask(task.id));
        }
        let entry = Arc::new(TaskEntry::new(task));
        tasks.insert(entry.task.id.clone(), Arc::clone(&entry));
        debug!(task = %entry.task.id, schedule = ?entry.task.schedule, "gc task registered");

        if self.inner.serving.load(Ordering::Acquire) {
            self.spawn_loop(entry);
        }
        Ok(())
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.task.id.clone()).collect()
    }

    pub fn stats(&self, id: &str) -> Option<TaskStats> {
        self.entry(id).map(|e| e.stats())
    }

    /// Start a timer loop per interval task.  Returns immediately; calling
    /// it again is a no-op.
    pub fn serve(&self) {
        if self.inner.shutdown.is_triggered() {
            return;
        }
        let Ok(tasks) = self.inner.tasks.read() else {
            return;
        };
        if self.inner.serving.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(tasks = tasks.len(), "gc started");
        for entry in tasks.values() {
            self.spawn_loop(Arc::clone(entry));
        }
    }

    /// Trigger one task now and wait for the run.  Returns `false` when the
    /// trigger was skipped because the task is already running.
    pub async fn run(&self, id: &str) -> Result<bool, GcError> {
        if self.inner.shutdown.is_triggered() {
            return Err(GcError::Stopped);
        }
        let entry = self
            .entry(id)
            .ok_or_else(|| GcError::UnknownTask(id.to_string()))?;
        match self.trigger(&entry) {
            Some(run) => {
                let _ = run.await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Trigger every task concurrently and wait for all of them.
    pub async fn run_all(&self) -> Result<BTreeMap<String, bool>, GcError> {
        if self.inner.shutdown.is_triggered() {
            return Err(GcError::Stopped);
        }
        let started: Vec<(String, Option<JoinHandle<()>>)> = self
            .entries()
            .into_iter()
            .map(|entry| (entry.task.id.clone(), self.trigger(&entry)))
            .collect();

        let mut ran = BTreeMap::new();
        for (id, run) in started {
            let triggered = run.is_some();
            if let Some(run) = run {
                let _ = run.await;
            }
            ran.insert(id, triggered);
        }
        Ok(ran)
    }

    /// Ask every loop to exit once its current run finishes.  Idempotent and
    /// non-blocking; in-flight runners are never interrupted.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_triggered() {
            info!("gc stopping");
        }
        self.inner.shutdown.trigger();
    }

    /// Wait for every task loop (and its last run) to finish.
    pub async fn wait(&self) {
        let loops = match self.inner.loops.lock() {
            Ok(mut loops) => std::mem::take(&mut *loops),
            Err(_) => return,
        };
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "gc task loop ended abnormally");
            }
        }
    }

    fn entries(&self) -> Vec<Arc<TaskEntry>> {
        self.inner
            .tasks
            .read()
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    fn entry(&self, id: &str) -> Option<Arc<TaskEntry>> {
        self.inner
            .tasks
            .read()
            .ok()
            .and_then(|tasks| tasks.get(id).cloned())
    }

    fn spawn_loop(&self, entry: Arc<TaskEntry>) {
        let Schedule::Interval(every) = entry.task.schedule else {
            return;
        };
        let gc = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move { gc.task_loop(entry, every, shutdown).await });
        if let Ok(mut loops) = self.inner.loops.lock() {
            loops.push(handle);
        }
    }

    async fn task_loop(self, entry: Arc<TaskEntry>, every: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                () = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Some(run) = self.trigger(&entry) {
                        in_flight = Some(run);
                    }
                }
            }
        }

        if let Some(run) = in_flight {
            let _ = run.await;
        }
        debug!(task = %entry.task.id, "gc task loop exited");
    }

    /// Start a run if the task is idle; otherwise record a skip.
    fn trigger(&self, entry: &Arc<TaskEntry>) -> Option<JoinHandle<()>> {
        let Some(guard) = RunGuard::acquire(entry) else {
            entry.skipped.fetch_add(1, Ordering::Relaxed);
            self.record(&entry.task.id, GcOutcome::Skipped);
            debug!(task = %entry.task.id, "gc run still in progress; trigger skipped");
            return None;
        };
        let gc = self.clone();
        Some(tokio::spawn(async move { gc.execute(guard).await }))
    }

    async fn execute(&self, guard: RunGuard) {
        let entry = &guard.0;
        let id = &entry.task.id;
        let started = Instant::now();

        let runner = Arc::clone(&entry.task.runner);
        let mut run = tokio::spawn(async move { runner.run_gc().await });
        let result = match entry.task.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut run).await {
                Ok(joined) => joined,
                Err(_) => {
                    run.abort();
                    Ok(Err(anyhow!("timed out after {limit:?}")))
                }
            },
            None => run.await,
        };
        let result = match result {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow!("runner panicked")),
            Err(e) => Err(anyhow!("runner cancelled: {e}")),
        };

        entry.runs.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.record(id, GcOutcome::Success);
                debug!(task = %id, elapsed = ?started.elapsed(), "gc run finished");
            }
            Err(e) => {
                entry.failures.fetch_add(1, Ordering::Relaxed);
                self.record(id, GcOutcome::Failure);
                error!(task = %id, error = %format!("{e:#}"), "gc run failed");
            }
        }
    }

    fn record(&self, task: &str, outcome: GcOutcome) {
        self.inner
            .metrics
            .metrics
            .gc_runs
            .get_or_create(&GcLabels {
                task: task.to_string(),
                outcome,
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Sleeps for `work`, tracking concurrency.
    #[derive(Default)]
    struct SlowRunner {
        work: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
        completed: AtomicUsize,
    }

    impl SlowRunner {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Runner for SlowRunner {
        async fn run_gc(&self) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl Runner for FailingRunner {
        async fn run_gc(&self) -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl Runner for PanickingRunner {
        async fn run_gc(&self) -> anyhow::Result<()> {
            panic!("corrupt record")
        }
    }

    #[tokio::test]
    async fn duplicate_task_name_is_rejected() {
        let gc = Gc::new(MetricsRegistry::new());
        let runner = SlowRunner::new(Duration::ZERO);
        gc.add(Task::manual("peers", runner.clone())).unwrap();

        let err = gc.add(Task::manual("peers", runner)).unwrap_err();
        assert_eq!(err, GcError::DuplicateTask("peers".into()));
        assert_eq!(gc.task_ids(), vec!["peers".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_never_overlap() {
        let gc = Gc::new(MetricsRegistry::new());
        let runner = SlowRunner::new(Duration::from_millis(250));
        gc.add(Task::interval("slow", Duration::from_millis(100), runner.clone()))
            .unwrap();

        gc.serve();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        gc.stop();
        gc.wait().await;

        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        let stats = gc.stats("slow").unwrap();
        assert!(stats.skipped > 0, "{stats:?}");
        assert!(stats.runs >= 3, "{stats:?}");
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_does_not_affect_others() {
        let gc = Gc::new(MetricsRegistry::new());
        let healthy = SlowRunner::new(Duration::ZERO);
        gc.add(Task::interval("broken", Duration::from_millis(100), Arc::new(FailingRunner)))
            .unwrap();
        gc.add(Task::interval("panics", Duration::from_millis(100), Arc::new(PanickingRunner)))
            .unwrap();
        gc.add(Task::interval("healthy", Duration::from_millis(100), healthy.clone()))
            .unwrap();

        gc.serve();
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        gc.stop();
        gc.wait().await;

        let broken = gc.stats("broken").unwrap();
        assert!(broken.runs >= 9 && broken.failures == broken.runs, "{broken:?}");
        let panics = gc.stats("panics").unwrap();
        assert!(panics.runs >= 9 && panics.failures == panics.runs, "{panics:?}");
        assert!(healthy.completed.load(Ordering::SeqCst) >= 9);
        assert_eq!(gc.stats("healthy").unwrap().failures, 0);
    }

    #[tokio::test]
    async fn manual_run_and_unknown_task() {
        let gc = Gc::new(MetricsRegistry::new());
        let runner = SlowRunner::new(Duration::ZERO);
        gc.add(Task::manual("on-demand", runner.clone())).unwrap();
        gc.serve();

        assert!(gc.run("on-demand").await.unwrap());
        assert_eq!(runner.completed.load(Ordering::SeqCst), 1);
        assert_eq!(
            gc.run("missing").await.unwrap_err(),
            GcError::UnknownTask("missing".into())
        );

        let ran = gc.run_all().await.unwrap();
        assert_eq!(ran.get("on-demand"), Some(&true));
        assert_eq!(gc.stats("on-demand").unwrap().runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_during_run_is_skipped() {
        let gc = Gc::new(MetricsRegistry::new());
        let runner = SlowRunner::new(Duration::from_secs(5));
        gc.add(Task::manual("slow", runner.clone())).unwrap();

        let first = tokio::spawn({
            let gc = gc.clone();
            async move { gc.run("slow").await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!gc.run("slow").await.unwrap());
        assert!(first.await.unwrap().unwrap());
        assert_eq!(gc.stats("slow").unwrap().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let gc = Gc::new(MetricsRegistry::new());
        let runner = SlowRunner::new(Duration::from_secs(60));
        gc.add(Task::manual("stuck", runner.clone()).with_timeout(Some(Duration::from_secs(1))))
            .unwrap();

        assert!(gc.run("stuck").await.unwrap());
        let stats = gc.stats("stuck").unwrap();
        assert_eq!((stats.runs, stats.failures), (1, 1));
        assert_eq!(runner.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_current_run_finish() {
        let gc = Gc::new(MetricsRegistry::new());
        let runner = SlowRunner::new(Duration::from_secs(5));
        gc.add(Task::interval("slow", Duration::from_secs(1), runner.clone()))
            .unwrap();
        gc.serve();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        gc.stop();
        gc.stop();
        gc.wait().await;

        assert_eq!(runner.completed.load(Ordering::SeqCst), 1);
        assert_eq!(gc.run("slow").await.unwrap_err(), GcError::Stopped);
        assert_eq!(
            gc.add(Task::manual("late", runner)).unwrap_err(),
            GcError::Stopped
        );
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let gc = Gc::new(MetricsRegistry::new());
        let runner = SlowRunner::new(Duration::ZERO);

        let err = gc
            .add(Task::interval("spin", Duration::ZERO, runner))
            .unwrap_err();
        assert_eq!(err, GcError::InvalidSchedule("spin".into()));
        assert!(gc.task_ids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn add_racing_serve_spawns_one_loop() {
        for round in 0..50 {
            let gc = Gc::new(MetricsRegistry::new());
            let runner = SlowRunner::new(Duration::ZERO);

            let serve = tokio::spawn({
                let gc = gc.clone();
                async move { gc.serve() }
            });
            let add = tokio::spawn({
                let gc = gc.clone();
                async move { gc.add(Task::interval("hourly", Duration::from_secs(3600), runner)) }
            });
            serve.await.unwrap();
            add.await.unwrap().unwrap();

            assert_eq!(gc.inner.loops.lock().unwrap().len(), 1, "round {round}");
            gc.stop();
            gc.wait().await;
        }
    }

    #[tokio::test]
    async fn stop_without_serve_is_harmless() {
        let gc = Gc::new(MetricsRegistry::new());
        gc.stop();
        gc.wait().await;
        gc.serve();
        assert!(gc.task_ids().is_empty());
    }
}
