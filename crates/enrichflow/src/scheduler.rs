//! Named tasks on cron triggers.
//!
//! A [`Scheduler`] owns one registry entry per enrichment kind. Each enabled
//! entry has a trigger task that sleeps until the next fire time and then
//! spawns an execution. Executions go through the [`ExecutionLock`], so a tick
//! that overlaps a still-running one (here or on another instance) is skipped.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;

use crate::batch::{BatchJob, BatchStats, ProgressStats};
use crate::enrich::EnrichmentKind;
use crate::lock::ExecutionLock;

pub const DEFAULT_SCHEDULE: &str = "*/1 * * * *";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub enabled: bool,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub schedule: String,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            enabled: false,
            running: false,
            last_run_at: None,
            next_run_at: None,
            schedule: DEFAULT_SCHEDULE.to_string(),
        }
    }
}

/// How to register one task.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: EnrichmentKind,
    pub schedule: String,
    pub batch_size: i64,
    pub auto_start: bool,
    pub job: Arc<dyn BatchJob>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(BatchStats),
    Failed(String),
    /// The lock was held elsewhere; nothing ran.
    Skipped,
}

/// Parse a 5-field (minute-first) or 6/7-field (second-first) cron expression.
pub fn parse_schedule(expr: &str) -> anyhow::Result<Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("invalid cron schedule {expr:?}: {e}"))
}

struct Entry {
    status: TaskStatus,
    trigger: Option<JoinHandle<()>>,
    schedule: Schedule,
    batch_size: i64,
    job: Arc<dyn BatchJob>,
}

#[derive(Default)]
struct Registry {
    initialized: bool,
    entries: BTreeMap<EnrichmentKind, Entry>,
}

struct Inner {
    lock: Arc<dyn ExecutionLock>,
    specs: Vec<TaskSpec>,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(lock: Arc<dyn ExecutionLock>, specs: Vec<TaskSpec>) -> Self {
        Self {
            inner: Arc::new(Inner {
                lock,
                specs,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Register every task and arm the auto-started ones. Runs once; later
    /// calls return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(&self) -> anyhow::Result<()> {
        let mut reg = self.inner.registry();
        if reg.initialized {
            return Ok(());
        }

        let mut parsed = Vec::with_capacity(self.inner.specs.len());
        for spec in &self.inner.specs {
            parsed.push((spec, parse_schedule(&spec.schedule)?));
        }

        for (spec, schedule) in parsed {
            let mut entry = Entry {
                status: TaskStatus {
                    schedule: spec.schedule.clone(),
                    ..TaskStatus::default()
                },
                trigger: None,
                schedule,
                batch_size: spec.batch_size,
                job: spec.job.clone(),
            };
            if spec.auto_start {
                self.arm(spec.name, &mut entry);
            }
            tracing::info!(
                task = spec.name.as_str(),
                schedule = %spec.schedule,
                batch_size = spec.batch_size,
                concurrency = spec.job.concurrency(),
                enabled = spec.auto_start,
                "task registered"
            );
            reg.entries.insert(spec.name, entry);
        }

        reg.initialized = true;
        Ok(())
    }

    fn arm(&self, name: EnrichmentKind, entry: &mut Entry) {
        entry.status.enabled = true;
        entry.status.next_run_at = entry.schedule.upcoming(Utc).next();
        entry.trigger = Some(tokio::spawn(trigger_loop(
            Arc::downgrade(&self.inner),
            name,
            entry.schedule.clone(),
        )));
    }

    /// `Ok(false)` when the task is not registered. Starting an enabled task is a no-op.
    pub fn start(&self, name: EnrichmentKind) -> anyhow::Result<bool> {
        self.initialize()?;

        let mut reg = self.inner.registry();
        let Some(entry) = reg.entries.get_mut(&name) else {
            tracing::warn!(task = name.as_str(), "task not registered, cannot start");
            return Ok(false);
        };

        if entry.status.enabled {
            tracing::info!(task = name.as_str(), "task already enabled");
            return Ok(true);
        }

        self.arm(name, entry);
        tracing::info!(task = name.as_str(), next_run_at = ?entry.status.next_run_at, "task started");
        Ok(true)
    }

    /// Disarm the trigger. An execution already in flight runs to completion.
    pub fn stop(&self, name: EnrichmentKind) -> anyhow::Result<bool> {
        self.initialize()?;

        let mut reg = self.inner.registry();
        let Some(entry) = reg.entries.get_mut(&name) else {
            tracing::warn!(task = name.as_str(), "task not registered, cannot stop");
            return Ok(false);
        };

        if let Some(trigger) = entry.trigger.take() {
            trigger.abort();
        }
        entry.status.enabled = false;
        entry.status.next_run_at = None;
        tracing::info!(task = name.as_str(), "task stopped");
        Ok(true)
    }

    pub fn get_status(&self, name: EnrichmentKind) -> TaskStatus {
        self.inner
            .registry()
            .entries
            .get(&name)
            .map(|e| e.status.clone())
            .unwrap_or_default()
    }

    pub fn get_all_status(&self) -> BTreeMap<EnrichmentKind, TaskStatus> {
        EnrichmentKind::ALL
            .into_iter()
            .map(|name| (name, self.get_status(name)))
            .collect()
    }

    /// One scheduled tick: a locked batch of the configured size.
    pub async fn run_tick(&self, name: EnrichmentKind) {
        let Some(batch_size) = self.batch_size(name) else {
            tracing::warn!(task = name.as_str(), "tick for unregistered task");
            return;
        };
        self.execute(name, batch_size).await;
    }

    /// A locked batch of `limit` items, outside the schedule.
    pub async fn run_now(&self, name: EnrichmentKind, limit: i64) -> anyhow::Result<RunOutcome> {
        self.initialize()?;
        if self.batch_size(name).is_none() {
            anyhow::bail!("task {name} is not registered");
        }
        Ok(self.execute(name, limit).await)
    }

    pub async fn progress(&self, name: EnrichmentKind) -> anyhow::Result<ProgressStats> {
        let job = self
            .inner
            .specs
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.job.clone())
            .ok_or_else(|| anyhow::anyhow!("task {name} is not registered"))?;
        job.progress().await
    }

    /// Abort every trigger. Executions in flight are left to finish.
    pub fn shutdown(&self) {
        let mut reg = self.inner.registry();
        for (name, entry) in reg.entries.iter_mut() {
            if let Some(trigger) = entry.trigger.take() {
                trigger.abort();
                tracing::info!(task = name.as_str(), "trigger stopped");
            }
            entry.status.next_run_at = None;
        }
    }

    fn batch_size(&self, name: EnrichmentKind) -> Option<i64> {
        self.inner.registry().entries.get(&name).map(|e| e.batch_size)
    }

    fn job(&self, name: EnrichmentKind) -> Option<Arc<dyn BatchJob>> {
        self.inner.registry().entries.get(&name).map(|e| e.job.clone())
    }

    async fn execute(&self, name: EnrichmentKind, limit: i64) -> RunOutcome {
        let Some(job) = self.job(name) else {
            return RunOutcome::Failed(format!("task {name} is not registered"));
        };

        let lock_name = name.lock_name();
        let mut result: Option<anyhow::Result<BatchStats>> = None;
        let slot = &mut result;
        let inner = &self.inner;

        let ran = self
            .inner
            .lock
            .run_exclusive(
                &lock_name,
                Box::pin(async move {
                    let _running = RunningGuard::enter(inner, name);
                    tracing::info!(
                        task = name.as_str(),
                        limit,
                        concurrency = job.concurrency(),
                        "batch started"
                    );

                    let res = job.run(limit).await;
                    match &res {
                        Ok(stats) => tracing::info!(
                            task = name.as_str(),
                            success = stats.success,
                            skipped = stats.skipped,
                            failed = stats.failed,
                            remaining = stats.remaining,
                            "batch finished"
                        ),
                        Err(e) => tracing::error!(task = name.as_str(), error = %e, "batch failed"),
                    }
                    *slot = Some(res);
                    Ok::<(), anyhow::Error>(())
                }),
            )
            .await;

        match result {
            Some(Ok(stats)) => RunOutcome::Completed(stats),
            Some(Err(e)) => RunOutcome::Failed(e.to_string()),
            None if ran => RunOutcome::Failed("batch did not report a result".to_string()),
            None => {
                tracing::info!(task = name.as_str(), "skipped, already running elsewhere");
                RunOutcome::Skipped
            }
        }
    }
}

/// Holds `running = true` for as long as it lives.
struct RunningGuard<'a> {
    inner: &'a Inner,
    name: EnrichmentKind,
}

impl<'a> RunningGuard<'a> {
    fn enter(inner: &'a Inner, name: EnrichmentKind) -> Self {
        if let Some(entry) = inner.registry().entries.get_mut(&name) {
            entry.status.running = true;
            entry.status.last_run_at = Some(Utc::now());
        }
        Self { inner, name }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.inner.registry().entries.get_mut(&self.name) {
            entry.status.running = false;
        }
    }
}

async fn trigger_loop(inner: Weak<Inner>, name: EnrichmentKind, schedule: Schedule) {
    let mut after = Utc::now();
    loop {
        let Some(next) = schedule.after(&after).next() else {
            tracing::warn!(task = name.as_str(), "schedule has no further fire times");
            return;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let scheduler = Scheduler { inner };

        after = next.max(Utc::now());
        if let Some(entry) = scheduler.inner.registry().entries.get_mut(&name) {
            entry.status.next_run_at = schedule.after(&after).next();
        }

        // Ticks do not wait for each other; overlap is settled by the lock.
        tokio::spawn(async move { scheduler.run_tick(name).await });
    }
}
