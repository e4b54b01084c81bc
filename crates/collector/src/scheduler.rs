//! Collection scheduler
//!
//! A cron job fires ticks. Each tick loads every source, runs one task per
//! source type and walks that type's sources one after another, so sources
//! sharing a rate-limit bucket never race each other while different types
//! make progress in parallel. Ticks never overlap.
//!
//! Every source run ends with exactly one outcome written back to the store
//! and the source's status back at `idle`.

use crate::fetcher::{build_fetcher, FetchBatch, FetcherDeps};
use chrono::Utc;
use futures::future::join_all;
use newsloom_common::config::{parse_cron, AppConfig};
use newsloom_common::db::models::{ScheduleEntry, Source, SourceStatus};
use newsloom_common::errors::{AppError, Result};
use newsloom_common::metrics::{record_tick, record_upserts, set_tick_running, SourceRunMetrics};
use newsloom_common::{Repository, WriteTx};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a [`Scheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Knobs the scheduler reads from the application config
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub cron_expr: String,
    pub source_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cron_expr: config.schedule.cron_expr.clone(),
            source_timeout: config.source_timeout(),
        }
    }
}

/// How one source run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutcome {
    Succeeded { articles: usize, comments: usize },
    Failed,
    /// Aborted by `stop`; nothing recorded against the source
    Cancelled,
    /// Never started because the scheduler was stopping
    Skipped,
}

/// Per-tick tally, mostly for logs and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub sources: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub articles: usize,
    pub comments: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: SourceOutcome) {
        self.sources += 1;
        match outcome {
            SourceOutcome::Succeeded { articles, comments } => {
                self.succeeded += 1;
                self.articles += articles;
                self.comments += comments;
            }
            SourceOutcome::Failed => self.failed += 1,
            SourceOutcome::Cancelled => self.cancelled += 1,
            SourceOutcome::Skipped => self.skipped += 1,
        }
    }
}

struct Inner {
    repo: Repository,
    deps: FetcherDeps,
    settings: SchedulerSettings,
    cancel: CancellationToken,
    tracker: TaskTracker,
    tick_running: Mutex<bool>,
    state: Mutex<SchedulerState>,
    /// Also serialises start/stop
    cron: tokio::sync::Mutex<Option<JobScheduler>>,
}

/// Cheap to clone; all clones drive the same scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Holds the single-flight flag for the lifetime of one tick
struct TickGuard {
    inner: Arc<Inner>,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        *lock(&self.inner.tick_running) = false;
        set_tick_running(false);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn scheduler_error(context: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Scheduler {
        message: format!("{context}: {err}"),
    }
}

/// The cron job wants a seconds field; standard five-field expressions fire at :00
fn job_expression(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

impl Scheduler {
    pub fn new(repo: Repository, deps: FetcherDeps, settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                deps,
                settings,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                tick_running: Mutex::new(false),
                state: Mutex::new(SchedulerState::Created),
                cron: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.inner.state)
    }

    /// True while a tick holds the single-flight flag
    pub fn is_running(&self) -> bool {
        *lock(&self.inner.tick_running)
    }

    /// Register the cron job and begin firing ticks
    ///
    /// Sources left `running` by a crash are reset to `idle` first.
    pub async fn start(&self) -> Result<()> {
        let mut cron = self.inner.cron.lock().await;
        if self.state() != SchedulerState::Created {
            return Err(AppError::Scheduler {
                message: format!("cannot start scheduler in state {:?}", self.state()),
            });
        }

        let expr = self.inner.settings.cron_expr.clone();
        parse_cron(&expr)?;

        let reset = self.inner.repo.reset_running_sources().await?;
        if reset > 0 {
            warn!(count = reset, "Reset sources left running by a previous process");
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| scheduler_error("failed to create cron scheduler", e))?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job = Job::new_async(job_expression(&expr).as_str(), move |_id, _lock| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Scheduler { inner }.on_cron_fire();
                }
            })
        })
        .map_err(|e| scheduler_error("failed to create cron job", e))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| scheduler_error("failed to add cron job", e))?;
        scheduler
            .start()
            .await
            .map_err(|e| scheduler_error("failed to start cron scheduler", e))?;

        *cron = Some(scheduler);
        *lock(&self.inner.state) = SchedulerState::Started;
        info!(cron_expr = %expr, "Scheduler started");
        Ok(())
    }

    /// Stop cron firings, cancel in-flight fetches and wait for ticks to drain
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut cron = self.inner.cron.lock().await;
        {
            let mut state = lock(&self.inner.state);
            match *state {
                SchedulerState::Stopping | SchedulerState::Stopped => return Ok(()),
                SchedulerState::Created | SchedulerState::Started => {
                    *state = SchedulerState::Stopping;
                }
            }
        }
        info!(timeout_secs = timeout.as_secs(), "Stopping scheduler");

        if let Some(mut scheduler) = cron.take() {
            if let Err(e) = scheduler.shutdown().await {
                warn!(error = %e, "Cron scheduler shutdown failed");
            }
        }

        self.inner.cancel.cancel();
        self.inner.tracker.close();
        let drained = tokio::time::timeout(timeout, self.inner.tracker.wait()).await;
        *lock(&self.inner.state) = SchedulerState::Stopped;

        match drained {
            Ok(()) => {
                info!("Scheduler stopped");
                Ok(())
            }
            Err(_) => Err(AppError::Scheduler {
                message: format!(
                    "in-flight work did not finish within {}s",
                    timeout.as_secs()
                ),
            }),
        }
    }

    /// Fire a tick now, out of band; returns once it is spawned
    pub fn run_now(&self) -> Result<()> {
        if matches!(self.state(), SchedulerState::Stopping | SchedulerState::Stopped) {
            return Err(AppError::Scheduler {
                message: "scheduler is stopped".to_string(),
            });
        }
        let guard = self.try_acquire()?;
        record_tick("manual");
        self.spawn_tick(guard);
        Ok(())
    }

    /// Next firing of the global schedule after the latest recorded run
    pub async fn get_schedule(&self) -> Result<ScheduleEntry> {
        let cron = parse_cron(&self.inner.settings.cron_expr)?;
        let last_run_at = self.inner.repo.last_run_at_max().await?;
        let from = last_run_at.unwrap_or_else(Utc::now);
        let next_run = cron
            .find_next_occurrence(&from, false)
            .map_err(|e| scheduler_error("failed to compute next run", e))?;
        Ok(ScheduleEntry::global(next_run, last_run_at))
    }

    /// Run one tick to completion on the caller's task
    pub async fn run_tick(&self) -> Result<TickSummary> {
        let guard = self.try_acquire()?;
        record_tick("manual");
        self.execute_tick(guard).await
    }

    fn try_acquire(&self) -> Result<TickGuard> {
        let mut running = lock(&self.inner.tick_running);
        if *running {
            return Err(AppError::SchedulerOverlap);
        }
        *running = true;
        set_tick_running(true);
        Ok(TickGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    fn on_cron_fire(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        match self.try_acquire() {
            Ok(guard) => {
                record_tick("cron");
                self.spawn_tick(guard);
            }
            Err(_) => {
                record_tick("skipped");
                info!("Previous tick still running, skipping this firing");
            }
        }
    }

    fn spawn_tick(&self, guard: TickGuard) {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            if let Err(e) = this.execute_tick(guard).await {
                error!(error = %e, "Tick failed");
            }
        });
    }

    #[instrument(skip_all)]
    async fn execute_tick(&self, _guard: TickGuard) -> Result<TickSummary> {
        let sources = self.inner.repo.list_all_sources().await?;
        let groups = group_by_type(sources);
        info!(types = groups.len(), "Tick started");

        let handles: Vec<_> = groups
            .into_iter()
            .map(|(source_type, sources)| {
                let this = self.clone();
                let task_type = source_type.clone();
                let handle = self
                    .inner
                    .tracker
                    .spawn(async move { this.run_type(&task_type, sources).await });
                (source_type, handle)
            })
            .collect();

        let (types, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        let mut summary = TickSummary::default();
        for (source_type, result) in types.iter().zip(results) {
            match result {
                Ok(outcomes) => outcomes.into_iter().for_each(|o| summary.record(o)),
                Err(e) => error!(source_type = %source_type, error = %e, "Source type task panicked"),
            }
        }

        info!(
            sources = summary.sources,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            articles = summary.articles,
            comments = summary.comments,
            "Tick complete"
        );
        Ok(summary)
    }

    async fn run_type(&self, source_type: &str, sources: Vec<Source>) -> Vec<SourceOutcome> {
        debug!(source_type, count = sources.len(), "Running source type");
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            if self.inner.cancel.is_cancelled() {
                outcomes.push(SourceOutcome::Skipped);
                continue;
            }
            outcomes.push(self.run_source(&source).await);
        }
        outcomes
    }

    #[instrument(skip_all, fields(source_id = %source.id, source_type = %source.source_type))]
    async fn run_source(&self, source: &Source) -> SourceOutcome {
        let repo = &self.inner.repo;
        let run_metrics = SourceRunMetrics::start(&source.source_type);

        if let Err(e) = repo.update_source_status(source.id, SourceStatus::Running).await {
            error!(error = %e, "Failed to mark source running");
            run_metrics.finish("error");
            return SourceOutcome::Failed;
        }

        let cancel = self.inner.cancel.child_token();
        let result = self.fetch_and_store(source, &cancel).await;
        let now = Utc::now();

        let outcome = match result {
            Ok((articles, comments)) => {
                if let Err(e) = repo.record_success(source.id, now).await {
                    error!(error = %e, "Failed to record source success");
                }
                record_upserts(&source.source_type, articles, comments);
                info!(articles, comments, "Source run succeeded");
                run_metrics.finish("success");
                SourceOutcome::Succeeded { articles, comments }
            }
            Err(e) if e.is_cancelled() && self.inner.cancel.is_cancelled() => {
                info!("Source run cancelled by shutdown");
                run_metrics.finish("cancelled");
                SourceOutcome::Cancelled
            }
            Err(e) => {
                warn!(error = %e, code = e.code().as_code(), "Source run failed");
                if let Err(store_err) = repo.record_error(source.id, now, &e.to_string()).await {
                    error!(error = %store_err, "Failed to record source error");
                }
                run_metrics.finish("error");
                SourceOutcome::Failed
            }
        };

        if let Err(e) = repo.update_source_status(source.id, SourceStatus::Idle).await {
            error!(error = %e, "Failed to return source to idle");
        }
        outcome
    }

    async fn fetch_and_store(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize)> {
        let fetcher = build_fetcher(source, &self.inner.deps)?;
        let timeout = self.inner.settings.source_timeout;

        let batch = match tokio::time::timeout(timeout, fetcher.fetch(cancel, source.since())).await {
            Ok(result) => result?,
            Err(_) => {
                cancel.cancel();
                return Err(AppError::Timeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        self.persist(&batch).await
    }

    /// All-or-nothing write of one batch
    async fn persist(&self, batch: &FetchBatch) -> Result<(usize, usize)> {
        let mut tx = self.inner.repo.begin_write().await?;
        match upsert_batch(&mut tx, batch).await {
            Ok(counts) => {
                tx.commit().await?;
                Ok(counts)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn upsert_batch(tx: &mut WriteTx, batch: &FetchBatch) -> Result<(usize, usize)> {
    let articles = tx.upsert_articles(&batch.articles).await?;
    let comments = tx.upsert_comments(&batch.comments).await?;
    Ok((articles, comments))
}

/// Group by type string, keeping first-seen type order and source order
fn group_by_type(sources: Vec<Source>) -> Vec<(String, Vec<Source>)> {
    let mut groups: Vec<(String, Vec<Source>)> = Vec::new();
    for source in sources {
        match groups.iter_mut().find(|(t, _)| *t == source.source_type) {
            Some((_, group)) => group.push(source),
            None => groups.push((source.source_type.clone(), vec![source])),
        }
    }
    groups
}
