//! Cadence jobs: detect then recommend over `[checkpoint, now)`, advancing the
//! checkpoint only when both stages succeed.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures_util::future::join_all;
use kite_core::{Clock, SystemClock};
use kite_store::{EventWarehouse, InsightStore, StoreError};
use kite_types::{validate_tenant_id, Cadence, JobOutcome, JobRun, TenantRegistry, ValidationError};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::detectors::DetectorCatalog;
use crate::recommender::StrategyRecommender;

/// Failure of the job machinery itself; stage failures are recorded on the [`JobRun`].
#[derive(Debug, Error)]
pub enum SchedulerJobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to record {cadence} job run for tenant '{tenant_id}': {source}")]
    Record {
        tenant_id: String,
        cadence: Cadence,
        #[source]
        source: StoreError,
    },
}

struct StageFailure {
    outcome: JobOutcome,
    error: String,
}

impl StageFailure {
    fn failed(error: String) -> Self {
        Self {
            outcome: JobOutcome::Failed,
            error,
        }
    }

    fn partial(error: String) -> Self {
        Self {
            outcome: JobOutcome::Partial,
            error,
        }
    }
}

async fn within<T>(
    deadline: Instant,
    stage: &str,
    work: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, String> {
    match tokio::time::timeout_at(deadline, work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) if error.is_transient() => Err(format!("{stage}: transient: {error}")),
        Ok(Err(error)) => Err(format!("{stage}: {error}")),
        Err(_) => Err(format!("{stage}: deadline exceeded")),
    }
}

/// Runs insight jobs for any tenant and cadence.
pub struct InsightJobRunner {
    events: Arc<dyn EventWarehouse>,
    insights: Arc<dyn InsightStore>,
    detectors: DetectorCatalog,
    recommender: StrategyRecommender,
    clock: Arc<dyn Clock>,
    job_timeout: StdDuration,
}

impl InsightJobRunner {
    pub fn new(
        events: Arc<dyn EventWarehouse>,
        insights: Arc<dyn InsightStore>,
        detectors: DetectorCatalog,
        recommender: StrategyRecommender,
    ) -> Self {
        Self {
            events,
            insights,
            detectors,
            recommender,
            clock: Arc::new(SystemClock),
            job_timeout: SchedulerConfig::default().job_timeout(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: StdDuration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn run_job(
        &self,
        tenant_id: &str,
        cadence: Cadence,
        now: DateTime<Utc>,
    ) -> Result<JobRun, SchedulerJobError> {
        self.run_job_with_deadline(tenant_id, cadence, now, self.job_timeout)
            .await
    }

    /// One job run; always persists a [`JobRun`] describing the outcome.
    #[tracing::instrument(level = "debug", skip(self), fields(cadence = %cadence))]
    pub async fn run_job_with_deadline(
        &self,
        tenant_id: &str,
        cadence: Cadence,
        now: DateTime<Utc>,
        deadline: StdDuration,
    ) -> Result<JobRun, SchedulerJobError> {
        validate_tenant_id(tenant_id)?;
        let started_at = self.clock.now();
        let mut run = JobRun {
            run_id: kite_core::new_id("job"),
            tenant_id: tenant_id.to_string(),
            cadence,
            window_start: now - cadence.window_length(),
            window_end: now,
            started_at,
            finished_at: started_at,
            outcome: JobOutcome::Success,
            events_processed: 0,
            patterns_detected: 0,
            recommendations_created: 0,
            error: None,
        };

        if let Err(failure) = self.execute(&mut run, Instant::now() + deadline).await {
            run.outcome = failure.outcome;
            run.error = Some(failure.error);
        }
        run.finished_at = self.clock.now();

        match run.outcome {
            JobOutcome::Success => tracing::info!(
                tenant_id,
                cadence = %cadence,
                run_id = %run.run_id,
                events = run.events_processed,
                patterns = run.patterns_detected,
                recommendations = run.recommendations_created,
                "insight job completed"
            ),
            JobOutcome::Partial | JobOutcome::Failed => tracing::warn!(
                tenant_id,
                cadence = %cadence,
                run_id = %run.run_id,
                outcome = %run.outcome,
                error = run.error.as_deref().unwrap_or_default(),
                "insight job did not complete; checkpoint unchanged"
            ),
        }

        self.insights
            .record_job_run(run.clone())
            .await
            .map_err(|source| {
                tracing::error!(tenant_id, cadence = %cadence, error = %source, "job run not recorded");
                SchedulerJobError::Record {
                    tenant_id: tenant_id.to_string(),
                    cadence,
                    source,
                }
            })?;
        Ok(run)
    }

    async fn execute(&self, run: &mut JobRun, deadline: Instant) -> Result<(), StageFailure> {
        let tenant_id = run.tenant_id.clone();
        let checkpoint = within(
            deadline,
            "checkpoint",
            self.insights.checkpoint(&tenant_id, run.cadence),
        )
        .await
        .map_err(StageFailure::failed)?;
        if let Some(checkpoint) = checkpoint {
            run.window_start = checkpoint;
        }
        if run.window_start >= run.window_end {
            return Ok(());
        }

        let detection = within(
            deadline,
            "detect",
            self.detectors.run_window(
                self.events.as_ref(),
                self.insights.as_ref(),
                &tenant_id,
                run.window_start,
                run.window_end,
                run.window_end,
            ),
        )
        .await
        .map_err(StageFailure::failed)?;
        run.events_processed = detection.events_consumed as u64;
        run.patterns_detected = detection.patterns.len() as u64;

        let report = within(
            deadline,
            "recommend",
            self.recommender
                .recommend(self.insights.as_ref(), &tenant_id, run.window_end),
        )
        .await
        .map_err(StageFailure::partial)?;
        run.recommendations_created = report.created.len() as u64;

        let advanced = within(
            deadline,
            "checkpoint",
            self.insights
                .advance_checkpoint(&tenant_id, run.cadence, checkpoint, run.window_end),
        )
        .await
        .map_err(StageFailure::failed)?;
        if !advanced {
            tracing::warn!(
                tenant_id = %tenant_id,
                cadence = %run.cadence,
                "checkpoint moved by a concurrent run; leaving it in place"
            );
        }
        Ok(())
    }

    /// True when the cadence's next cron occurrence after its checkpoint has passed.
    pub async fn is_due(
        &self,
        schedules: &CadenceSchedules,
        tenant_id: &str,
        cadence: Cadence,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let checkpoint = self
            .insights
            .checkpoint(tenant_id, cadence)
            .await
            .with_context(|| format!("failed to read {cadence} checkpoint for '{tenant_id}'"))?;
        let from = checkpoint.unwrap_or_else(|| now - cadence.window_length());
        Ok(schedules.next_after(cadence, from)? <= now)
    }

    /// Runs every due `(tenant, cadence)` job concurrently.
    pub async fn run_due(
        &self,
        schedules: &CadenceSchedules,
        tenants: &[String],
        now: DateTime<Utc>,
    ) -> Vec<JobRun> {
        let mut due = Vec::new();
        for tenant_id in tenants {
            for cadence in Cadence::ALL {
                match self.is_due(schedules, tenant_id, *cadence, now).await {
                    Ok(true) => due.push((tenant_id.as_str(), *cadence)),
                    Ok(false) => {}
                    Err(error) => tracing::warn!(
                        tenant_id = %tenant_id,
                        cadence = %cadence,
                        error = %error,
                        "skipping due check"
                    ),
                }
            }
        }

        join_all(
            due.into_iter()
                .map(|(tenant_id, cadence)| self.run_job(tenant_id, cadence, now)),
        )
        .await
        .into_iter()
        .filter_map(|result| match result {
            Ok(run) => Some(run),
            Err(error) => {
                tracing::error!(error = %error, "insight job aborted");
                None
            }
        })
        .collect()
    }
}

/// Compiled cron schedules for the three cadences in one timezone.
#[derive(Debug, Clone)]
pub struct CadenceSchedules {
    timezone: Tz,
    hourly: Schedule,
    daily: Schedule,
    weekly: Schedule,
}

impl CadenceSchedules {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let timezone: Tz = config
            .timezone
            .parse()
            .map_err(|error| anyhow!("invalid timezone '{}': {error}", config.timezone))?;
        let parse = |cadence: Cadence| {
            let expression = config.cron_for(cadence);
            Schedule::from_str(expression)
                .with_context(|| format!("invalid {cadence} cron expression '{expression}'"))
        };
        Ok(Self {
            timezone,
            hourly: parse(Cadence::Hourly)?,
            daily: parse(Cadence::Daily)?,
            weekly: parse(Cadence::Weekly)?,
        })
    }

    fn schedule(&self, cadence: Cadence) -> &Schedule {
        match cadence {
            Cadence::Hourly => &self.hourly,
            Cadence::Daily => &self.daily,
            Cadence::Weekly => &self.weekly,
        }
    }

    pub fn next_after(&self, cadence: Cadence, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let from = from.with_timezone(&self.timezone);
        self.schedule(cadence)
            .after(&from)
            .next()
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| anyhow!("{cadence} schedule has no future occurrence"))
    }
}

/// Handle owning the background scheduler task.
#[derive(Debug)]
pub struct InsightSchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    tenants_at_start: usize,
}

impl InsightSchedulerHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Configured tenants when the loop started.
    pub fn tenants_at_start(&self) -> usize {
        self.tenants_at_start
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub fn start_insight_scheduler(
    runner: Arc<InsightJobRunner>,
    tenants: Arc<TenantRegistry>,
    config: &SchedulerConfig,
) -> Result<InsightSchedulerHandle> {
    let schedules = CadenceSchedules::from_config(config)?;
    let tick = config.tick();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let tenants_at_start = tenants.configured_tenants().len();
    if tenants_at_start == 0 {
        tracing::warn!(
            "no [tenants.<id>] tables configured; scheduled insight jobs run only for tenants added later"
        );
    }
    tracing::info!(
        tick_seconds = tick.as_secs(),
        timezone = %config.timezone,
        tenants = tenants_at_start,
        "insight scheduler started"
    );
    let task = tokio::spawn(async move {
        run_scheduler_loop(runner, tenants, schedules, tick, shutdown_rx).await;
    });
    Ok(InsightSchedulerHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        tenants_at_start,
    })
}

async fn run_scheduler_loop(
    runner: Arc<InsightJobRunner>,
    tenants: Arc<TenantRegistry>,
    schedules: CadenceSchedules,
    tick: StdDuration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = runner.clock().now();
                let runs = runner
                    .run_due(&schedules, &tenants.configured_tenants(), now)
                    .await;
                if !runs.is_empty() {
                    tracing::debug!(jobs = runs.len(), "scheduler tick finished");
                }
            }
            _ = &mut shutdown_rx => {
                tracing::info!("insight scheduler stopped");
                break;
            }
        }
    }
}
