//! Coordinator that runs Fetch → Diff → Apply → Report for one domain

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::applier::{Applier, ApplyOptions};
use crate::config::ReconcileConfig;
use crate::diff::{Differ, ReconcilePlan};
use crate::domain::ReconcileDomain;
use crate::error::{FetchError, ReconcileError, Result};
use crate::lock::DomainLocks;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::record::{ExternalRecord, LocalRecord};
use crate::report::{ReconciliationReport, Reporter};
use crate::store::{ExternalSource, LocalStore};

/// Stages of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Fetching,
    Diffing,
    Applying,
    Reporting,
    Done,
    Aborted,
}

impl RunStage {
    /// Whether `next` directly follows this stage
    pub fn can_advance_to(self, next: RunStage) -> bool {
        use RunStage::*;
        matches!(
            (self, next),
            (Fetching, Diffing)
                | (Diffing, Applying)
                | (Applying, Reporting)
                | (Reporting, Done)
                | (Fetching, Aborted)
                | (Diffing, Aborted)
        )
    }

    pub fn advance(&mut self, next: RunStage) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(ReconcileError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStage::Done | RunStage::Aborted)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Fetching => "fetching",
            RunStage::Diffing => "diffing",
            RunStage::Applying => "applying",
            RunStage::Reporting => "reporting",
            RunStage::Done => "done",
            RunStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// State owned by a single run
struct RunContext {
    run_id: Uuid,
    domain: String,
    stage: RunStage,
    started_at: DateTime<Utc>,
    progress: Option<ProgressReporter>,
}

impl RunContext {
    fn start(domain: &str, progress: Option<ProgressReporter>) -> Self {
        let run = Self {
            run_id: Uuid::new_v4(),
            domain: domain.to_string(),
            stage: RunStage::Fetching,
            started_at: Utc::now(),
            progress,
        };
        run.emit(ProgressEvent::RunStarted {
            run_id: run.run_id,
            domain: run.domain.clone(),
        });
        run.emit(ProgressEvent::StageChanged {
            run_id: run.run_id,
            stage: RunStage::Fetching,
        });
        run
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(reporter) = &self.progress {
            reporter.send(event);
        }
    }

    fn enter(&mut self, stage: RunStage) -> Result<()> {
        self.stage.advance(stage)?;
        info!(stage = %stage, "Entering stage");
        self.emit(ProgressEvent::StageChanged {
            run_id: self.run_id,
            stage,
        });
        Ok(())
    }

    /// Move to `Aborted` and hand the error back
    fn abort(&mut self, err: ReconcileError) -> ReconcileError {
        if let Err(transition) = self.stage.advance(RunStage::Aborted) {
            warn!(error = %transition, "Aborting from unexpected stage");
            self.stage = RunStage::Aborted;
        }
        error!(error = %err, "Reconciliation aborted");
        self.emit(ProgressEvent::StageChanged {
            run_id: self.run_id,
            stage: RunStage::Aborted,
        });
        self.emit(ProgressEvent::RunAborted {
            run_id: self.run_id,
            error: err.to_string(),
        });
        err
    }
}

/// Runs reconciliation for any domain, one run per domain at a time
pub struct Coordinator {
    config: ReconcileConfig,
    locks: Arc<DomainLocks>,
    progress: Option<ProgressReporter>,
}

impl Coordinator {
    /// Create a coordinator with its own lock registry
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            locks: Arc::new(DomainLocks::new()),
            progress: None,
        })
    }

    /// Share a lock registry with other coordinators
    pub fn with_locks(mut self, locks: Arc<DomainLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<DomainLocks> {
        &self.locks
    }

    /// Run one full reconciliation for `domain`.
    ///
    /// Returns `Err` only when the run aborts before applying anything:
    /// lock contention, fetch or load failure, structural diff errors, or
    /// cancellation while fetching. Once operations are being applied the
    /// run always ends with a report, failed records included.
    pub async fn reconcile<D, E, S>(
        &self,
        domain: &D,
        source: &E,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationReport>
    where
        D: ReconcileDomain + ?Sized,
        E: ExternalSource + ?Sized,
        S: LocalStore + ?Sized,
    {
        let _guard = self
            .locks
            .try_acquire(domain.name())
            .ok_or_else(|| ReconcileError::AlreadyRunning {
                domain: domain.name().to_string(),
            })?;

        let mut run = RunContext::start(domain.name(), self.progress.clone());
        let span = info_span!("reconcile", run_id = %run.run_id, domain = %domain.name());

        async move {
            info!("Starting reconciliation");
            let plan = self.fetch_and_diff(&mut run, domain, source, store, cancel).await?;

            run.enter(RunStage::Applying)?;
            let mut applier = Applier::new(store);
            if let Some(reporter) = &self.progress {
                applier = applier.with_progress(reporter, run.run_id);
            }
            let options = ApplyOptions {
                concurrency: self.config.apply_concurrency,
                abort_on_first_failure: self.config.abort_on_first_apply_failure,
            };
            let outcome = applier.apply_all(&plan.operations, options, cancel).await;

            run.enter(RunStage::Reporting)?;
            let mut report = Reporter::new(run.run_id, run.domain.clone(), run.started_at)
                .summarize(outcome.attempted(&plan.operations), plan.summary.unchanged);
            report.retained = plan.summary.retained;
            report.skipped = outcome.skipped();
            report.cancelled = outcome.cancelled;
            report.log();
            run.emit(ProgressEvent::RunCompleted {
                run_id: run.run_id,
                created: report.created,
                updated: report.updated,
                deleted: report.deleted,
                unchanged: report.unchanged,
                failed: report.failed,
            });

            run.enter(RunStage::Done)?;
            Ok::<_, ReconcileError>(report)
        }
        .instrument(span)
        .await
    }

    /// Fetch and diff without touching the store
    pub async fn preview<D, E, S>(
        &self,
        domain: &D,
        source: &E,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<ReconcilePlan>
    where
        D: ReconcileDomain + ?Sized,
        E: ExternalSource + ?Sized,
        S: LocalStore + ?Sized,
    {
        let mut run = RunContext::start(domain.name(), self.progress.clone());
        let span = info_span!("preview", run_id = %run.run_id, domain = %domain.name());
        let plan = self
            .fetch_and_diff(&mut run, domain, source, store, cancel)
            .instrument(span)
            .await?;

        run.emit(ProgressEvent::PreviewCompleted {
            run_id: run.run_id,
            creates: plan.summary.creates,
            updates: plan.summary.updates,
            deletes: plan.summary.deletes,
            unchanged: plan.summary.unchanged,
        });
        Ok(plan)
    }

    async fn fetch_and_diff<D, E, S>(
        &self,
        run: &mut RunContext,
        domain: &D,
        source: &E,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<ReconcilePlan>
    where
        D: ReconcileDomain + ?Sized,
        E: ExternalSource + ?Sized,
        S: LocalStore + ?Sized,
    {
        let (external, local) = match self.fetch_snapshots(run, source, store, cancel).await {
            Ok(snapshots) => snapshots,
            Err(err) => return Err(run.abort(err)),
        };
        info!(external = external.len(), local = local.len(), "Fetched snapshots");

        run.enter(RunStage::Diffing)?;
        let plan = Differ::new(domain)
            .allow_deletes(self.config.allow_deletes)
            .diff(&external, &local)
            .map_err(|err| run.abort(err))?;

        info!(
            creates = plan.summary.creates,
            updates = plan.summary.updates,
            deletes = plan.summary.deletes,
            unchanged = plan.summary.unchanged,
            retained = plan.summary.retained,
            "Generated reconciliation plan"
        );
        Ok(plan)
    }

    /// External snapshot first, then the local one; both cancellable
    async fn fetch_snapshots<E, S>(
        &self,
        run: &RunContext,
        source: &E,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<(Vec<ExternalRecord>, Vec<LocalRecord>)>
    where
        E: ExternalSource + ?Sized,
        S: LocalStore + ?Sized,
    {
        let external = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            result = self.fetch_with_retry(run, source) => result?,
        };

        let local = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            result = store.load() => result.map_err(ReconcileError::Load)?,
        };

        Ok((external, local))
    }

    /// Fetch with a per-call timeout, retrying transient failures with
    /// exponential backoff up to `max_retries` times
    async fn fetch_with_retry<E>(&self, run: &RunContext, source: &E) -> Result<Vec<ExternalRecord>>
    where
        E: ExternalSource + ?Sized,
    {
        let max_retries = self.config.max_retries;
        let timeout = self.config.fetch_timeout();
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.backoff_base())
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(self.config.max_backoff())
            .with_max_elapsed_time(None)
            .build();

        let operation = move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let result = match tokio::time::timeout(timeout, source.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::transient(format!(
                    "fetch timed out after {}ms",
                    timeout.as_millis()
                ))),
            };

            match result {
                Ok(records) => Ok(records),
                Err(err) if err.is_retryable() && attempt <= max_retries => {
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        };

        let notify = |err: FetchError, delay: Duration| {
            let attempt = attempts_ref.load(Ordering::SeqCst);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient fetch failure, retrying"
            );
            run.emit(ProgressEvent::FetchRetry {
                run_id: run.run_id,
                attempt,
                delay,
                error: err.message,
            });
        };

        match backoff::future::retry_notify(policy, operation, notify).await {
            Ok(records) => Ok(records),
            Err(err) if err.is_retryable() => Err(ReconcileError::FetchExhausted {
                attempts: attempts.load(Ordering::SeqCst),
                last_error: err,
            }),
            Err(err) => Err(ReconcileError::Fetch(err)),
        }
    }
}
