//! Reconciliation reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::applier::OperationResult;
use crate::diff::{Operation, OperationKind};
use crate::identity::IdentityKey;

/// One record that could not be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    pub key: IdentityKey,
    /// Operation that failed
    pub stage: OperationKind,
    pub reason: String,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub domain: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Local-only records kept because deletes are disabled
    #[serde(default)]
    pub retained: usize,
    /// Operations never attempted (cancellation or abort on first failure)
    #[serde(default)]
    pub skipped: usize,
    #[serde(default)]
    pub cancelled: bool,
    /// Failures in operation order
    pub failures: Vec<FailureDescriptor>,
}

impl ReconciliationReport {
    /// Nothing failed and nothing was left out
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && !self.cancelled
    }

    /// Records written in this run
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {} created, {} updated, {} deleted, {} unchanged, {} failed",
            self.domain, self.created, self.updated, self.deleted, self.unchanged, self.failed
        );
        if self.retained > 0 {
            line.push_str(&format!(", {} retained", self.retained));
        }
        if self.skipped > 0 {
            line.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        line
    }

    /// Emit the report as a structured log event
    pub fn log(&self) {
        if self.is_clean() {
            info!(
                run_id = %self.run_id,
                domain = %self.domain,
                created = self.created,
                updated = self.updated,
                deleted = self.deleted,
                unchanged = self.unchanged,
                "Reconciliation completed"
            );
        } else {
            warn!(
                run_id = %self.run_id,
                domain = %self.domain,
                created = self.created,
                updated = self.updated,
                deleted = self.deleted,
                unchanged = self.unchanged,
                failed = self.failed,
                skipped = self.skipped,
                cancelled = self.cancelled,
                "Reconciliation completed with problems"
            );
            for failure in &self.failures {
                warn!(
                    run_id = %self.run_id,
                    key = %failure.key,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    "Record failed to reconcile"
                );
            }
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Folds operation outcomes into a report
#[derive(Debug, Clone)]
pub struct Reporter {
    run_id: Uuid,
    domain: String,
    started_at: DateTime<Utc>,
}

impl Reporter {
    pub fn new(run_id: Uuid, domain: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            domain: domain.into(),
            started_at,
        }
    }

    /// Aggregate outcomes, given in operation order.
    ///
    /// Kind counters only count applied operations; failures are counted
    /// once in `failed` and described in `failures`. `unchanged` comes
    /// straight from the plan.
    pub fn summarize<'a, I>(&self, outcomes: I, unchanged: usize) -> ReconciliationReport
    where
        I: IntoIterator<Item = (&'a Operation, &'a OperationResult)>,
    {
        let mut report = ReconciliationReport {
            run_id: self.run_id,
            domain: self.domain.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged,
            failed: 0,
            retained: 0,
            skipped: 0,
            cancelled: false,
            failures: Vec::new(),
        };

        for (operation, result) in outcomes {
            match result {
                OperationResult::Applied(_) => match operation.kind() {
                    OperationKind::Create => report.created += 1,
                    OperationKind::Update => report.updated += 1,
                    OperationKind::Delete => report.deleted += 1,
                },
                OperationResult::Failed(reason) => {
                    report.failed += 1;
                    report.failures.push(FailureDescriptor {
                        key: operation.key().clone(),
                        stage: operation.kind(),
                        reason: reason.clone(),
                    });
                }
            }
        }

        report
    }
}
