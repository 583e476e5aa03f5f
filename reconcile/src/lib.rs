//! Reconciliation Engine Library
//!
//! Keeps a local store converged with an external system of record:
//! - Identity matching on normalized natural keys
//! - Diffing external and local snapshots into create/update/delete plans
//! - Applying plans record by record with bounded concurrency
//! - Retry with exponential backoff for transient fetch failures
//! - Per-domain run locks, cancellation and progress events
//! - Reports with per-record failure detail

pub mod identity;
pub mod record;
pub mod domain;
pub mod diff;
pub mod store;
pub mod applier;
pub mod report;
pub mod coordinator;
pub mod config;
pub mod progress;
pub mod lock;
pub mod error;

// Re-export main types and functions
pub use identity::{normalize, IdentityKey};
pub use record::{content_hash, ExternalRecord, FieldMap, LocalId, LocalRecord, NewRecord};
pub use domain::{FieldMappingDomain, ReconcileDomain};
pub use diff::{Differ, Operation, OperationKind, PlanSummary, ReconcilePlan};
pub use store::{ExternalSource, LocalStore, MemoryStore, StaticSource};
pub use applier::{Applier, ApplyOptions, ApplyOutcome, OperationResult};
pub use report::{FailureDescriptor, ReconciliationReport, Reporter};
pub use coordinator::{Coordinator, RunStage};
pub use config::ReconcileConfig;
pub use progress::{ProgressChannel, ProgressEvent, ProgressReporter};
pub use lock::{DomainGuard, DomainLocks};
pub use error::{FetchError, ReconcileError, Result, Side, StoreError};

pub use tokio_util::sync::CancellationToken;

/// Run a single reconciliation with a fresh coordinator
pub async fn reconcile<D, E, S>(
    domain: &D,
    source: &E,
    store: &S,
    config: ReconcileConfig,
) -> Result<ReconciliationReport>
where
    D: ReconcileDomain + ?Sized,
    E: ExternalSource + ?Sized,
    S: LocalStore + ?Sized,
{
    let coordinator = Coordinator::new(config)?;
    coordinator
        .reconcile(domain, source, store, &CancellationToken::new())
        .await
}

/// Compute the plan for two snapshots already in hand
pub fn plan<D>(domain: &D, external: &[ExternalRecord], local: &[LocalRecord]) -> Result<ReconcilePlan>
where
    D: ReconcileDomain + ?Sized,
{
    Differ::new(domain).diff(external, local)
}

// Test modules
#[cfg(test)]
mod test_support;
