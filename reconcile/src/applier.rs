//! Applies planned operations to the local store

use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::diff::Operation;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::record::LocalId;
use crate::store::LocalStore;

/// Result of applying one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    /// Store confirmed the write for this record
    Applied(LocalId),
    /// Store rejected the write
    Failed(String),
}

impl OperationResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, OperationResult::Applied(_))
    }
}

/// Dispatch policy for a batch
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Operations in flight at once
    pub concurrency: usize,
    /// Stop dispatching after the first failure
    pub abort_on_first_failure: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            abort_on_first_failure: false,
        }
    }
}

/// Results of a batch, aligned with the operation list
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// `None` for operations that were never attempted
    pub results: Vec<Option<OperationResult>>,
    /// Dispatch stopped because the run was cancelled
    pub cancelled: bool,
}

impl ApplyOutcome {
    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.is_none()).count()
    }

    /// Attempted operations with their results, in operation order
    pub fn attempted<'a>(
        &'a self,
        operations: &'a [Operation],
    ) -> impl Iterator<Item = (&'a Operation, &'a OperationResult)> + 'a {
        operations
            .iter()
            .zip(self.results.iter())
            .filter_map(|(operation, result)| result.as_ref().map(|r| (operation, r)))
    }
}

/// Executes operations one record at a time.
///
/// There is no batch transaction: each store call stands on its own and a
/// failure never prevents later operations from being attempted.
pub struct Applier<'a, S: LocalStore + ?Sized> {
    store: &'a S,
    progress: Option<(&'a ProgressReporter, Uuid)>,
}

impl<'a, S: LocalStore + ?Sized> Applier<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store, progress: None }
    }

    pub fn with_progress(mut self, reporter: &'a ProgressReporter, run_id: Uuid) -> Self {
        self.progress = Some((reporter, run_id));
        self
    }

    /// Apply a single operation
    pub async fn apply(&self, operation: &Operation) -> OperationResult {
        let outcome = match operation {
            Operation::Create { natural_key, record, .. } => {
                self.store.create(&Operation::new_record(natural_key, record)).await
            }
            Operation::Update { id, changes, content_hash, .. } => {
                self.store.update(*id, changes, content_hash).await
            }
            Operation::Delete { id, .. } => self.store.delete(*id).await,
        };

        match outcome {
            Ok(id) => OperationResult::Applied(id),
            Err(e) => OperationResult::Failed(e.to_string()),
        }
    }

    /// Apply a whole plan.
    ///
    /// Up to `options.concurrency` operations run at once. Creates and
    /// updates all complete before the first delete is dispatched.
    /// Cancellation and abort-on-failure are checked before each operation
    /// starts; calls already in flight are allowed to finish. Results come
    /// back in operation order regardless of completion order.
    pub async fn apply_all(
        &self,
        operations: &[Operation],
        options: ApplyOptions,
        cancel: &CancellationToken,
    ) -> ApplyOutcome {
        let halted = AtomicBool::new(false);
        let mut results: Vec<Option<OperationResult>> = vec![None; operations.len()];

        let split = operations
            .iter()
            .position(|operation| matches!(operation, Operation::Delete { .. }))
            .unwrap_or(operations.len());
        let (writes, deletes) = operations.split_at(split);
        let (write_results, delete_results) = results.split_at_mut(split);

        self.dispatch(writes, 0, options, &halted, cancel, write_results).await;
        self.dispatch(deletes, split, options, &halted, cancel, delete_results).await;

        let cancelled = cancel.is_cancelled() && results.iter().any(Option::is_none);
        ApplyOutcome { results, cancelled }
    }

    /// Run one phase of the plan to completion
    async fn dispatch(
        &self,
        operations: &[Operation],
        offset: usize,
        options: ApplyOptions,
        halted: &AtomicBool,
        cancel: &CancellationToken,
        results: &mut [Option<OperationResult>],
    ) {
        let abort_on_failure = options.abort_on_first_failure;
        let mut completions = stream::iter(operations.iter().enumerate())
            .map(move |(index, operation)| async move {
                if cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
                    return (index, None);
                }
                let result = self.apply(operation).await;
                if abort_on_failure && !result.is_applied() {
                    halted.store(true, Ordering::SeqCst);
                }
                (index, Some(result))
            })
            .buffer_unordered(options.concurrency.max(1));

        while let Some((index, result)) = completions.next().await {
            if let Some(result) = &result {
                self.record(offset + index, &operations[index], result);
            }
            results[index] = result;
        }
    }

    fn record(&self, index: usize, operation: &Operation, result: &OperationResult) {
        match result {
            OperationResult::Applied(id) => {
                debug!(index, kind = %operation.kind(), key = %operation.key(), id = %id, "Applied operation");
                if let Some((reporter, run_id)) = self.progress {
                    reporter.send(ProgressEvent::OperationApplied {
                        run_id,
                        index,
                        kind: operation.kind(),
                        key: operation.key().clone(),
                        id: *id,
                    });
                }
            }
            OperationResult::Failed(reason) => {
                warn!(index, kind = %operation.kind(), key = %operation.key(), reason = %reason, "Operation failed");
                if let Some((reporter, run_id)) = self.progress {
                    reporter.send(ProgressEvent::OperationFailed {
                        run_id,
                        index,
                        kind: operation.kind(),
                        key: operation.key().clone(),
                        error: reason.clone(),
                    });
                }
            }
        }
    }
}
