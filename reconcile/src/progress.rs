//! Progress events for reconciliation runs

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::coordinator::RunStage;
use crate::diff::OperationKind;
use crate::identity::IdentityKey;
use crate::record::LocalId;

/// Progress event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// Run acquired its domain lock and started fetching
    RunStarted { run_id: Uuid, domain: String },
    /// Run moved to a new stage
    StageChanged { run_id: Uuid, stage: RunStage },
    /// A transient fetch failure will be retried after `delay`
    FetchRetry {
        run_id: Uuid,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Operation written to the store
    OperationApplied {
        run_id: Uuid,
        index: usize,
        kind: OperationKind,
        key: IdentityKey,
        id: LocalId,
    },
    /// Operation rejected by the store
    OperationFailed {
        run_id: Uuid,
        index: usize,
        kind: OperationKind,
        key: IdentityKey,
        error: String,
    },
    /// Run finished with a report
    RunCompleted {
        run_id: Uuid,
        created: usize,
        updated: usize,
        deleted: usize,
        unchanged: usize,
        failed: usize,
    },
    /// Preview finished planning; nothing was written
    PreviewCompleted {
        run_id: Uuid,
        creates: usize,
        updates: usize,
        deletes: usize,
        unchanged: usize,
    },
    /// Run aborted before applying anything
    RunAborted { run_id: Uuid, error: String },
}

/// Progress channel for receiving progress updates
pub struct ProgressChannel {
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressChannel {
    /// Create a new progress channel
    pub fn new() -> (ProgressReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ProgressReporter { sender }, Self { receiver })
    }

    /// Receive the next progress event
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Receive an event without waiting
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything currently queued
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Progress reporter for sending progress updates
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressReporter {
    /// Send an event. A closed channel only means nobody is listening.
    pub fn send(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Progress receiver dropped, event discarded");
        }
    }
}
