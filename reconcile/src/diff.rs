//! Diff algorithm for turning two snapshots into a reconciliation plan

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::ReconcileDomain;
use crate::error::{ReconcileError, Result, Side};
use crate::identity::{normalize, IdentityKey};
use crate::record::{content_hash, ExternalRecord, FieldMap, LocalId, LocalRecord, NewRecord};

/// Operations needed to converge the local store on the external snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Record exists only upstream
    Create {
        key: IdentityKey,
        /// Trimmed natural key as sent upstream
        natural_key: String,
        /// External record projected onto the local field layout
        record: ExternalRecord,
    },
    /// Record exists on both sides with different content
    Update {
        key: IdentityKey,
        id: LocalId,
        /// Only the fields that differ
        changes: FieldMap,
        /// Hash of the full projected record after the update
        content_hash: String,
    },
    /// Record exists only locally
    Delete { key: IdentityKey, id: LocalId },
}

/// Operation kinds, used for counting and failure descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Create { .. } => OperationKind::Create,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn key(&self) -> &IdentityKey {
        match self {
            Operation::Create { key, .. } | Operation::Update { key, .. } | Operation::Delete { key, .. } => key,
        }
    }

    /// Target record id; `None` for creates
    pub fn local_id(&self) -> Option<LocalId> {
        match self {
            Operation::Create { .. } => None,
            Operation::Update { id, .. } | Operation::Delete { id, .. } => Some(*id),
        }
    }

    /// Store payload for a create operation
    pub(crate) fn new_record(natural_key: &str, record: &ExternalRecord) -> NewRecord {
        NewRecord {
            natural_key: natural_key.to_string(),
            fields: record.fields.clone(),
            content_hash: content_hash(&record.fields),
        }
    }
}

/// A complete reconciliation plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilePlan {
    /// Operations in apply order: creates and updates first, deletes last
    pub operations: Vec<Operation>,
    /// Summary statistics
    pub summary: PlanSummary,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

/// Summary of a reconciliation plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total_operations: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    /// Matched pairs with equal content
    pub unchanged: usize,
    /// Local-only records kept because deletes are disabled
    pub retained: usize,
}

/// Computes the operations needed to converge two snapshots
pub struct Differ<'a, D: ReconcileDomain + ?Sized> {
    domain: &'a D,
    allow_deletes: bool,
}

impl<'a, D: ReconcileDomain + ?Sized> Differ<'a, D> {
    pub fn new(domain: &'a D) -> Self {
        Self {
            domain,
            allow_deletes: true,
        }
    }

    /// Keep local-only records instead of deleting them
    pub fn allow_deletes(mut self, allow: bool) -> Self {
        self.allow_deletes = allow;
        self
    }

    /// Diff an external snapshot against the local snapshot.
    ///
    /// Fails with `InvalidKey` for a record without a usable key and with
    /// `DuplicateKey` when two records of one snapshot share a key.
    pub fn diff(&self, external: &[ExternalRecord], local: &[LocalRecord]) -> Result<ReconcilePlan> {
        let mut local_map: HashMap<IdentityKey, &LocalRecord> = HashMap::with_capacity(local.len());
        for record in local {
            let key = normalize(&record.natural_key)?;
            if local_map.insert(key.clone(), record).is_some() {
                return Err(ReconcileError::duplicate_key(key.as_str(), Side::Local));
            }
        }

        let mut operations = Vec::new();
        let mut seen_external: HashSet<IdentityKey> = HashSet::with_capacity(external.len());
        let mut summary = PlanSummary::default();

        for record in external {
            let raw_key = self.domain.require_key(record)?;
            let key = normalize(raw_key)?;
            if !seen_external.insert(key.clone()) {
                return Err(ReconcileError::duplicate_key(key.as_str(), Side::External));
            }

            let projected = self.domain.project(record);

            match local_map.get(&key) {
                Some(local_record) => match self.changed_fields(&projected, local_record) {
                    Some(changes) => operations.push(Operation::Update {
                        key,
                        id: local_record.id,
                        changes,
                        content_hash: content_hash(&projected),
                    }),
                    None => summary.unchanged += 1,
                },
                None => operations.push(Operation::Create {
                    key,
                    natural_key: raw_key.trim().to_string(),
                    record: ExternalRecord::new(projected),
                }),
            }
        }

        // Deletes go last so nothing is removed before its replacement exists
        for record in local {
            let key = normalize(&record.natural_key)?;
            if seen_external.contains(&key) {
                continue;
            }
            if self.allow_deletes {
                operations.push(Operation::Delete { key, id: record.id });
            } else {
                summary.retained += 1;
            }
        }

        Self::fill_summary(&mut summary, &operations);
        tracing::debug!(
            domain = self.domain.name(),
            external = external.len(),
            local = local.len(),
            creates = summary.creates,
            updates = summary.updates,
            deletes = summary.deletes,
            unchanged = summary.unchanged,
            "Computed reconciliation plan"
        );

        Ok(ReconcilePlan { operations, summary })
    }

    /// Fields of `projected` that differ from the local snapshot, `None` when equal
    fn changed_fields(&self, projected: &FieldMap, local: &LocalRecord) -> Option<FieldMap> {
        if let Some(stored) = &local.content_hash {
            if *stored == content_hash(projected) {
                return None;
            }
        }

        let changes: FieldMap = projected
            .iter()
            .filter(|(field, value)| match local.fields.get(field.as_str()) {
                Some(existing) => !self.domain.fields_equal(field, value, existing),
                None => true,
            })
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();

        if changes.is_empty() {
            None
        } else {
            Some(changes)
        }
    }

    fn fill_summary(summary: &mut PlanSummary, operations: &[Operation]) {
        summary.total_operations = operations.len();
        for operation in operations {
            match operation.kind() {
                OperationKind::Create => summary.creates += 1,
                OperationKind::Update => summary.updates += 1,
                OperationKind::Delete => summary.deletes += 1,
            }
        }
    }
}
