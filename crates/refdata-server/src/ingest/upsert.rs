//! Upsert engine
//!
//! Applies validated batches to the record store. Each batch commits in a
//! single transaction: every record is inserted when its LEI is unseen,
//! otherwise only changed fields are updated, and one audit entry is written
//! per effective change. Replaying a batch is a no-op because unchanged
//! records produce neither a write nor an audit entry.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::models::{AuditAction, AuditEntry, BatchOutcome, LeiRecord};
use super::store::{IngestStore, StoreError};

/// What applying one incoming record to the store amounts to
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    Create { changed: Value },
    Update { previous: Value, changed: Value },
    Unchanged,
    /// Incoming record is older than the stored one
    Stale,
}

impl RecordChange {
    /// Audit entry for an effective change, `None` for no-ops
    pub fn audit_entry(&self, lei: &str, snapshot_id: Uuid) -> Option<AuditEntry> {
        let (action, previous, changed) = match self {
            RecordChange::Create { changed } => (AuditAction::Create, None, changed.clone()),
            RecordChange::Update { previous, changed } => {
                (AuditAction::Update, Some(previous.clone()), changed.clone())
            },
            RecordChange::Unchanged | RecordChange::Stale => return None,
        };

        Some(AuditEntry {
            id: Uuid::new_v4(),
            lei: lei.to_string(),
            snapshot_id,
            action,
            previous,
            changed,
            created_at: Utc::now(),
        })
    }

    /// Count this change into a batch outcome
    pub fn tally(&self, outcome: &mut BatchOutcome) {
        match self {
            RecordChange::Create { .. } => outcome.created += 1,
            RecordChange::Update { .. } => outcome.updated += 1,
            RecordChange::Unchanged => outcome.unchanged += 1,
            RecordChange::Stale => outcome.stale += 1,
        }
    }
}

/// Decide how `incoming` changes the stored state
///
/// Store implementations call this inside their batch transaction with the
/// row they just read, so the decision and the write see the same state.
pub fn plan_change(
    existing: Option<&LeiRecord>,
    incoming: &LeiRecord,
) -> Result<RecordChange, serde_json::Error> {
    let Some(existing) = existing else {
        return Ok(RecordChange::Create {
            changed: serde_json::to_value(incoming)?,
        });
    };

    if incoming.last_update < existing.last_update {
        return Ok(RecordChange::Stale);
    }

    let before = field_map(existing)?;
    let after = field_map(incoming)?;

    let mut previous = Map::new();
    let mut changed = Map::new();
    for (field, value) in after {
        let old = before.get(&field).cloned().unwrap_or(Value::Null);
        if old != value {
            previous.insert(field.clone(), old);
            changed.insert(field, value);
        }
    }

    if changed.is_empty() {
        Ok(RecordChange::Unchanged)
    } else {
        Ok(RecordChange::Update {
            previous: Value::Object(previous),
            changed: Value::Object(changed),
        })
    }
}

fn field_map(record: &LeiRecord) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// Batch applier in front of the store
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn IngestStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    /// Apply `batch` atomically: either every record lands or none does
    pub async fn apply(
        &self,
        snapshot_id: Uuid,
        batch: &[LeiRecord],
    ) -> Result<BatchOutcome, StoreError> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let started = Instant::now();
        let outcome = self.store.apply_batch(snapshot_id, batch).await?;

        debug!(
            snapshot_id = %snapshot_id,
            records = batch.len(),
            created = outcome.created,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            stale = outcome.stale,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch committed"
        );

        Ok(outcome)
    }
}
