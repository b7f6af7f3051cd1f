use std::collections::HashSet;

use dhc_core::{EqualFn, Event, LabelId, ReconciliationOutcome};
use dhc_storage::{EventStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

/// A write failed mid-batch. `outcome` counts the work committed before it.
#[derive(Debug, Error)]
#[error("reconciliation aborted (inserted {}, updated {}, unchanged {}): {source}", .outcome.inserted, .outcome.updated, .outcome.unchanged)]
pub struct ReconcileError {
    pub outcome: ReconciliationOutcome,
    #[source]
    pub source: StoreError,
}

/// Make the stored events of `label` match `events`.
///
/// Every event is looked up by natural key first. Unknown events are inserted
/// together in one write after the scan; known events whose mutable fields
/// differ under `equal` are updated right away, one write each. Lookup
/// failures skip the single event. Write failures abort the batch.
pub async fn reconcile(
    store: &dyn EventStore,
    events: &[Event],
    label: LabelId,
    equal: &EqualFn<'_>,
) -> Result<ReconciliationOutcome, ReconcileError> {
    let mut outcome = ReconciliationOutcome::default();
    let mut seen = HashSet::with_capacity(events.len());
    let mut staged = Vec::new();

    for event in events {
        let mut event = event.clone();
        // the label argument wins over whatever the canonicalizer filled in
        event.label_id = label;
        let key = event.natural_key();
        if !seen.insert(key.clone()) {
            debug!(%key, "natural key repeated within the batch");
            outcome.skipped += 1;
            continue;
        }

        let existing = match store.find_event(&key).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(%key, error = %err, "event lookup failed; skipping");
                outcome.skipped += 1;
                continue;
            }
        };
        match existing {
            None => staged.push(event),
            Some(existing) if equal(&existing, &event) => outcome.unchanged += 1,
            Some(_) => match store.update_event(&event).await {
                Ok(0) => {
                    warn!(%key, "update matched no row");
                    outcome.skipped += 1;
                }
                Ok(_) => outcome.updated += 1,
                Err(source) => return Err(ReconcileError { outcome, source }),
            },
        }
    }

    if !staged.is_empty() {
        let written = match store.insert_events(&staged).await {
            Ok(written) => written,
            Err(source) => return Err(ReconcileError { outcome, source }),
        };
        if written < staged.len() {
            // another writer stored some of these keys since the lookup
            warn!(%label, staged = staged.len(), written, "some staged inserts already existed");
        }
        outcome.inserted = written;
        outcome.skipped += staged.len().saturating_sub(written);
    }
    Ok(outcome)
}
