//! Change detection between consecutive validator snapshots.

use std::future::Future;

use tracing::instrument;

use crate::{
    Result,
    types::{
        change::DetectedChange,
        common::{ChangeId, NodeAddress, Timestamp, ValidatorId, now},
        validator::{ValidatorRecord, ValidatorSnapshot},
    },
};

/// A write of one validator's freshly observed state.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatorUpdate {
    /// The row being overwritten, or [`None`] to insert a new validator.
    pub existing: Option<ValidatorId>,
    pub snapshot: ValidatorSnapshot,
    /// Change records to append alongside the row write.
    pub changes: Vec<DetectedChange>,
    pub detected_at: Timestamp,
}

/// Persistent storage for tracked validators and their change records.
pub trait ValidatorPersistence: Clone + Send + Sync {
    /// The persisted record of the validator with the given node address, if it is tracked.
    fn validator(
        &self,
        node: &NodeAddress,
    ) -> impl Send + Future<Output = Result<Option<ValidatorRecord>>>;

    /// Number of subscriptions to a validator.
    fn subscriber_count(&self, validator: ValidatorId) -> impl Send + Future<Output = Result<usize>>;

    /// Write a validator row and its change records atomically.
    ///
    /// Either the row and every change record are persisted, or nothing is. Returns the row id and
    /// the ids of the new change records, in order.
    fn store_update(
        &self,
        update: ValidatorUpdate,
    ) -> impl Send + Future<Output = Result<(ValidatorId, Vec<ChangeId>)>>;
}

/// The tracked attributes of `snapshot` which differ from the persisted `previous` record.
///
/// Rates are compared exactly.
pub fn diff(previous: &ValidatorRecord, snapshot: &ValidatorSnapshot) -> Vec<DetectedChange> {
    let mut changes = vec![];
    if previous.state != snapshot.state {
        changes.push(DetectedChange::state(previous.state, snapshot.state));
    }
    if previous.commission.rate != snapshot.commission.rate {
        changes.push(DetectedChange::commission(
            previous.commission.rate,
            snapshot.commission.rate,
        ));
    }
    changes
}

/// What happened to one validator during a change cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackOutcome {
    /// First sighting: the validator is now tracked, with nothing to compare against.
    Inserted(ValidatorId),

    /// An existing row was refreshed, recording the listed changes.
    Updated {
        id: ValidatorId,
        changes: Vec<ChangeId>,
    },
}

/// Totals for one change cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackSummary {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    /// Ids of all change records created.
    pub changes: Vec<ChangeId>,
}

#[derive(Clone, Debug)]
pub struct ChangeTracker<S> {
    storage: S,
}

impl<S: ValidatorPersistence> ChangeTracker<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Compare one snapshot against storage and persist it.
    ///
    /// Changes are recorded only if the validator has at least one subscriber at the time of
    /// comparison. The row itself is always overwritten.
    #[instrument(skip(self, snapshot), fields(node_address = %snapshot.node_address))]
    pub async fn track_validator(
        &self,
        snapshot: &ValidatorSnapshot,
        detected_at: Timestamp,
    ) -> Result<TrackOutcome> {
        let Some(previous) = self.storage.validator(&snapshot.node_address).await? else {
            let (id, _) = self
                .storage
                .store_update(ValidatorUpdate {
                    existing: None,
                    snapshot: snapshot.clone(),
                    changes: vec![],
                    detected_at,
                })
                .await?;
            tracing::info!(id, validator_address = %snapshot.validator_address, "tracking new validator");
            return Ok(TrackOutcome::Inserted(id));
        };

        let mut changes = diff(&previous, snapshot);
        if !changes.is_empty() && self.storage.subscriber_count(previous.id).await? == 0 {
            tracing::debug!(id = previous.id, ?changes, "no subscribers, not recording changes");
            changes.clear();
        }
        for change in &changes {
            tracing::info!(
                id = previous.id,
                kind = %change.kind(),
                "{} -> {}",
                change.previous,
                change.new
            );
        }

        let (id, changes) = self
            .storage
            .store_update(ValidatorUpdate {
                existing: Some(previous.id),
                snapshot: snapshot.clone(),
                changes,
                detected_at,
            })
            .await?;
        Ok(TrackOutcome::Updated { id, changes })
    }

    /// Process every snapshot of a cycle.
    ///
    /// A failure for one validator is logged and counted; it leaves that validator's persisted
    /// state as it was and does not stop the others.
    #[instrument(skip_all, fields(validators = snapshots.len()))]
    pub async fn track(&self, snapshots: &[ValidatorSnapshot]) -> TrackSummary {
        let detected_at = now();
        let mut summary = TrackSummary::default();
        for snapshot in snapshots {
            match self.track_validator(snapshot, detected_at).await {
                Ok(TrackOutcome::Inserted(_)) => summary.inserted += 1,
                Ok(TrackOutcome::Updated { changes, .. }) => {
                    summary.updated += 1;
                    summary.changes.extend(changes);
                }
                Err(err) => {
                    tracing::error!(node_address = %snapshot.node_address, "failed to store validator: {err}");
                    summary.failed += 1;
                }
            }
        }
        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            failed = summary.failed,
            changes = summary.changes.len(),
            "change cycle complete"
        );
        summary
    }
}
