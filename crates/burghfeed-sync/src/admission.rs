//! Whether a batch should be merged into the cumulative archive for the current period.
//!
//! The archive is judged from its row count for the period alone. A partially filled period is
//! re-inserted in full and flagged for an operator.

use std::time::Duration;

use burghfeed_core::{ArchiveDecision, ArchiveState, Period, TableKind, TableProfile, WriteMethod};
use burghfeed_storage::{bounded, Datastore, DatastoreError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
#[error("could not determine state of archive `{resource}`: {source}")]
pub struct AdmissionQueryError {
    pub resource: String,
    #[source]
    pub source: DatastoreError,
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveAdmissionPolicy {
    timeout: Duration,
}

impl ArchiveAdmissionPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// `existing` is the archive's row count for `period`, or `None` when the archive does not exist.
    pub fn decide(kind: TableKind, period: Period, existing: Option<u64>, batch_len: usize) -> ArchiveDecision {
        let batch_len = batch_len as u64;
        match existing {
            None => ArchiveDecision {
                should_archive: true,
                method: WriteMethod::Insert,
                state: ArchiveState::NoArchiveYet,
                reason: format!("no {kind} archive exists yet"),
                alert: None,
            },
            Some(existing) if existing >= batch_len => ArchiveDecision {
                should_archive: false,
                method: WriteMethod::Insert,
                state: ArchiveState::ExistsSufficient { existing },
                reason: format!(
                    "{kind} archive already holds {existing} rows for {period} (batch has {batch_len})"
                ),
                alert: None,
            },
            Some(0) => ArchiveDecision {
                should_archive: true,
                method: WriteMethod::Insert,
                state: ArchiveState::ExistsIncomplete { existing: 0 },
                reason: format!("{kind} archive has no rows for {period}"),
                alert: None,
            },
            Some(existing) => ArchiveDecision {
                should_archive: true,
                method: WriteMethod::Insert,
                state: ArchiveState::ExistsIncomplete { existing },
                reason: format!(
                    "{kind} archive holds {existing} of {batch_len} rows for {period}"
                ),
                alert: Some(format!(
                    "{kind} archive record count mismatch for {period}: {existing} rows archived, \
                     batch has {batch_len}; inserted the batch again, verify no duplicate or \
                     conflicting rows were archived"
                )),
            },
        }
    }

    /// Conservative outcome when the archive state is unknown: skip archiving and tell an operator.
    pub fn on_query_failure(kind: TableKind, period: Period, err: &AdmissionQueryError) -> ArchiveDecision {
        ArchiveDecision {
            should_archive: false,
            method: WriteMethod::Insert,
            state: ArchiveState::Unknown,
            reason: err.to_string(),
            alert: Some(format!(
                "{kind} batch for {period} was not archived because the archive state could not be read: {err}"
            )),
        }
    }

    pub async fn archive_count(
        &self,
        store: &dyn Datastore,
        profile: &TableProfile,
        period: Period,
    ) -> Result<Option<u64>, AdmissionQueryError> {
        let resource = &profile.archive_resource_name;
        let wrap = |source| AdmissionQueryError {
            resource: resource.clone(),
            source,
        };
        let Some(id) = bounded("find_resource", self.timeout, store.find_resource(resource))
            .await
            .map_err(wrap)?
        else {
            return Ok(None);
        };
        bounded(
            "query_period_count",
            self.timeout,
            store.query_period_count(&id, period),
        )
        .await
        .map(Some)
        .map_err(wrap)
    }

    /// Never fails: a query error becomes a "do not archive" decision carrying an alert.
    pub async fn evaluate(
        &self,
        store: &dyn Datastore,
        profile: &TableProfile,
        period: Period,
        batch_len: usize,
    ) -> ArchiveDecision {
        let kind = profile.kind;
        match self.archive_count(store, profile, period).await {
            Ok(existing) => {
                let decision = Self::decide(kind, period, existing, batch_len);
                info!(
                    table = %kind,
                    %period,
                    should_archive = decision.should_archive,
                    reason = %decision.reason,
                    "archive admission"
                );
                decision
            }
            Err(err) => {
                warn!(table = %kind, %period, error = %err, "archive admission query failed");
                Self::on_query_failure(kind, period, &err)
            }
        }
    }
}
