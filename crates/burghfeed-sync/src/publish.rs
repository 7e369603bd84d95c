//! Pushes normalized batches to the datastore.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use burghfeed_core::{CanonicalRecord, RecordSchema, WireField, WriteMethod};
use burghfeed_storage::{bounded, Datastore, DatastoreError, ResourceId, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPhase {
    Prepare,
    Write,
    Reload,
}

impl fmt::Display for PublishPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishPhase::Prepare => f.write_str("preparing"),
            PublishPhase::Write => f.write_str("writing"),
            PublishPhase::Reload => f.write_str("clearing and reloading"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("upsert into `{resource}` needs at least one key field")]
    MissingKeyFields { resource: String },
    #[error("{phase} `{resource}` failed: {source}")]
    Transmission {
        resource: String,
        phase: PublishPhase,
        #[source]
        source: DatastoreError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub resource: String,
    pub resource_id: ResourceId,
    pub method: WriteMethod,
    pub rows: usize,
    /// Rows dropped because a later row in the batch had the same key.
    pub duplicates_dropped: usize,
    pub replaced: bool,
}

/// Rows, columns and keys computed once so every transmission of a batch sends the same shape.
struct WirePlan {
    rows: Vec<Row>,
    fields: Vec<WireField>,
    keys: Vec<String>,
    duplicates_dropped: usize,
}

impl WirePlan {
    fn new(batch: &[CanonicalRecord], schema: &RecordSchema, key_fields: &[String]) -> Self {
        let keys = schema.publish_keys(key_fields);
        let rows = batch.iter().map(|r| r.to_wire_row(schema)).collect::<Vec<_>>();
        let total = rows.len();
        let rows = collapse_duplicate_keys(rows, &keys);
        Self {
            duplicates_dropped: total - rows.len(),
            rows,
            fields: schema.wire_fields(),
            keys,
        }
    }
}

/// Keeps one row per key: the last one seen, at the position of the first. No-op without keys.
fn collapse_duplicate_keys(rows: Vec<Row>, keys: &[String]) -> Vec<Row> {
    if keys.is_empty() {
        return rows;
    }
    let mut slots: BTreeMap<String, usize> = BTreeMap::new();
    let mut kept: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = keys
            .iter()
            .map(|k| row.get(k).map(ToString::to_string).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        match slots.get(&key) {
            Some(&slot) => kept[slot] = row,
            None => {
                slots.insert(key, kept.len());
                kept.push(row);
            }
        }
    }
    kept
}

pub struct Publisher<'a> {
    store: &'a dyn Datastore,
    timeout: Duration,
}

impl<'a> Publisher<'a> {
    pub fn new(store: &'a dyn Datastore, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Insert permits empty `key_fields`; upsert does not.
    pub async fn publish(
        &self,
        batch: &[CanonicalRecord],
        schema: &RecordSchema,
        resource: &str,
        method: WriteMethod,
        key_fields: &[String],
    ) -> Result<PublishOutcome, PublishError> {
        let plan = self.plan(batch, schema, resource, method, key_fields)?;
        let resource_id = self.transmit(&plan, resource, method).await?;
        Ok(PublishOutcome {
            resource: resource.to_string(),
            resource_id,
            method,
            rows: plan.rows.len(),
            duplicates_dropped: plan.duplicates_dropped,
            replaced: false,
        })
    }

    /// Leaves `resource` holding exactly `batch`.
    ///
    /// The datastore can only clear a resource that exists, so this is an ordinary write followed
    /// by a clear-and-reload with the same rows and columns. A failure in either step leaves the
    /// resource partially updated and is returned as is.
    pub async fn replace(
        &self,
        batch: &[CanonicalRecord],
        schema: &RecordSchema,
        resource: &str,
        method: WriteMethod,
        key_fields: &[String],
    ) -> Result<PublishOutcome, PublishError> {
        let plan = self.plan(batch, schema, resource, method, key_fields)?;
        let resource_id = self.transmit(&plan, resource, method).await?;
        bounded(
            "clear_and_reload",
            self.timeout,
            self.store
                .clear_and_reload(&resource_id, &plan.rows, &plan.fields, &plan.keys),
        )
        .await
        .map_err(|source| PublishError::Transmission {
            resource: resource.to_string(),
            phase: PublishPhase::Reload,
            source,
        })?;
        info!(resource, rows = plan.rows.len(), "replaced resource contents");
        Ok(PublishOutcome {
            resource: resource.to_string(),
            resource_id,
            method,
            rows: plan.rows.len(),
            duplicates_dropped: plan.duplicates_dropped,
            replaced: true,
        })
    }

    fn plan(
        &self,
        batch: &[CanonicalRecord],
        schema: &RecordSchema,
        resource: &str,
        method: WriteMethod,
        key_fields: &[String],
    ) -> Result<WirePlan, PublishError> {
        if method == WriteMethod::Upsert && key_fields.is_empty() {
            return Err(PublishError::MissingKeyFields {
                resource: resource.to_string(),
            });
        }
        let plan = WirePlan::new(batch, schema, key_fields);
        if plan.duplicates_dropped > 0 {
            warn!(
                resource,
                dropped = plan.duplicates_dropped,
                keys = ?plan.keys,
                "batch repeats key values, keeping the last row for each key"
            );
        }
        Ok(plan)
    }

    async fn transmit(&self, plan: &WirePlan, resource: &str, method: WriteMethod) -> Result<ResourceId, PublishError> {
        let failed = |phase| {
            move |source| PublishError::Transmission {
                resource: resource.to_string(),
                phase,
                source,
            }
        };
        let resource_id = bounded(
            "create_or_get_resource",
            self.timeout,
            self.store
                .create_or_get_resource(resource, &plan.fields, &plan.keys),
        )
        .await
        .map_err(failed(PublishPhase::Prepare))?;

        let write = match method {
            WriteMethod::Insert => {
                bounded(
                    "insert",
                    self.timeout,
                    self.store.insert(&resource_id, &plan.rows, &plan.fields),
                )
                .await
            }
            WriteMethod::Upsert => {
                bounded(
                    "upsert",
                    self.timeout,
                    self.store
                        .upsert(&resource_id, &plan.rows, &plan.fields, &plan.keys),
                )
                .await
            }
        };
        write.map_err(failed(PublishPhase::Write))?;
        info!(resource, %method, rows = plan.rows.len(), "published batch");
        Ok(resource_id)
    }
}
