//! Remote tabular datastore: the trait the pipeline publishes through, a CKAN client and an in-process store.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use burghfeed_core::{Period, WireField, PERIOD_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::{classify_reqwest_error, classify_status, RetryDisposition};

/// One row on the wire, keyed by publish name.
pub type Row = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("datastore call `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("datastore request `{operation}` failed: {source}")]
    Request {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("datastore returned http {status} for `{operation}`: {body}")]
    HttpStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("datastore rejected `{operation}`: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
    #[error("unknown datastore resource {0}")]
    UnknownResource(ResourceId),
}

impl DatastoreError {
    /// Surfaced to callers so they can report it; nothing below the orchestrator retries.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            DatastoreError::Timeout { .. } => RetryDisposition::Retryable,
            DatastoreError::Request { source, .. } => classify_reqwest_error(source),
            DatastoreError::HttpStatus { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            DatastoreError::Rejected { .. } | DatastoreError::UnknownResource(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Bounds one datastore call; the only suspension point in the pipeline that needs a limit.
pub async fn bounded<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, DatastoreError>
where
    F: Future<Output = Result<T, DatastoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DatastoreError::Timeout { operation, timeout }),
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Looks a resource up by name without creating it.
    async fn find_resource(&self, name: &str) -> Result<Option<ResourceId>, DatastoreError>;

    async fn create_or_get_resource(
        &self,
        name: &str,
        fields: &[WireField],
        key_fields: &[String],
    ) -> Result<ResourceId, DatastoreError>;

    /// Number of rows whose `period` column equals `period`.
    async fn query_period_count(&self, resource: &ResourceId, period: Period) -> Result<u64, DatastoreError>;

    async fn insert(&self, resource: &ResourceId, rows: &[Row], fields: &[WireField]) -> Result<(), DatastoreError>;

    async fn upsert(
        &self,
        resource: &ResourceId,
        rows: &[Row],
        fields: &[WireField],
        key_fields: &[String],
    ) -> Result<(), DatastoreError>;

    /// Empties an existing resource and writes `rows`. Fails on resources that were never created.
    async fn clear_and_reload(
        &self,
        resource: &ResourceId,
        rows: &[Row],
        fields: &[WireField],
        key_fields: &[String],
    ) -> Result<(), DatastoreError>;
}

#[derive(Debug, Clone)]
pub struct CkanConfig {
    pub base_url: String,
    pub package_id: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// CKAN action-API client (`/api/3/action/*`).
#[derive(Debug, Clone)]
pub struct CkanDatastore {
    client: reqwest::Client,
    config: CkanConfig,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    success: bool,
    #[serde(default)]
    result: JsonValue,
    #[serde(default)]
    error: JsonValue,
}

impl CkanDatastore {
    pub fn new(config: CkanConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building CKAN client")?;
        Ok(Self { client, config })
    }

    fn action_url(&self, action: &str) -> String {
        format!(
            "{}/api/3/action/{}",
            self.config.base_url.trim_end_matches('/'),
            action
        )
    }

    async fn action(&self, operation: &'static str, action: &str, body: JsonValue) -> Result<JsonValue, DatastoreError> {
        let mut request = self.client.post(self.action_url(action)).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header(reqwest::header::AUTHORIZATION, key);
        }
        debug!(action, "ckan action");
        let resp = request.send().await.map_err(|source| {
            if source.is_timeout() {
                DatastoreError::Timeout {
                    operation,
                    timeout: self.config.timeout,
                }
            } else {
                DatastoreError::Request { operation, source }
            }
        })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|source| DatastoreError::Request { operation, source })?;
        if !status.is_success() {
            return Err(DatastoreError::HttpStatus {
                operation,
                status: status.as_u16(),
                body: text,
            });
        }
        let parsed: ActionResponse = serde_json::from_str(&text).map_err(|e| DatastoreError::Rejected {
            operation,
            message: format!("unparseable response: {e}"),
        })?;
        if !parsed.success {
            return Err(DatastoreError::Rejected {
                operation,
                message: parsed.error.to_string(),
            });
        }
        Ok(parsed.result)
    }

    async fn write_rows(
        &self,
        operation: &'static str,
        resource: &ResourceId,
        rows: &[Row],
        method: &str,
    ) -> Result<(), DatastoreError> {
        self.action(
            operation,
            "datastore_upsert",
            json!({
                "resource_id": resource.0,
                "records": rows,
                "method": method,
                "force": true,
            }),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl Datastore for CkanDatastore {
    async fn find_resource(&self, name: &str) -> Result<Option<ResourceId>, DatastoreError> {
        let package = self
            .action("find_resource", "package_show", json!({ "id": self.config.package_id }))
            .await?;
        Ok(package
            .get("resources")
            .and_then(JsonValue::as_array)
            .and_then(|resources| {
                resources
                    .iter()
                    .find(|r| r.get("name").and_then(JsonValue::as_str) == Some(name))
            })
            .and_then(|r| r.get("id").and_then(JsonValue::as_str))
            .map(|id| ResourceId(id.to_string())))
    }

    async fn create_or_get_resource(
        &self,
        name: &str,
        fields: &[WireField],
        key_fields: &[String],
    ) -> Result<ResourceId, DatastoreError> {
        if let Some(existing) = self.find_resource(name).await? {
            return Ok(existing);
        }
        let mut body = json!({
            "resource": { "package_id": self.config.package_id, "name": name, "format": "csv" },
            "fields": fields,
            "force": true,
        });
        if !key_fields.is_empty() {
            body["primary_key"] = json!(key_fields);
        }
        let result = self.action("create_resource", "datastore_create", body).await?;
        result
            .get("resource_id")
            .and_then(JsonValue::as_str)
            .map(|id| ResourceId(id.to_string()))
            .ok_or_else(|| DatastoreError::Rejected {
                operation: "create_resource",
                message: "datastore_create returned no resource_id".to_string(),
            })
    }

    async fn query_period_count(&self, resource: &ResourceId, period: Period) -> Result<u64, DatastoreError> {
        let result = self
            .action(
                "query_period_count",
                "datastore_search",
                json!({
                    "resource_id": resource.0,
                    "filters": { PERIOD_FIELD: period.to_string() },
                    "limit": 0,
                    "include_total": true,
                }),
            )
            .await?;
        result
            .get("total")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| DatastoreError::Rejected {
                operation: "query_period_count",
                message: "datastore_search returned no total".to_string(),
            })
    }

    async fn insert(&self, resource: &ResourceId, rows: &[Row], _fields: &[WireField]) -> Result<(), DatastoreError> {
        self.write_rows("insert", resource, rows, "insert").await
    }

    async fn upsert(
        &self,
        resource: &ResourceId,
        rows: &[Row],
        _fields: &[WireField],
        key_fields: &[String],
    ) -> Result<(), DatastoreError> {
        if key_fields.is_empty() {
            return Err(DatastoreError::Rejected {
                operation: "upsert",
                message: "upsert requires key fields".to_string(),
            });
        }
        self.write_rows("upsert", resource, rows, "upsert").await
    }

    async fn clear_and_reload(
        &self,
        resource: &ResourceId,
        rows: &[Row],
        fields: &[WireField],
        key_fields: &[String],
    ) -> Result<(), DatastoreError> {
        // Empty filters truncate the table while keeping the resource.
        self.action(
            "clear_and_reload",
            "datastore_delete",
            json!({ "resource_id": resource.0, "filters": {}, "force": true }),
        )
        .await?;
        let mut body = json!({
            "resource_id": resource.0,
            "fields": fields,
            "records": rows,
            "force": true,
        });
        if !key_fields.is_empty() {
            body["primary_key"] = json!(key_fields);
        }
        self.action("clear_and_reload", "datastore_create", body)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone)]
struct MemoryResource {
    id: ResourceId,
    fields: Vec<WireField>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: BTreeMap<String, MemoryResource>,
    next_id: u64,
    calls: Vec<String>,
    failing: Vec<String>,
}

/// In-process datastore with the same constraints as the remote one.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    state: Mutex<MemoryState>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `operation` fail with `Rejected`.
    pub fn fail_operation(&self, operation: &str) {
        self.lock().failing.push(operation.to_string());
    }

    /// Operations performed so far, as `"<operation> <resource name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn rows(&self, name: &str) -> Option<Vec<Row>> {
        self.lock().resources.get(name).map(|r| r.rows.clone())
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.lock().resources.keys().cloned().collect()
    }

    /// Seeds a resource directly, bypassing the call log.
    pub fn seed(&self, name: &str, fields: Vec<WireField>, rows: Vec<Row>) -> ResourceId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = ResourceId(format!("mem-{}", state.next_id));
        state.resources.insert(
            name.to_string(),
            MemoryResource {
                id: id.clone(),
                fields,
                rows,
            },
        );
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_resource<T>(
        &self,
        operation: &'static str,
        resource: &ResourceId,
        f: impl FnOnce(&mut MemoryResource) -> Result<T, DatastoreError>,
    ) -> Result<T, DatastoreError> {
        let mut state = self.lock();
        let name = state
            .resources
            .iter()
            .find(|(_, r)| &r.id == resource)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| DatastoreError::UnknownResource(resource.clone()))?;
        state.calls.push(format!("{operation} {name}"));
        if state.failing.iter().any(|op| op == operation) {
            return Err(DatastoreError::Rejected {
                operation,
                message: "injected failure".to_string(),
            });
        }
        let entry = state
            .resources
            .get_mut(&name)
            .ok_or_else(|| DatastoreError::UnknownResource(resource.clone()))?;
        f(entry)
    }
}

fn check_columns(operation: &'static str, resource: &MemoryResource, rows: &[Row]) -> Result<(), DatastoreError> {
    for row in rows {
        if let Some(unknown) = row
            .keys()
            .find(|k| !resource.fields.iter().any(|f| &f.id == *k))
        {
            return Err(DatastoreError::Rejected {
                operation,
                message: format!("column `{unknown}` not in resource schema"),
            });
        }
    }
    Ok(())
}

fn same_key(a: &Row, b: &Row, key_fields: &[String]) -> bool {
    key_fields.iter().all(|k| a.get(k) == b.get(k))
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn find_resource(&self, name: &str) -> Result<Option<ResourceId>, DatastoreError> {
        let mut state = self.lock();
        state.calls.push(format!("find_resource {name}"));
        if state.failing.iter().any(|op| op == "find_resource") {
            return Err(DatastoreError::Rejected {
                operation: "find_resource",
                message: "injected failure".to_string(),
            });
        }
        Ok(state.resources.get(name).map(|r| r.id.clone()))
    }

    async fn create_or_get_resource(
        &self,
        name: &str,
        fields: &[WireField],
        _key_fields: &[String],
    ) -> Result<ResourceId, DatastoreError> {
        let mut state = self.lock();
        state.calls.push(format!("create_or_get_resource {name}"));
        if state.failing.iter().any(|op| op == "create_or_get_resource") {
            return Err(DatastoreError::Rejected {
                operation: "create_or_get_resource",
                message: "injected failure".to_string(),
            });
        }
        if let Some(existing) = state.resources.get(name) {
            return Ok(existing.id.clone());
        }
        state.next_id += 1;
        let id = ResourceId(format!("mem-{}", state.next_id));
        state.resources.insert(
            name.to_string(),
            MemoryResource {
                id: id.clone(),
                fields: fields.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn query_period_count(&self, resource: &ResourceId, period: Period) -> Result<u64, DatastoreError> {
        let period = JsonValue::String(period.to_string());
        self.with_resource("query_period_count", resource, |r| {
            Ok(r.rows
                .iter()
                .filter(|row| row.get(PERIOD_FIELD) == Some(&period))
                .count() as u64)
        })
    }

    async fn insert(&self, resource: &ResourceId, rows: &[Row], _fields: &[WireField]) -> Result<(), DatastoreError> {
        self.with_resource("insert", resource, |r| {
            check_columns("insert", r, rows)?;
            r.rows.extend(rows.iter().cloned());
            Ok(())
        })
    }

    async fn upsert(
        &self,
        resource: &ResourceId,
        rows: &[Row],
        _fields: &[WireField],
        key_fields: &[String],
    ) -> Result<(), DatastoreError> {
        self.with_resource("upsert", resource, |r| {
            if key_fields.is_empty() {
                return Err(DatastoreError::Rejected {
                    operation: "upsert",
                    message: "upsert requires key fields".to_string(),
                });
            }
            check_columns("upsert", r, rows)?;
            for row in rows {
                match r.rows.iter_mut().find(|existing| same_key(existing, row, key_fields)) {
                    Some(existing) => *existing = row.clone(),
                    None => r.rows.push(row.clone()),
                }
            }
            Ok(())
        })
    }

    async fn clear_and_reload(
        &self,
        resource: &ResourceId,
        rows: &[Row],
        fields: &[WireField],
        key_fields: &[String],
    ) -> Result<(), DatastoreError> {
        self.with_resource("clear_and_reload", resource, |r| {
            r.fields = fields.to_vec();
            check_columns("clear_and_reload", r, rows)?;
            if !key_fields.is_empty() {
                for (i, row) in rows.iter().enumerate() {
                    if rows[..i].iter().any(|earlier| same_key(earlier, row, key_fields)) {
                        return Err(DatastoreError::Rejected {
                            operation: "clear_and_reload",
                            message: format!("duplicate key ({}) at row {i}", key_fields.join(", ")),
                        });
                    }
                }
            }
            r.rows = rows.to_vec();
            Ok(())
        })
    }
}
