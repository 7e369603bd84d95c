//! Per-table sync orchestration: ingest, archive admission and publication.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burghfeed_adapters::{write_canonical_csv, BatchIngestor, IngestError, RecordNormalizer, SkippedRow};
use burghfeed_core::{ArchiveDecision, Mode, Period, TableKind, TableProfile, WriteMethod, PERIOD_FIELD};
use burghfeed_storage::{
    notify_best_effort, Alert, AlertSink, ArtifactStore, CkanConfig, CkanDatastore, Datastore, FetchError,
    HttpClientConfig, HttpFetcher, LogNotifier, Notifier, WebhookNotifier,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod admission;
pub mod config;
pub mod publish;

pub use admission::{AdmissionQueryError, ArchiveAdmissionPolicy};
pub use config::{EnvironmentConfig, PipelineConfig};
pub use publish::{PublishError, PublishOutcome, PublishPhase, Publisher};

pub const CRATE_NAME: &str = "burghfeed-sync";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Download extracts from the configured source URLs instead of reading local files.
    pub fetch_remote: bool,
    pub local_paths: BTreeMap<TableKind, PathBuf>,
    /// Empty means every table kind.
    pub tables: Vec<TableKind>,
    /// Overrides the wall-clock period.
    pub period: Option<Period>,
}

impl RunOptions {
    pub fn selected_tables(&self) -> Vec<TableKind> {
        if self.tables.is_empty() {
            TableKind::ALL.to_vec()
        } else {
            self.tables.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum TableRunError {
    #[error("no source url configured for {0}")]
    MissingSource(TableKind),
    #[error("fetching {kind} extract: {source}")]
    Fetch {
        kind: TableKind,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("{0} extract produced no publishable records")]
    EmptyBatch(TableKind),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractSource {
    Local { path: PathBuf },
    Remote { url: String, artifact: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Succeeded,
    Failed,
    /// No extract was supplied for this table.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: TableKind,
    pub status: TableStatus,
    pub source: Option<ExtractSource>,
    pub records: usize,
    pub quarantined: Vec<SkippedRow>,
    pub rejected: Vec<SkippedRow>,
    pub export_path: Option<PathBuf>,
    pub archive: Option<ArchiveDecision>,
    pub published: Vec<PublishOutcome>,
    pub error: Option<String>,
}

impl TableOutcome {
    fn new(table: TableKind) -> Self {
        Self {
            table,
            status: TableStatus::Succeeded,
            source: None,
            records: 0,
            quarantined: Vec::new(),
            rejected: Vec::new(),
            export_path: None,
            archive: None,
            published: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub period: Period,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableOutcome>,
    pub alerts: Vec<Alert>,
    pub report_path: PathBuf,
}

impl RunSummary {
    pub fn outcome(&self, table: TableKind) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == table)
    }

    pub fn failed_tables(&self) -> Vec<TableKind> {
        self.tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .map(|t| t.table)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_tables().is_empty()
    }
}

pub struct SyncPipeline {
    config: PipelineConfig,
    datastore: Arc<dyn Datastore>,
    notifier: Arc<dyn Notifier>,
    http: HttpFetcher,
    artifacts: ArtifactStore,
    admission: ArchiveAdmissionPolicy,
    alerts: AlertSink,
}

impl SyncPipeline {
    pub fn new(config: PipelineConfig, datastore: Arc<dyn Datastore>, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            admission: ArchiveAdmissionPolicy::new(config.datastore_timeout()),
            alerts: AlertSink::new(),
            http,
            config,
            datastore,
            notifier,
        })
    }

    /// Wires the CKAN datastore of `environment` and the configured notifier.
    pub fn from_config(config: PipelineConfig, environment: Option<&str>) -> Result<Self> {
        let env = config.environment(environment)?;
        let datastore = CkanDatastore::new(CkanConfig {
            base_url: env.ckan_url.clone(),
            package_id: env.package_id.clone(),
            api_key: config.ckan_api_key.clone(),
            timeout: config.datastore_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let notifier: Arc<dyn Notifier> = match &config.alert_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone(), config.http_timeout())?),
            None => Arc::new(LogNotifier),
        };
        Self::new(config, Arc::new(datastore), notifier)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn alerts(&self) -> &AlertSink {
        &self.alerts
    }

    /// Runs every selected table in turn. A table failure is reported in its outcome and does not
    /// stop the remaining tables; only writing the run report can fail the whole run.
    pub async fn run_once(&self, options: &RunOptions) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let first_alert = self.alerts.mark();
        let period = options.period.unwrap_or_else(Period::current);
        info!(%run_id, %period, fetch_remote = options.fetch_remote, "starting sync run");

        let mut tables = Vec::new();
        for kind in options.selected_tables() {
            let span = info_span!("table_run", %run_id, table = %kind);
            tables.push(self.run_table(run_id, kind, period, options).instrument(span).await);
        }

        let finished_at = Utc::now();
        let alerts = self.alerts.since(first_alert);
        let report_path = self.config.reports_dir.join(run_id.to_string()).join("run_summary.json");
        let summary = RunSummary {
            run_id,
            period,
            started_at,
            finished_at,
            tables,
            alerts,
            report_path,
        };
        write_run_summary(&summary).await?;
        info!(
            %run_id,
            failed = summary.failed_tables().len(),
            report = %summary.report_path.display(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_table(&self, run_id: Uuid, kind: TableKind, period: Period, options: &RunOptions) -> TableOutcome {
        let mut outcome = TableOutcome::new(kind);
        if let Err(err) = self.process_table(run_id, kind, period, options, &mut outcome).await {
            let detail = format!("{:#}", anyhow::Error::new(err));
            error!(table = %kind, error = %detail, "table run failed");
            self.raise_alert(
                Some(kind),
                format!("{} feed failed to publish: {detail}", kind.display_name()),
            )
            .await;
            outcome.status = TableStatus::Failed;
            outcome.error = Some(detail);
        }
        outcome
    }

    async fn process_table(
        &self,
        run_id: Uuid,
        kind: TableKind,
        period: Period,
        options: &RunOptions,
        outcome: &mut TableOutcome,
    ) -> Result<(), TableRunError> {
        let Some((source, text)) = self.load_extract(run_id, kind, options).await? else {
            info!(table = %kind, "no extract supplied, skipping");
            outcome.status = TableStatus::Skipped;
            return Ok(());
        };
        outcome.source = Some(source);

        let profile = TableProfile::for_kind(kind);
        let report = BatchIngestor::new(profile.clone(), self.config.malformed_rows).ingest(&text)?;
        outcome.records = report.records.len();
        outcome.quarantined = report.quarantined.clone();
        outcome.rejected = report.rejected.clone();
        if !report.quarantined.is_empty() {
            let lines = report
                .quarantined
                .iter()
                .map(|row| row.line.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.raise_alert(
                Some(kind),
                format!(
                    "{} rows skipped from {} extract due to malformed coordinates (lines {lines})",
                    report.quarantined.len(),
                    kind.display_name()
                ),
            )
            .await;
        }
        if report.records.is_empty() {
            return Err(TableRunError::EmptyBatch(kind));
        }

        let live_schema = profile.schema(Mode::Live);
        if let Some(dir) = &self.config.export_dir {
            let path = dir.join(format!("{}.csv", kind.slug()));
            write_canonical_csv(&path, &live_schema, &report.records)?;
            outcome.export_path = Some(path);
        }

        let archived = RecordNormalizer::stamp_period(&report.records, period);
        let archive_schema = profile.schema(Mode::Archive);
        let decision = self
            .admission
            .evaluate(self.datastore.as_ref(), &profile, period, archived.len())
            .await;
        if let Some(alert) = &decision.alert {
            self.raise_alert(Some(kind), alert.clone()).await;
        }
        outcome.archive = Some(decision.clone());

        let publisher = Publisher::new(self.datastore.as_ref(), self.config.datastore_timeout());
        outcome.published.push(
            publisher
                .replace(
                    &report.records,
                    &live_schema,
                    &profile.resource_name,
                    WriteMethod::Upsert,
                    &profile.key_fields,
                )
                .await?,
        );

        if decision.should_archive {
            let keys = archive_keys(&profile, decision.method);
            outcome.published.push(
                publisher
                    .publish(
                        &archived,
                        &archive_schema,
                        &profile.archive_resource_name,
                        decision.method,
                        &keys,
                    )
                    .await?,
            );
        } else {
            info!(table = %kind, reason = %decision.reason, "archive left unchanged");
        }

        outcome.published.push(
            publisher
                .replace(
                    &archived,
                    &archive_schema,
                    &profile.period_resource_name(period),
                    WriteMethod::Insert,
                    &[],
                )
                .await?,
        );
        info!(
            table = %kind,
            records = outcome.records,
            archived = decision.should_archive,
            "table published"
        );
        Ok(())
    }

    async fn load_extract(
        &self,
        run_id: Uuid,
        kind: TableKind,
        options: &RunOptions,
    ) -> Result<Option<(ExtractSource, String)>, TableRunError> {
        if options.fetch_remote {
            let url = self
                .config
                .source_url(kind)
                .ok_or(TableRunError::MissingSource(kind))?;
            let fetched = self
                .http
                .fetch_extract(run_id, kind, url)
                .await
                .map_err(|source| TableRunError::Fetch { kind, source })?;
            let stored = self
                .artifacts
                .store_extract(fetched.fetched_at, kind, &fetched.body)
                .await?;
            let text = String::from_utf8(fetched.body)
                .with_context(|| format!("{kind} extract from {} is not valid UTF-8", fetched.final_url))?;
            let source = ExtractSource::Remote {
                url: fetched.final_url,
                artifact: stored.absolute_path,
            };
            return Ok(Some((source, text)));
        }

        let Some(path) = options.local_paths.get(&kind) else {
            return Ok(None);
        };
        let text = read_extract(path).await?;
        Ok(Some((ExtractSource::Local { path: path.clone() }, text)))
    }

    async fn raise_alert(&self, table: Option<TableKind>, message: String) {
        warn!(table = ?table, "{message}");
        let channel = &self.config.alert_channel;
        notify_best_effort(self.notifier.as_ref(), &message, channel).await;
        self.alerts.push(Alert {
            raised_at: Utc::now(),
            table,
            channel: channel.clone(),
            message,
        });
    }
}

/// Archive rows carry their period, so an upsert has to include it in the key.
fn archive_keys(profile: &TableProfile, method: WriteMethod) -> Vec<String> {
    match method {
        WriteMethod::Insert => Vec::new(),
        WriteMethod::Upsert => profile
            .key_fields
            .iter()
            .cloned()
            .chain(std::iter::once(PERIOD_FIELD.to_string()))
            .collect(),
    }
}

async fn read_extract(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

async fn write_run_summary(summary: &RunSummary) -> Result<()> {
    let path = &summary.report_path;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Scheduler that runs `options` against `pipeline` on the configured cron expression.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, options: RunOptions) -> Result<JobScheduler> {
    let cron = pipeline.config().schedule_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        let options = options.clone();
        Box::pin(async move {
            match pipeline.run_once(&options).await {
                Ok(summary) if summary.all_succeeded() => {
                    info!(run_id = %summary.run_id, "scheduled sync succeeded")
                }
                Ok(summary) => warn!(
                    run_id = %summary.run_id,
                    failed = ?summary.failed_tables(),
                    "scheduled sync finished with failures"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_keys_follow_write_method() {
        let profile = TableProfile::for_kind(TableKind::Services);
        assert!(archive_keys(&profile, WriteMethod::Insert).is_empty());
        assert_eq!(
            archive_keys(&profile, WriteMethod::Upsert),
            vec!["service_name", "program_or_facility", "period"]
        );
    }

    #[test]
    fn empty_table_selection_means_all() {
        let options = RunOptions::default();
        assert_eq!(options.selected_tables(), TableKind::ALL.to_vec());
        let options = RunOptions {
            tables: vec![TableKind::Services],
            ..Default::default()
        };
        assert_eq!(options.selected_tables(), vec![TableKind::Services]);
    }
}
