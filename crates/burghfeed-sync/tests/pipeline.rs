use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use burghfeed_core::{ArchiveState, Mode, Period, TableKind, TableProfile, PERIOD_FIELD};
use burghfeed_storage::{Datastore, MemoryDatastore, Notifier, Row};
use burghfeed_sync::{PipelineConfig, RunOptions, SyncPipeline, TableStatus};
use serde_json::{json, Value};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name)
}

fn period() -> Period {
    Period::new(2026, 10).unwrap()
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, _channel: &str) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify(&self, _message: &str, _channel: &str) -> Result<()> {
        bail!("webhook unreachable")
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<MemoryDatastore>,
    notifier: Arc<RecordingNotifier>,
    pipeline: SyncPipeline,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        reports_dir: dir.path().join("reports"),
        artifacts_dir: dir.path().join("artifacts"),
        export_dir: Some(dir.path().join("export")),
        ..Default::default()
    };
    let store = Arc::new(MemoryDatastore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let datastore: Arc<dyn Datastore> = store.clone();
    let pipeline = SyncPipeline::new(config, datastore, notifier.clone()).unwrap();
    Harness {
        dir,
        store,
        notifier,
        pipeline,
    }
}

fn all_fixtures() -> RunOptions {
    let mut local_paths = BTreeMap::new();
    local_paths.insert(TableKind::Events, fixture("events.csv"));
    local_paths.insert(TableKind::SafePlaces, fixture("safe_places.csv"));
    local_paths.insert(TableKind::Services, fixture("services.csv"));
    RunOptions {
        local_paths,
        period: Some(period()),
        ..Default::default()
    }
}

#[tokio::test]
async fn publishes_every_table_to_three_resources() {
    let h = harness();
    let summary = h.pipeline.run_once(&all_fixtures()).await.unwrap();

    assert!(summary.all_succeeded(), "{:?}", summary.tables);
    let mut names = h.store.resource_names();
    names.sort();
    assert_eq!(
        names,
        vec![
            "Events",
            "Events 202610",
            "Events Archive",
            "Safe Places",
            "Safe Places 202610",
            "Safe Places Archive",
            "Services",
            "Services 202610",
            "Services Archive",
        ]
    );

    let current = h.store.rows("Events").unwrap();
    assert_eq!(current.len(), 2);
    assert!(current.iter().all(|r| r.get("category") == Some(&json!("Food"))));
    assert!(current.iter().all(|r| !r.contains_key(PERIOD_FIELD)));

    let archive = h.store.rows("Events Archive").unwrap();
    assert_eq!(archive.len(), 2);
    assert!(archive.iter().all(|r| r.get(PERIOD_FIELD) == Some(&json!("202610"))));
    assert_eq!(h.store.rows("Events 202610").unwrap().len(), 2);

    let services = h.store.rows("Services").unwrap();
    assert_eq!(services[1].get("organization"), Some(&json!("Goodwill")));
    let outcome = summary.outcome(TableKind::Services).unwrap();
    assert_eq!(outcome.rejected.len(), 1);
}

#[tokio::test]
async fn quarantined_rows_raise_an_alert() {
    let h = harness();
    let summary = h.pipeline.run_once(&all_fixtures()).await.unwrap();

    let events = summary.outcome(TableKind::Events).unwrap();
    assert_eq!(events.records, 2);
    assert_eq!(events.quarantined.len(), 1);
    assert_eq!(events.quarantined[0].line, 5);

    let alerts = h.pipeline.alerts().for_table(TableKind::Events);
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].message.contains("lines 5"));
    let messages = h.notifier.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("malformed coordinates"));
}

#[tokio::test]
async fn second_run_in_same_period_leaves_archive_alone() {
    let h = harness();
    h.pipeline.run_once(&all_fixtures()).await.unwrap();
    let summary = h.pipeline.run_once(&all_fixtures()).await.unwrap();

    assert!(summary.all_succeeded());
    for kind in TableKind::ALL {
        let profile = TableProfile::for_kind(kind);
        let decision = summary.outcome(kind).unwrap().archive.clone().unwrap();
        assert!(!decision.should_archive, "{kind}");
        assert_eq!(decision.state, ArchiveState::ExistsSufficient { existing: 2 });
        assert_eq!(h.store.rows(&profile.archive_resource_name).unwrap().len(), 2);
        assert_eq!(h.store.rows(&profile.resource_name).unwrap().len(), 2);
        assert_eq!(
            h.store.rows(&profile.period_resource_name(period())).unwrap().len(),
            2
        );
    }
}

#[tokio::test]
async fn partially_archived_period_is_reinserted_with_alert() {
    let h = harness();
    let profile = TableProfile::for_kind(TableKind::Events);
    let mut row = Row::new();
    row.insert("event_name".into(), json!("Community Lunch"));
    row.insert(PERIOD_FIELD.into(), json!("202610"));
    h.store.seed(
        &profile.archive_resource_name,
        profile.schema(Mode::Archive).wire_fields(),
        vec![row],
    );

    let options = RunOptions {
        tables: vec![TableKind::Events],
        ..all_fixtures()
    };
    let summary = h.pipeline.run_once(&options).await.unwrap();

    let decision = summary.outcome(TableKind::Events).unwrap().archive.clone().unwrap();
    assert!(decision.should_archive);
    assert_eq!(decision.state, ArchiveState::ExistsIncomplete { existing: 1 });
    assert_eq!(h.store.rows("Events Archive").unwrap().len(), 3);
    assert!(summary.alerts.iter().any(|a| a.message.contains("mismatch")));
}

#[tokio::test]
async fn one_failing_table_does_not_stop_the_others() {
    let h = harness();
    let mut options = all_fixtures();
    options
        .local_paths
        .insert(TableKind::Services, h.dir.path().join("missing.csv"));
    options.local_paths.remove(&TableKind::SafePlaces);

    let summary = h.pipeline.run_once(&options).await.unwrap();

    assert_eq!(summary.failed_tables(), vec![TableKind::Services]);
    assert_eq!(summary.outcome(TableKind::Events).unwrap().status, TableStatus::Succeeded);
    assert_eq!(summary.outcome(TableKind::SafePlaces).unwrap().status, TableStatus::Skipped);
    let services = summary.outcome(TableKind::Services).unwrap();
    assert!(services.error.as_deref().unwrap().contains("missing.csv"));
    assert_eq!(h.pipeline.alerts().for_table(TableKind::Services).len(), 1);
    assert!(h.store.rows("Events").is_some());
    assert!(h.store.rows("Services").is_none());
}

#[tokio::test]
async fn datastore_rejection_fails_each_table_and_still_reports() {
    let h = harness();
    h.store.fail_operation("clear_and_reload");
    let summary = h.pipeline.run_once(&all_fixtures()).await.unwrap();

    assert_eq!(summary.failed_tables(), TableKind::ALL.to_vec());
    assert!(summary.report_path.exists());
}

#[tokio::test]
async fn notifier_failure_does_not_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        reports_dir: dir.path().join("reports"),
        artifacts_dir: dir.path().join("artifacts"),
        ..Default::default()
    };
    let store: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
    let pipeline = SyncPipeline::new(config, store, Arc::new(BrokenNotifier)).unwrap();

    let summary = pipeline.run_once(&all_fixtures()).await.unwrap();
    assert!(summary.all_succeeded());
    assert_eq!(pipeline.alerts().for_table(TableKind::Events).len(), 1);
}

#[tokio::test]
async fn run_report_and_exports_are_written() {
    let h = harness();
    let summary = h.pipeline.run_once(&all_fixtures()).await.unwrap();

    let expected = h
        .dir
        .path()
        .join("reports")
        .join(summary.run_id.to_string())
        .join("run_summary.json");
    assert_eq!(summary.report_path, expected);
    let report: Value = serde_json::from_str(&std::fs::read_to_string(&expected).unwrap()).unwrap();
    assert_eq!(report["period"], json!("202610"));
    assert_eq!(report["tables"].as_array().unwrap().len(), 3);
    assert_eq!(report["tables"][0]["status"], json!("succeeded"));

    let export = std::fs::read_to_string(h.dir.path().join("export").join("events.csv")).unwrap();
    assert_eq!(export.lines().count(), 3);
    assert!(export.lines().next().unwrap().contains("organization"));
}

#[tokio::test]
async fn each_run_summary_lists_only_its_own_alerts() {
    let h = harness();
    let first = h.pipeline.run_once(&all_fixtures()).await.unwrap();
    let second = h.pipeline.run_once(&all_fixtures()).await.unwrap();

    assert_eq!(first.alerts.len(), 1);
    assert_eq!(second.alerts.len(), 1);
    assert!(second.alerts[0].raised_at >= second.started_at);
    assert_eq!(h.pipeline.alerts().for_table(TableKind::Events).len(), 2);
}
