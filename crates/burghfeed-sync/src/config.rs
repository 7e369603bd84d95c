//! Pipeline configuration: `burghfeed.yaml` plus environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use burghfeed_adapters::MalformedRowPolicy;
use burghfeed_core::TableKind;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "burghfeed.yaml";

/// Target datastore for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvironmentConfig {
    pub ckan_url: String,
    pub package_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default = "default_environment")]
    pub default_environment: String,
    /// Remote extract URL per table.
    #[serde(default)]
    pub sources: BTreeMap<TableKind, String>,
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
    #[serde(default = "default_alert_channel")]
    pub alert_channel: String,
    #[serde(default = "default_datastore_timeout_secs")]
    pub datastore_timeout_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub malformed_rows: MalformedRowPolicy,
    #[serde(default)]
    pub export_dir: Option<PathBuf>,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_schedule_cron")]
    pub schedule_cron: String,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub ckan_api_key: Option<String>,
}

fn default_environment() -> String {
    "staging".to_string()
}

fn default_alert_channel() -> String {
    "#burghfeed-alerts".to_string()
}

fn default_datastore_timeout_secs() -> u64 {
    60
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "burghfeed/0.1".to_string()
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("./reports")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("./artifacts")
}

fn default_schedule_cron() -> String {
    // sec min hour day-of-month month day-of-week
    "0 0 6 * * *".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environments: BTreeMap::new(),
            default_environment: default_environment(),
            sources: BTreeMap::new(),
            alert_webhook_url: None,
            alert_channel: default_alert_channel(),
            datastore_timeout_secs: default_datastore_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
            malformed_rows: MalformedRowPolicy::default(),
            export_dir: None,
            reports_dir: default_reports_dir(),
            artifacts_dir: default_artifacts_dir(),
            schedule_cron: default_schedule_cron(),
            ckan_api_key: None,
        }
    }
}

impl PipelineConfig {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing pipeline config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Reads the file named by `BURGHFEED_CONFIG` (default `burghfeed.yaml`) and applies the
    /// credential overrides. A missing default file yields the built-in defaults.
    pub fn from_env() -> Result<Self> {
        let explicit = std::env::var("BURGHFEED_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let config = if explicit.is_some() || path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_overrides(
            std::env::var("BURGHFEED_CKAN_API_KEY").ok(),
            std::env::var("BURGHFEED_ALERT_WEBHOOK_URL").ok(),
        ))
    }

    pub fn with_overrides(mut self, api_key: Option<String>, webhook_url: Option<String>) -> Self {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.ckan_api_key = Some(key);
        }
        if let Some(url) = webhook_url.filter(|u| !u.trim().is_empty()) {
            self.alert_webhook_url = Some(url);
        }
        self
    }

    /// `None` selects `default_environment`.
    pub fn environment(&self, name: Option<&str>) -> Result<&EnvironmentConfig> {
        let name = name.unwrap_or(&self.default_environment);
        self.environments.get(name).with_context(|| {
            format!(
                "unknown environment `{name}` (configured: {})",
                self.environments.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    pub fn source_url(&self, kind: TableKind) -> Option<&str> {
        self.sources.get(&kind).map(String::as_str)
    }

    pub fn datastore_timeout(&self) -> Duration {
        Duration::from_secs(self.datastore_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
