//! Operator alerting. Delivery is best-effort and never fails a pipeline run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use burghfeed_core::TableKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, channel: &str) -> Result<()>;
}

/// Posts Slack-compatible `{"text", "channel"}` payloads to an incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str, channel: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({ "text": message, "channel": channel }))
            .send()
            .await
            .context("posting alert webhook")?
            .error_for_status()
            .context("alert webhook rejected message")?;
        Ok(())
    }
}

/// Fallback when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, channel: &str) -> Result<()> {
        warn!(channel, "{message}");
        Ok(())
    }
}

pub async fn notify_best_effort(notifier: &dyn Notifier, message: &str, channel: &str) {
    if let Err(err) = notifier.notify(message, channel).await {
        warn!(error = %format!("{err:#}"), channel, "alert delivery failed");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub raised_at: DateTime<Utc>,
    pub table: Option<TableKind>,
    pub channel: String,
    pub message: String,
}

/// Alerts a long-running scheduler keeps in memory; older ones are dropped first.
pub const ALERT_RETENTION: usize = 1000;

/// Bounded alert log shared across table runs. Every alert gets a sequence number so a run can
/// collect what it raised with [`AlertSink::mark`] and [`AlertSink::since`].
#[derive(Debug, Clone)]
pub struct AlertSink {
    inner: Arc<Mutex<AlertLog>>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct AlertLog {
    alerts: VecDeque<Alert>,
    pushed: u64,
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::with_capacity(ALERT_RETENTION)
    }
}

impl AlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    fn log(&self) -> MutexGuard<'_, AlertLog> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, alert: Alert) {
        let mut log = self.log();
        if log.alerts.len() == self.capacity {
            log.alerts.pop_front();
        }
        log.alerts.push_back(alert);
        log.pushed += 1;
    }

    /// Sequence number the next pushed alert will get.
    pub fn mark(&self) -> u64 {
        self.log().pushed
    }

    /// Retained alerts pushed at or after `mark`, oldest first.
    pub fn since(&self, mark: u64) -> Vec<Alert> {
        let log = self.log();
        let first_retained = log.pushed - log.alerts.len() as u64;
        let skip = mark.saturating_sub(first_retained);
        log.alerts
            .iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.log().alerts.iter().cloned().collect()
    }

    pub fn for_table(&self, kind: TableKind) -> Vec<Alert> {
        self.snapshot()
            .into_iter()
            .filter(|a| a.table == Some(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _message: &str, _channel: &str) -> Result<()> {
            anyhow::bail!("webhook down")
        }
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        notify_best_effort(&FailingNotifier, "archive mismatch", "#feeds").await;
    }

    #[test]
    fn sink_accepts_writes_from_many_threads() {
        let sink = AlertSink::new();
        let handles = (0..8)
            .map(|i| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    sink.push(Alert {
                        raised_at: Utc::now(),
                        table: Some(TableKind::ALL[i % 3]),
                        channel: "#feeds".into(),
                        message: format!("alert {i}"),
                    })
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.snapshot().len(), 8);
        assert_eq!(sink.for_table(TableKind::Events).len(), 3);
    }

    fn alert(message: &str) -> Alert {
        Alert {
            raised_at: Utc::now(),
            table: None,
            channel: "#feeds".into(),
            message: message.into(),
        }
    }

    #[test]
    fn since_returns_only_alerts_after_the_mark() {
        let sink = AlertSink::new();
        sink.push(alert("first run"));
        let mark = sink.mark();
        assert!(sink.since(mark).is_empty());
        sink.push(alert("second run"));
        let later = sink.since(mark);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].message, "second run");
    }

    #[test]
    fn retention_drops_oldest_and_keeps_marks_valid() {
        let sink = AlertSink::with_capacity(3);
        for i in 0..5 {
            sink.push(alert(&format!("alert {i}")));
        }
        let kept = sink.snapshot().into_iter().map(|a| a.message).collect::<Vec<_>>();
        assert_eq!(kept, ["alert 2", "alert 3", "alert 4"]);
        assert_eq!(sink.mark(), 5);

        let since_three = sink.since(3).into_iter().map(|a| a.message).collect::<Vec<_>>();
        assert_eq!(since_three, ["alert 3", "alert 4"]);
        // an evicted mark yields whatever is still retained
        assert_eq!(sink.since(0).len(), 3);
    }
}
