//! Stakeholder notification.
//!
//! Delivery is fire-and-forget from the workflow's point of view: callers go
//! through [`deliver`], which logs delivery failures and never propagates them.

use crate::error::{DrError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Free-form key/value context attached to a notification.
pub type NotificationContext = BTreeMap<String, String>;

/// Notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs an operator now.
    Critical,
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Delivery channel.
    pub channel: String,
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: NotificationContext,
    /// When the notification was produced.
    pub sent_at: DateTime<Utc>,
}

/// Delivery to email/chat/pager integrations.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    async fn notify(
        &self,
        channel: &str,
        severity: Severity,
        message: &str,
        context: &NotificationContext,
    ) -> Result<()>;
}

/// Deliver through `notifier` within `limit`, logging instead of
/// propagating failures. A sink that does not answer in time is abandoned.
pub async fn deliver(
    notifier: &dyn Notifier,
    channel: &str,
    severity: Severity,
    message: &str,
    context: &NotificationContext,
    limit: Duration,
) {
    match tokio::time::timeout(limit, notifier.notify(channel, severity, message, context)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(channel, ?severity, error = %e, "notification delivery failed"),
        Err(_) => error!(channel, ?severity, ?limit, "notification delivery timed out"),
    }
}

/// Writes notifications to the structured log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        channel: &str,
        severity: Severity,
        message: &str,
        context: &NotificationContext,
    ) -> Result<()> {
        match severity {
            Severity::Info => info!(channel, ?context, "{}", message),
            Severity::Warning => warn!(channel, ?context, "{}", message),
            Severity::Critical => error!(channel, ?context, "{}", message),
        }
        Ok(())
    }
}

/// POSTs notifications as JSON to a set of webhook URLs.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl WebhookNotifier {
    /// Create a notifier posting to every URL in `urls`. `timeout` bounds
    /// each request.
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DrError::Collaborator {
                name: "webhook".to_string(),
                msg: e.to_string(),
            })?;
        Ok(Self { client, urls })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        channel: &str,
        severity: Severity,
        message: &str,
        context: &NotificationContext,
    ) -> Result<()> {
        let body = Notification {
            channel: channel.to_string(),
            severity,
            message: message.to_string(),
            context: context.clone(),
            sent_at: Utc::now(),
        };
        let mut failures = Vec::new();
        for url in &self.urls {
            let result = self.client.post(url).json(&body).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => failures.push(format!("{url}: HTTP {}", resp.status())),
                Err(e) => failures.push(format!("{url}: {e}")),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DrError::Collaborator {
                name: "webhook".to_string(),
                msg: failures.join("; "),
            })
        }
    }
}

/// Sends each notification to every inner notifier.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    /// Create from a list of sinks.
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True when there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(
        &self,
        channel: &str,
        severity: Severity,
        message: &str,
        context: &NotificationContext,
    ) -> Result<()> {
        let results = futures::future::join_all(
            self.sinks
                .iter()
                .map(|s| s.notify(channel, severity, message, context)),
        )
        .await;
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }
}

/// Keeps notifications in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryNotifier {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number delivered so far.
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(
        &self,
        channel: &str,
        severity: Severity,
        message: &str,
        context: &NotificationContext,
    ) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Notification {
                channel: channel.to_string(),
                severity,
                message: message.to_string(),
                context: context.clone(),
                sent_at: Utc::now(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _: &str, _: Severity, _: &str, _: &NotificationContext) -> Result<()> {
            Err(DrError::Collaborator {
                name: "failing".to_string(),
                msg: "down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_memory_notifier_records() {
        let sink = MemoryNotifier::new();
        let mut ctx = NotificationContext::new();
        ctx.insert("region".to_string(), "us-east-1".to_string());
        sink.notify("ops", Severity::Warning, "hello", &ctx).await.unwrap();
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Warning);
        assert_eq!(sent[0].context["region"], "us-east-1");
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_sinks_even_when_one_fails() {
        let a = MemoryNotifier::new();
        let b = MemoryNotifier::new();
        let fanout = FanoutNotifier::new(vec![
            Arc::new(a.clone()),
            Arc::new(Failing),
            Arc::new(b.clone()),
        ]);
        let result = fanout
            .notify("ops", Severity::Critical, "x", &NotificationContext::new())
            .await;
        assert!(result.is_err());
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    struct Stuck;

    #[async_trait]
    impl Notifier for Stuck {
        async fn notify(&self, _: &str, _: Severity, _: &str, _: &NotificationContext) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_deliver_swallows_errors() {
        deliver(
            &Failing,
            "ops",
            Severity::Info,
            "x",
            &NotificationContext::new(),
            Duration::from_secs(1),
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_gives_up_on_stuck_sink() {
        let started = tokio::time::Instant::now();
        deliver(
            &Stuck,
            "ops",
            Severity::Critical,
            "x",
            &NotificationContext::new(),
            Duration::from_secs(5),
        )
        .await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6), "{elapsed:?}");
    }

    #[test]
    fn test_webhook_notifier_builds_with_timeout() {
        let n = WebhookNotifier::new(vec!["http://127.0.0.1:9/hook".into()], Duration::from_secs(2)).unwrap();
        assert_eq!(n.urls.len(), 1);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
