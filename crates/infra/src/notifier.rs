//! Best-effort notifications for terminal job outcomes.
//!
//! `Notifier::notify` never blocks and never fails: it `try_send`s onto a
//! bounded queue. A worker task drains the queue into a `NotificationSink`
//! and logs delivery failures. Nothing here feeds back into job state.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use genforge_core::UserId;
use genforge_generation::GenerationJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "user_id", rename_all = "snake_case")]
pub enum Audience {
    User(UserId),
    Operators,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub audience: Audience,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_link: Option<String>,
}

impl Notification {
    pub fn new(audience: Audience, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            audience,
            title: title.into(),
            message: message.into(),
            action_link: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.action_link = Some(link.into());
        self
    }

    /// User-facing message for a completed job.
    pub fn completed(job: &GenerationJob) -> Self {
        let n = Self::new(
            Audience::User(job.owner_id),
            format!("Your {} is ready", job.kind),
            format!("Generation {} finished successfully.", job.id),
        );
        match &job.result_url {
            Some(url) => n.with_link(url.clone()),
            None => n,
        }
    }

    /// User-facing message for a failed job.
    pub fn failed(job: &GenerationJob) -> Self {
        let reason = job
            .error_kind
            .map(|k| k.describe())
            .unwrap_or("the generation failed");
        Self::new(
            Audience::User(job.owner_id),
            format!("Your {} could not be generated", job.kind),
            format!(
                "Generation {} failed: {}. {} credits were returned to your balance.",
                job.id, reason, job.credits_reserved
            ),
        )
    }

    /// Operator-facing message for a failed job.
    pub fn operator_alert(job: &GenerationJob) -> Self {
        Self::new(
            Audience::Operators,
            format!("Generation failed ({})", job.provider),
            format!(
                "job={} user={} kind={} error={} detail={}",
                job.id,
                job.owner_id,
                job.kind,
                job.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                job.error_detail.as_deref().unwrap_or("")
            ),
        )
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("sink rejected notification with status {0}")]
    Status(u16),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            audience = ?n.audience,
            title = %n.title,
            message = %n.message,
            link = n.action_link.as_deref().unwrap_or(""),
            "notification"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Collects notifications; for tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
    delivered: Mutex<Vec<Notification>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InMemorySink {
    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        self.delivered
            .lock()
            .map_err(|_| NotifyError::Delivery("lock poisoned".to_string()))?
            .push(n.clone());
        Ok(())
    }
}

/// Cheap, cloneable enqueue side of the dispatch queue.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Enqueue without waiting. A full or closed queue drops the message.
    pub fn notify(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(title = %n.title, "notification queue full; dropping");
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                warn!(title = %n.title, "notification queue closed; dropping");
            }
        }
    }

    /// User notification plus, for failures, an operator alert.
    pub fn job_finished(&self, job: &GenerationJob) {
        if job.result_url.is_some() {
            self.notify(Notification::completed(job));
        } else {
            self.notify(Notification::failed(job));
            self.notify(Notification::operator_alert(job));
        }
    }
}

/// Handle to stop the delivery worker.
#[derive(Debug)]
pub struct NotifierHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl NotifierHandle {
    /// Stop accepting new work, deliver what is queued, then return.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Spawn the delivery worker and return the enqueue side plus its handle.
pub fn spawn(capacity: usize, sink: Arc<dyn NotificationSink>) -> (Notifier, NotifierHandle) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(delivery_loop(rx, shutdown_rx, sink));
    (
        Notifier { tx },
        NotifierHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        },
    )
}

async fn delivery_loop(
    mut rx: mpsc::Receiver<Notification>,
    mut shutdown: watch::Receiver<bool>,
    sink: Arc<dyn NotificationSink>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(n) => deliver(sink.as_ref(), &n).await,
                None => break,
            },
            _ = shutdown.changed() => {
                rx.close();
                while let Some(n) = rx.recv().await {
                    deliver(sink.as_ref(), &n).await;
                }
                break;
            }
        }
    }
    debug!("notification worker stopped");
}

async fn deliver(sink: &dyn NotificationSink, n: &Notification) {
    if let Err(err) = sink.deliver(n).await {
        warn!(error = %err, title = %n.title, "notification delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genforge_core::JobId;
    use genforge_generation::{ErrorKind, GenerationParams, MediaKind, ProviderId};

    fn failed_job() -> GenerationJob {
        let mut job = GenerationJob::new(
            JobId::new(),
            UserId::new(),
            ProviderId::TaskApi,
            MediaKind::Video,
            GenerationParams::with_prompt("p"),
            30,
        );
        job.fail(ErrorKind::ContentPolicy, "flagged", chrono::Utc::now()).unwrap();
        job
    }

    #[tokio::test]
    async fn failure_notifies_user_and_operators() {
        let sink = Arc::new(InMemorySink::new());
        let (notifier, handle) = spawn(8, sink.clone());

        notifier.job_finished(&failed_job());
        handle.shutdown().await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 2);
        assert!(matches!(delivered[0].audience, Audience::User(_)));
        assert!(delivered[0].message.contains("30 credits"));
        assert_eq!(delivered[1].audience, Audience::Operators);
        assert!(delivered[1].message.contains("content_policy"));
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let notifier = Notifier { tx };

        let n = Notification::new(Audience::Operators, "t", "m");
        notifier.notify(n.clone());
        notifier.notify(n.clone());

        assert_eq!(rx.recv().await, Some(n));
        assert!(rx.try_recv().is_err());
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn deliver(&self, _: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Status(503))
        }
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_worker() {
        let (notifier, handle) = spawn(4, Arc::new(FailingSink));
        notifier.notify(Notification::new(Audience::Operators, "a", "b"));
        notifier.notify(Notification::new(Audience::Operators, "c", "d"));
        handle.shutdown().await;
    }
}
