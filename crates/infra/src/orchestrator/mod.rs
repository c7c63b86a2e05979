//! Explicitly constructed orchestrator: submitter, poller loop and notifier
//! worker, owned by whoever calls `Orchestrator::start`.
//!
//! There is no process-wide state. Dropping the handle without `shutdown`
//! leaves the tasks running until the runtime stops.

pub mod poller;
mod refunds;
pub mod service;
pub mod submitter;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use genforge_providers::ProviderRegistry;

use crate::config::OrchestratorConfig;
use crate::jobs::JobStore;
use crate::ledger::CreditLedger;
use crate::materializer::ResultMaterializer;
use crate::notifier::{self, NotificationSink, Notifier, NotifierHandle};
use crate::storage::ObjectStorage;

pub use poller::{PollerError, StatusPoller, SweepReport};
pub use refunds::RefundError;
pub use service::{GenerationService, JobPage, JobView, ServiceError};
pub use submitter::{JobSubmitter, SubmitError, SubmitReceipt, SubmitRequest};

/// Collaborators injected into the orchestrator.
pub struct OrchestratorDeps {
    pub ledger: Arc<dyn CreditLedger>,
    pub jobs: Arc<dyn JobStore>,
    pub providers: ProviderRegistry,
    pub storage: Arc<dyn ObjectStorage>,
    pub sink: Arc<dyn NotificationSink>,
    pub http: reqwest::Client,
}

#[derive(Debug)]
pub struct Orchestrator;

impl Orchestrator {
    /// Spawn the poller loop and the notification worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: OrchestratorConfig, deps: OrchestratorDeps) -> OrchestratorHandle {
        let OrchestratorDeps {
            ledger,
            jobs,
            providers,
            storage,
            sink,
            http,
        } = deps;

        let (notifier, notifier_handle) = notifier::spawn(config.notify_queue_capacity, sink);
        let materializer = ResultMaterializer::new(http, storage, config.download_timeout)
            .with_max_bytes(config.max_asset_bytes);

        let submitter = Arc::new(JobSubmitter::new(
            ledger.clone(),
            jobs.clone(),
            providers.clone(),
            config.provider_call_timeout,
        ));
        let service = GenerationService::new(submitter, jobs.clone(), ledger.clone());

        let poller = Arc::new(StatusPoller::new(
            jobs,
            ledger,
            providers,
            materializer,
            notifier.clone(),
            config.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(poll_loop(poller.clone(), config.poll_interval, shutdown_rx));
        info!(
            interval_secs = config.poll_interval.as_secs(),
            concurrency = config.poll_concurrency,
            "orchestrator started"
        );

        OrchestratorHandle {
            service,
            poller,
            notifier,
            shutdown: shutdown_tx,
            poll_join: Some(join),
            notifier_handle,
        }
    }
}

/// Handle to reach and stop a running orchestrator.
#[derive(Debug)]
pub struct OrchestratorHandle {
    service: GenerationService,
    poller: Arc<StatusPoller>,
    notifier: Notifier,
    shutdown: watch::Sender<bool>,
    poll_join: Option<JoinHandle<()>>,
    notifier_handle: NotifierHandle,
}

impl OrchestratorHandle {
    pub fn service(&self) -> &GenerationService {
        &self.service
    }

    /// Direct access for driving sweeps outside the schedule.
    pub fn poller(&self) -> Arc<StatusPoller> {
        self.poller.clone()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Let the in-flight sweep finish, stop the loop, then drain pending
    /// notifications.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.poll_join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "poller task ended abnormally");
            }
        }
        self.notifier_handle.shutdown().await;
        info!("orchestrator stopped");
    }
}

async fn poll_loop(poller: Arc<StatusPoller>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => match poller.run_sweep().await {
                Ok(report) if report.is_idle() => debug!("sweep idle"),
                Ok(report) => info!(
                    claimed = report.claimed,
                    completed = report.completed,
                    failed = report.failed,
                    waiting = report.waiting,
                    skipped = report.skipped,
                    refunds = report.refunds,
                    abandoned = report.abandoned,
                    "sweep finished"
                ),
                Err(e) => error!(error = %e, "sweep failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("poller loop stopped");
}
