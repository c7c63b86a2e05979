use std::sync::Arc;

use anyhow::Context;

use genforge_infra::config::{InfraSettings, OrchestratorConfig};
use genforge_infra::db;
use genforge_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use genforge_infra::ledger::{CreditLedger, InMemoryCreditLedger, PostgresCreditLedger};
use genforge_infra::notifier::{LogSink, NotificationSink, WebhookSink};
use genforge_infra::orchestrator::{Orchestrator, OrchestratorDeps};
use genforge_infra::storage::FsObjectStorage;
use genforge_providers::ProviderSettings;

const DB_MAX_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    genforge_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator config")?;
    let settings = InfraSettings::from_env().context("invalid infra settings")?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("genforge-worker/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build http client")?;

    let providers = ProviderSettings::from_env().build_registry(http.clone());
    if providers.is_empty() {
        tracing::warn!("no provider credentials configured; every submission will be rejected");
    }

    let (ledger, jobs): (Arc<dyn CreditLedger>, Arc<dyn JobStore>) = match &settings.database_url {
        Some(url) => {
            let pool = db::connect(url, DB_MAX_CONNECTIONS)
                .await
                .context("failed to connect to postgres")?;
            db::migrate(&pool).await.context("failed to apply schema")?;
            tracing::info!("using postgres stores");
            (
                Arc::new(PostgresCreditLedger::new(pool.clone())),
                Arc::new(PostgresJobStore::new(pool)),
            )
        }
        None => {
            tracing::warn!("USE_PERSISTENT_STORES not set; state is lost on restart");
            (Arc::new(InMemoryCreditLedger::new()), Arc::new(InMemoryJobStore::new()))
        }
    };

    let sink: Arc<dyn NotificationSink> = match &settings.notify_webhook_url {
        Some(url) => Arc::new(WebhookSink::new(http.clone(), url.clone())),
        None => Arc::new(LogSink),
    };

    let storage = Arc::new(FsObjectStorage::new(
        settings.storage_root.clone(),
        settings.storage_public_base_url.clone(),
    ));
    tracing::info!(root = %storage.root().display(), "filesystem object storage");

    tracing::info!(providers = ?providers.ids(), "starting generation worker");
    let handle = Orchestrator::start(
        config,
        OrchestratorDeps {
            ledger,
            jobs,
            providers,
            storage,
            sink,
            http,
        },
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    handle.shutdown().await;
    Ok(())
}
