use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

use aigate_core::Provider;
use aigate_server::check_run::{
    AzureDevOpsStatuses, BitbucketReports, CheckRunGateways, GitHubCheckRuns, GitHubClient,
};
use aigate_server::config::Config;
use aigate_server::dispatch::{AnalysisDispatcher, HttpQueueClient};
use aigate_server::download::GitDownloader;
use aigate_server::http::create_api_client;
use aigate_server::importer::{ArtifactImporter, Importer};
use aigate_server::store::{SqliteStore, Store};
use aigate_server::workspace::Workspace;
use aigate_server::{AppState, PullRequestOrchestrator, Telemetry};

const CHECK_RUN_NAME: &str = "AI Code Gate";
const PROVIDER_API_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting aigate {}", aigate_server::get_bot_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    info!("Configuration: {:?}", config);

    let db_path = config.database_path();
    info!("Using state database: {}", db_path.display());
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::new(&db_path).context("Failed to initialize SQLite database")?);

    let mut gateways = CheckRunGateways::new();
    let mut downloader = GitDownloader::new();

    if let Some(github) = &config.github {
        let client = GitHubClient::new(github.app_id, github.private_key.clone())?;
        downloader = downloader.with_github(client.clone());
        gateways.register(
            Provider::GitHub,
            Arc::new(GitHubCheckRuns::new(client, CHECK_RUN_NAME)),
        );
    }
    if let Some(bitbucket) = &config.bitbucket {
        downloader = downloader.with_basic_credentials(
            Provider::Bitbucket,
            bitbucket.username.clone(),
            bitbucket.app_password.clone(),
        );
        gateways.register(
            Provider::Bitbucket,
            Arc::new(BitbucketReports::new(
                create_api_client(Some(PROVIDER_API_TIMEOUT))?,
                bitbucket.username.clone(),
                bitbucket.app_password.clone(),
            )),
        );
    }
    if let Some(azure) = &config.azure_devops {
        downloader = downloader.with_basic_credentials(
            Provider::AzureDevOps,
            "aigate",
            azure.pat.clone(),
        );
        gateways.register(
            Provider::AzureDevOps,
            Arc::new(AzureDevOpsStatuses::new(
                create_api_client(Some(PROVIDER_API_TIMEOUT))?,
                &azure.organization,
                azure.pat.clone(),
            )),
        );
    }
    if gateways.providers().is_empty() {
        warn!("No provider credentials configured; every run will fail to open a check run");
    }

    let telemetry = Telemetry::new();
    let queue = Arc::new(HttpQueueClient::new(config.queue_client)?);
    let dispatcher = AnalysisDispatcher::new(config.dispatch.clone(), queue, telemetry.clone());
    if !config.dispatch.remote_eligible() {
        info!("Queue dispatch disabled; analysis runs locally");
    }
    let importer = Importer::new(Arc::new(ArtifactImporter::new(store.clone())), config.import);

    let orchestrator = PullRequestOrchestrator::new(
        store,
        gateways,
        Arc::new(downloader),
        dispatcher,
        importer,
        Workspace::new(&config.workspace_dir),
        telemetry.clone(),
    )
    .with_details_base_url(config.details_base_url.clone());

    let app_state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        telemetry,
        webhook_secret: config.github_webhook_secret.clone(),
        rerun_auth_token: config.rerun_auth_token.clone(),
    });

    let app = aigate_server::app(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
