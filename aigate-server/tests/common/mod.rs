//! In-memory collaborators for driving the orchestrator end to end.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use aigate_core::{
    ChangedFile, CheckRunId, CheckRunOutput, Commit, CommitSha, CompositionPercentages,
    EventRepository, NewStatusCheck, OrganizationSettings, Provider, PullRequest,
    PullRequestAction, PullRequestEvent, PullRequestId, RepositoryId, RepositoryRecord, Rule,
    StatusCheck, TierThresholds,
};
use aigate_server::check_run::{
    CheckRunGateway, CheckRunGateways, CheckRunHandle, CompleteCheckRun, CreateCheckRun,
    GatewayError,
};
use aigate_server::dispatch::{
    AnalysisDispatcher, DispatchConfig, QueueEndpoints, QueueError, QueueMessage, QueueSender,
};
use aigate_server::download::{DownloadError, DownloadedRepository, Downloader};
use aigate_server::importer::{ArtifactImporter, ImportConfig, Importer};
use aigate_server::store::{InMemoryStore, Store, StoreError};
use aigate_server::workspace::Workspace;
use aigate_server::{PullRequestOrchestrator, Telemetry};

pub const ARTIFACT_HEADER: &str = "path,total_lines,ai_pure_lines,ai_blended_lines\n";

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Create(CreateCheckRun),
    Update(CheckRunOutput),
    Complete(CheckRunId, CompleteCheckRun),
}

/// Records every call, failed ones included; ids are `run-1`, `run-2`, ...
#[derive(Default)]
pub struct FakeGateway {
    pub calls: Mutex<Vec<GatewayCall>>,
    next_id: AtomicU64,
    /// Number of upcoming `create` calls that fail.
    pub failing_creates: AtomicUsize,
    /// Number of upcoming `complete` calls that fail.
    pub failing_completes: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn provider_outage() -> GatewayError {
    GatewayError::Api {
        provider: Provider::GitHub,
        status: 502,
        body: "bad gateway".to_string(),
    }
}

impl FakeGateway {
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<CompleteCheckRun> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Complete(_, request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn creations(&self) -> Vec<CreateCheckRun> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Create(request) => Some(request),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CheckRunGateway for FakeGateway {
    async fn create(
        &self,
        _event: &PullRequestEvent,
        request: CreateCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push(GatewayCall::Create(request));
        if take_failure(&self.failing_creates) {
            return Err(provider_outage());
        }
        let id = format!("run-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(CheckRunHandle {
            id: CheckRunId(id.clone()),
            external_data: json!({ "check_run_id": id }),
        })
    }

    async fn update(
        &self,
        _event: &PullRequestEvent,
        _id: &CheckRunId,
        output: CheckRunOutput,
    ) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push(GatewayCall::Update(output));
        Ok(())
    }

    async fn complete(
        &self,
        _event: &PullRequestEvent,
        id: &CheckRunId,
        request: CompleteCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push(GatewayCall::Complete(id.clone(), request));
        if take_failure(&self.failing_completes) {
            return Err(provider_outage());
        }
        Ok(CheckRunHandle {
            id: id.clone(),
            external_data: json!({ "check_run_id": id.0 }),
        })
    }
}

/// Creates the checkout directory and reports a fixed change set.
pub struct FakeDownloader {
    pub changed_files: Vec<ChangedFile>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(
        &self,
        event: &PullRequestEvent,
        _repository: &RepositoryRecord,
        destination: &Path,
    ) -> Result<DownloadedRepository, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DownloadError::Git {
                command: "fetch".to_string(),
                stderr: "fatal: could not read from remote repository".to_string(),
            });
        }
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(DownloadError::Spawn)?;
        Ok(DownloadedRepository {
            commits: vec![event.head_sha.0.clone()],
            changed_files: self.changed_files.clone(),
        })
    }
}

/// Accepts every message and, after `delay`, writes the completion artifact
/// the way a queue worker would.
pub struct ArtifactQueue {
    pub artifact: String,
    pub delay: Option<Duration>,
    pub sent: Mutex<Vec<(String, QueueMessage)>>,
}

impl ArtifactQueue {
    pub fn sent(&self) -> Vec<(String, QueueMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueSender for ArtifactQueue {
    async fn send(
        &self,
        endpoint: &str,
        message: &QueueMessage,
        _correlation_id: Option<&str>,
    ) -> Result<(), QueueError> {
        self.sent
            .lock()
            .unwrap()
            .push((endpoint.to_string(), message.clone()));
        if let Some(delay) = self.delay {
            let path = format!("{}.csv", message.repository_path);
            let contents = self.artifact.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                std::fs::write(path, contents).unwrap();
            });
        }
        Ok(())
    }
}

/// Delegates to an in-memory store, but can refuse audit rows.
pub struct AuditFailingStore {
    pub inner: Arc<InMemoryStore>,
    pub fail_status_checks: AtomicBool,
}

#[async_trait]
impl Store for AuditFailingStore {
    async fn find_repositories(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Vec<RepositoryRecord>, StoreError> {
        self.inner.find_repositories(provider, external_id).await
    }

    async fn organization_settings(
        &self,
        organization_id: i64,
    ) -> Result<OrganizationSettings, StoreError> {
        self.inner.organization_settings(organization_id).await
    }

    async fn organization_rules(&self, organization_id: i64) -> Result<Vec<Rule>, StoreError> {
        self.inner.organization_rules(organization_id).await
    }

    async fn group_rules(&self, group_id: i64) -> Result<Vec<Rule>, StoreError> {
        self.inner.group_rules(group_id).await
    }

    async fn get_or_create_commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Commit, StoreError> {
        self.inner.get_or_create_commit(repository_id, sha).await
    }

    async fn commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Option<Commit>, StoreError> {
        self.inner.commit(repository_id, sha).await
    }

    async fn update_commit(&self, commit: &Commit) -> Result<(), StoreError> {
        self.inner.update_commit(commit).await
    }

    async fn upsert_pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
        base_sha: &CommitSha,
        head_sha: &CommitSha,
    ) -> Result<PullRequest, StoreError> {
        self.inner
            .upsert_pull_request(repository_id, pr_number, base_sha, head_sha)
            .await
    }

    async fn pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
    ) -> Result<Option<PullRequest>, StoreError> {
        self.inner.pull_request(repository_id, pr_number).await
    }

    async fn set_pull_requests_closed(
        &self,
        repository_ids: &[RepositoryId],
        pr_number: u64,
        closed: bool,
    ) -> Result<usize, StoreError> {
        self.inner
            .set_pull_requests_closed(repository_ids, pr_number, closed)
            .await
    }

    async fn cache_composition(
        &self,
        pull_request_id: PullRequestId,
        composition: &CompositionPercentages,
    ) -> Result<(), StoreError> {
        self.inner
            .cache_composition(pull_request_id, composition)
            .await
    }

    async fn latest_status_check(
        &self,
        pull_request_ids: &[PullRequestId],
    ) -> Result<Option<StatusCheck>, StoreError> {
        self.inner.latest_status_check(pull_request_ids).await
    }

    async fn insert_status_check(&self, check: NewStatusCheck) -> Result<StatusCheck, StoreError> {
        if self.fail_status_checks.load(Ordering::SeqCst) {
            return Err(StoreError::storage("insert status check", "disk I/O error"));
        }
        self.inner.insert_status_check(check).await
    }

    async fn status_checks(
        &self,
        pull_request_id: PullRequestId,
    ) -> Result<Vec<StatusCheck>, StoreError> {
        self.inner.status_checks(pull_request_id).await
    }
}

pub struct HarnessOptions {
    pub changed_lines: u64,
    /// Artifact rows after the header.
    pub artifact_rows: String,
    /// `None` means the artifact never appears.
    pub artifact_delay: Option<Duration>,
    pub fail_download: bool,
    pub mark_as_failed: bool,
    pub rules: Vec<Rule>,
    pub register_gateway: bool,
    pub fail_status_checks: bool,
    /// Run this program as the analyzer locally instead of using queues.
    pub local_analyzer: Option<PathBuf>,
    pub import: ImportConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            changed_lines: 150,
            artifact_rows: "src/lib.rs,150,15,15\n".to_string(),
            artifact_delay: Some(Duration::from_secs(45)),
            fail_download: false,
            mark_as_failed: true,
            rules: Vec::new(),
            register_gateway: true,
            fail_status_checks: false,
            local_analyzer: None,
            import: ImportConfig::default(),
        }
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub downloader: Arc<FakeDownloader>,
    pub queue: Arc<ArtifactQueue>,
    pub telemetry: Telemetry,
    pub orchestrator: PullRequestOrchestrator,
    pub workspace: TempDir,
}

pub fn repository(id: i64, organization_id: i64) -> RepositoryRecord {
    RepositoryRecord {
        id: RepositoryId(id),
        organization_id,
        group_id: Some(10),
        provider: Provider::GitHub,
        external_id: "99".to_string(),
        installation_id: Some(7),
        full_name: "acme/widgets".to_string(),
        status_check_enabled: true,
    }
}

pub fn event(action: PullRequestAction, head_sha: &str) -> PullRequestEvent {
    PullRequestEvent {
        provider: Provider::GitHub,
        action,
        merged: false,
        repository: EventRepository {
            external_id: "99".to_string(),
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            clone_url: "https://github.com/acme/widgets.git".to_string(),
        },
        installation_id: Some(7),
        pr_number: 42,
        base_sha: CommitSha::from("base000"),
        head_sha: CommitSha::from(head_sha),
        correlation_id: Some("test-correlation".to_string()),
    }
}

pub fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        queues: QueueEndpoints {
            small: Some("http://queue/small".to_string()),
            medium: Some("http://queue/medium".to_string()),
            large: Some("http://queue/large".to_string()),
        },
        thresholds: TierThresholds {
            small: 100,
            medium: 500,
            large: u64::MAX,
        },
        poll_interval: Duration::from_secs(30),
        soft_timeout: Duration::from_secs(60),
        hard_timeout: Duration::from_secs(120),
        ..DispatchConfig::default()
    }
}

impl Harness {
    pub async fn new(options: HarnessOptions) -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.add_repository(repository(1, 1)).await;
        store
            .set_organization_settings(
                1,
                OrganizationSettings {
                    status_check_mark_as_failed: options.mark_as_failed,
                },
            )
            .await;
        for rule in options.rules {
            store.add_organization_rule(1, rule).await;
        }

        let gateway = Arc::new(FakeGateway::default());
        let mut gateways = CheckRunGateways::new();
        if options.register_gateway {
            gateways.register(Provider::GitHub, gateway.clone());
        }

        let downloader = Arc::new(FakeDownloader {
            changed_files: vec![ChangedFile {
                path: "src/lib.rs".to_string(),
                additions: options.changed_lines,
                deletions: 0,
                binary: false,
            }],
            fail: options.fail_download,
            calls: AtomicUsize::new(0),
        });
        let queue = Arc::new(ArtifactQueue {
            artifact: format!("{}{}", ARTIFACT_HEADER, options.artifact_rows),
            delay: options.artifact_delay,
            sent: Mutex::new(Vec::new()),
        });

        let mut dispatch = dispatch_config();
        if let Some(analyzer) = options.local_analyzer {
            dispatch.analyzer_path = analyzer;
            dispatch.test_mode = true;
        }

        let orchestrator_store = Arc::new(AuditFailingStore {
            inner: store.clone(),
            fail_status_checks: AtomicBool::new(options.fail_status_checks),
        });

        let telemetry = Telemetry::new();
        let workspace = tempfile::tempdir().unwrap();
        let orchestrator = PullRequestOrchestrator::new(
            orchestrator_store,
            gateways,
            downloader.clone(),
            AnalysisDispatcher::new(dispatch, queue.clone(), telemetry.clone()),
            Importer::new(Arc::new(ArtifactImporter::new(store.clone())), options.import),
            Workspace::new(workspace.path()),
            telemetry.clone(),
        )
        .with_details_base_url(Some("https://aigate.example.com".to_string()));

        Self {
            store,
            gateway,
            downloader,
            queue,
            telemetry,
            orchestrator,
            workspace,
        }
    }
}
