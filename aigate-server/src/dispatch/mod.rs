//! Running the analyzer, locally or through the tiered queues.
//!
//! Both paths share one success criterion: the completion artifact
//! `<repository_path>.csv` exists once the analyzer is done.

mod queue;

pub use queue::{HttpQueueClient, QueueClientConfig, QueueError, QueueMessage, QueueSender};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use aigate_core::{estimate_changed_lines, select_tier, ChangedFile, QueueTier, TierThresholds};

use crate::error::OrchestratorError;
use crate::telemetry::Telemetry;
use crate::workspace::{artifact_path, log_path};

/// Endpoints for each queue tier. A missing endpoint means the tier is
/// unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueEndpoints {
    pub small: Option<String>,
    pub medium: Option<String>,
    pub large: Option<String>,
}

impl QueueEndpoints {
    pub fn endpoint(&self, tier: QueueTier) -> Option<&str> {
        match tier {
            QueueTier::Small => self.small.as_deref(),
            QueueTier::Medium => self.medium.as_deref(),
            QueueTier::Large => self.large.as_deref(),
        }
    }

    pub fn any(&self) -> bool {
        self.small.is_some() || self.medium.is_some() || self.large.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub queues: QueueEndpoints,
    pub thresholds: TierThresholds,
    pub poll_interval: Duration,
    /// After this long the check run is told the analysis is delayed.
    pub soft_timeout: Duration,
    /// After this long polling gives up.
    pub hard_timeout: Duration,
    pub analyzer_path: PathBuf,
    pub debug: bool,
    pub test_mode: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queues: QueueEndpoints::default(),
            thresholds: TierThresholds::default(),
            poll_interval: Duration::from_secs(30),
            soft_timeout: Duration::from_secs(900),
            hard_timeout: Duration::from_secs(3600),
            analyzer_path: PathBuf::from("analyzer"),
            debug: false,
            test_mode: false,
        }
    }
}

impl DispatchConfig {
    pub fn remote_eligible(&self) -> bool {
        !self.debug && !self.test_mode && self.queues.any()
    }
}

/// Number of poll attempts before `timeout` is reached, counted from zero.
///
/// Each attempt sleeps one interval before checking, so attempt `n` checks
/// at `(n + 1) * interval` and the last attempt lands on the boundary.
pub fn poll_attempts(timeout: Duration, interval: Duration) -> u64 {
    let interval = interval.as_millis().max(1);
    let attempts = timeout.as_millis().div_ceil(interval);
    attempts.saturating_sub(1).min(u64::MAX as u128) as u64
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("analysis did not complete within {}s", .waited.as_secs())]
    Timeout { waited: Duration },

    #[error("{message}")]
    Failed { message: String },
}

impl DispatchError {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Notified while a remote analysis is running.
#[async_trait]
pub trait AnalysisProgress: Send + Sync {
    /// The soft timeout elapsed and polling continues.
    async fn analysis_delayed(&self, waited: Duration);
}

/// Identifies the analysis for logging and telemetry.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub pr_number: u64,
    pub correlation_id: Option<&'a str>,
}

pub struct AnalysisDispatcher {
    config: DispatchConfig,
    queue: Arc<dyn QueueSender>,
    telemetry: Telemetry,
}

enum Route {
    Local,
    Remote,
}

impl AnalysisDispatcher {
    pub fn new(config: DispatchConfig, queue: Arc<dyn QueueSender>, telemetry: Telemetry) -> Self {
        Self {
            config,
            queue,
            telemetry,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Analyse the checked-out repository and return the artifact path.
    pub async fn analyze_files(
        &self,
        repository_path: &Path,
        changed_files: &[ChangedFile],
        ctx: DispatchContext<'_>,
        progress: &dyn AnalysisProgress,
    ) -> Result<PathBuf, DispatchError> {
        if !self.config.remote_eligible() {
            info!("PR #{}: running analyzer locally", ctx.pr_number);
            return self.run_local(repository_path).await;
        }

        match self.enqueue(repository_path, changed_files, ctx).await {
            Route::Local => self.run_local(repository_path).await,
            Route::Remote => self.poll_for_artifact(repository_path, ctx, progress).await,
        }
    }

    async fn enqueue(
        &self,
        repository_path: &Path,
        changed_files: &[ChangedFile],
        ctx: DispatchContext<'_>,
    ) -> Route {
        let changed_lines = estimate_changed_lines(changed_files);
        let tier = match select_tier(changed_lines, &self.config.thresholds) {
            Ok(tier) => tier,
            Err(e) => {
                // No queue is selected and nothing is enqueued; polling still runs.
                let err = OrchestratorError::from(e);
                self.telemetry
                    .report("dispatch", err.kind(), Some(ctx.pr_number), &err);
                return Route::Remote;
            }
        };

        let Some(endpoint) = self.config.queues.endpoint(tier) else {
            warn!(
                "PR #{}: no endpoint for {} queue, falling back to local analysis",
                ctx.pr_number, tier
            );
            return Route::Local;
        };

        let message = QueueMessage {
            repository_path: repository_path.to_string_lossy().into_owned(),
            selective: true,
        };
        match self.queue.send(endpoint, &message, ctx.correlation_id).await {
            Ok(()) => {
                info!(
                    "PR #{}: {} changed lines, enqueued on {} queue",
                    ctx.pr_number, changed_lines, tier
                );
                Route::Remote
            }
            Err(e) => {
                let err = OrchestratorError::from(e);
                self.telemetry
                    .report("dispatch", err.kind(), Some(ctx.pr_number), &err);
                warn!(
                    "PR #{}: {} queue unavailable, falling back to local analysis",
                    ctx.pr_number, tier
                );
                Route::Local
            }
        }
    }

    async fn poll_for_artifact(
        &self,
        repository_path: &Path,
        ctx: DispatchContext<'_>,
        progress: &dyn AnalysisProgress,
    ) -> Result<PathBuf, DispatchError> {
        let artifact = artifact_path(repository_path);
        let interval = self.config.poll_interval;
        let soft_attempts = poll_attempts(self.config.soft_timeout, interval);
        let hard_attempts = poll_attempts(self.config.hard_timeout, interval);

        let mut attempt: u64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            let waited = interval * (attempt as u32 + 1);

            if artifact.exists() {
                info!(
                    "PR #{}: analysis artifact found after {}s",
                    ctx.pr_number,
                    waited.as_secs()
                );
                return Ok(artifact);
            }
            if attempt == soft_attempts {
                warn!(
                    "PR #{}: analysis still running after {}s",
                    ctx.pr_number,
                    waited.as_secs()
                );
                progress.analysis_delayed(waited).await;
            }
            if attempt >= hard_attempts {
                return Err(DispatchError::Timeout { waited });
            }
            attempt += 1;
        }
    }

    async fn run_local(&self, repository_path: &Path) -> Result<PathBuf, DispatchError> {
        let mut command = Command::new(&self.config.analyzer_path);
        command.arg(repository_path).arg("--selective");

        if !self.config.debug {
            let log = log_path(repository_path);
            let stdout = std::fs::File::create(&log).map_err(|e| {
                DispatchError::failed(format!("cannot create {}: {}", log.display(), e))
            })?;
            let stderr = stdout
                .try_clone()
                .map_err(|e| DispatchError::failed(format!("cannot clone log handle: {}", e)))?;
            command
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr));
        }

        let status = command.status().await.map_err(|e| {
            DispatchError::failed(format!(
                "failed to start analyzer {}: {}",
                self.config.analyzer_path.display(),
                e
            ))
        })?;
        if !status.success() {
            return Err(DispatchError::failed(format!(
                "analyzer exited with {}",
                status
            )));
        }

        let artifact = artifact_path(repository_path);
        if !artifact.exists() {
            return Err(DispatchError::failed(format!(
                "analyzer finished without producing {}",
                artifact.display()
            )));
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue {
        sent: Mutex<Vec<(String, QueueMessage)>>,
        reject: bool,
    }

    #[async_trait]
    impl QueueSender for RecordingQueue {
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
            if self.reject {
                Err(QueueError::Rejected { status: 503 })
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        delayed: AtomicUsize,
    }

    #[async_trait]
    impl AnalysisProgress for CountingProgress {
        async fn analysis_delayed(&self, _waited: Duration) {
            self.delayed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn remote_config(analyzer: &str) -> DispatchConfig {
        DispatchConfig {
            queues: QueueEndpoints {
                small: Some("http://queue/small".to_string()),
                medium: Some("http://queue/medium".to_string()),
                large: Some("http://queue/large".to_string()),
            },
            thresholds: TierThresholds {
                small: 100,
                medium: 500,
                large: 1_000,
            },
            poll_interval: Duration::from_secs(30),
            soft_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(120),
            analyzer_path: PathBuf::from(analyzer),
            debug: false,
            test_mode: false,
        }
    }

    fn changed(lines: u64) -> Vec<ChangedFile> {
        vec![ChangedFile {
            path: "src/lib.rs".to_string(),
            additions: lines,
            deletions: 0,
            binary: false,
        }]
    }

    fn ctx() -> DispatchContext<'static> {
        DispatchContext {
            pr_number: 42,
            correlation_id: None,
        }
    }

    #[test]
    fn test_poll_attempts() {
        let interval = Duration::from_secs(30);
        assert_eq!(poll_attempts(Duration::from_secs(120), interval), 3);
        assert_eq!(poll_attempts(Duration::from_secs(100), interval), 3);
        assert_eq!(poll_attempts(Duration::from_secs(30), interval), 0);
        assert_eq!(poll_attempts(Duration::ZERO, interval), 0);
    }

    #[test]
    fn test_remote_eligibility() {
        let config = remote_config("analyzer");
        assert!(config.remote_eligible());
        assert!(!DispatchConfig {
            debug: true,
            ..config.clone()
        }
        .remote_eligible());
        assert!(!DispatchConfig {
            test_mode: true,
            ..config.clone()
        }
        .remote_eligible());
        assert!(!DispatchConfig::default().remote_eligible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_artifact_found_on_second_poll() {
        let dir = tempfile::tempdir().unwrap();
        let repository = dir.path().join("repository");
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher =
            AnalysisDispatcher::new(remote_config("analyzer"), queue.clone(), Telemetry::new());

        let artifact = artifact_path(&repository);
        let writer = tokio::spawn({
            let artifact = artifact.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(45)).await;
                std::fs::write(&artifact, "path,total_lines,ai_pure_lines,ai_blended_lines\n")
                    .unwrap();
            }
        });

        let progress = CountingProgress::default();
        let found = dispatcher
            .analyze_files(&repository, &changed(150), ctx(), &progress)
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(found, artifact);
        let sent = queue.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "http://queue/medium");
        assert!(sent[0].1.selective);
        assert_eq!(progress.delayed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout_warns_once_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = AnalysisDispatcher::new(
            remote_config("analyzer"),
            Arc::new(RecordingQueue::default()),
            Telemetry::new(),
        );
        let progress = CountingProgress::default();
        let start = tokio::time::Instant::now();

        let err = dispatcher
            .analyze_files(&dir.path().join("repository"), &changed(10), ctx(), &progress)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout { waited } if waited == Duration::from_secs(120)));
        assert_eq!(start.elapsed(), Duration::from_secs(120));
        assert_eq!(progress.delayed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassifiable_count_is_telemetered_and_still_polls() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(RecordingQueue::default());
        let telemetry = Telemetry::new();
        let dispatcher =
            AnalysisDispatcher::new(remote_config("analyzer"), queue.clone(), telemetry.clone());

        let err = dispatcher
            .analyze_files(
                &dir.path().join("repository"),
                &changed(5_000),
                ctx(),
                &CountingProgress::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert!(queue.sent.lock().unwrap().is_empty());
        assert_eq!(telemetry.reported_errors(), 1);
    }

    #[cfg(unix)]
    fn write_analyzer(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("analyzer.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_enqueue_failure_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = write_analyzer(dir.path(), "echo 'path,total_lines,ai_pure_lines,ai_blended_lines' > \"$1.csv\"");
        let repository = dir.path().join("repository");
        std::fs::create_dir_all(&repository).unwrap();

        let queue = Arc::new(RecordingQueue {
            reject: true,
            ..Default::default()
        });
        let telemetry = Telemetry::new();
        let dispatcher = AnalysisDispatcher::new(
            remote_config(analyzer.to_str().unwrap()),
            queue.clone(),
            telemetry.clone(),
        );

        let artifact = dispatcher
            .analyze_files(&repository, &changed(10), ctx(), &CountingProgress::default())
            .await
            .unwrap();
        assert_eq!(artifact, artifact_path(&repository));
        assert_eq!(queue.sent.lock().unwrap()[0].0, "http://queue/small");
        assert_eq!(telemetry.reported_errors(), 1);
        assert!(log_path(&repository).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = write_analyzer(dir.path(), "echo crashed >&2\nexit 3");
        let repository = dir.path().join("repository");
        std::fs::create_dir_all(&repository).unwrap();

        let config = DispatchConfig {
            analyzer_path: analyzer,
            test_mode: true,
            ..DispatchConfig::default()
        };
        let dispatcher = AnalysisDispatcher::new(
            config,
            Arc::new(RecordingQueue::default()),
            Telemetry::new(),
        );

        let err = dispatcher
            .analyze_files(&repository, &changed(10), ctx(), &CountingProgress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Failed { .. }));
        let log = std::fs::read_to_string(log_path(&repository)).unwrap();
        assert!(log.contains("crashed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_success_without_artifact_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = write_analyzer(dir.path(), "exit 0");
        let repository = dir.path().join("repository");
        std::fs::create_dir_all(&repository).unwrap();

        let dispatcher = AnalysisDispatcher::new(
            DispatchConfig {
                analyzer_path: analyzer,
                test_mode: true,
                ..DispatchConfig::default()
            },
            Arc::new(RecordingQueue::default()),
            Telemetry::new(),
        );
        let err = dispatcher
            .analyze_files(&repository, &[], ctx(), &CountingProgress::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without producing"));
    }
}
