use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use aigate_core::{FailureKind, Provider, TierSelectionError};

use crate::check_run::GatewayError;
use crate::dispatch::{DispatchError, QueueError};
use crate::store::StoreError;

/// Errors raised while processing a pull request event.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No registered repository with status checks enabled matched the event.
    #[error("no repositories with status checks enabled for {provider} repository {external_id}")]
    NoRepositories {
        provider: Provider,
        external_id: String,
    },

    #[error("failed to download {repository} at {sha}: {message}")]
    DownloadFailed {
        repository: String,
        sha: String,
        message: String,
    },

    #[error("analysis did not complete within {}s", .waited.as_secs())]
    AnalysisTimeout { waited: Duration },

    #[error("analysis failed: {message}")]
    AnalysisFailed { message: String },

    #[error("import failed after {attempts} attempts")]
    ImportFailed { attempts: u32 },

    #[error("queue tier classification failed: {0}")]
    QueueClassification(#[from] TierSelectionError),

    #[error("enqueue failed: {0}")]
    QueueEnqueue(#[from] QueueError),

    #[error("failed to persist status check: {0}")]
    StatusCheckPersistence(StoreError),

    #[error("check run error: {0}")]
    CheckRun(#[from] GatewayError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("workspace error at {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    pub fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }

    /// The failure kind recorded on the commit when this error ends a run.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::DownloadFailed { .. } => FailureKind::DownloadFailed,
            Self::AnalysisTimeout { .. } => FailureKind::AnalysisTimeout,
            Self::AnalysisFailed { .. } => FailureKind::AnalysisFailed,
            Self::ImportFailed { .. } => FailureKind::ImportFailed,
            _ => FailureKind::Internal,
        }
    }

    /// Short machine-readable name used in telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoRepositories { .. } => "no_repositories",
            Self::DownloadFailed { .. } => "download_failed",
            Self::AnalysisTimeout { .. } => "analysis_timeout",
            Self::AnalysisFailed { .. } => "analysis_failed",
            Self::ImportFailed { .. } => "import_failed",
            Self::QueueClassification(_) => "queue_classification",
            Self::QueueEnqueue(_) => "queue_enqueue",
            Self::StatusCheckPersistence(_) => "status_check_persistence",
            Self::CheckRun(_) => "check_run",
            Self::Storage(_) => "storage",
            Self::Workspace { .. } => "workspace",
        }
    }
}

impl From<DispatchError> for OrchestratorError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Timeout { waited } => Self::AnalysisTimeout { waited },
            DispatchError::Failed { message } => Self::AnalysisFailed { message },
        }
    }
}
