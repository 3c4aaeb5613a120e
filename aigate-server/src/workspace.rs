//! On-disk layout of analysis directories.
//!
//! ```text
//! <root>/<repository id>/<pr number>-<head sha>/
//!     repository/        checked-out sources
//!     repository.csv     completion artifact written by the analyzer
//!     repository.log     local analyzer output
//!     metadata.json      pull request number, commits and changed files
//! ```
//!
//! The directory's existence doubles as the re-entrancy guard for a
//! (commit, pull request) pair.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use aigate_core::{ChangedFile, CommitSha, RepositoryId};

use crate::error::OrchestratorError;

const REPOSITORY_DIR: &str = "repository";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn analysis_dir(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
        head_sha: &CommitSha,
    ) -> PathBuf {
        self.root
            .join(repository_id.0.to_string())
            .join(format!("{}-{}", pr_number, head_sha))
    }
}

/// Where the sources are checked out inside an analysis directory.
pub fn repository_path(analysis_dir: &Path) -> PathBuf {
    analysis_dir.join(REPOSITORY_DIR)
}

/// `<repository_path>.csv`; its existence signals a finished analysis.
pub fn artifact_path(repository_path: &Path) -> PathBuf {
    with_suffix(repository_path, ".csv")
}

pub fn log_path(repository_path: &Path) -> PathBuf {
    with_suffix(repository_path, ".log")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Snapshot written beside the downloaded sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub pr_number: u64,
    pub commits: Vec<String>,
    pub changed_files: Vec<ChangedFile>,
}

impl AnalysisMetadata {
    pub async fn write(&self, analysis_dir: &Path) -> Result<(), OrchestratorError> {
        let path = analysis_dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            OrchestratorError::workspace(&path, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| OrchestratorError::workspace(&path, e))
    }

    pub async fn read(analysis_dir: &Path) -> Result<Self, OrchestratorError> {
        let path = analysis_dir.join(METADATA_FILE);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| OrchestratorError::workspace(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            OrchestratorError::workspace(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }
}
