//! Persistent domain records.
//!
//! These mirror the rows the server stores: repositories that opted into
//! status checks, the commits and pull requests seen in webhook events, and
//! the append-only audit trail of check-run outcomes.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conclusion::StatusClass;

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(7) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }

    /// Abbreviated or full hex object name (SHA-1 or SHA-256).
    ///
    /// Event SHAs end up in filesystem paths and git arguments, so ingress
    /// rejects anything else.
    pub fn is_well_formed(&self) -> bool {
        (4..=64).contains(&self.0.len()) && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PullRequestId(pub i64);

/// Provider-assigned check-run identifier.
///
/// GitHub hands out integers, Bitbucket report keys are strings and Azure
/// DevOps status ids are integers again, so the id is kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckRunId(pub String);

impl fmt::Display for CheckRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CheckRunId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CheckRunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque provider continuation data captured from a check-run call.
///
/// Handed back on the next call for the same pull request so the provider
/// can update an existing annotation instead of creating a second one.
pub type ExternalData = serde_json::Value;

/// Git hosting provider an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "bitbucket")]
    Bitbucket,
    #[serde(rename = "azure_devops")]
    AzureDevOps,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Bitbucket => "bitbucket",
            Self::AzureDevOps => "azure_devops",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::GitHub),
            "bitbucket" => Ok(Self::Bitbucket),
            "azure_devops" => Ok(Self::AzureDevOps),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// A repository registered with the service.
///
/// The same provider repository may be registered by several organizations,
/// so an incoming event can resolve to more than one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: RepositoryId,
    pub organization_id: i64,
    pub group_id: Option<i64>,
    pub provider: Provider,
    pub external_id: String,
    /// GitHub App installation the repository was registered through.
    pub installation_id: Option<u64>,
    pub full_name: String,
    pub status_check_enabled: bool,
}

/// Organization-level settings that affect reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationSettings {
    /// When false, a failing policy check is reported as `neutral`.
    pub status_check_mark_as_failed: bool,
}

impl Default for OrganizationSettings {
    fn default() -> Self {
        Self {
            status_check_mark_as_failed: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Pending,
    Analyzed,
    Failure,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzed => "analyzed",
            Self::Failure => "failure",
        }
    }
}

impl FromStr for CommitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analyzed" => Ok(Self::Analyzed),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown commit status: {}", other)),
        }
    }
}

/// Why a commit's analysis failed.
///
/// Kept distinct so operators can tell infrastructure slowness from a
/// crashing analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DownloadFailed,
    AnalysisTimeout,
    AnalysisFailed,
    ImportFailed,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadFailed => "download_failed",
            Self::AnalysisTimeout => "analysis_timeout",
            Self::AnalysisFailed => "analysis_failed",
            Self::ImportFailed => "import_failed",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download_failed" => Ok(Self::DownloadFailed),
            "analysis_timeout" => Ok(Self::AnalysisTimeout),
            "analysis_failed" => Ok(Self::AnalysisFailed),
            "import_failed" => Ok(Self::ImportFailed),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown failure kind: {}", other)),
        }
    }
}

/// Line counts imported from a finished analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCounts {
    pub analyzed_files: u64,
    pub total: u64,
    pub ai_pure: u64,
    pub ai_blended: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub repository_id: RepositoryId,
    pub sha: CommitSha,
    pub status: CommitStatus,
    pub failure_kind: Option<FailureKind>,
    pub analysis_path: Option<PathBuf>,
    pub lines: LineCounts,
}

impl Commit {
    /// Mark the commit failed with a distinguishable kind.
    pub fn fail(&mut self, kind: FailureKind) {
        self.status = CommitStatus::Failure;
        self.failure_kind = Some(kind);
    }
}

/// AI composition of analysed code, in percent of total lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionPercentages {
    pub pure: f64,
    pub blended: f64,
    pub overall: f64,
}

impl CompositionPercentages {
    pub fn from_counts(lines: &LineCounts) -> Self {
        if lines.total == 0 {
            return Self::default();
        }
        let total = lines.total as f64;
        let pure = lines.ai_pure as f64 / total * 100.0;
        let blended = lines.ai_blended as f64 / total * 100.0;
        Self {
            pure,
            blended,
            overall: (pure + blended).min(100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: PullRequestId,
    pub repository_id: RepositoryId,
    pub pr_number: u64,
    pub base_sha: CommitSha,
    pub head_sha: CommitSha,
    pub is_closed: bool,
    pub composition: Option<CompositionPercentages>,
}

/// Audit row for one check-run outcome. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub id: i64,
    pub pull_request_id: PullRequestId,
    pub check_run_id: CheckRunId,
    pub status: StatusClass,
    pub external_data: ExternalData,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusCheck {
    pub pull_request_id: PullRequestId,
    pub check_run_id: CheckRunId,
    pub status: StatusClass,
    pub external_data: ExternalData,
}

/// A file touched by a pull request, as reported by `git diff --numstat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    pub binary: bool,
}

/// Estimated number of changed text lines across a change set.
///
/// Binary files carry no line information and are ignored.
pub fn estimate_changed_lines(files: &[ChangedFile]) -> u64 {
    files
        .iter()
        .filter(|f| !f.binary)
        .map(|f| f.additions + f.deletions)
        .sum()
}
