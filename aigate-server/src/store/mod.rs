//! Storage abstraction for repositories, commits, pull requests and the
//! status-check audit trail.
//!
//! The orchestrator only talks to the `Store` trait. `InMemoryStore` backs
//! tests and local runs; `SqliteStore` is the durable backend.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use aigate_core::{
    Commit, CommitSha, CompositionPercentages, NewStatusCheck, OrganizationSettings, Provider,
    PullRequest, PullRequestId, RepositoryId, RepositoryRecord, Rule, StatusCheck,
};

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage failed (database, lock, task join).
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: String, message: String },

    /// A referenced row does not exist.
    #[error("{entity} not found")]
    NotFound { entity: String },
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn corrupt(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Repositories registered for a provider repository.
    async fn find_repositories(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Vec<RepositoryRecord>, StoreError>;

    /// Settings for an organization, falling back to defaults.
    async fn organization_settings(
        &self,
        organization_id: i64,
    ) -> Result<OrganizationSettings, StoreError>;

    async fn organization_rules(&self, organization_id: i64) -> Result<Vec<Rule>, StoreError>;

    async fn group_rules(&self, group_id: i64) -> Result<Vec<Rule>, StoreError>;

    /// Look up the commit for (repository, sha), creating a pending row if absent.
    async fn get_or_create_commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Commit, StoreError>;

    async fn commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Option<Commit>, StoreError>;

    /// Overwrite a commit's mutable fields (status, failure kind, path, counts).
    async fn update_commit(&self, commit: &Commit) -> Result<(), StoreError>;

    /// Create the pull request row or update its SHAs in place.
    async fn upsert_pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
        base_sha: &CommitSha,
        head_sha: &CommitSha,
    ) -> Result<PullRequest, StoreError>;

    async fn pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
    ) -> Result<Option<PullRequest>, StoreError>;

    /// Set `is_closed` on every matching pull request; returns rows changed.
    async fn set_pull_requests_closed(
        &self,
        repository_ids: &[RepositoryId],
        pr_number: u64,
        closed: bool,
    ) -> Result<usize, StoreError>;

    async fn cache_composition(
        &self,
        pull_request_id: PullRequestId,
        composition: &CompositionPercentages,
    ) -> Result<(), StoreError>;

    /// Most recent audit row across the given pull requests.
    async fn latest_status_check(
        &self,
        pull_request_ids: &[PullRequestId],
    ) -> Result<Option<StatusCheck>, StoreError>;

    async fn insert_status_check(&self, check: NewStatusCheck) -> Result<StatusCheck, StoreError>;

    async fn status_checks(
        &self,
        pull_request_id: PullRequestId,
    ) -> Result<Vec<StatusCheck>, StoreError>;
}
