//! In-memory implementation of `Store`.
//!
//! All state is held in memory and lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use aigate_core::{
    Commit, CommitId, CommitSha, CommitStatus, CompositionPercentages, LineCounts, NewStatusCheck,
    OrganizationSettings, Provider, PullRequest, PullRequestId, RepositoryId, RepositoryRecord,
    Rule, StatusCheck,
};

use super::{Store, StoreError};

#[derive(Default)]
struct Tables {
    repositories: Vec<RepositoryRecord>,
    settings: HashMap<i64, OrganizationSettings>,
    organization_rules: HashMap<i64, Vec<Rule>>,
    group_rules: HashMap<i64, Vec<Rule>>,
    commits: Vec<Commit>,
    pull_requests: Vec<PullRequest>,
    status_checks: Vec<StatusCheck>,
}

/// In-memory store.
///
/// Row ids are assigned sequentially per table, starting at 1.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_repository(&self, repository: RepositoryRecord) {
        self.tables.write().await.repositories.push(repository);
    }

    pub async fn set_organization_settings(
        &self,
        organization_id: i64,
        settings: OrganizationSettings,
    ) {
        self.tables
            .write()
            .await
            .settings
            .insert(organization_id, settings);
    }

    pub async fn add_organization_rule(&self, organization_id: i64, rule: Rule) {
        self.tables
            .write()
            .await
            .organization_rules
            .entry(organization_id)
            .or_default()
            .push(rule);
    }

    pub async fn add_group_rule(&self, group_id: i64, rule: Rule) {
        self.tables
            .write()
            .await
            .group_rules
            .entry(group_id)
            .or_default()
            .push(rule);
    }

    /// Snapshot of every pull request row, for assertions.
    pub async fn all_pull_requests(&self) -> Vec<PullRequest> {
        self.tables.read().await.pull_requests.clone()
    }

    /// Snapshot of every commit row, for assertions.
    pub async fn all_commits(&self) -> Vec<Commit> {
        self.tables.read().await.commits.clone()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_repositories(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Vec<RepositoryRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .repositories
            .iter()
            .filter(|r| r.provider == provider && r.external_id == external_id)
            .cloned()
            .collect())
    }

    async fn organization_settings(
        &self,
        organization_id: i64,
    ) -> Result<OrganizationSettings, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .settings
            .get(&organization_id)
            .copied()
            .unwrap_or_default())
    }

    async fn organization_rules(&self, organization_id: i64) -> Result<Vec<Rule>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .organization_rules
            .get(&organization_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn group_rules(&self, group_id: i64) -> Result<Vec<Rule>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.group_rules.get(&group_id).cloned().unwrap_or_default())
    }

    async fn get_or_create_commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Commit, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .commits
            .iter()
            .find(|c| c.repository_id == repository_id && &c.sha == sha)
        {
            return Ok(existing.clone());
        }
        let commit = Commit {
            id: CommitId(tables.commits.len() as i64 + 1),
            repository_id,
            sha: sha.clone(),
            status: CommitStatus::Pending,
            failure_kind: None,
            analysis_path: None,
            lines: LineCounts::default(),
        };
        tables.commits.push(commit.clone());
        Ok(commit)
    }

    async fn commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Option<Commit>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .commits
            .iter()
            .find(|c| c.repository_id == repository_id && &c.sha == sha)
            .cloned())
    }

    async fn update_commit(&self, commit: &Commit) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let row = tables
            .commits
            .iter_mut()
            .find(|c| c.id == commit.id)
            .ok_or_else(|| StoreError::not_found(format!("commit {}", commit.id.0)))?;
        *row = commit.clone();
        Ok(())
    }

    async fn upsert_pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
        base_sha: &CommitSha,
        head_sha: &CommitSha,
    ) -> Result<PullRequest, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .pull_requests
            .iter_mut()
            .find(|p| p.repository_id == repository_id && p.pr_number == pr_number)
        {
            existing.base_sha = base_sha.clone();
            existing.head_sha = head_sha.clone();
            return Ok(existing.clone());
        }
        let pull_request = PullRequest {
            id: PullRequestId(tables.pull_requests.len() as i64 + 1),
            repository_id,
            pr_number,
            base_sha: base_sha.clone(),
            head_sha: head_sha.clone(),
            is_closed: false,
            composition: None,
        };
        tables.pull_requests.push(pull_request.clone());
        Ok(pull_request)
    }

    async fn pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
    ) -> Result<Option<PullRequest>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .pull_requests
            .iter()
            .find(|p| p.repository_id == repository_id && p.pr_number == pr_number)
            .cloned())
    }

    async fn set_pull_requests_closed(
        &self,
        repository_ids: &[RepositoryId],
        pr_number: u64,
        closed: bool,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let mut changed = 0;
        for pr in tables.pull_requests.iter_mut().filter(|p| {
            p.pr_number == pr_number
                && repository_ids.contains(&p.repository_id)
                && p.is_closed != closed
        }) {
            pr.is_closed = closed;
            changed += 1;
        }
        Ok(changed)
    }

    async fn cache_composition(
        &self,
        pull_request_id: PullRequestId,
        composition: &CompositionPercentages,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let row = tables
            .pull_requests
            .iter_mut()
            .find(|p| p.id == pull_request_id)
            .ok_or_else(|| StoreError::not_found(format!("pull request {}", pull_request_id.0)))?;
        row.composition = Some(*composition);
        Ok(())
    }

    async fn latest_status_check(
        &self,
        pull_request_ids: &[PullRequestId],
    ) -> Result<Option<StatusCheck>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .status_checks
            .iter()
            .rev()
            .find(|s| pull_request_ids.contains(&s.pull_request_id))
            .cloned())
    }

    async fn insert_status_check(&self, check: NewStatusCheck) -> Result<StatusCheck, StoreError> {
        let mut tables = self.tables.write().await;
        let row = StatusCheck {
            id: tables.status_checks.len() as i64 + 1,
            pull_request_id: check.pull_request_id,
            check_run_id: check.check_run_id,
            status: check.status,
            external_data: check.external_data,
            created_at: Utc::now(),
        };
        tables.status_checks.push(row.clone());
        Ok(row)
    }

    async fn status_checks(
        &self,
        pull_request_id: PullRequestId,
    ) -> Result<Vec<StatusCheck>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .status_checks
            .iter()
            .filter(|s| s.pull_request_id == pull_request_id)
            .cloned()
            .collect())
    }
}
