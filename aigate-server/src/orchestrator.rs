//! The pull request analysis state machine.
//!
//! `PullRequestOrchestrator::run` turns one webhook event into at most one check run:
//!
//! ```text
//! Received -> RepositoriesResolved -> ClosedHandled | ReopenedHandled | AnalysisStarted
//! AnalysisStarted -> FilesDownloaded -> AnalysisDispatched -> AnalysisComplete
//!     -> DataImported -> RulesEvaluated -> CheckRunCompleted
//! ```
//!
//! Any failure after the check run was opened completes it with an error
//! conclusion. A failure after repositories were claimed but before a check
//! run exists creates an already-completed one instead. Callers only ever
//! see a boolean.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use aigate_core::{
    blocking_rules, build_report, delayed_output, error_report, evaluate_rules,
    in_progress_output, CheckRunId, CheckRunStatus, Commit, CommitStatus, CompositionPercentages,
    ExternalData, NewStatusCheck, PullRequest, PullRequestAction, PullRequestEvent,
    PullRequestId, RepositoryId, RepositoryRecord, Report, ReportContext, RuleEvaluator,
    RuleOutcome, RuleSubject, StatusClass, ThresholdRuleEvaluator,
};

use crate::check_run::{CheckRunGateway, CheckRunGateways, CompleteCheckRun, CreateCheckRun};
use crate::dispatch::{AnalysisDispatcher, AnalysisProgress, DispatchContext};
use crate::download::Downloader;
use crate::error::OrchestratorError;
use crate::importer::{ImportTarget, Importer};
use crate::store::Store;
use crate::telemetry::Telemetry;
use crate::workspace::{repository_path, AnalysisMetadata, Workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    RepositoriesResolved,
    ClosedHandled,
    ReopenedHandled,
    AnalysisStarted,
    FilesDownloaded,
    AnalysisDispatched,
    AnalysisComplete,
    DataImported,
    RulesEvaluated,
    CheckRunCompleted,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::RepositoriesResolved => "repositories_resolved",
            Self::ClosedHandled => "closed_handled",
            Self::ReopenedHandled => "reopened_handled",
            Self::AnalysisStarted => "analysis_started",
            Self::FilesDownloaded => "files_downloaded",
            Self::AnalysisDispatched => "analysis_dispatched",
            Self::AnalysisComplete => "analysis_complete",
            Self::DataImported => "data_imported",
            Self::RulesEvaluated => "rules_evaluated",
            Self::CheckRunCompleted => "check_run_completed",
        }
    }
}

/// A check run opened by this run and not yet completed.
#[derive(Debug, Clone)]
struct OpenCheckRun {
    id: CheckRunId,
    external_data: ExternalData,
    pull_request_ids: Vec<PullRequestId>,
}

/// Progress of a single run, kept so failures can be cleaned up.
#[derive(Debug)]
struct RunContext {
    stage: Stage,
    check_run: Option<OpenCheckRun>,
    commits: Vec<(RepositoryId, Commit)>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            stage: Stage::Received,
            check_run: None,
            commits: Vec::new(),
        }
    }

    fn advance(&mut self, stage: Stage, event: &PullRequestEvent) {
        info!(
            "PR #{} at {}: {} -> {}",
            event.pr_number,
            event.head_sha.short(),
            self.stage.as_str(),
            stage.as_str()
        );
        self.stage = stage;
    }
}

/// A repository selected for analysis in this run.
#[derive(Debug, Clone)]
struct AnalysisTarget {
    repository: RepositoryRecord,
    commit: Commit,
    pull_request: PullRequest,
    analysis_dir: PathBuf,
}

/// Updates the open check run when analysis is slow.
struct CheckRunProgress<'a> {
    gateway: Arc<dyn CheckRunGateway>,
    event: &'a PullRequestEvent,
    id: &'a CheckRunId,
}

#[async_trait]
impl AnalysisProgress for CheckRunProgress<'_> {
    async fn analysis_delayed(&self, waited: Duration) {
        let output = delayed_output(&self.event.head_sha, waited);
        if let Err(e) = self.gateway.update(self.event, self.id, output).await {
            warn!(
                "Failed to mark check run {} as delayed: {}",
                self.id, e
            );
        }
    }
}

pub struct PullRequestOrchestrator {
    store: Arc<dyn Store>,
    gateways: CheckRunGateways,
    downloader: Arc<dyn Downloader>,
    dispatcher: AnalysisDispatcher,
    importer: Importer,
    evaluator: Arc<dyn RuleEvaluator>,
    workspace: Workspace,
    telemetry: Telemetry,
    details_base_url: Option<String>,
}

impl PullRequestOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        gateways: CheckRunGateways,
        downloader: Arc<dyn Downloader>,
        dispatcher: AnalysisDispatcher,
        importer: Importer,
        workspace: Workspace,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            gateways,
            downloader,
            dispatcher,
            importer,
            evaluator: Arc::new(ThresholdRuleEvaluator),
            workspace,
            telemetry,
            details_base_url: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_details_base_url(mut self, base: Option<String>) -> Self {
        self.details_base_url = base;
        self
    }

    /// Process one event. Never propagates errors.
    ///
    /// Returns false when the run failed; the failure has already been
    /// reported to telemetry and, if a check run was open, to the provider.
    pub async fn run(&self, event: &PullRequestEvent) -> bool {
        let mut ctx = RunContext::new();
        match self.process(event, &mut ctx).await {
            Ok(()) => true,
            Err(e @ OrchestratorError::NoRepositories { .. }) => {
                info!("PR #{}: {}, skipping", event.pr_number, e);
                true
            }
            Err(e) => {
                self.handle_failure(event, &mut ctx, &e).await;
                false
            }
        }
    }

    async fn process(
        &self,
        event: &PullRequestEvent,
        ctx: &mut RunContext,
    ) -> Result<(), OrchestratorError> {
        let repositories = self.resolve_repositories(event).await?;
        ctx.advance(Stage::RepositoriesResolved, event);

        match event.action {
            PullRequestAction::Closed => {
                if event.is_merge() {
                    // The next scheduled full scan analyses the merge commit.
                    info!(
                        "PR #{} merged; nothing to analyse until the next full scan",
                        event.pr_number
                    );
                }
                self.set_closed(event, &repositories, true).await?;
                ctx.advance(Stage::ClosedHandled, event);
                Ok(())
            }
            PullRequestAction::Reopened => {
                self.set_closed(event, &repositories, false).await?;
                ctx.advance(Stage::ReopenedHandled, event);
                Ok(())
            }
            _ => self.process_pull_request(event, repositories, ctx).await,
        }
    }

    /// Registered repositories for the event with status checks enabled.
    async fn resolve_repositories(
        &self,
        event: &PullRequestEvent,
    ) -> Result<Vec<RepositoryRecord>, OrchestratorError> {
        let repositories: Vec<RepositoryRecord> = self
            .store
            .find_repositories(event.provider, &event.repository.external_id)
            .await?
            .into_iter()
            .filter(|r| match (event.installation_id, r.installation_id) {
                (Some(event_installation), Some(installation)) => {
                    event_installation == installation
                }
                _ => true,
            })
            .filter(|r| r.status_check_enabled)
            .collect();

        if repositories.is_empty() {
            return Err(OrchestratorError::NoRepositories {
                provider: event.provider,
                external_id: event.repository.external_id.clone(),
            });
        }
        Ok(repositories)
    }

    async fn set_closed(
        &self,
        event: &PullRequestEvent,
        repositories: &[RepositoryRecord],
        closed: bool,
    ) -> Result<(), OrchestratorError> {
        let ids: Vec<RepositoryId> = repositories.iter().map(|r| r.id).collect();
        let changed = self
            .store
            .set_pull_requests_closed(&ids, event.pr_number, closed)
            .await?;
        info!(
            "PR #{}: {} {} pull request rows",
            event.pr_number,
            if closed { "closed" } else { "reopened" },
            changed
        );
        Ok(())
    }

    async fn process_pull_request(
        &self,
        event: &PullRequestEvent,
        repositories: Vec<RepositoryRecord>,
        ctx: &mut RunContext,
    ) -> Result<(), OrchestratorError> {
        ctx.advance(Stage::AnalysisStarted, event);

        let targets = self.claim_targets(event, repositories).await?;
        if targets.is_empty() {
            info!(
                "PR #{} at {} is already being analysed, skipping duplicate delivery",
                event.pr_number,
                event.head_sha.short()
            );
            return Ok(());
        }
        ctx.commits = targets
            .iter()
            .map(|t| (t.repository.id, t.commit.clone()))
            .collect();

        let pull_request_ids: Vec<PullRequestId> =
            targets.iter().map(|t| t.pull_request.id).collect();
        let old_external_data = self
            .store
            .latest_status_check(&pull_request_ids)
            .await?
            .map(|s| s.external_data);

        let gateway = self.gateways.get(event.provider)?;
        let opened = gateway
            .create(
                event,
                CreateCheckRun {
                    status: Some(CheckRunStatus::InProgress),
                    conclusion: None,
                    details_url: self.details_url(event),
                    output: Some(in_progress_output(&event.head_sha)),
                    old_external_data,
                },
            )
            .await?;
        info!("PR #{}: opened check run {}", event.pr_number, opened.id);
        self.record_status_checks(
            event,
            &pull_request_ids,
            &opened.id,
            StatusClass::Unknown,
            &opened.external_data,
            Stage::AnalysisStarted,
        )
        .await;
        ctx.check_run = Some(OpenCheckRun {
            id: opened.id.clone(),
            external_data: opened.external_data,
            pull_request_ids,
        });

        for target in &targets {
            tokio::fs::create_dir_all(&target.analysis_dir)
                .await
                .map_err(|e| OrchestratorError::workspace(&target.analysis_dir, e))?;
        }

        let mut downloads = Vec::with_capacity(targets.len());
        for target in &targets {
            let repo_path = repository_path(&target.analysis_dir);
            let downloaded = self
                .downloader
                .download(event, &target.repository, &repo_path)
                .await
                .map_err(|e| OrchestratorError::DownloadFailed {
                    repository: target.repository.full_name.clone(),
                    sha: event.head_sha.0.clone(),
                    message: e.to_string(),
                })?;
            AnalysisMetadata {
                pr_number: event.pr_number,
                commits: downloaded.commits,
                changed_files: downloaded.changed_files.clone(),
            }
            .write(&target.analysis_dir)
            .await?;
            downloads.push((repo_path, downloaded.changed_files));
        }
        ctx.advance(Stage::FilesDownloaded, event);

        ctx.advance(Stage::AnalysisDispatched, event);
        let progress = CheckRunProgress {
            gateway: gateway.clone(),
            event,
            id: &opened.id,
        };
        let mut imports = Vec::with_capacity(targets.len());
        for (target, (repo_path, changed_files)) in targets.iter().zip(&downloads) {
            let artifact = self
                .dispatcher
                .analyze_files(
                    repo_path,
                    changed_files,
                    DispatchContext {
                        pr_number: event.pr_number,
                        correlation_id: event.correlation_id.as_deref(),
                    },
                    &progress,
                )
                .await?;
            imports.push(ImportTarget {
                repository: target.repository.clone(),
                commit: target.commit.clone(),
                pull_request: target.pull_request.clone(),
                artifact,
            });
        }
        ctx.advance(Stage::AnalysisComplete, event);

        self.importer.import_data(&imports).await?;
        ctx.advance(Stage::DataImported, event);

        let (outcome, compositions) = self.check_rules(event, &targets).await?;
        let status = if outcome.passed() {
            StatusClass::Success
        } else {
            StatusClass::Failure
        };
        ctx.advance(Stage::RulesEvaluated, event);
        info!(
            "PR #{}: {} ({} violations)",
            event.pr_number,
            status,
            outcome.violations.len()
        );

        let settings = self
            .store
            .organization_settings(targets[0].repository.organization_id)
            .await?;
        let report = build_report(
            status,
            &settings,
            &ReportContext {
                head_sha: &event.head_sha,
                pr_number: event.pr_number,
                outcome: &outcome,
                compositions: &compositions,
            },
        );
        self.finalize(event, ctx, report).await
    }

    /// Get-or-create commits and apply the analysis-directory guard.
    ///
    /// Repositories whose directory already exists are skipped. Directories
    /// are only created once the check run is open, so a run that cannot
    /// report anything leaves no guard behind.
    async fn claim_targets(
        &self,
        event: &PullRequestEvent,
        repositories: Vec<RepositoryRecord>,
    ) -> Result<Vec<AnalysisTarget>, OrchestratorError> {
        let mut targets = Vec::with_capacity(repositories.len());
        for repository in repositories {
            let commit = self
                .store
                .get_or_create_commit(repository.id, &event.head_sha)
                .await?;

            let analysis_dir =
                self.workspace
                    .analysis_dir(repository.id, event.pr_number, &event.head_sha);
            if tokio::fs::try_exists(&analysis_dir)
                .await
                .map_err(|e| OrchestratorError::workspace(&analysis_dir, e))?
            {
                info!(
                    "{} already exists, skipping {}",
                    analysis_dir.display(),
                    repository.full_name
                );
                continue;
            }

            let pull_request = self
                .store
                .upsert_pull_request(
                    repository.id,
                    event.pr_number,
                    &event.base_sha,
                    &event.head_sha,
                )
                .await?;

            targets.push(AnalysisTarget {
                repository,
                commit,
                pull_request,
                analysis_dir,
            });
        }
        Ok(targets)
    }

    /// Evaluate organization and group rules against imported compositions.
    async fn check_rules(
        &self,
        event: &PullRequestEvent,
        targets: &[AnalysisTarget],
    ) -> Result<(RuleOutcome, Vec<(String, CompositionPercentages)>), OrchestratorError> {
        let mut subjects = Vec::new();
        let mut compositions = Vec::new();
        for target in targets {
            let Some(commit) = self
                .store
                .commit(target.repository.id, &event.head_sha)
                .await?
            else {
                continue;
            };
            if commit.status != CommitStatus::Analyzed || commit.lines.analyzed_files == 0 {
                continue;
            }

            let percentages = CompositionPercentages::from_counts(&commit.lines);
            let organization = self
                .store
                .organization_rules(target.repository.organization_id)
                .await?;
            let group = match target.repository.group_id {
                Some(group_id) => self.store.group_rules(group_id).await?,
                None => Vec::new(),
            };
            subjects.push(RuleSubject {
                repository: target.repository.full_name.clone(),
                percentages,
                rules: blocking_rules(organization, group),
            });
            compositions.push((target.repository.full_name.clone(), percentages));
        }
        Ok((evaluate_rules(self.evaluator.as_ref(), &subjects), compositions))
    }

    /// Complete the open check run, or create an already-completed one when
    /// none was opened, and append the audit rows.
    ///
    /// The open check run stays in the context until the provider accepted
    /// the completion, so a failed completion can still be retried as an
    /// error.
    async fn finalize(
        &self,
        event: &PullRequestEvent,
        ctx: &mut RunContext,
        report: Report,
    ) -> Result<(), OrchestratorError> {
        let gateway = self.gateways.get(event.provider)?;
        let details_url = self.details_url(event);
        let conclusion = report.conclusion;

        let (handle, pull_request_ids) = match ctx.check_run.clone() {
            Some(open) => {
                let handle = gateway
                    .complete(
                        event,
                        &open.id,
                        CompleteCheckRun {
                            conclusion,
                            output: report.output,
                            details_url,
                            old_external_data: Some(open.external_data),
                        },
                    )
                    .await?;
                ctx.check_run = None;
                (handle, open.pull_request_ids)
            }
            None => {
                let pull_request_ids = self.claimed_pull_requests(event, ctx).await;
                let old_external_data = self
                    .store
                    .latest_status_check(&pull_request_ids)
                    .await?
                    .map(|s| s.external_data);
                let handle = gateway
                    .create(
                        event,
                        CreateCheckRun {
                            status: Some(CheckRunStatus::Completed),
                            conclusion: Some(conclusion),
                            details_url,
                            output: Some(report.output),
                            old_external_data,
                        },
                    )
                    .await?;
                (handle, pull_request_ids)
            }
        };
        ctx.advance(Stage::CheckRunCompleted, event);
        info!(
            "PR #{}: check run {} completed as {:?}",
            event.pr_number, handle.id, conclusion
        );

        self.record_status_checks(
            event,
            &pull_request_ids,
            &handle.id,
            report.status,
            &handle.external_data,
            Stage::CheckRunCompleted,
        )
        .await;
        Ok(())
    }

    /// Pull request rows of the claimed repositories, for runs that failed
    /// before a check run was opened.
    async fn claimed_pull_requests(
        &self,
        event: &PullRequestEvent,
        ctx: &RunContext,
    ) -> Vec<PullRequestId> {
        let mut ids = Vec::with_capacity(ctx.commits.len());
        for (repository_id, _) in &ctx.commits {
            match self.store.pull_request(*repository_id, event.pr_number).await {
                Ok(Some(pull_request)) => ids.push(pull_request.id),
                Ok(None) => {}
                Err(e) => warn!(
                    "Failed to load PR #{} for repository {}: {}",
                    event.pr_number, repository_id.0, e
                ),
            }
        }
        ids
    }

    /// Append one audit row per pull request. Failures go to telemetry and
    /// never change the run's outcome.
    async fn record_status_checks(
        &self,
        event: &PullRequestEvent,
        pull_request_ids: &[PullRequestId],
        check_run_id: &CheckRunId,
        status: StatusClass,
        external_data: &ExternalData,
        stage: Stage,
    ) {
        for pull_request_id in pull_request_ids {
            let row = NewStatusCheck {
                pull_request_id: *pull_request_id,
                check_run_id: check_run_id.clone(),
                status,
                external_data: external_data.clone(),
            };
            if let Err(e) = self.store.insert_status_check(row).await {
                let err = OrchestratorError::StatusCheckPersistence(e);
                self.telemetry
                    .report(stage.as_str(), err.kind(), Some(event.pr_number), &err);
            }
        }
    }

    async fn handle_failure(
        &self,
        event: &PullRequestEvent,
        ctx: &mut RunContext,
        error: &OrchestratorError,
    ) {
        self.telemetry.report(
            ctx.stage.as_str(),
            error.kind(),
            Some(event.pr_number),
            error,
        );

        let kind = error.failure_kind();
        for (repository_id, commit) in &ctx.commits {
            match self.store.commit(*repository_id, &commit.sha).await {
                Ok(Some(mut current)) if current.status != CommitStatus::Analyzed => {
                    current.fail(kind);
                    if let Err(e) = self.store.update_commit(&current).await {
                        warn!("Failed to mark commit {} as failed: {}", commit.sha.short(), e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to load commit {}: {}", commit.sha.short(), e),
            }
        }

        // Nothing was claimed, so no result is owed.
        if ctx.check_run.is_none() && ctx.commits.is_empty() {
            return;
        }
        let report = error_report(kind, &event.head_sha, &error.to_string());
        if let Err(e) = self.finalize(event, ctx, report).await {
            warn!(
                "PR #{}: failed to complete check run with error conclusion: {}",
                event.pr_number, e
            );
        }
    }

    fn details_url(&self, event: &PullRequestEvent) -> Option<String> {
        self.details_base_url.as_ref().map(|base| {
            format!(
                "{}/{}/{}/pull-requests/{}",
                base.trim_end_matches('/'),
                event.provider,
                event.repository.full_name(),
                event.pr_number
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_are_distinct() {
        let stages = [
            Stage::Received,
            Stage::RepositoriesResolved,
            Stage::ClosedHandled,
            Stage::ReopenedHandled,
            Stage::AnalysisStarted,
            Stage::FilesDownloaded,
            Stage::AnalysisDispatched,
            Stage::AnalysisComplete,
            Stage::DataImported,
            Stage::RulesEvaluated,
            Stage::CheckRunCompleted,
        ];
        let names: std::collections::HashSet<_> = stages.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.len(), stages.len());
    }
}
