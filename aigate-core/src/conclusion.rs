//! Mapping analysis outcomes to check-run conclusions and rendered output.

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{CommitSha, CompositionPercentages, FailureKind, OrganizationSettings};
use crate::rules::RuleOutcome;

/// Outcome class of a finished run, as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Success,
    Failure,
    Error,
    Unknown,
}

impl StatusClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown status class: {}", other)),
        }
    }
}

/// Lifecycle status of a check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunStatus {
    Queued,
    InProgress,
    Completed,
}

/// Terminal state of a check run.
///
/// Provider gateways translate this into their own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Neutral,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunOutput {
    pub title: String,
    pub summary: String,
    /// Rendered markdown body.
    pub text: Option<String>,
}

/// Everything needed to complete a check run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub status: StatusClass,
    pub conclusion: Conclusion,
    pub output: CheckRunOutput,
}

/// Facts about the analysed pull request used to render a report.
#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub head_sha: &'a CommitSha,
    pub pr_number: u64,
    pub outcome: &'a RuleOutcome,
    pub compositions: &'a [(String, CompositionPercentages)],
}

const SUCCESS_TITLE: &str = "No policy violations";
const SUCCESS_SUMMARY: &str = "AI-generated code in this pull request is within organization policy.";
const FAILURE_TITLE: &str = "Action recommended";
const FAILURE_SUMMARY: &str =
    "AI-generated code in this pull request violates one or more organization policy rules.";
const ERROR_TITLE: &str = "An Error Occurred";
const ERROR_SUMMARY: &str = "The analysis could not be completed. Re-run the check to try again.";
const TIMEOUT_TITLE: &str = "Analysis took too long";
const TIMEOUT_SUMMARY: &str =
    "The analysis did not finish within the allotted time. Re-run the check to try again.";
const UNKNOWN_TITLE: &str = "Analysis status unknown";
const UNKNOWN_SUMMARY: &str = "The analysis finished without a definitive result.";

pub fn in_progress_output(head_sha: &CommitSha) -> CheckRunOutput {
    CheckRunOutput {
        title: "Analysis in progress".to_string(),
        summary: format!("Analysing AI-generated code in commit `{}`.", head_sha.short()),
        text: None,
    }
}

/// Output shown once the soft timeout has elapsed. Polling continues.
pub fn delayed_output(head_sha: &CommitSha, waited: Duration) -> CheckRunOutput {
    CheckRunOutput {
        title: "Analysis is taking longer than usual".to_string(),
        summary: format!(
            "Still analysing commit `{}` after {} minutes. Results will appear here when ready.",
            head_sha.short(),
            waited.as_secs() / 60
        ),
        text: None,
    }
}

/// Map a status class to the provider conclusion.
///
/// A failing result is demoted to `Neutral` when the organization does not
/// want policy violations to block merging.
pub fn conclusion_for(status: StatusClass, settings: &OrganizationSettings) -> Conclusion {
    match status {
        StatusClass::Success => Conclusion::Success,
        StatusClass::Failure if settings.status_check_mark_as_failed => Conclusion::Failure,
        StatusClass::Failure => Conclusion::Neutral,
        StatusClass::Error => Conclusion::Error,
        StatusClass::Unknown => Conclusion::Neutral,
    }
}

fn title_and_summary(status: StatusClass) -> (&'static str, &'static str) {
    match status {
        StatusClass::Success => (SUCCESS_TITLE, SUCCESS_SUMMARY),
        StatusClass::Failure => (FAILURE_TITLE, FAILURE_SUMMARY),
        StatusClass::Error => (ERROR_TITLE, ERROR_SUMMARY),
        StatusClass::Unknown => (UNKNOWN_TITLE, UNKNOWN_SUMMARY),
    }
}

/// Build the final report for an analysed pull request.
pub fn build_report(
    status: StatusClass,
    settings: &OrganizationSettings,
    ctx: &ReportContext<'_>,
) -> Report {
    let (title, summary) = title_and_summary(status);
    Report {
        status,
        conclusion: conclusion_for(status, settings),
        output: CheckRunOutput {
            title: title.to_string(),
            summary: summary.to_string(),
            text: Some(render_markdown(ctx)),
        },
    }
}

/// Build the report for a run that failed before rules could be evaluated.
pub fn error_report(kind: FailureKind, head_sha: &CommitSha, detail: &str) -> Report {
    let (title, summary) = match kind {
        FailureKind::AnalysisTimeout => (TIMEOUT_TITLE, TIMEOUT_SUMMARY),
        _ => title_and_summary(StatusClass::Error),
    };
    let mut text = String::new();
    let _ = writeln!(text, "**Commit:** `{}`", head_sha.short());
    let _ = writeln!(text, "**Error kind:** `{}`", kind);
    if !detail.is_empty() {
        let _ = writeln!(text, "\n```\n{}\n```", detail);
    }
    Report {
        status: StatusClass::Error,
        conclusion: Conclusion::Error,
        output: CheckRunOutput {
            title: title.to_string(),
            summary: summary.to_string(),
            text: Some(text),
        },
    }
}

fn render_markdown(ctx: &ReportContext<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "## AI composition for #{} at `{}`\n",
        ctx.pr_number,
        ctx.head_sha.short()
    );

    if ctx.compositions.is_empty() {
        out.push_str("No analysable files were changed.\n");
    } else {
        out.push_str("| Repository | Pure AI | Blended AI | Overall AI |\n");
        out.push_str("|---|---:|---:|---:|\n");
        for (repository, pct) in ctx.compositions {
            let _ = writeln!(
                out,
                "| {} | {:.1}% | {:.1}% | {:.1}% |",
                repository, pct.pure, pct.blended, pct.overall
            );
        }
    }

    if !ctx.outcome.violations.is_empty() {
        out.push_str("\n### Policy violations\n\n");
        for violation in &ctx.outcome.violations {
            let _ = writeln!(
                out,
                "- **{}** ({}): {}",
                violation.rule, violation.repository, violation.condition
            );
        }
    }

    out
}
