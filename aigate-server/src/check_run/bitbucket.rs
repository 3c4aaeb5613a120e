use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use aigate_core::{CheckRunId, CheckRunOutput, Conclusion, Provider, PullRequestEvent};

use super::{
    external_string, CheckRunGateway, CheckRunHandle, CompleteCheckRun, CreateCheckRun,
    GatewayError,
};
use crate::http::CORRELATION_ID_HEADER;

const BITBUCKET_API: &str = "https://api.bitbucket.org/2.0";

/// Check runs on Bitbucket Cloud, expressed as commit reports.
///
/// A report is addressed by (commit, report id) and written with PUT, so
/// creating a report that already exists updates it in place. The report id
/// is kept in the external data.
#[derive(Clone)]
pub struct BitbucketReports {
    client: ClientWithMiddleware,
    api_base: String,
    username: String,
    app_password: String,
}

#[derive(Debug, Serialize)]
struct ReportBody<'a> {
    title: &'a str,
    details: &'a str,
    report_type: &'static str,
    reporter: &'static str,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
}

impl BitbucketReports {
    pub fn new(client: ClientWithMiddleware, username: String, app_password: String) -> Self {
        Self {
            client,
            api_base: BITBUCKET_API.to_string(),
            username,
            app_password,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn report_id(event: &PullRequestEvent, old: Option<&serde_json::Value>) -> String {
        external_string(old, "report_id").unwrap_or_else(|| format!("aigate-pr-{}", event.pr_number))
    }

    async fn put_report(
        &self,
        event: &PullRequestEvent,
        report_id: &str,
        body: &ReportBody<'_>,
    ) -> Result<CheckRunHandle, GatewayError> {
        let url = format!(
            "{}/repositories/{}/{}/commit/{}/reports/{}",
            self.api_base, event.repository.owner, event.repository.name, event.head_sha, report_id
        );
        info!(
            "Writing report {} for {} at {}",
            report_id,
            event.repository.full_name(),
            event.head_sha.short()
        );

        let mut request = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.app_password))
            .json(body);
        if let Some(cid) = event.correlation_id.as_deref() {
            request = request.header(CORRELATION_ID_HEADER, cid);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::request(Provider::Bitbucket, e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!("Bitbucket API error: {} - {}", status, body);
            return Err(GatewayError::Api {
                provider: Provider::Bitbucket,
                status,
                body,
            });
        }

        Ok(CheckRunHandle {
            id: CheckRunId(report_id.to_string()),
            external_data: json!({
                "report_id": report_id,
                "commit": event.head_sha.0,
            }),
        })
    }
}

fn result_str(conclusion: Option<Conclusion>) -> &'static str {
    match conclusion {
        None => "PENDING",
        Some(Conclusion::Success | Conclusion::Neutral) => "PASSED",
        Some(Conclusion::Failure | Conclusion::Error | Conclusion::Cancelled) => "FAILED",
    }
}

fn body<'a>(
    output: Option<&'a CheckRunOutput>,
    conclusion: Option<Conclusion>,
    link: Option<&'a str>,
) -> ReportBody<'a> {
    ReportBody {
        title: output.map(|o| o.title.as_str()).unwrap_or("AI code analysis"),
        details: output.map(|o| o.summary.as_str()).unwrap_or(""),
        report_type: "TEST",
        reporter: "aigate",
        result: result_str(conclusion),
        link,
    }
}

#[async_trait]
impl CheckRunGateway for BitbucketReports {
    async fn create(
        &self,
        event: &PullRequestEvent,
        request: CreateCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        let report_id = Self::report_id(event, request.old_external_data.as_ref());
        let body = body(
            request.output.as_ref(),
            request.conclusion,
            request.details_url.as_deref(),
        );
        self.put_report(event, &report_id, &body).await
    }

    async fn update(
        &self,
        event: &PullRequestEvent,
        id: &CheckRunId,
        output: CheckRunOutput,
    ) -> Result<(), GatewayError> {
        self.put_report(event, &id.0, &body(Some(&output), None, None))
            .await
            .map(|_| ())
    }

    async fn complete(
        &self,
        event: &PullRequestEvent,
        id: &CheckRunId,
        request: CompleteCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        let body = body(
            Some(&request.output),
            Some(request.conclusion),
            request.details_url.as_deref(),
        );
        self.put_report(event, &id.0, &body).await
    }
}
