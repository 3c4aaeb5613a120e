use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use aigate_core::{CheckRunId, CheckRunOutput, Conclusion, Provider, PullRequestEvent};

use super::{
    external_string, CheckRunGateway, CheckRunHandle, CompleteCheckRun, CreateCheckRun,
    GatewayError,
};
use crate::http::CORRELATION_ID_HEADER;

const API_VERSION: &str = "7.1";

/// Check runs on Azure DevOps, expressed as pull request statuses.
///
/// Statuses are append-only; posting a new status with the same context
/// supersedes the previous one. The first status looks up the pull
/// request's latest iteration; its id is threaded through the external data
/// so later statuses attach to the same iteration.
#[derive(Clone)]
pub struct AzureDevOpsStatuses {
    client: ClientWithMiddleware,
    api_base: String,
    personal_access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    state: &'static str,
    description: &'a str,
    context: StatusContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iteration_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatusContext {
    name: &'static str,
    genre: &'static str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct IterationList {
    value: Vec<Iteration>,
}

#[derive(Debug, Deserialize)]
struct Iteration {
    id: u64,
}

impl AzureDevOpsStatuses {
    pub fn new(
        client: ClientWithMiddleware,
        organization: &str,
        personal_access_token: String,
    ) -> Self {
        Self {
            client,
            api_base: format!("https://dev.azure.com/{}", organization),
            personal_access_token,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn pull_request_url(&self, event: &PullRequestEvent, resource: &str) -> String {
        // The event owner is the Azure DevOps project.
        format!(
            "{}/{}/_apis/git/repositories/{}/pullRequests/{}/{}?api-version={}",
            self.api_base,
            event.repository.owner,
            event.repository.external_id,
            event.pr_number,
            resource,
            API_VERSION
        )
    }

    async fn latest_iteration(&self, event: &PullRequestEvent) -> Result<Option<u64>, GatewayError> {
        let mut request = self
            .client
            .get(self.pull_request_url(event, "iterations"))
            .basic_auth("", Some(&self.personal_access_token));
        if let Some(cid) = event.correlation_id.as_deref() {
            request = request.header(CORRELATION_ID_HEADER, cid);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::request(Provider::AzureDevOps, e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                provider: Provider::AzureDevOps,
                status,
                body,
            });
        }
        let iterations: IterationList = response
            .json()
            .await
            .map_err(|e| GatewayError::request(Provider::AzureDevOps, e))?;
        Ok(iterations.value.iter().map(|i| i.id).max())
    }

    /// The iteration from earlier external data, else the latest one.
    ///
    /// A failed lookup posts the status without an iteration.
    async fn resolve_iteration(
        &self,
        event: &PullRequestEvent,
        old: Option<&serde_json::Value>,
    ) -> Option<u64> {
        if let Some(id) = iteration_id(old) {
            return Some(id);
        }
        match self.latest_iteration(event).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Could not look up iterations for PR #{}: {}",
                    event.pr_number, e
                );
                None
            }
        }
    }

    async fn post_status(
        &self,
        event: &PullRequestEvent,
        body: &StatusBody<'_>,
    ) -> Result<CheckRunHandle, GatewayError> {
        let url = self.pull_request_url(event, "statuses");
        info!(
            "Posting {} status for PR #{} in {}",
            body.state,
            event.pr_number,
            event.repository.full_name()
        );

        let mut request = self
            .client
            .post(&url)
            .basic_auth("", Some(&self.personal_access_token))
            .json(body);
        if let Some(cid) = event.correlation_id.as_deref() {
            request = request.header(CORRELATION_ID_HEADER, cid);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::request(Provider::AzureDevOps, e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!("Azure DevOps API error: {} - {}", status, body);
            return Err(GatewayError::Api {
                provider: Provider::AzureDevOps,
                status,
                body,
            });
        }

        let created: StatusResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::request(Provider::AzureDevOps, e))?;
        Ok(CheckRunHandle {
            id: CheckRunId::from(created.id),
            external_data: json!({
                "status_id": created.id,
                "iteration_id": body.iteration_id,
            }),
        })
    }
}

fn state_str(conclusion: Option<Conclusion>) -> &'static str {
    match conclusion {
        None => "pending",
        Some(Conclusion::Success) => "succeeded",
        Some(Conclusion::Failure) => "failed",
        Some(Conclusion::Neutral) => "notApplicable",
        Some(Conclusion::Error | Conclusion::Cancelled) => "error",
    }
}

fn iteration_id(old: Option<&serde_json::Value>) -> Option<u64> {
    external_string(old, "iteration_id").and_then(|id| id.parse().ok())
}

fn status_body<'a>(
    output: Option<&'a CheckRunOutput>,
    conclusion: Option<Conclusion>,
    target_url: Option<&'a str>,
    iteration_id: Option<u64>,
) -> StatusBody<'a> {
    StatusBody {
        state: state_str(conclusion),
        description: output.map(|o| o.title.as_str()).unwrap_or("AI code analysis"),
        context: StatusContext {
            name: "ai-code-analysis",
            genre: "aigate",
        },
        target_url,
        iteration_id,
    }
}

#[async_trait]
impl CheckRunGateway for AzureDevOpsStatuses {
    async fn create(
        &self,
        event: &PullRequestEvent,
        request: CreateCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        let iteration = self
            .resolve_iteration(event, request.old_external_data.as_ref())
            .await;
        let body = status_body(
            request.output.as_ref(),
            request.conclusion,
            request.details_url.as_deref(),
            iteration,
        );
        self.post_status(event, &body).await
    }

    async fn update(
        &self,
        event: &PullRequestEvent,
        _id: &CheckRunId,
        output: CheckRunOutput,
    ) -> Result<(), GatewayError> {
        let iteration = self.resolve_iteration(event, None).await;
        self.post_status(event, &status_body(Some(&output), None, None, iteration))
            .await
            .map(|_| ())
    }

    async fn complete(
        &self,
        event: &PullRequestEvent,
        _id: &CheckRunId,
        request: CompleteCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        let iteration = self
            .resolve_iteration(event, request.old_external_data.as_ref())
            .await;
        let body = status_body(
            Some(&request.output),
            Some(request.conclusion),
            request.details_url.as_deref(),
            iteration,
        );
        self.post_status(event, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(state_str(None), "pending");
        assert_eq!(state_str(Some(Conclusion::Failure)), "failed");
        assert_eq!(state_str(Some(Conclusion::Neutral)), "notApplicable");
        assert_eq!(state_str(Some(Conclusion::Error)), "error");
    }

    #[test]
    fn test_status_body_serializes_camel_case() {
        let body = status_body(None, Some(Conclusion::Success), Some("https://x"), Some(4));
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["state"], "succeeded");
        assert_eq!(value["targetUrl"], "https://x");
        assert_eq!(value["iterationId"], 4);
        assert_eq!(value["context"]["genre"], "aigate");
    }

    #[test]
    fn test_iteration_id_from_external_data() {
        assert_eq!(iteration_id(Some(&json!({ "iteration_id": 7 }))), Some(7));
        assert_eq!(iteration_id(Some(&json!({ "iteration_id": null }))), None);
        assert_eq!(iteration_id(None), None);
    }

    mod server {
        use super::*;
        use crate::http::create_api_client;
        use aigate_core::{in_progress_output, CommitSha, EventRepository, PullRequestAction};
        use axum::extract::State;
        use axum::routing::get;
        use axum::{Json, Router};
        use serde_json::Value;
        use std::sync::{Arc, Mutex};

        type Posted = Arc<Mutex<Vec<Value>>>;

        async fn iterations() -> Json<Value> {
            Json(json!({ "count": 3, "value": [{ "id": 1 }, { "id": 3 }, { "id": 2 }] }))
        }

        async fn statuses(State(posted): State<Posted>, Json(body): Json<Value>) -> Json<Value> {
            let mut posted = posted.lock().unwrap();
            posted.push(body);
            Json(json!({ "id": posted.len() }))
        }

        async fn serve() -> (String, Posted) {
            let posted: Posted = Arc::default();
            let app = Router::new()
                .route(
                    "/acme/_apis/git/repositories/:repo/pullRequests/:n/iterations",
                    get(iterations),
                )
                .route(
                    "/acme/_apis/git/repositories/:repo/pullRequests/:n/statuses",
                    axum::routing::post(statuses),
                )
                .with_state(posted.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{}", addr), posted)
        }

        fn event() -> PullRequestEvent {
            PullRequestEvent {
                provider: Provider::AzureDevOps,
                action: PullRequestAction::Opened,
                merged: false,
                repository: EventRepository {
                    external_id: "repo-guid".to_string(),
                    owner: "acme".to_string(),
                    name: "widgets".to_string(),
                    clone_url: "https://dev.azure.com/acme/_git/widgets".to_string(),
                },
                installation_id: None,
                pr_number: 12,
                base_sha: CommitSha::from("def456"),
                head_sha: CommitSha::from("abc123"),
                correlation_id: None,
            }
        }

        #[tokio::test]
        async fn test_create_attaches_latest_iteration_and_complete_reuses_it() {
            let (base, posted) = serve().await;
            let gateway = AzureDevOpsStatuses::new(
                create_api_client(None).unwrap(),
                "acme",
                "pat".to_string(),
            )
            .with_api_base(base);
            let event = event();

            let opened = gateway
                .create(
                    &event,
                    CreateCheckRun {
                        status: None,
                        conclusion: None,
                        details_url: None,
                        output: Some(in_progress_output(&event.head_sha)),
                        old_external_data: None,
                    },
                )
                .await
                .unwrap();
            assert_eq!(opened.external_data["iteration_id"], 3);

            gateway
                .complete(
                    &event,
                    &opened.id,
                    CompleteCheckRun {
                        conclusion: Conclusion::Success,
                        output: in_progress_output(&event.head_sha),
                        details_url: None,
                        old_external_data: Some(opened.external_data.clone()),
                    },
                )
                .await
                .unwrap();

            let posted = posted.lock().unwrap().clone();
            assert_eq!(posted.len(), 2);
            assert_eq!(posted[0]["state"], "pending");
            assert_eq!(posted[0]["iterationId"], 3);
            assert_eq!(posted[1]["state"], "succeeded");
            assert_eq!(posted[1]["iterationId"], 3);
        }
    }
}
