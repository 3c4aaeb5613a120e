use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info};

use aigate_core::{
    CheckRunId, CheckRunOutput, CheckRunStatus, Conclusion, Provider, PullRequestEvent,
};

use super::{
    external_string, CheckRunGateway, CheckRunHandle, CompleteCheckRun, CreateCheckRun,
    GatewayError,
};
use crate::http::{create_api_client, CORRELATION_ID_HEADER};

const GITHUB_API: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";

/// GitHub App client: JWT authentication, installation tokens and the
/// check-runs API.
#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_base: String,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Default, Serialize)]
pub struct CheckRunBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<GitHubOutput<'a>>,
}

#[derive(Debug, Serialize)]
pub struct GitHubOutput<'a> {
    pub title: &'a str,
    pub summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<&'a str>,
}

impl<'a> From<&'a CheckRunOutput> for GitHubOutput<'a> {
    fn from(output: &'a CheckRunOutput) -> Self {
        Self {
            title: &output.title,
            summary: &output.summary,
            text: output.text.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckRunResponse {
    pub id: u64,
    pub head_sha: String,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Result<Self> {
        Ok(Self {
            client: create_api_client(None)?,
            api_base: GITHUB_API.to_string(),
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Point the client at a different API root (GitHub Enterprise, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,
            exp: now + 600,
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    /// Installation access token, served from cache while it has more than
    /// five minutes left.
    pub async fn installation_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", ACCEPT)
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub App token request failed: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub App token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + Duration::from_secs(expires_at.timestamp().max(0) as u64);

        self.token_cache.write().await.insert(
            installation_id,
            (token_response.token.clone(), expires_at_system),
        );

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    #[cfg(test)]
    async fn seed_token(&self, installation_id: u64, token: &str) {
        self.token_cache.write().await.insert(
            installation_id,
            (
                token.to_string(),
                SystemTime::now() + Duration::from_secs(3600),
            ),
        );
    }

    async fn authorized(
        &self,
        builder: RequestBuilder,
        correlation_id: Option<&str>,
        installation_id: u64,
    ) -> Result<RequestBuilder> {
        let token = self.installation_token(installation_id).await?;
        let mut builder = builder
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", ACCEPT);
        if let Some(cid) = correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, cid);
        }
        Ok(builder)
    }

    async fn send_check_run(
        &self,
        builder: RequestBuilder,
        body: &CheckRunBody<'_>,
        action: &str,
    ) -> Result<CheckRunResponse> {
        let response = builder
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", action))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error: {} - {}", status, error_text);
            return Err(anyhow!("GitHub API error: {} - {}", status, error_text));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", action))
    }

    pub async fn create_check_run(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        body: &CheckRunBody<'_>,
    ) -> Result<CheckRunResponse> {
        let url = format!(
            "{}/repos/{}/{}/check-runs",
            self.api_base, repo_owner, repo_name
        );
        info!("Creating check run in {}/{}", repo_owner, repo_name);
        let builder = self
            .authorized(self.client.post(&url), correlation_id, installation_id)
            .await?;
        let check_run = self.send_check_run(builder, body, "create check run").await?;
        info!("Created check run {}", check_run.id);
        Ok(check_run)
    }

    pub async fn update_check_run(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        check_run_id: u64,
        body: &CheckRunBody<'_>,
    ) -> Result<CheckRunResponse> {
        let url = format!(
            "{}/repos/{}/{}/check-runs/{}",
            self.api_base, repo_owner, repo_name, check_run_id
        );
        info!(
            "Updating check run {} in {}/{}",
            check_run_id, repo_owner, repo_name
        );
        let builder = self
            .authorized(self.client.patch(&url), correlation_id, installation_id)
            .await?;
        self.send_check_run(builder, body, "update check run").await
    }
}

/// Check runs on GitHub through a GitHub App installation.
#[derive(Clone)]
pub struct GitHubCheckRuns {
    client: GitHubClient,
    name: String,
}

impl GitHubCheckRuns {
    pub fn new(client: GitHubClient, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

fn status_str(status: CheckRunStatus) -> &'static str {
    match status {
        CheckRunStatus::Queued => "queued",
        CheckRunStatus::InProgress => "in_progress",
        CheckRunStatus::Completed => "completed",
    }
}

/// GitHub has no `error` conclusion.
fn conclusion_str(conclusion: Conclusion) -> &'static str {
    match conclusion {
        Conclusion::Success => "success",
        Conclusion::Failure | Conclusion::Error => "failure",
        Conclusion::Neutral => "neutral",
        Conclusion::Cancelled => "cancelled",
    }
}

fn installation(event: &PullRequestEvent) -> Result<u64, GatewayError> {
    event.installation_id.ok_or(GatewayError::MissingContext {
        provider: Provider::GitHub,
        what: "an installation id",
    })
}

fn parse_id(id: &CheckRunId) -> Result<u64, GatewayError> {
    id.0.parse()
        .map_err(|_| GatewayError::request(Provider::GitHub, format!("invalid check run id {}", id)))
}

fn handle(response: CheckRunResponse) -> CheckRunHandle {
    CheckRunHandle {
        id: CheckRunId::from(response.id),
        external_data: json!({
            "check_run_id": response.id,
            "head_sha": response.head_sha,
        }),
    }
}

#[async_trait]
impl CheckRunGateway for GitHubCheckRuns {
    async fn create(
        &self,
        event: &PullRequestEvent,
        request: CreateCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        let installation_id = installation(event)?;
        let output = request.output.as_ref().map(GitHubOutput::from);
        let body = CheckRunBody {
            name: Some(&self.name),
            head_sha: Some(&event.head_sha.0),
            status: request.status.map(status_str),
            conclusion: request.conclusion.map(conclusion_str),
            details_url: request.details_url.as_deref(),
            output,
        };

        // A run already exists for this head commit: reuse it.
        let previous_head = external_string(request.old_external_data.as_ref(), "head_sha");
        let previous_id = external_string(request.old_external_data.as_ref(), "check_run_id")
            .and_then(|id| id.parse::<u64>().ok());
        let response = match (previous_id, previous_head) {
            (Some(id), Some(head)) if head == event.head_sha.0 => {
                self.client
                    .update_check_run(
                        event.correlation_id.as_deref(),
                        installation_id,
                        &event.repository.owner,
                        &event.repository.name,
                        id,
                        &body,
                    )
                    .await
            }
            _ => {
                self.client
                    .create_check_run(
                        event.correlation_id.as_deref(),
                        installation_id,
                        &event.repository.owner,
                        &event.repository.name,
                        &body,
                    )
                    .await
            }
        }
        .map_err(|e| GatewayError::request(Provider::GitHub, format!("{:#}", e)))?;

        Ok(handle(response))
    }

    async fn update(
        &self,
        event: &PullRequestEvent,
        id: &CheckRunId,
        output: CheckRunOutput,
    ) -> Result<(), GatewayError> {
        let body = CheckRunBody {
            output: Some(GitHubOutput::from(&output)),
            ..Default::default()
        };
        self.client
            .update_check_run(
                event.correlation_id.as_deref(),
                installation(event)?,
                &event.repository.owner,
                &event.repository.name,
                parse_id(id)?,
                &body,
            )
            .await
            .map_err(|e| GatewayError::request(Provider::GitHub, format!("{:#}", e)))?;
        Ok(())
    }

    async fn complete(
        &self,
        event: &PullRequestEvent,
        id: &CheckRunId,
        request: CompleteCheckRun,
    ) -> Result<CheckRunHandle, GatewayError> {
        let body = CheckRunBody {
            status: Some(status_str(CheckRunStatus::Completed)),
            conclusion: Some(conclusion_str(request.conclusion)),
            details_url: request.details_url.as_deref(),
            output: Some(GitHubOutput::from(&request.output)),
            ..Default::default()
        };
        let response = self
            .client
            .update_check_run(
                event.correlation_id.as_deref(),
                installation(event)?,
                &event.repository.owner,
                &event.repository.name,
                parse_id(id)?,
                &body,
            )
            .await
            .map_err(|e| GatewayError::request(Provider::GitHub, format!("{:#}", e)))?;
        Ok(handle(response))
    }
}
