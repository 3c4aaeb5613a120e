//! Provider check-run gateways.
//!
//! Each git provider exposes a different API for attaching a pass/fail
//! annotation to a pull request. They are all driven through the same
//! create / update / complete capability.

mod azure;
mod bitbucket;
mod github;

pub use azure::AzureDevOpsStatuses;
pub use bitbucket::BitbucketReports;
pub use github::{GitHubCheckRuns, GitHubClient};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use aigate_core::{
    CheckRunId, CheckRunOutput, CheckRunStatus, Conclusion, ExternalData, Provider,
    PullRequestEvent,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no check-run gateway registered for {0}")]
    Unsupported(Provider),

    #[error("{provider} event is missing {what}")]
    MissingContext {
        provider: Provider,
        what: &'static str,
    },

    #[error("{provider} request failed: {message}")]
    Request { provider: Provider, message: String },

    #[error("{provider} API returned {status}: {body}")]
    Api {
        provider: Provider,
        status: u16,
        body: String,
    },
}

impl GatewayError {
    pub fn request(provider: Provider, error: impl std::fmt::Display) -> Self {
        Self::Request {
            provider,
            message: error.to_string(),
        }
    }
}

/// Parameters for creating a check run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateCheckRun {
    pub status: Option<CheckRunStatus>,
    pub conclusion: Option<Conclusion>,
    pub details_url: Option<String>,
    pub output: Option<CheckRunOutput>,
    /// Continuation data from an earlier check run on the same pull request.
    pub old_external_data: Option<ExternalData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteCheckRun {
    pub conclusion: Conclusion,
    pub output: CheckRunOutput,
    pub details_url: Option<String>,
    pub old_external_data: Option<ExternalData>,
}

/// A check run as the provider knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRunHandle {
    pub id: CheckRunId,
    pub external_data: ExternalData,
}

#[async_trait]
pub trait CheckRunGateway: Send + Sync {
    async fn create(
        &self,
        event: &PullRequestEvent,
        request: CreateCheckRun,
    ) -> Result<CheckRunHandle, GatewayError>;

    /// Replace the visible output of a running check.
    async fn update(
        &self,
        event: &PullRequestEvent,
        id: &CheckRunId,
        output: CheckRunOutput,
    ) -> Result<(), GatewayError>;

    async fn complete(
        &self,
        event: &PullRequestEvent,
        id: &CheckRunId,
        request: CompleteCheckRun,
    ) -> Result<CheckRunHandle, GatewayError>;
}

/// Gateways keyed by the provider they talk to.
#[derive(Clone, Default)]
pub struct CheckRunGateways {
    gateways: HashMap<Provider, Arc<dyn CheckRunGateway>>,
}

impl CheckRunGateways {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Provider, gateway: Arc<dyn CheckRunGateway>) {
        self.gateways.insert(provider, gateway);
    }

    pub fn with(mut self, provider: Provider, gateway: Arc<dyn CheckRunGateway>) -> Self {
        self.register(provider, gateway);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn CheckRunGateway>, GatewayError> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or(GatewayError::Unsupported(provider))
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.gateways.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

/// Read a string field from continuation data, accepting numbers too.
pub(crate) fn external_string(data: Option<&ExternalData>, key: &str) -> Option<String> {
    match data?.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
