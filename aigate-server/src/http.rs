//! Shared outgoing HTTP plumbing: correlation ids and retries.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::http;
use reqwest::header::HeaderValue;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{
    ClientBuilder, ClientWithMiddleware, Middleware, Next, Result as MiddlewareResult,
};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

const USER_AGENT: &str = concat!("aigate/", env!("CARGO_PKG_VERSION"));

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Stamps every outgoing request with a correlation id unless the caller
/// already set one.
pub struct CorrelationMiddleware;

#[async_trait::async_trait]
impl Middleware for CorrelationMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&new_correlation_id()) {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }
        debug!(method = %req.method(), url = %req.url(), "Outgoing request");
        next.run(req, extensions).await
    }
}

/// Retries transport errors and 5xx responses with linear backoff.
///
/// Requests with streaming bodies cannot be cloned and are sent once.
pub struct RetryMiddleware {
    max_retries: u32,
    backoff: Duration,
}

impl RetryMiddleware {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let mut attempt = 0;
        loop {
            let Some(current) = req.try_clone() else {
                return next.run(req, extensions).await;
            };
            let result = next.clone().run(current, extensions).await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(_) => true,
            };
            if !retryable || attempt >= self.max_retries {
                return result;
            }
            attempt += 1;
            match &result {
                Ok(response) => warn!(
                    "Request to {} returned {}, retrying ({}/{})",
                    req.url(),
                    response.status(),
                    attempt,
                    self.max_retries
                ),
                Err(e) => warn!(
                    "Request to {} failed: {}, retrying ({}/{})",
                    req.url(),
                    e,
                    attempt,
                    self.max_retries
                ),
            }
            tokio::time::sleep(self.backoff * attempt).await;
        }
    }
}

/// Build a client for provider APIs. Correlation ids are always attached.
pub fn create_api_client(timeout: Option<Duration>) -> Result<ClientWithMiddleware> {
    let mut builder = Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder.build().context("Failed to create HTTP client")?;
    Ok(ClientBuilder::new(client).with(CorrelationMiddleware).build())
}

/// Build a client that additionally retries transient failures.
pub fn create_retrying_client(
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
) -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")?;
    Ok(ClientBuilder::new(client)
        .with(CorrelationMiddleware)
        .with(RetryMiddleware::new(max_retries, backoff))
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(new_correlation_id(), new_correlation_id());
        assert_eq!(new_correlation_id().len(), 36);
    }
}
