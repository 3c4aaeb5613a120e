//! Client for the tier-specific analysis queues.

use std::time::Duration;

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::http::{create_retrying_client, CORRELATION_ID_HEADER};

/// Message consumed by queue workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub repository_path: String,
    pub selective: bool,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Transport(String),

    #[error("queue rejected message with status {status}")]
    Rejected { status: u16 },
}

#[async_trait]
pub trait QueueSender: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        message: &QueueMessage,
        correlation_id: Option<&str>,
    ) -> Result<(), QueueError>;
}

/// Process-wide queue client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClientConfig {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for QueueClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Posts queue messages as JSON over HTTP.
pub struct HttpQueueClient {
    client: ClientWithMiddleware,
}

impl HttpQueueClient {
    pub fn new(config: QueueClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: create_retrying_client(
                config.request_timeout,
                config.max_retries,
                config.retry_backoff,
            )?,
        })
    }
}

#[async_trait]
impl QueueSender for HttpQueueClient {
    async fn send(
        &self,
        endpoint: &str,
        message: &QueueMessage,
        correlation_id: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut request = self.client.post(endpoint).json(message);
        if let Some(cid) = correlation_id {
            request = request.header(CORRELATION_ID_HEADER, cid);
        }
        let response = request
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(QueueError::Rejected {
                status: response.status().as_u16(),
            });
        }
        info!("Enqueued analysis of {}", message.repository_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails with 503 until `failures` requests have been seen.
    async fn serve(failures: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/queue",
                post(
                    move |State(hits): State<Arc<AtomicUsize>>, Json(message): Json<QueueMessage>| async move {
                        assert!(message.selective);
                        if hits.fetch_add(1, Ordering::SeqCst) < failures {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::ACCEPTED
                        }
                    },
                ),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/queue", addr), hits)
    }

    fn client(max_retries: u32) -> HttpQueueClient {
        HttpQueueClient::new(QueueClientConfig {
            request_timeout: Duration::from_secs(5),
            max_retries,
            retry_backoff: Duration::from_millis(1),
        })
        .unwrap()
    }

    fn message() -> QueueMessage {
        QueueMessage {
            repository_path: "/srv/aigate/1/42-abc123/repository".to_string(),
            selective: true,
        }
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let (url, hits) = serve(2).await;
        client(2).send(&url, &message(), Some("cid")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (url, hits) = serve(10).await;
        let err = client(1).send(&url, &message(), None).await.unwrap_err();
        assert!(matches!(err, QueueError::Rejected { status: 503 }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_value(message()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "repository_path": "/srv/aigate/1/42-abc123/repository",
                "selective": true
            })
        );
    }
}
