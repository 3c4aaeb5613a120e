use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, warn};

use aigate_core::{CommitSha, EventRepository, Provider, PullRequestAction, PullRequestEvent};

use crate::http::new_correlation_id;
use crate::AppState;

/// Correlation id assigned to an incoming request.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

#[derive(Debug, Deserialize)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestRef,
    pub base: PullRequestRef,
    #[serde(default)]
    pub merged: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestRef {
    pub sha: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub owner: User,
    pub clone_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RerunResponse {
    pub success: bool,
}

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.webhook_secret.as_deref() else {
        error!("GITHUB_WEBHOOK_SECRET is not configured, rejecting webhook");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut request = Request::from_parts(parts, axum::body::Body::from(bytes));
    request
        .extensions_mut()
        .insert(CorrelationId(new_correlation_id()));

    Ok(next.run(request).await)
}

/// Normalize a GitHub `pull_request` payload.
///
/// Returns `None` when the payload lacks the pull request, repository or
/// action.
pub fn github_pull_request_event(
    payload: &GitHubWebhookPayload,
    correlation_id: Option<String>,
) -> Option<PullRequestEvent> {
    let action = payload.action.as_deref()?;
    let pr = payload.pull_request.as_ref()?;
    let repo = payload.repository.as_ref()?;

    Some(PullRequestEvent {
        provider: Provider::GitHub,
        action: PullRequestAction::parse(action),
        merged: pr.merged.unwrap_or(false),
        repository: EventRepository {
            external_id: repo.id.to_string(),
            owner: repo.owner.login.clone(),
            name: repo.name.clone(),
            clone_url: repo.clone_url.clone(),
        },
        installation_id: payload.installation.as_ref().map(|i| i.id),
        pr_number: pr.number,
        base_sha: CommitSha(pr.base.sha.clone()),
        head_sha: CommitSha(pr.head.sha.clone()),
        correlation_id,
    })
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone());
    let event_name = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if event_name != "pull_request" {
        info!("Ignoring {:?} webhook", event_name);
        return Ok(Json(WebhookResponse {
            message: format!("Ignored {} event", event_name),
        }));
    }

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let payload: GitHubWebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    let Some(event) = github_pull_request_event(&payload, correlation_id) else {
        warn!("pull_request webhook without pull request or repository information");
        return Ok(Json(WebhookResponse {
            message: "Incomplete pull_request payload ignored".to_string(),
        }));
    };

    if !event.has_well_formed_shas() {
        warn!("pull_request webhook with malformed commit SHAs rejected");
        return Err(StatusCode::BAD_REQUEST);
    }

    if let PullRequestAction::Other(action) = &event.action {
        info!("Ignoring pull_request action {:?}", action);
        return Ok(Json(WebhookResponse {
            message: format!("Ignored action {}", action),
        }));
    }

    info!(
        "PR #{} in {}: {:?} at {}",
        event.pr_number,
        event.repository.full_name(),
        event.action,
        event.head_sha.short()
    );

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        info!(
            "Spawned background task for PR #{} analysis",
            event.pr_number
        );
        if !orchestrator.run(&event).await {
            warn!("Analysis of PR #{} did not succeed", event.pr_number);
        }
    });

    Ok(Json(WebhookResponse {
        message: "Pull request event accepted".to_string(),
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Compare digests so the comparison time does not depend on where the
/// tokens first differ.
fn tokens_match(expected: &str, provided: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(provided.as_bytes())
}

/// Manual re-run. The body is a normalized event; the run is awaited.
pub async fn rerun_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut event): Json<PullRequestEvent>,
) -> Result<Json<RerunResponse>, StatusCode> {
    let Some(expected) = state.rerun_auth_token.as_deref() else {
        return Err(StatusCode::FORBIDDEN);
    };
    match bearer_token(&headers) {
        Some(provided) if tokens_match(expected, provided) => {}
        _ => return Err(StatusCode::UNAUTHORIZED),
    }

    if !event.has_well_formed_shas() {
        warn!("Re-run of PR #{} rejected: malformed commit SHAs", event.pr_number);
        return Err(StatusCode::BAD_REQUEST);
    }
    if event.correlation_id.is_none() {
        event.correlation_id = Some(new_correlation_id());
    }
    info!(
        "Manual re-run of PR #{} in {} at {}",
        event.pr_number,
        event.repository.full_name(),
        event.head_sha.short()
    );

    let success = state.orchestrator.run(&event).await;
    Ok(Json(RerunResponse { success }))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
        .route("/rerun", post(rerun_handler))
}
