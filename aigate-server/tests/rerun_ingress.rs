mod common;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use tempfile::TempDir;

use aigate_core::{CommitSha, PullRequestAction, PullRequestEvent};
use aigate_server::webhook::rerun_handler;
use aigate_server::AppState;

use common::{event, FakeGateway, Harness, HarnessOptions};

struct Ingress {
    state: Arc<AppState>,
    gateway: Arc<FakeGateway>,
    workspace: TempDir,
}

async fn ingress() -> Ingress {
    let Harness {
        orchestrator,
        gateway,
        telemetry,
        workspace,
        ..
    } = Harness::new(HarnessOptions::default()).await;
    Ingress {
        state: Arc::new(AppState {
            orchestrator: Arc::new(orchestrator),
            telemetry,
            webhook_secret: None,
            rerun_auth_token: Some("rerun-token".to_string()),
        }),
        gateway,
        workspace,
    }
}

fn authorized() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, "Bearer rerun-token".parse().unwrap());
    headers
}

fn rerun_event() -> PullRequestEvent {
    let mut event = event(PullRequestAction::Synchronize, "abc123def4567890");
    event.base_sha = CommitSha::from("0000111122223333");
    event
}

#[tokio::test]
async fn test_rerun_rejects_path_like_head_sha() {
    let ingress = ingress().await;
    let mut traversal = rerun_event();
    traversal.head_sha = CommitSha::from("../../../../tmp/x");

    let result = rerun_handler(State(ingress.state.clone()), authorized(), Json(traversal)).await;
    assert_eq!(result.err(), Some(StatusCode::BAD_REQUEST));
    assert!(ingress.gateway.calls().is_empty());
    assert!(std::fs::read_dir(ingress.workspace.path())
        .unwrap()
        .next()
        .is_none());
}

#[tokio::test]
async fn test_rerun_rejects_option_like_base_sha() {
    let ingress = ingress().await;
    let mut injected = rerun_event();
    injected.base_sha = CommitSha::from("--upload-pack=touch");

    let result = rerun_handler(State(ingress.state.clone()), authorized(), Json(injected)).await;
    assert_eq!(result.err(), Some(StatusCode::BAD_REQUEST));
    assert!(ingress.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_rerun_requires_token() {
    let ingress = ingress().await;
    let result = rerun_handler(State(ingress.state.clone()), HeaderMap::new(), Json(rerun_event())).await;
    assert_eq!(result.err(), Some(StatusCode::UNAUTHORIZED));
}
