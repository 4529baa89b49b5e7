//! Axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET /health`, `GET /healthz`    - liveness probe
//! - anything else                    - gated git CGI path
//!
//! Git paths look like `/<repo>.git[/<tail>]`.  The repo name is everything
//! up to the first `.git` that sits at a `/`-or-end boundary, so namespaced
//! names containing slashes work.  Each git request serializes on its repo,
//! refreshes the mirror from upstream, and is then handed to the backend.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, error, info, instrument, warn};

use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_health))
        .fallback(handle_git)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` and `GET /healthz`.
async fn handle_health() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        "{\"status\":\"ok\"}",
    )
}

/// Every non-health path: parse the repo, serialize, sync, gate through the
/// CGI backend.  Unexpected failures surface as a plain 500.
async fn handle_git(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match serve_git(state, request).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %format!("{err:#}"), "git request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

#[instrument(skip_all, fields(path = %request.uri().path(), method = %request.method()))]
async fn serve_git(state: Arc<AppState>, request: Request) -> anyhow::Result<Response> {
    let path = request.uri().path().to_string();

    let Some((repo, tail)) = parse_repo_path(&path) else {
        debug!("path does not match /<repo>.git");
        return Ok((StatusCode::NOT_FOUND, "Not Found - Invalid repo path").into_response());
    };

    if !state.config.repos.contains_key(&repo) {
        warn!(%repo, "request for unknown repo");
        return Ok((
            StatusCode::NOT_FOUND,
            format!("Not Found - Unknown repo: {repo}"),
        )
            .into_response());
    }

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await?;

    let mirror = state.store.path(&repo);
    let script_name = format!("/{repo}.git");

    let response = state
        .locks
        .with_exclusive(&repo, async {
            if let Err(err) = state.store.sync(&repo, &state.ssh_env).await {
                warn!(%repo, error = %format!("{err:#}"), "upstream sync failed");
                return Ok((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Error - Failed to sync with upstream",
                )
                    .into_response());
            }
            info!(%repo, tail = %tail, "mirror synced; invoking git backend");
            crate::cgi::serve(&mirror, &script_name, &tail, &parts, body).await
        })
        .await?;

    Ok(response)
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

/// Split `/<repo>.git[/<tail>]` into `(repo, tail)`.  The first `.git`
/// followed by `/` or end-of-path wins, so repo names may contain slashes
/// (and even `.git` deeper in the name never matches mid-segment).
fn parse_repo_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix('/')?;
    for (idx, _) in rest.match_indices(".git") {
        let after = &rest[idx + 4..];
        if after.is_empty() || after.starts_with('/') {
            let repo = &rest[..idx];
            if repo.is_empty() {
                return None;
            }
            return Some((repo.to_string(), after.to_string()));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_repo_path() {
        assert_eq!(
            parse_repo_path("/demo.git"),
            Some(("demo".to_string(), String::new()))
        );
    }

    #[test]
    fn repo_with_tail() {
        assert_eq!(
            parse_repo_path("/demo.git/info/refs"),
            Some(("demo".to_string(), "/info/refs".to_string()))
        );
    }

    #[test]
    fn namespaced_repo_name() {
        assert_eq!(
            parse_repo_path("/team/sub/app.git/git-receive-pack"),
            Some(("team/sub/app".to_string(), "/git-receive-pack".to_string()))
        );
    }

    #[test]
    fn first_boundary_wins() {
        assert_eq!(
            parse_repo_path("/a.git/b.git"),
            Some(("a".to_string(), "/b.git".to_string()))
        );
    }

    #[test]
    fn dot_git_mid_segment_is_not_a_boundary() {
        assert_eq!(
            parse_repo_path("/a.github/x"),
            None,
            ".github must not terminate the repo name"
        );
        assert_eq!(
            parse_repo_path("/a.github/x.git"),
            Some(("a.github/x".to_string(), String::new()))
        );
    }

    #[test]
    fn invalid_paths() {
        assert_eq!(parse_repo_path("/"), None);
        assert_eq!(parse_repo_path("/.git"), None);
        assert_eq!(parse_repo_path("/no-suffix"), None);
        assert_eq!(parse_repo_path("no-leading-slash.git"), None);
    }

    #[tokio::test]
    async fn health_body_is_fixed_json() {
        let response = handle_health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"{\"status\":\"ok\"}");
    }
}
