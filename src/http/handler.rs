//! axum router and request handlers over a [`RepositoryManager`].
//!
//! Routes:
//! - `GET  /commit-hash/{version}` - Resolve a branch, tag or commit to its commit id
//! - `GET  /commit-hash`           - Resolve the current branch
//! - `POST /checkout`              - Check out a commit, detaching HEAD
//! - `POST /commits`               - Write one file and commit every pending change
//! - `GET  /health`                - Liveness, independent of the repository
//!
//! Every repository route clones the origin first if the working copy is
//! not ready yet. Manager calls block, so they run on tokio's blocking pool.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::{
    git::Vcs,
    manager::{RepoError, RepositoryManager},
    model::{CommitId, Version},
};

type SharedManager<V> = Arc<RepositoryManager<V>>;

/// Build the axum [`Router`] serving `manager`.
pub fn create_router<V: Vcs>(manager: SharedManager<V>) -> Router {
    Router::new()
        .route("/commit-hash", get(handle_current_commit_hash::<V>))
        // Branch names may contain slashes.
        .route("/commit-hash/{*version}", get(handle_commit_hash::<V>))
        .route("/checkout", post(handle_checkout::<V>))
        .route("/commits", post(handle_commit::<V>))
        .route("/health", get(handle_health))
        .with_state(manager)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitHashResponse {
    pub version: String,
    pub commit_hash: CommitId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub commit_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Relative to the working copy root.
    pub path: String,
    pub content: String,
    pub message: String,
    /// `Name <email>`
    pub author: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    pub commit_hash: CommitId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Ok,
}

#[derive(Debug, Serialize)]
struct Health {
    status: HealthStatus,
}

/// `GET /commit-hash/{version}`
async fn handle_commit_hash<V: Vcs>(
    State(manager): State<SharedManager<V>>,
    Path(version): Path<String>,
) -> Result<Json<CommitHashResponse>, ApiError> {
    resolve(manager, Version::from(version.as_str())).await
}

/// `GET /commit-hash`
async fn handle_current_commit_hash<V: Vcs>(
    State(manager): State<SharedManager<V>>,
) -> Result<Json<CommitHashResponse>, ApiError> {
    resolve(manager, Version::current()).await
}

async fn resolve<V: Vcs>(
    manager: SharedManager<V>,
    version: Version,
) -> Result<Json<CommitHashResponse>, ApiError> {
    let resolved = run_blocking(manager, move |manager| {
        manager
            .resolve(version)
            .map_err(|e| ApiError::bad_request("Failed to get commit hash", e))
    })
    .await?;
    Ok(Json(CommitHashResponse {
        version: resolved.version,
        commit_hash: resolved.commit_id,
    }))
}

/// `POST /checkout`
async fn handle_checkout<V: Vcs>(
    State(manager): State<SharedManager<V>>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CommitResponse>, ApiError> {
    let commit_hash = run_blocking(manager, move |manager| {
        manager
            .checkout_commit(&request.commit_hash)
            .map_err(|e| ApiError::bad_request("Failed to checkout commit", e))
    })
    .await?;
    Ok(Json(CommitResponse { commit_hash }))
}

/// `POST /commits`
///
/// Responds `201 Created` with the id of the new commit.
async fn handle_commit<V: Vcs>(
    State(manager): State<SharedManager<V>>,
    Json(request): Json<CommitRequest>,
) -> Result<(StatusCode, Json<CommitResponse>), ApiError> {
    let commit_hash = run_blocking(manager, move |manager| {
        manager
            .commit_changes(
                &request.path,
                request.content,
                &request.message,
                &request.author,
            )
            .map_err(|e| match e {
                RepoError::CommitPrecondition { .. } => {
                    ApiError::bad_request("Invalid commit request", e)
                }
                other => ApiError::internal("Failed to commit changes", other),
            })
    })
    .await?;
    Ok((StatusCode::CREATED, Json(CommitResponse { commit_hash })))
}

/// `GET /health`
async fn handle_health() -> Json<Health> {
    Json(Health {
        status: HealthStatus::Ok,
    })
}

/// Runs `operation` on the blocking pool once the working copy is ready.
async fn run_blocking<V, T, F>(manager: SharedManager<V>, operation: F) -> Result<T, ApiError>
where
    V: Vcs,
    T: Send + 'static,
    F: FnOnce(&RepositoryManager<V>) -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        if manager
            .ensure_initialized()
            .map_err(ApiError::initialization)?
        {
            debug!("Working copy initialized on demand");
        }
        operation(&manager)
    })
    .await
    .map_err(|e| {
        error!("Repository operation did not complete: {}", e);
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "Repository operation failed",
            details: None,
        }
    })?
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    details: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    fn bad_request(error: &'static str, cause: RepoError) -> Self {
        debug!("{}: {}", error, cause);
        ApiError {
            status: StatusCode::BAD_REQUEST,
            error,
            details: Some(cause.to_string()),
        }
    }

    fn internal(error: &'static str, cause: RepoError) -> Self {
        error!("{}: {}", error, cause);
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error,
            details: Some(cause.to_string()),
        }
    }

    /// The origin URI may carry credentials, so the cause is only logged.
    fn initialization(cause: RepoError) -> Self {
        error!("Repository initialization failed: {}", cause);
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "Repository initialization failed",
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}
