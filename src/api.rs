//! Exposed HTTP routes
//!
//! Thin axum layer over the lifecycle manager and stream server. Caller
//! identity arrives from the upstream auth guard in `X-User-Id` and
//! `X-User-Role` headers; this boundary enforces ownership (admin/owner
//! roles bypass it) and maps the error taxonomy onto HTTP statuses. The
//! manager itself never sees identity.

use crate::error::Error;
use crate::manager::DownloadManager;
use crate::stream;
use crate::types::{DownloadId, StartRequest};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

/// Build the downloads router
pub fn router(manager: Arc<DownloadManager>) -> Router {
    Router::new()
        .route("/downloads", post(start_handler).get(list_handler))
        .route("/downloads/{id}", get(get_handler).delete(delete_handler))
        .route("/downloads/{id}/pause", post(pause_handler))
        .route("/downloads/{id}/resume", post(resume_handler))
        .route("/downloads/{id}/files", get(files_handler))
        .route(
            "/downloads/{id}/stream",
            get(stream_handler).head(stream_head_handler),
        )
        .with_state(manager)
}

/// Authenticated caller, as asserted by the upstream guard
struct Caller {
    id: String,
    role: String,
}

impl Caller {
    fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let id = headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::Unauthenticated)?
            .to_string();
        let role = headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("user")
            .to_string();
        Ok(Self { id, role })
    }

    fn is_privileged(&self) -> bool {
        self.role == "admin" || self.role == "owner"
    }

    fn may_touch(&self, owner_id: &str) -> Result<(), ApiError> {
        if self.is_privileged() || self.id == owner_id {
            Ok(())
        } else {
            Err(Error::Forbidden("download belongs to another user".to_string()).into())
        }
    }
}

/// API-level error with an HTTP status
enum ApiError {
    Unauthenticated,
    Domain(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Domain(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "missing caller identity".to_string(),
            ),
            Self::Domain(err) => {
                let status = match &err {
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::NotActive { .. } => StatusCode::CONFLICT,
                    Error::Forbidden(_) => StatusCode::FORBIDDEN,
                    Error::UnresolvableSource { .. } | Error::PathTraversal { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    Error::Indexer { .. } => StatusCode::BAD_GATEWAY,
                    Error::ReadyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    Error::EngineUnavailable | Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!("request failed: {}", err);
                }
                (status, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<DownloadId, ApiError> {
    DownloadId::parse(raw).ok_or_else(|| Error::NotFound(raw.to_string()).into())
}

#[derive(Debug, Deserialize)]
struct StartBody {
    reference: String,
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(default, rename = "mediaId")]
    media_id: Option<String>,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

async fn start_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;

    let record = manager
        .start(StartRequest {
            reference: body.reference,
            display_name: body.display_name,
            owner_id: caller.id,
            media_id: body.media_id,
            origin: body.origin,
            quality: body.quality,
            language: body.language,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListParams {
    /// Admins may list every user's downloads
    #[serde(default)]
    all: bool,
}

async fn list_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;

    let owner = if params.all && caller.is_privileged() {
        None
    } else {
        Some(caller.id.as_str())
    };

    let downloads = manager.list(owner).await?;
    Ok(Json(downloads).into_response())
}

async fn get_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let id = parse_id(&id)?;

    let view = manager.get(id).await?;
    caller.may_touch(&view.record.owner_id)?;
    Ok(Json(view).into_response())
}

async fn pause_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let id = parse_id(&id)?;

    let view = manager.get(id).await?;
    caller.may_touch(&view.record.owner_id)?;

    manager.pause(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn resume_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let id = parse_id(&id)?;

    let view = manager.get(id).await?;
    caller.may_touch(&view.record.owner_id)?;

    let record = manager.resume(id).await?;
    Ok(Json(record).into_response())
}

async fn delete_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let id = parse_id(&id)?;

    let view = manager.get(id).await?;
    caller.may_touch(&view.record.owner_id)?;

    manager.delete(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn files_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let id = parse_id(&id)?;

    let view = manager.get(id).await?;
    caller.may_touch(&view.record.owner_id)?;

    let files = stream::list_files(&manager, id).await?;
    Ok(Json(files).into_response())
}

async fn stream_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let id = parse_id(&id)?;

    let view = manager.get(id).await?;
    caller.may_touch(&view.record.owner_id)?;

    Ok(stream::serve(&manager, id, &headers, false).await?)
}

async fn stream_head_handler(
    State(manager): State<Arc<DownloadManager>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let id = parse_id(&id)?;

    let view = manager.get(id).await?;
    caller.may_touch(&view.record.owner_id)?;

    Ok(stream::serve(&manager, id, &headers, true).await?)
}
