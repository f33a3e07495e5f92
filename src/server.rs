//! HTTP surface: a small JSON API over the engine.
//!
//! Every request authenticates with a bearer token that names the principal;
//! there is no session state. Errors use a single envelope,
//! `{"error": {"code": ..., "message": ...}}`, with the code drawn from the
//! engine's error taxonomy.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::engine::{Engine, QueryRequest};
use crate::error::EngineError;
use crate::ingest::Ingestor;
use crate::migrate;
use crate::openai::OpenAiClient;
use crate::storage::StorageClient;
use crate::tabular::TabularClient;

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    ingestor: Arc<Ingestor>,
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::connect(&config).await?;
    migrate::run_migrations_on(&pool).await?;

    let openai = Arc::new(OpenAiClient::new(&config.openai)?);
    let tabular = Arc::new(TabularClient::new(&config.tabular)?);
    let storage = Arc::new(StorageClient::new(&config.storage)?);

    let engine = Arc::new(Engine::new(
        pool.clone(),
        config.clone(),
        openai.clone(),
        tabular.clone(),
    ));
    let ingestor = Arc::new(Ingestor::new(
        pool,
        config.clone(),
        openai,
        tabular,
        storage,
    ));

    let app = router(AppState { engine, ingestor });

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/query", post(query))
        .route("/ingest", post(ingest))
        .route("/projects/{project_id}/history", get(history))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = principal(&headers)?;
    let response = state.engine.answer_query(&user_id, &request).await?;
    Ok(Json(serde_json::to_value(&response).map_err(|e| {
        ApiError(EngineError::Other(e.into()))
    })?))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    document_id: String,
    #[serde(default)]
    storage_path: Option<String>,
}

async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = principal(&headers)?;
    let report = state
        .ingestor
        .ingest(&request.document_id, &user_id, request.storage_path.as_deref())
        .await?;
    Ok(Json(serde_json::to_value(&report).map_err(|e| {
        ApiError(EngineError::Other(e.into()))
    })?))
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = principal(&headers)?;
    let messages = state.engine.history(&user_id, &project_id).await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

/// The bearer token IS the principal id. Token verification is the fronting
/// gateway's job; this service only requires the header to be present.
fn principal(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError(EngineError::Auth))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(ApiError(EngineError::Auth))?
        .trim();
    if token.is_empty() {
        return Err(ApiError(EngineError::Auth));
    }
    Ok(token.to_string())
}

#[derive(Debug)]
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Auth => StatusCode::UNAUTHORIZED,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Upstream(_) | EngineError::RunFailed { .. } => StatusCode::BAD_GATEWAY,
            EngineError::CodeSafety(_)
            | EngineError::Execution(_)
            | EngineError::Db(_)
            | EngineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        }

        let body = serde_json::json!({
            "error": { "code": self.0.code(), "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", value.parse().unwrap());
        headers
    }

    #[test]
    fn principal_extracts_bearer_token() {
        let headers = headers_with_auth("Bearer user-42");
        assert_eq!(principal(&headers).unwrap(), "user-42");
    }

    #[test]
    fn principal_rejects_missing_header() {
        assert!(principal(&HeaderMap::new()).is_err());
    }

    #[test]
    fn principal_rejects_non_bearer_scheme() {
        let headers = headers_with_auth("Basic dXNlcg==");
        assert!(principal(&headers).is_err());
    }

    #[test]
    fn principal_rejects_empty_token() {
        let headers = headers_with_auth("Bearer ");
        assert!(principal(&headers).is_err());
    }
}
