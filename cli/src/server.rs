use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info};

use tally_core::db::Database;
use tally_core::models::{RecordKind, validate_amount, validate_name};
use tally_core::remote::RemoteDocument;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB

pub(crate) const IDEMPOTENCY_KEY: &str = "idempotency-key";

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    api_key: Option<String>,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct StatusPatch {
    status: bool,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Validation ---

fn collection_kind(collection: &str) -> Result<RecordKind, ApiError> {
    RecordKind::from_collection(collection)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown collection '{collection}'")))
}

/// Parse and validate a document body, returning its normalized JSON form.
fn normalize_document(body: serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let doc: RemoteDocument = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid document: {e}")))?;
    validate_name(&doc.name).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_amount(doc.amount).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let value = serde_json::to_value(doc).context("failed to serialize document")?;
    Ok(value)
}

// --- Handlers ---

async fn list_documents(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    collection_kind(&collection)?;
    let docs = state
        .db()
        .list_documents(&collection)
        .context("failed to list documents")?;
    Ok(Json(docs))
}

async fn create_document(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    collection_kind(&collection)?;
    let body = normalize_document(body)?;
    let client_key = headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    let (id, created) = state
        .db()
        .create_document(&collection, client_key, &body)
        .context("failed to create document")?;

    if created {
        debug!(collection = %collection, id = %id, "created document");
        Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
    } else {
        debug!(collection = %collection, id = %id, "replayed create");
        Ok((StatusCode::OK, Json(CreatedResponse { id })))
    }
}

async fn get_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    collection_kind(&collection)?;
    let doc = state
        .db()
        .get_document(&collection, &id)
        .context("failed to read document")?;
    doc.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No document '{id}' in {collection}")))
}

async fn put_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    collection_kind(&collection)?;
    let body = normalize_document(body)?;
    let db = state.db();
    db.put_document(&collection, &id, &body)
        .context("failed to write document")?;
    let doc = db
        .get_document(&collection, &id)
        .context("failed to read document")?
        .ok_or_else(|| anyhow::anyhow!("document {id} vanished after write"))?;
    Ok(Json(doc))
}

async fn patch_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<StatusPatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    collection_kind(&collection)?;
    let mut fields = serde_json::Map::new();
    fields.insert("status".to_string(), serde_json::Value::Bool(patch.status));
    let doc = state
        .db()
        .patch_document(&collection, &id, &fields)
        .context("failed to patch document")?;
    doc.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No document '{id}' in {collection}")))
}

async fn delete_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    collection_kind(&collection)?;
    let removed = state
        .db()
        .delete_document(&collection, &id)
        .context("failed to delete document")?;
    debug!(collection = %collection, id = %id, removed, "deleted document");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn router(db: Database, api_key: Option<String>) -> Router {
    build_router(AppState {
        db: Arc::new(Mutex::new(db)),
        api_key,
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/collections/{collection}/documents",
            get(list_documents).post(create_document),
        )
        .route(
            "/api/collections/{collection}/documents/{id}",
            get(get_document)
                .put(put_document)
                .patch(patch_document)
                .delete(delete_document),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// First and last four characters of the key. Short keys are fully masked.
fn key_preview(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

pub async fn start_server(
    db: Database,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            key_preview(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let app = router(db, api_key);
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
