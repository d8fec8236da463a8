mod bulk;
mod clock;
mod config;
mod error;
mod guard;
mod kv;
mod metrics;
mod models;
mod notify;
mod security;
mod store;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use bulk::corrections::Locale;
use bulk::staging::Resolution;
use bulk::{BulkUploads, CommitReport, PreviewPage, PreviewQuery, ResolvedRow, UploadReport};
use clock::{Clock, SystemClock};
use config::AppConfig;
use error::{ErrorKind, MarketError};
use guard::{BlockRecord, BlockStatus, Guard};
use kv::{KvStore, MemoryKv, RedisStore};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ShopProduct, UploadBatch};
use notify::{LogNotifier, UploadNotifier, WebhookNotifier};
use security::{AuthState, DEMO_SELLER_ID, Principal, guard_requests, limit_uploads, require_principal};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use store::memory::MemoryStore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

/// Headroom over the file size limit so oversize files reach the parser.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "sokoni.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::open(url)?),
        None => {
            warn!(
                target = "sokoni.api",
                "REDIS_URL not set; rate limits and blocks are kept in process memory"
            );
            Arc::new(MemoryKv::new(clock.clone()))
        }
    };
    let notifier: Arc<dyn UploadNotifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            notify::build_client(config.http_timeout_secs, config.http_connect_timeout_secs),
            url.clone(),
        )),
        None => Arc::new(LogNotifier),
    };
    let store = MemoryStore::demo(DEMO_SELLER_ID).await;
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        uploads: BulkUploads::new(Arc::new(store), clock.clone(), notifier, config.bulk),
        guard: Guard::new(kv, clock, &config.guard),
        prometheus_handle,
        metrics_key: std::env::var("METRICS_KEY").ok(),
    };
    let app = build_router(state, AuthState::from_env());

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "sokoni.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    uploads: BulkUploads,
    guard: Guard,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

fn build_router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);
    let body_limit = state.uploads.config().limits.max_bytes + BODY_LIMIT_SLACK;
    let upload_limit = middleware::from_fn_with_state(state.guard.clone(), limit_uploads);

    // Layers wrap outward: the principal is attached before the upload
    // limiter reads it.
    let protected = Router::new()
        .route(
            "/shops/{shop_id}/uploads",
            get(list_batches).merge(post(upload_file).layer(upload_limit.clone())),
        )
        .route("/uploads/{batch_id}", get(get_batch))
        .route("/uploads/{batch_id}/rows", get(preview_rows))
        .route(
            "/uploads/{batch_id}/rows/{row_index}/resolution",
            put(resolve_row),
        )
        .route(
            "/uploads/{batch_id}/commit",
            post(commit_upload).layer(upload_limit),
        )
        .route("/uploads/{batch_id}/cancel", post(cancel_upload))
        .route("/uploads/{batch_id}/listings", get(batch_listings))
        .route("/uploads/{batch_id}/corrections", get(download_corrections))
        .nest(
            "/admin",
            Router::new()
                .route("/blocks", get(list_blocks).post(create_block))
                .route(
                    "/blocks/{identifier}",
                    get(block_status).delete(remove_block),
                )
                .route("/violations/{identifier}", delete(clear_violations)),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_principal));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.guard.clone(),
            guard_requests,
        ))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "sokoni-api",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Stage a spreadsheet of products for one shop.
///
/// - Method: `POST`
/// - Path: `/shops/{shop_id}/uploads`
/// - Auth: seller owning the shop, or an admin
/// - Body: the raw file; `Content-Type` picks the format, `X-File-Name`
///   names it
/// - Response: `201` with the staged batch, row errors and stage transcript
async fn upload_file(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(shop_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadReport>), AppError> {
    crate::metrics::inc_requests("/shops/{shop_id}/uploads");
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let file_name = headers
        .get("X-File-Name")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("upload.csv");
    info!(
        target = "sokoni.api",
        user_id = %principal.user_id,
        shop_id = %shop_id,
        bytes = body.len(),
        "bulk upload received",
    );
    let report = state
        .uploads
        .upload(&principal, shop_id, file_name, content_type, &body)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn list_batches(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(shop_id): Path<Uuid>,
) -> Result<Json<Vec<UploadBatch>>, AppError> {
    crate::metrics::inc_requests("/shops/{shop_id}/uploads");
    Ok(Json(state.uploads.list_batches(&principal, shop_id).await?))
}

async fn get_batch(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<UploadBatch>, AppError> {
    crate::metrics::inc_requests("/uploads/{batch_id}");
    Ok(Json(state.uploads.batch(&principal, batch_id).await?))
}

/// Page through staged rows.
///
/// - Method: `GET`
/// - Path: `/uploads/{batch_id}/rows?page=&per_page=&filter=all|valid|invalid`
async fn preview_rows(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<PreviewPage>, AppError> {
    crate::metrics::inc_requests("/uploads/{batch_id}/rows");
    Ok(Json(
        state.uploads.preview(&principal, batch_id, query).await?,
    ))
}

/// Settle an ambiguous match.
///
/// - Method: `PUT`
/// - Path: `/uploads/{batch_id}/rows/{row_index}/resolution`
/// - Body: `{"action":"product","product_id":"..."}` or `{"action":"create_new"}`
async fn resolve_row(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((batch_id, row_index)): Path<(Uuid, usize)>,
    Json(resolution): Json<Resolution>,
) -> Result<Json<ResolvedRow>, AppError> {
    crate::metrics::inc_requests("/uploads/{batch_id}/rows/{row_index}/resolution");
    Ok(Json(
        state
            .uploads
            .resolve(&principal, batch_id, row_index, resolution)
            .await?,
    ))
}

/// Publish every valid row of a staged batch in one transaction.
///
/// - Method: `POST`
/// - Path: `/uploads/{batch_id}/commit`
/// - Response: the committed batch and a per-status summary
async fn commit_upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<CommitReport>, AppError> {
    crate::metrics::inc_requests("/uploads/{batch_id}/commit");
    Ok(Json(state.uploads.commit(&principal, batch_id).await?))
}

async fn cancel_upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<UploadBatch>, AppError> {
    crate::metrics::inc_requests("/uploads/{batch_id}/cancel");
    Ok(Json(state.uploads.cancel(&principal, batch_id).await?))
}

async fn batch_listings(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<Vec<ShopProduct>>, AppError> {
    crate::metrics::inc_requests("/uploads/{batch_id}/listings");
    Ok(Json(state.uploads.listings(&principal, batch_id).await?))
}

#[derive(Debug, Deserialize)]
struct CorrectionsQuery {
    #[serde(default)]
    locale: Option<String>,
}

/// Download invalid rows as a re-uploadable CSV.
///
/// - Method: `GET`
/// - Path: `/uploads/{batch_id}/corrections?locale=fr`
async fn download_corrections(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<CorrectionsQuery>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/uploads/{batch_id}/corrections");
    let locale = match query.locale.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        Some(tag) => Some(Locale::parse(tag).ok_or_else(|| {
            MarketError::invalid_input("corrections", format!("unsupported locale `{tag}`"))
        })?),
        None => None,
    };
    let file = state
        .uploads
        .corrections(&principal, batch_id, locale)
        .await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&file.file_name),
            ),
        ],
        file.bytes,
    )
        .into_response())
}

/// Quotes, backslashes and non-printable bytes cannot appear inside a
/// quoted `filename`.
fn content_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .filter(|c| (c.is_ascii_graphic() || *c == ' ') && *c != '"' && *c != '\\')
        .collect();
    let safe = safe.trim();
    let safe = if safe.is_empty() { "corrections.csv" } else { safe };
    format!("attachment; filename=\"{safe}\"")
}

#[derive(Debug, Deserialize)]
struct BlockRequest {
    identifier: String,
    duration_secs: u64,
    #[serde(default)]
    reason: Option<String>,
}

fn require_admin(principal: &Principal) -> Result<(), AppError> {
    if principal.role.is_admin() {
        Ok(())
    } else {
        Err(MarketError::forbidden("admin", "admin role required").into())
    }
}

/// Active blocks plus the limits and escalation in force.
///
/// - Method: `GET`
/// - Path: `/admin/blocks`
/// - Auth: admin
async fn list_blocks(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, AppError> {
    require_admin(&principal)?;
    let blocks = state.guard.blocker.list_blocked().await?;
    let limits: Vec<Value> = [&state.guard.global, &state.guard.uploads]
        .into_iter()
        .map(|limiter| {
            let policy = limiter.policy();
            json!({
                "name": policy.name,
                "max": policy.max,
                "window_secs": policy.window_secs,
                "strategy": policy.strategy,
            })
        })
        .collect();
    Ok(Json(json!({
        "blocks": blocks,
        "escalation": state.guard.blocker.policy(),
        "limits": limits,
    })))
}

async fn create_block(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<BlockRequest>,
) -> Result<(StatusCode, Json<BlockRecord>), AppError> {
    require_admin(&principal)?;
    let reason = request
        .reason
        .unwrap_or_else(|| format!("blocked by {}", principal.user_id));
    let record = state
        .guard
        .blocker
        .block(&request.identifier, request.duration_secs, &reason)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn block_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(identifier): Path<String>,
) -> Result<Json<BlockStatus>, AppError> {
    require_admin(&principal)?;
    Ok(Json(state.guard.blocker.status(&identifier).await?))
}

async fn remove_block(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(identifier): Path<String>,
) -> Result<Json<Value>, AppError> {
    require_admin(&principal)?;
    let removed = state.guard.blocker.unblock(&identifier).await?;
    Ok(Json(json!({ "identifier": identifier, "removed": removed })))
}

async fn clear_violations(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(identifier): Path<String>,
) -> Result<StatusCode, AppError> {
    require_admin(&principal)?;
    state.guard.blocker.clear_violations(&identifier).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug)]
enum AppError {
    Market(MarketError),
}

impl From<MarketError> for AppError {
    fn from(value: MarketError) -> Self {
        Self::Market(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Market(err) => {
                let status = match err.kind() {
                    ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::Forbidden => StatusCode::FORBIDDEN,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                // Store faults stay in the logs; commit failures carry a
                // message written for the seller.
                let detail = if err.kind() == ErrorKind::Internal {
                    error!(target = "sokoni.api", op = err.op(), error = %err, "request failed");
                    if err.op() == "commit" {
                        err.detail().to_string()
                    } else {
                        "internal error".to_string()
                    }
                } else {
                    err.detail().to_string()
                };
                let payload = ApiError {
                    error: err.op().to_string(),
                    detail: Some(detail),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
