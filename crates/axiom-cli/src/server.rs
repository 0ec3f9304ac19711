use std::sync::Arc;
use std::time::Duration;

use axiom_core::{CoreError, Layer, TokenId, Vec3};
use axiom_signal::{Axiom, SignalError};
use axiom_store::TokenDb;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{
    CreateTokenRequest, DeletedView, Envelope, ListParams, ListView, QueryView,
    RangeQueryRequest, TokenView, UpdateTokenRequest,
};
use crate::ws;

/// Shared by every handler. The database mutex also serializes mutations,
/// so rows are written in the same order the space applied them.
#[derive(Clone)]
pub struct AppState {
    pub axiom: Axiom,
    pub db: Arc<Mutex<TokenDb>>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(axiom: Axiom, db: TokenDb) -> Self {
        Self {
            axiom,
            db: Arc::new(Mutex::new(db)),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/tokens", get(list_tokens).post(create_token))
        .route(
            "/tokens/{id}",
            get(get_token).put(update_token).delete(delete_token),
        )
        .route("/grid/query", post(range_query))
        .route("/channels/{channel}/emit", post(emit));

    Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C or until `state.shutdown` is cancelled, then flush the WAL.
pub async fn run(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {bind}: {e}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let shutdown = state.shutdown.clone();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl-C, shutting down");
            }
            shutdown.cancel();
        }
    });

    let db = state.db.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    if let Err(e) = db.lock().await.checkpoint_truncate() {
        tracing::warn!("final WAL checkpoint failed: {e}");
    }
    Ok(())
}

// --- Errors ---

#[derive(Debug)]
pub enum ApiError {
    Signal(SignalError),
    BadRequest(String),
    Storage(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Signal(SignalError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Signal(SignalError::AlreadyExists(_)) => StatusCode::CONFLICT,
            ApiError::Signal(SignalError::Core(e)) => match e {
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::OutOfRange { .. } | CoreError::InvalidRange { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                CoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                CoreError::InvalidSnapshot(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Signal(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Storage(_) => "storage",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Signal(e) => e.to_string(),
            ApiError::BadRequest(msg) | ApiError::Storage(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                kind: self.kind(),
                message: self.message(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<SignalError> for ApiError {
    fn from(e: SignalError) -> Self {
        ApiError::Signal(e)
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Signal(SignalError::Core(e))
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn parse_id(raw: &str) -> Result<TokenId, ApiError> {
    TokenId::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid token id {raw:?}")))
}

/// The in-memory change already happened; a failed write is reported but
/// cannot be rolled back.
fn persisted(result: axiom_store::Result<()>) -> Result<(), ApiError> {
    result.map_err(|e| {
        tracing::error!("write-through failed: {e}");
        ApiError::Storage(e.to_string())
    })
}

// --- Handlers ---

async fn health() -> Json<Envelope<serde_json::Value>> {
    Json(Envelope::ok(serde_json::json!({ "status": "ok" })))
}

async fn status(State(state): State<AppState>) -> Json<Envelope<axiom_signal::AxiomStatus>> {
    Json(Envelope::ok(state.axiom.status()))
}

async fn list_tokens(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Envelope<ListView>> {
    let tokens = state.axiom.list_tokens(params.limit, params.offset);
    Json(Envelope::ok(ListView {
        tokens: tokens.into_iter().map(TokenView::new).collect(),
        total: state.axiom.space().len(),
    }))
}

async fn create_token(
    State(state): State<AppState>,
    Json(req): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<Envelope<TokenView>>), ApiError> {
    let (attrs, coordinates) = req.into_parts().map_err(ApiError::BadRequest)?;
    let db = state.db.lock().await;
    let token = state.axiom.create_token(&attrs, coordinates)?;
    persisted(db.upsert_token(&token, state.axiom.space().next_local_id()))?;
    Ok((StatusCode::CREATED, Json(Envelope::ok(TokenView::new(token)))))
}

async fn get_token(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<TokenView> {
    let token = state.axiom.get_token(parse_id(&id)?)?;
    Ok(Json(Envelope::ok(TokenView::new(token))))
}

async fn update_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTokenRequest>,
) -> ApiResult<TokenView> {
    let id = parse_id(&id)?;
    let patch = req.into_patch().map_err(ApiError::BadRequest)?;
    let db = state.db.lock().await;
    let token = state.axiom.update_token(id, &patch)?;
    persisted(db.upsert_token(&token, state.axiom.space().next_local_id()))?;
    Ok(Json(Envelope::ok(TokenView::new(token))))
}

async fn delete_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeletedView> {
    let id = parse_id(&id)?;
    let db = state.db.lock().await;
    let token = state.axiom.delete_token(id)?;
    persisted(db.delete_token(id).map(|_| ()))?;
    Ok(Json(Envelope::ok(DeletedView {
        id: token.id,
        id_hex: token.id.hex(),
        deleted: true,
    })))
}

async fn range_query(
    State(state): State<AppState>,
    Json(req): Json<RangeQueryRequest>,
) -> ApiResult<QueryView> {
    let layer = Layer::parse(&req.layer)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown layer {:?}", req.layer)))?;
    let outcome = state.axiom.range_query(
        layer,
        Vec3::from(req.center),
        req.radius,
        req.max_results,
        req.timeout_ms.map(Duration::from_millis),
    )?;
    let partial = outcome.is_partial();
    let hits = if req.allow_partial {
        outcome.into_hits()
    } else {
        outcome.into_complete()?
    };
    Ok(Json(Envelope::ok(QueryView::new(hits, partial))))
}

async fn emit(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<axiom_signal::DeliveryReport> {
    let report = state
        .axiom
        .broadcast_to_channel(&channel, payload)
        .settle()
        .await;
    Ok(Json(Envelope::ok(report)))
}
