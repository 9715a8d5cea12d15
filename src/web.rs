use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;

use crate::{
    app::{AppContext, AppError, AppFactory, AppPaths, AppStatus},
    eid::Eid,
    rows::{Row, RowCreate, RowUpdate},
    semantic::{Phase, SearchResult, SweepReport},
};

#[derive(Clone)]
struct SharedState {
    app: Arc<AppContext>,
}

pub fn router(app: Arc<AppContext>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/search", post(search))
        .route("/api/sweep", post(sweep))
        .route("/api/status", get(status))
        .route("/api/retry", post(retry))
        .route("/api/rows/get", post(get_row))
        .route("/api/rows/create", post(create))
        .route("/api/rows/update", post(update))
        .route("/api/rows/delete", post(delete))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal(app: Arc<AppContext>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
    app.shutdown();
}

pub async fn start_daemon(paths: AppPaths) -> anyhow::Result<()> {
    let app = Arc::new(AppFactory::create_context(&paths)?);
    app.spawn_background_indexing();

    let listen = app.config().listen.clone();
    let signal = shutdown_signal(app.clone());

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    log::info!("listening on {listen}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(signal)
        .await?;

    Ok(())
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match self.0 {
            AppError::NotFound => (
                axum::http::StatusCode::NOT_FOUND,
                Json(json!({"error": self.0.to_string()})),
            ),
            AppError::InvalidInput(_) => (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({"error": self.0.to_string()})),
            ),
            AppError::Store(_) | AppError::Other(_) => {
                log::error!("{self:?}");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": self.0.to_string()})),
                )
            }
        }
        .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,

    /// Result count, `semantic_search.default_limit` when omitted
    pub k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    /// False while the embedding model is not ready
    pub available: bool,
    pub phase: Phase,
    /// A newer search was issued before this one finished
    pub superseded: bool,
    pub results: Vec<SearchResult>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let search = state.app.search();
    let k = payload.k.unwrap_or_else(|| search.default_limit());
    let results = search.search_latest(&payload.query, k).await;

    Ok(Json(SearchResponse {
        available: search.is_available(),
        phase: state.app.lifecycle().state().phase,
        superseded: results.is_none(),
        results: results.unwrap_or_default(),
    }))
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResponse {
    /// False when another sweep was already running
    pub started: bool,
    pub report: Option<SweepReport>,
}

async fn sweep(State(state): State<Arc<SharedState>>) -> Result<Json<SweepResponse>, HttpError> {
    let report = state.app.sweeper().sweep().await;

    Ok(Json(SweepResponse {
        started: report.is_some(),
        report,
    }))
}

async fn status(State(state): State<Arc<SharedState>>) -> Result<Json<AppStatus>, HttpError> {
    Ok(Json(state.app.status()?))
}

async fn retry(State(state): State<Arc<SharedState>>) -> Result<Json<AppStatus>, HttpError> {
    state.app.lifecycle().manual_retry();
    Ok(Json(state.app.status()?))
}

async fn create(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RowCreate>,
) -> Result<Json<Row>, HttpError> {
    log::debug!("payload: {payload:?}");

    if payload.title.trim().is_empty() {
        return Err(AppError::InvalidInput("title must not be empty".to_string()).into());
    }

    Ok(Json(state.app.store().create(payload)?))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RowUpdateRequest {
    pub id: Eid,

    #[serde(flatten)]
    pub update: RowUpdate,
}

async fn update(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RowUpdateRequest>,
) -> Result<Json<Row>, HttpError> {
    log::debug!("payload: {payload:?}");

    if payload.update.is_empty() {
        return Err(AppError::InvalidInput("nothing to update".to_string()).into());
    }

    Ok(Json(state.app.store().update(&payload.id, payload.update)?))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RowIdRequest {
    pub id: Eid,
}

async fn get_row(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RowIdRequest>,
) -> Result<Json<Row>, HttpError> {
    Ok(Json(state.app.store().get(&payload.id)?))
}

async fn delete(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RowIdRequest>,
) -> Result<Json<serde_json::Value>, HttpError> {
    state.app.store().delete(&payload.id)?;
    Ok(Json(json!({"deleted": payload.id})))
}
