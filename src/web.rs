use crate::{
    config::Config,
    metadata::{Engine, ExtractError, MetadataResult},
};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let shared_state = Arc::new(SharedState { engine });

    Router::new()
        .route("/api/extract-metadata", post(extract_metadata))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(CorsLayer::permissive())
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

async fn start_app(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::new(&config)?);
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    log::info!("listening on {}", config.server.addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
}

pub fn start_daemon(config: Config) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(config))
}

#[derive(Debug)]
struct HttpError {
    error: ExtractError,
    fallback: Option<MetadataResult>,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        if self.error.is_input_error() {
            log::debug!("rejected request: {}", self.error);
            let mut body = json!({"error": self.error.to_string()});
            if let Some(fallback) = self.fallback {
                body["fallback"] = json!(fallback);
            }
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }

        log::error!("{:?}", self.error);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": self.error.to_string()})),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionRequest {
    pub url: Option<String>,
}

async fn extract_metadata(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ExtractionRequest>,
) -> Result<Json<MetadataResult>, HttpError> {
    log::debug!("payload: {payload:?}");

    let url = payload.url.unwrap_or_default();
    match state.engine.resolve(&url).await {
        Ok(result) => Ok(Json(result.as_ref().clone())),
        Err(error) => {
            let fallback = matches!(error, ExtractError::InvalidUrl { .. })
                .then(|| state.engine.fallback_for(&url));
            Err(HttpError { error, fallback })
        }
    }
}
