//! Local proxy host that routes page traffic through the worker registration.
//!
//! Every request outside `/__worker/` is treated as a page fetch and
//! answered by the active worker. The control endpoints stand in for the
//! platform events a browser would deliver (messages, page open/close,
//! update checks).

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::http::Request;
use crate::registration::{Registration, WorkerState};

/// Response header naming where a proxied response came from.
pub const SOURCE_HEADER: &str = "x-shellcache-source";

/// Largest request body forwarded to the network.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Response headers recomputed by the server for the outgoing body.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "content-length", "transfer-encoding"];

/// Where and how the proxy listens.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind, e.g. `127.0.0.1`.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Origin that request paths are resolved against until a worker is active.
    pub origin: Url,
    /// Config file re-read by `POST /__worker/update`.
    pub config_path: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    registration: Arc<Registration>,
    origin: Arc<Url>,
    config_path: Option<Arc<PathBuf>>,
}

#[derive(Deserialize)]
struct OpenClientRequest {
    url: String,
}

#[derive(Serialize)]
struct StateResponse {
    state: Option<WorkerState>,
    active_version: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::State(_) => StatusCode::CONFLICT,
            Error::Install { .. } | Error::Http(_) | Error::Network(_) => StatusCode::BAD_GATEWAY,
            Error::Manifest(_) | Error::InvalidUrl { .. } | Error::ConfigParse(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        log::warn!("Control request failed: {}", self.0);
        (
            status,
            axum::Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl AppState {
    async fn state_response(&self, state: Option<WorkerState>) -> StateResponse {
        StateResponse {
            state,
            active_version: self
                .registration
                .active()
                .await
                .map(|w| w.version().to_string()),
        }
    }
}

async fn post_message(
    State(state): State<AppState>,
    axum::Json(payload): axum::Json<serde_json::Value>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let outcome = state.registration.post_message(&payload).await?;
    Ok(axum::Json(state.state_response(outcome).await))
}

async fn open_client(
    State(state): State<AppState>,
    axum::Json(payload): axum::Json<OpenClientRequest>,
) -> impl IntoResponse {
    let client = state.registration.client_opened(&payload.url).await;
    (StatusCode::CREATED, axum::Json(client))
}

async fn close_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    if state.registration.client_closed(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn update(State(state): State<AppState>) -> std::result::Result<impl IntoResponse, ApiError> {
    let Some(path) = state.config_path.as_deref() else {
        return Err(Error::State("no config file to reload".into()).into());
    };
    let config = AppConfig::load(path)?;
    let outcome = state.registration.update(config.worker).await?;
    Ok(axum::Json(state.state_response(Some(outcome)).await))
}

async fn status(State(state): State<AppState>) -> std::result::Result<impl IntoResponse, ApiError> {
    Ok(axum::Json(state.registration.status().await?))
}

fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    if headers
        .get("sec-fetch-mode")
        .is_some_and(|v| v.as_bytes() == b"navigate")
    {
        return true;
    }
    method == Method::GET
        && headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

/// Places the request's path and query on `origin`. The host always stays
/// the origin's, even for paths like `//other.example/x`.
fn resolve_on_origin(origin: &Url, uri: &Uri) -> Url {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url.set_fragment(None);
    url
}

async fn to_request(state: &AppState, request: axum::extract::Request) -> Result<Request> {
    let (parts, body) = request.into_parts();
    let origin = match state.registration.active().await {
        Some(worker) => worker.config().origin_url()?,
        None => state.origin.as_ref().clone(),
    };
    let url = resolve_on_origin(&origin, &parts.uri);

    let mut out = if is_navigation(&parts.method, &parts.headers) {
        Request::navigate(url)
    } else {
        Request::get(url)
    }
    .with_method(parts.method.as_str());
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            out = out.with_header(name.as_str(), value);
        }
    }

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::Network(format!("reading request body: {e}")))?;
    Ok(out.with_body(body))
}

fn to_response(response: crate::http::Response) -> Response {
    let mut builder = axum::http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if SKIPPED_RESPONSE_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header(SOURCE_HEADER, response.source.as_str());

    builder
        .body(Body::from(response.into_body()))
        .unwrap_or_else(|e| {
            log::error!("Failed to build response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

async fn proxy(State(state): State<AppState>, request: axum::extract::Request) -> Response {
    let request = match to_request(&state, request).await {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let url = request.url.clone();
    match state.registration.fetch(request).await {
        Ok(response) => to_response(response),
        Err(e) => {
            log::warn!("Fetch failed for {url}: {e}");
            (
                StatusCode::BAD_GATEWAY,
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("offline and not cached: {url}"),
            )
                .into_response()
        }
    }
}

/// Builds the proxy router.
#[must_use]
pub fn router(registration: Arc<Registration>, origin: Url, config_path: Option<PathBuf>) -> Router {
    let state = AppState {
        registration,
        origin: Arc::new(origin),
        config_path: config_path.map(Arc::new),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__worker/message", post(post_message))
        .route("/__worker/clients", post(open_client))
        .route("/__worker/clients/{id}", delete(close_client))
        .route("/__worker/update", post(update))
        .route("/__worker/status", get(status))
        .fallback(proxy)
        .layer(cors)
        .with_state(state)
}

/// Serves the proxy until Ctrl-C, then waits for pending cache writes.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(registration: Arc<Registration>, options: ServerOptions) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((options.host.as_str(), options.port)).await?;
    log::info!(
        "Serving {} on http://{}",
        options.origin,
        listener.local_addr()?
    );

    let app = router(Arc::clone(&registration), options.origin, options.config_path);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Shutting down; flushing pending cache writes");
    registration.flush().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
