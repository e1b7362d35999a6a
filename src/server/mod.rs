//! HLS HTTP server.
//!
//! Process-wide axum server multiplexing sessions on the request path:
//!
//! - `GET /ping`, `GET /` — health
//! - `GET /hls/{session}/stream.m3u8` — live media playlist
//! - `GET /hls/{session}/segment{N}.ts` — segment bytes
//!
//! Status codes are part of the receiver contract: 404 only for unknown
//! sessions or routes; a known session's not-yet-ready segment answers 503
//! with `Retry-After: 1` because the receiver polls. Handlers read only the
//! atomically-published segment catalog and never block on the producer.

pub mod net;

use crate::playlist;
use crate::session::{SessionManager, SessionStatus};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Host, Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Shared application context.
#[derive(Clone)]
pub struct AppContext {
    pub sessions: Arc<SessionManager>,
}

/// Build the router with all routes and layers.
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ping", get(ping))
        .route("/hls/:session/:file", get(hls_entry))
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Permissive CORS on every response; bare 204 for OPTIONS preflight.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors(response.headers_mut());
    response
}

fn apply_cors(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
}

async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    format!(
        "castbridge {} ({} active sessions)",
        env!("CARGO_PKG_VERSION"),
        ctx.sessions.active_count()
    )
}

async fn ping() -> impl IntoResponse {
    "OK"
}

/// Dispatch on the file component under `/hls/{session}/`.
async fn hls_entry(
    State(ctx): State<AppContext>,
    Host(host): Host,
    Path((session_id, file)): Path<(String, String)>,
) -> Response {
    if file == "stream.m3u8" {
        return serve_playlist(&ctx, &session_id, &host).await;
    }
    if let Some(index) = parse_segment_name(&file) {
        return serve_segment(&ctx, &session_id, index).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

fn parse_segment_name(file: &str) -> Option<u32> {
    file.strip_prefix("segment")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

async fn serve_playlist(ctx: &AppContext, session_id: &str, host: &str) -> Response {
    let Some(session) = ctx.sessions.get(session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let ended = session.shared.status() == SessionStatus::Complete;
    let base = format!("http://{}", host);
    let body = playlist::render(
        &session.store,
        ended,
        ctx.sessions.config().transcode.max_segment_duration_secs,
        &base,
        session_id,
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn serve_segment(ctx: &AppContext, session_id: &str, index: u32) -> Response {
    let Some(session) = ctx.sessions.get(session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // Copied bytes, never the store's own buffer.
    match session.store.get(index).await {
        Some(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp2t")
            .header(header::CONTENT_LENGTH, bytes.len().to_string())
            .header(header::CACHE_CONTROL, "max-age=3600")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        None => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header(header::RETRY_AFTER, "1")
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    }
}

/// Bind the listener, reporting the actual address (port 0 = ephemeral).
pub async fn bind(host: &str, port: u16) -> Result<(tokio::net::TcpListener, SocketAddr)> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind HLS server")?;
    let bound = listener.local_addr()?;
    tracing::info!("HLS server listening on {}", bound);
    Ok((listener, bound))
}

/// Serve until shutdown is signalled.
pub async fn serve(listener: tokio::net::TcpListener, ctx: AppContext) -> Result<()> {
    let app = create_router(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("segment0.ts"), Some(0));
        assert_eq!(parse_segment_name("segment42.ts"), Some(42));
        assert_eq!(parse_segment_name("segment.ts"), None);
        assert_eq!(parse_segment_name("segment42.mp4"), None);
        assert_eq!(parse_segment_name("init.mp4"), None);
        assert_eq!(parse_segment_name("segment-1.ts"), None);
    }
}
