// Axum request handler: translates player range requests into bridged chunk requests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::bridge::RangeStreamBridge;
use crate::config::{STREAM_CONTENT_TYPE, STREAM_PATH_PREFIX};

pub struct StreamServer {
    addr: SocketAddr,
    bridge: Arc<RangeStreamBridge>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl StreamServer {
    /// Bind `bind_addr` (port 0 picks a free port) and serve the stream routes.
    pub async fn start(bridge: Arc<RangeStreamBridge>, bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("bind stream server on {}", bind_addr))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(bridge.clone());

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("stream server stopped: {}", e);
            }
        });
        info!("stream server listening on {}", addr);

        Ok(Self {
            addr,
            bridge,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL a player should open for `session_id`.
    pub fn url_for_session(&self, session_id: &str) -> String {
        format!("http://{}{}{}", self.addr, STREAM_PATH_PREFIX, session_id)
    }

    pub fn bridge(&self) -> &Arc<RangeStreamBridge> {
        &self.bridge
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Stream routes only, for merging into a host application's router.
pub fn router(bridge: Arc<RangeStreamBridge>) -> Router {
    Router::new()
        .route(
            &format!("{}{{session_id}}", STREAM_PATH_PREFIX),
            get(stream_handler),
        )
        .with_state(bridge)
}

/// `bytes=<start>-<end?>`. Suffix ranges and multi-range lists are not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParsedRange {
    start: u64,
    end_inclusive: Option<u64>,
}

fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let rest = value.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = rest.split_once('-')?;
    let start: u64 = start_str.trim().parse().ok()?;
    let end_str = end_str.trim();
    let end_inclusive = if end_str.is_empty() {
        None
    } else {
        Some(end_str.parse::<u64>().ok()?)
    };
    Some(ParsedRange {
        start,
        end_inclusive,
    })
}

/// Inclusive window to serve, or `None` when the range cannot be satisfied.
fn resolve_window(range: ParsedRange, total: u64, window_bytes: u64) -> Option<(u64, u64)> {
    if total == 0 || range.start >= total {
        return None;
    }
    let last = total - 1;
    let end = match range.end_inclusive {
        Some(end) => end.min(last),
        None => range
            .start
            .saturating_add(window_bytes.max(1) - 1)
            .min(last),
    };
    if range.start > end {
        return None;
    }
    Some((range.start, end))
}

fn not_satisfiable(total: u64) -> Response {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        "range not satisfiable",
    )
        .into_response()
}

/// GET /video-stream/{session_id}: serve a window of the file with Range support.
async fn stream_handler(
    State(bridge): State<Arc<RangeStreamBridge>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = bridge.session(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };
    let total = session.file_size;

    let Some(raw) = headers.get(header::RANGE) else {
        // Size probe: headers only.
        return (
            StatusCode::OK,
            [
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_LENGTH, total.to_string()),
                (header::CONTENT_TYPE, STREAM_CONTENT_TYPE.to_string()),
            ],
        )
            .into_response();
    };

    let Some(range) = raw.to_str().ok().and_then(parse_range_header) else {
        debug!("session {} malformed range {:?}", session_id, raw);
        return not_satisfiable(total);
    };
    let Some((start, end)) = resolve_window(range, total, bridge.window_bytes()) else {
        return not_satisfiable(total);
    };

    match bridge.request_window(&session, start, end).await {
        Ok(data) => {
            let expected = end - start + 1;
            if data.len() as u64 != expected {
                error!(
                    "session {} got {} bytes for {}-{}, expected {}",
                    session_id,
                    data.len(),
                    start,
                    end,
                    expected
                );
                return (StatusCode::INTERNAL_SERVER_ERROR, "short chunk response").into_response();
            }
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, STREAM_CONTENT_TYPE.to_string()),
                    (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total)),
                    (header::CONTENT_LENGTH, expected.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                data,
            )
                .into_response()
        }
        Err(e) => {
            error!("session {} range {}-{} failed: {}", session_id, start, end, e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {}", e)).into_response()
        }
    }
}
