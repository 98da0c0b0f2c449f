// Axum stream server — serves file bytes of one session while the transfer is still running.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::config::STREAM_CLAMP_BYTES;
use crate::detect::media::kind_from_name;
use crate::engine::{FileEntry, SessionKey, TorrentHandle};
use crate::session::registry::SessionRegistry;

#[derive(Clone)]
struct StreamState {
    registry: Arc<SessionRegistry>,
    key: SessionKey,
}

impl StreamState {
    /// Resolve the handle on every request; a stopped session yields `None`.
    fn file(&self, file_index: usize) -> Option<(Arc<dyn TorrentHandle>, FileEntry)> {
        let handle = self.registry.lookup(&self.key).ok()?;
        let entry = handle.files().into_iter().nth(file_index)?;
        Some((handle, entry))
    }
}

/// HTTP server bound to one session.
pub struct StreamServer {
    port: u16,
    key: SessionKey,
    file_index: usize,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl StreamServer {
    /// Start the server on an ephemeral port of `bind_addr`.
    pub async fn start(
        bind_addr: IpAddr,
        registry: Arc<SessionRegistry>,
        key: SessionKey,
        file_index: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(bind_addr, 0)).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/{file_index}", get(stream_handler).head(head_handler))
            .with_state(StreamState {
                registry,
                key: key.clone(),
            });

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        debug!("stream server for {} listening on port {}", key, port);
        Ok(Self {
            port,
            key,
            file_index,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let rest = value.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = rest.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        return Some(ParsedRange::Suffix { len });
    }

    let start: u64 = start_str.parse().ok()?;
    let end_inclusive = if end_str.is_empty() {
        None
    } else {
        Some(end_str.parse::<u64>().ok()?)
    };
    Some(ParsedRange::StartEnd {
        start,
        end_inclusive,
    })
}

/// Byte window `[start, end)` a request resolves to.
#[derive(Debug, PartialEq, Eq)]
enum Window {
    Full { end: u64 },
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

fn resolve_window(range: Option<ParsedRange>, total: u64) -> Window {
    match range {
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive: Some(end),
        }) => {
            let end = end.saturating_add(1).min(total);
            if start >= total || end <= start {
                Window::Unsatisfiable
            } else {
                Window::Partial { start, end }
            }
        }
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive: None,
        }) => {
            if start >= total {
                return Window::Unsatisfiable;
            }
            // Open-ended ranges are served in clamped slices.
            Window::Partial {
                start,
                end: (start + STREAM_CLAMP_BYTES).min(total),
            }
        }
        Some(ParsedRange::Suffix { len }) => {
            if total == 0 {
                return Window::Unsatisfiable;
            }
            Window::Partial {
                start: total.saturating_sub(len),
                end: total,
            }
        }
        None => {
            let end = STREAM_CLAMP_BYTES.min(total);
            if end < total {
                Window::Partial { start: 0, end }
            } else {
                Window::Full { end }
            }
        }
    }
}

fn base_headers(entry: &FileEntry, body_len: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(kind_from_name(&entry.name).content_type()),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers
}

fn content_range(start: u64, end: u64, total: u64) -> HeaderValue {
    // `end` is exclusive; HTTP wants it inclusive.
    HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end - 1, total))
        .unwrap_or_else(|_| HeaderValue::from_static("bytes */0"))
}

fn unsatisfiable(total: u64) -> Response {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        "range not satisfiable",
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "file not found").into_response()
}

fn requested_range(headers: &HeaderMap) -> Option<ParsedRange> {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header)
}

/// GET /{file_index} — serve file bytes with Range support.
async fn stream_handler(
    State(state): State<StreamState>,
    Path(file_index): Path<usize>,
    headers: HeaderMap,
) -> Response {
    let (handle, entry) = match state.file(file_index) {
        Some(found) => found,
        None => return not_found(),
    };
    let total = entry.length;

    let (start, end, is_partial) = match resolve_window(requested_range(&headers), total) {
        Window::Full { end } => (0, end, false),
        Window::Partial { start, end } => (start, end, true),
        Window::Unsatisfiable => return unsatisfiable(total),
    };

    debug!(
        "stream request session={} file={} range=[{}, {}) partial={}",
        state.key, file_index, start, end, is_partial
    );

    if start == end {
        return (StatusCode::OK, base_headers(&entry, 0)).into_response();
    }

    match handle.read_file_range(file_index, start, end).await {
        Ok(data) => {
            let mut resp_headers = base_headers(&entry, data.len() as u64);
            let status = if is_partial {
                resp_headers.insert(header::CONTENT_RANGE, content_range(start, end, total));
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            (status, resp_headers, data).into_response()
        }
        Err(e) => {
            error!("read_file_range error for {}: {}", state.key, e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {}", e)).into_response()
        }
    }
}

/// HEAD /{file_index} — return headers only.
async fn head_handler(
    State(state): State<StreamState>,
    Path(file_index): Path<usize>,
    headers: HeaderMap,
) -> Response {
    let entry = match state.file(file_index) {
        Some((_, entry)) => entry,
        None => return not_found(),
    };
    let total = entry.length;

    let mut resp_headers = base_headers(&entry, total);
    if let Some(range) = requested_range(&headers) {
        let (start, end) = match range {
            ParsedRange::StartEnd {
                start,
                end_inclusive,
            } => {
                let end = match end_inclusive {
                    Some(e) => e.saturating_add(1).min(total),
                    None => total,
                };
                (start, end)
            }
            ParsedRange::Suffix { len } => (total.saturating_sub(len), total),
        };
        if start < end {
            resp_headers.insert(header::CONTENT_RANGE, content_range(start, end, total));
        }
    }

    (StatusCode::OK, resp_headers).into_response()
}
