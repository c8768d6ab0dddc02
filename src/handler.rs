use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::RANGE;
use axum::http::{HeaderMap, Response};

use crate::config::DownloadConfig;
use crate::error::DownloadResult;
use crate::registry::SessionRegistry;
use crate::session::{build_head_response, open_error, DownloadSession};
use crate::trace::TraceWriter;

/// Shared application state injected into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub download: Arc<DownloadConfig>,
    pub registry: Arc<SessionRegistry>,
    pub trace: Option<Arc<TraceWriter>>,
}

impl AppState {
    pub fn new(download: DownloadConfig) -> Self {
        Self {
            download: Arc::new(download),
            registry: Arc::new(SessionRegistry::default()),
            trace: None,
        }
    }
}

// ---------------------------------------------------------------------------
// HEAD handler
// ---------------------------------------------------------------------------

/// Headers only.  Not subject to the session limit.
pub async fn handle_head(State(state): State<AppState>) -> DownloadResult<Response<Body>> {
    let path = &state.download.path;
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| open_error(path, e))?;
    Ok(build_head_response(&state.download.file_name(), meta.len()))
}

// ---------------------------------------------------------------------------
// GET handler
// ---------------------------------------------------------------------------

pub async fn handle_get(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> DownloadResult<Response<Body>> {
    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
    DownloadSession::new(state.download.clone(), state.registry.clone(), client_id(&peer))
        .with_trace(state.trace.clone())
        .handle(range)
        .await
}

/// Sessions are counted per peer IP; the port differs on every connection.
fn client_id(peer: &SocketAddr) -> String {
    peer.ip().to_canonical().to_string()
}
