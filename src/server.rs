use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::handler::{handle_get, handle_head, AppState};

/// Build the axum router: the file is served at `/`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_get).head(handle_head))
        .with_state(state)
}

/// Serve `router` on `listener`, exposing the peer address to handlers.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
