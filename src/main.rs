use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use throttled_serve::config::{AppConfig, CliArgs};
use throttled_serve::handler::AppState;
use throttled_serve::server::{build_router, serve};
use throttled_serve::trace::TraceWriter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let trace = match args.debug_trace.as_deref() {
        Some(p) => {
            let tw = TraceWriter::create(std::path::Path::new(p))
                .map_err(|e| anyhow::anyhow!("failed to create debug trace file {p}: {e}"))?;
            info!(path = p, "debug trace enabled");
            Some(Arc::new(tw))
        }
        None => None,
    };
    let config = AppConfig::try_from(args)?;

    let meta = tokio::fs::metadata(&config.download.path).await?;
    anyhow::ensure!(meta.is_file(), "{:?} is not a regular file", config.download.path);
    info!(
        path = ?config.download.path,
        size = meta.len(),
        speed_kbps = config.download.speed_kbps,
        max_sessions = config.download.max_sessions,
        chunk_size = config.download.chunk_size,
        "serving file"
    );

    let mut state = AppState::new(config.download.clone());
    state.trace = trace;

    let app = build_router(state).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::new(config.bind_ip, config.port);
    let listener = TcpListener::bind(addr).await?;
    info!("throttled-serve listening on http://{addr}");
    serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "throttled_serve=info,tower_http=info".into()
            }),
        )
        .with_target(false)
        .compact()
        .init();
}
