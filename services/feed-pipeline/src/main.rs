use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use feed_pipeline::config::PipelineConfig;
use feed_pipeline::pipeline::Pipeline;
use feed_pipeline::server::{create_router, AppState};
use feed_pipeline::sink::MemorySink;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    tracing::info!("Starting feed pipeline service");

    let config = PipelineConfig::default();

    // In-process sink; a durable store deployment swaps this for a
    // client implementing PersistenceSink.
    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::start(config, sink, None);

    let state = AppState::from_pipeline(&pipeline);
    let app = create_router(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    pipeline.shutdown().await;
    Ok(())
}
