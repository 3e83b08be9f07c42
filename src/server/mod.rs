// HTTP API
//
// Thin axum layer over the pipeline: handlers parse the request, call one
// App method, and serialize the result. All domain rules live in the
// pipeline; the only logic here is error-to-status mapping and the SSE
// bridge for streaming step runs.

mod handlers;

pub use handlers::create_router;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::pipeline::App;

/// Build the application from config and serve it until shutdown.
pub async fn serve(config: Config) -> Result<()> {
    let app = Arc::new(App::from_config(&config)?);
    app.ensure_defaults().await?;

    let router = create_router(app)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting casework server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
