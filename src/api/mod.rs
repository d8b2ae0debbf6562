pub mod envelope;
pub mod routes;

use crate::pipeline::ReportContext;
use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub async fn run_server(ctx: Arc<ReportContext>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.api_bind, ctx.config.api_port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid API bind address: {}:{}",
                ctx.config.api_bind, ctx.config.api_port
            )
        })?;

    let state = routes::ApiState { ctx };
    let app: Router = routes::router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API server: {addr}"))?;

    info!(address = %addr, "Report API server started");

    axum::serve(listener, app)
        .await
        .context("API server failed")?;

    Ok(())
}
