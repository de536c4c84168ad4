#![forbid(unsafe_code)]
#![deny(future_incompatible)]
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    trivial_casts,
    unused_qualifications
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::Router;
use dotenvy::dotenv;

use utils::config::FilesetConfig;
use utils::time::unix_now;

mod api;
mod redirects;
mod requests;
mod serve;
mod structures;

use crate::structures::{AppState, FilesetRouter, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    env_logger::init();

    let config = FilesetConfig::from_env()?;
    if config.dev {
        log::info!("running in dev mode; ingest auth is disabled");
    }
    let state: AppState = Arc::new(ServerState::new(config)?);

    const MAX_BODY_SIZE_BYTES: usize = 100 * 1024 * 1024;

    let app = build_router(state.clone())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE_BYTES))
        .with_state(state.clone());

    spawn_timed_deploy_cron(state.clone());

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8088);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    log::info!("fileset server listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// The ingest API plus the serving fallback, with the redirect middleware
/// wrapped around serving (it passes `/_fs/` straight through).
pub(crate) fn build_router(state: AppState) -> FilesetRouter {
    let router = Router::new();
    let router = api::mount(router, state.clone());
    router
        .fallback(serve::serve_path)
        .layer(middleware::from_fn_with_state(
            state,
            redirects::redirect_middleware,
        ))
}

/// Single-node deployments don't need an external scheduler: promote due
/// timed deploys from inside the process.
fn spawn_timed_deploy_cron(state: AppState) {
    let interval_secs = state.config.cron_interval_secs;
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;
        loop {
            interval.tick().await;
            match state.manifests.promote_due_deploys(unix_now()).await {
                Ok(deployments) if !deployments.is_empty() => {
                    log::info!(
                        "deployed: {}",
                        serde_json::to_string(&deployments).unwrap_or_default()
                    );
                }
                Ok(_) => {}
                Err(e) => log::error!("timed deploy promotion failed: {e}"),
            }
        }
    });
}
