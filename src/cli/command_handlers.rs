use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use tokio::{net::TcpListener, signal};

use crate::{
    config::RepogateConfig,
    http,
    manager::GitRepositoryManager,
    model::Version,
};

pub fn build_manager(config: &RepogateConfig) -> GitRepositoryManager {
    GitRepositoryManager::git(
        config.origin_uri.as_str(),
        config.working_copy.as_path(),
        config.cache(),
    )
}

/// Handler to serve command
///
/// A failed initial clone is not fatal: every request retries it.
pub fn do_serve(config: &RepogateConfig) -> anyhow::Result<()> {
    let manager = Arc::new(build_manager(config));
    if let Err(e) = manager.initialize() {
        error!("{}", e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(manager, &config.listen))
}

async fn serve(manager: Arc<GitRepositoryManager>, listen: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {listen}"))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, http::create_router(manager))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt, shutting down"),
        Err(e) => {
            error!("Cannot listen for interrupts: {}", e);
            std::future::pending::<()>().await
        }
    }
}

/// Handler to resolve command
pub fn do_resolve(config: &RepogateConfig, version: Option<&str>) -> anyhow::Result<()> {
    let manager = build_manager(config);
    manager.initialize()?;
    let resolved = manager.resolve(Version::from(version))?;
    info!("{} is at {}", resolved.version, resolved.commit_id);
    println!("{}", resolved.commit_id);
    Ok(())
}
