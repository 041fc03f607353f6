use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod adapters;
mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::engine::{EngineOptions, SpaceEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting spacefs with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize the engine shared by every protocol ---
    let options = EngineOptions {
        usage_ttl: cfg.usage_ttl,
        ticket_ttl: chrono::Duration::from_std(cfg.ticket_ttl)
            .context("SPACEFS_TICKET_TTL_SECS is out of range")?,
        ..Default::default()
    };
    let engine = SpaceEngine::new(db, options);
    services::bootstrap::apply(&engine, &cfg.seed)
        .await
        .context("provisioning admin account and spaces")?;

    // --- Protocol listeners ---
    if let Some(addr) = cfg.ftp_addr.clone() {
        let engine = engine.clone();
        let passive = cfg.ftp_passive_ports.clone();
        tokio::spawn(async move {
            if let Err(err) = adapters::ftp::serve(engine, addr, passive).await {
                tracing::error!("FTP server stopped: {:#}", err);
            }
        });
    }
    if let Some(addr) = cfg.sftp_addr.clone() {
        let engine = engine.clone();
        let host_key = cfg.sftp_host_key.clone();
        tokio::spawn(async move {
            if let Err(err) = adapters::sftp::serve(engine, addr, host_key).await {
                tracing::error!("SFTP server stopped: {:#}", err);
            }
        });
    }

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.webdav).with_state(engine);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
