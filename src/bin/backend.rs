#![forbid(unsafe_code)]

//! RingPing API server.
//!
//! Serves the JSON endpoints under `/api` and the produced audio files under
//! `/downloads`. Configuration comes from the command line, the environment
//! and an optional `.env` file, in that order of precedence.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use ringping::{
    api::{AppState, router},
    config::{RuntimeOverrides, resolve_runtime_config},
    init_tracing,
    security::{ensure_not_root, ensure_writable_dir},
    store::RingtoneStore,
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serve the RingPing API and downloads")]
struct BackendArgs {
    /// Directory holding ringping.db (RINGPING_DATA_ROOT).
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Public downloads root (RINGPING_DOWNLOADS_ROOT).
    #[arg(long)]
    downloads_root: Option<PathBuf>,

    /// Listen port (RINGPING_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Listen address (RINGPING_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root,
            downloads_root: self.downloads_root,
            port: self.port,
            host: self.host,
            env_path: self.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing();
    ensure_not_root("backend")?;

    let config = resolve_runtime_config(args.into_overrides())?;
    ensure_writable_dir(&config.data_root)?;
    ensure_writable_dir(&config.downloads_root)?;

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("expected an IPv4 or IPv6 address, got {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);

    let store = RingtoneStore::open(&config.database_path())
        .await
        .context("initializing ringtone database")?;
    info!(
        data_root = %config.data_root.display(),
        downloads_root = %config.downloads_root.display(),
        ytdlp = %config.ytdlp_bin.display(),
        ffmpeg = %config.ffmpeg_bin.display(),
        precise_trim = config.precise_trim,
        "configuration resolved"
    );

    let app = router(AppState::new(config, store));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--data-root",
            "/srv/ringping",
            "--port",
            "9090",
            "--host",
            "0.0.0.0",
            "--env-file",
            "/etc/ringping.env",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.data_root, Some(PathBuf::from("/srv/ringping")));
        assert_eq!(overrides.port, Some(9090));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.env_path, Some(PathBuf::from("/etc/ringping.env")));
        assert!(overrides.downloads_root.is_none());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(BackendArgs::try_parse_from(["backend", "--port", "99999"]).is_err());
        assert!(BackendArgs::try_parse_from(["backend", "--unknown"]).is_err());
    }
}
