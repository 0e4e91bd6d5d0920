//! shmbus-busd: serves one bus over a Unix socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use shmbus::bus::{Broker, BusType};
use shmbus::config::BusConfig;

#[derive(Debug, Parser)]
#[command(name = "shmbus-busd", version, about = "Unix-socket broker for shmbus")]
struct Args {
    /// Which bus this broker serves; picks the default socket path.
    #[arg(long, default_value = "session")]
    bus: BusType,

    /// Socket path, overriding the configured address for `--bus`.
    #[arg(long)]
    socket: Option<PathBuf>,
}

/// Initialize tracing with SHMBUS_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SHMBUS_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("shmbus={level},shmbus_busd={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Bind `path`, replacing a stale socket but refusing to steal a live one.
fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }

    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            bail!("another broker is already listening on {}", path.display());
        }
        tracing::debug!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }

    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}

fn watch_signals(shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let path = match args.socket {
        Some(path) => path,
        None => BusConfig::from_env().address(args.bus).to_path_buf(),
    };

    let listener = bind(&path)?;
    tracing::info!(bus = %args.bus, path = %path.display(), "Broker listening");

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;

    let result = Broker::new().serve(listener, shutdown).await;

    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket");
    }
    result.context("broker failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bus_and_socket() {
        let args = Args::parse_from(["shmbus-busd", "--bus", "system", "--socket", "/tmp/b.sock"]);
        assert_eq!(args.bus, BusType::System);
        assert_eq!(args.socket, Some(PathBuf::from("/tmp/b.sock")));

        let args = Args::parse_from(["shmbus-busd"]);
        assert_eq!(args.bus, BusType::Session);
        assert!(args.socket.is_none());
    }

    #[tokio::test]
    async fn bind_refuses_live_socket_and_replaces_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bus.sock");

        let live = bind(&path).unwrap();
        assert!(bind(&path).is_err());

        drop(live);
        bind(&path).unwrap();
    }

    #[test]
    fn unknown_bus_is_rejected() {
        assert!(Args::try_parse_from(["shmbus-busd", "--bus", "nope"]).is_err());
    }
}
