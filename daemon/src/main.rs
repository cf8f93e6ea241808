//! `gost-agent`: the remotely-managed forwarding daemon's entrypoint.
//!
//! Wires the components in `gost-core` together the way
//! `servers/src/server_yahoo.rs` wires its `upstream`/`downstream`/
//! `monitor` tasks: load config, spawn the long-lived tasks on a shared
//! `CancellationToken`, wait for Ctrl-C/SIGTERM, then join everything
//! before exiting.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use gost_core::{ConfigStore, Core, ControlChannel, Codec, RuntimeConfig};

/// Thin CLI surface layered over `config.json`, mirroring
/// `yahoo_logic/config.rs`'s `clap::Parser` + env-var precedence.
#[derive(Parser, Debug, Clone)]
#[command(name = "gost-agent", version, about = "Remotely-managed TCP/TLS forwarding agent")]
struct Args {
    /// Required local startup file (§6): controller addr, shared secret,
    /// protocol-forbid bits.
    #[arg(long, env = "GOST_CONFIG_PATH", default_value = "config.json")]
    config_path: PathBuf,

    /// Authoritative, mutable configuration persisted after every
    /// successful control-channel mutation.
    #[arg(long, env = "GOST_DATA_PATH", default_value = "gost.json")]
    data_path: PathBuf,

    #[arg(long, env = "GOST_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Disables the AES-256-GCM envelope on control-channel frames, for
    /// local testing against a controller that speaks plaintext JSON.
    #[arg(long, env = "GOST_PLAINTEXT")]
    plaintext: bool,
}

/// `log` macros (the handler/service/listener hot path) go through
/// `env_logger`; `tracing` spans (the control-channel session, per
/// SPEC_FULL's ambient-stack note) go through a separate
/// `tracing-subscriber` fmt layer. Two independent global backends, both
/// writing to stderr — matches the teacher's `server_yahoo.rs`, which
/// carries both crate families without bridging them.
fn setup_logging(log_level: &str) {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(parse_level(log_level));
    }
    builder.init();

    let filter = tracing_subscriber::EnvFilter::try_from_env("GOST_TRACE")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn parse_level(level: &str) -> log::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

fn load_runtime_config(path: &PathBuf) -> anyhow::Result<RuntimeConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(&args.log_level);

    // Explicitly install the default crypto provider for rustls, used by
    // both the silent-TLS listener and the control channel's `wss://`
    // upgrade path.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime_config = match load_runtime_config(&args.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("startup failure: {e}");
            return ExitCode::from(1);
        }
    };

    let config_store = match ConfigStore::load(&args.data_path) {
        Ok(store) => store,
        Err(e) => {
            log::error!("startup failure: failed to load {}: {e}", args.data_path.display());
            return ExitCode::from(1);
        }
    };

    let core = Arc::new(Core::new(runtime_config.clone(), config_store));
    if let Err(e) = core.restore_from_config().await {
        log::warn!("restoring services from {}: {e}", args.data_path.display());
    }

    let codec = if args.plaintext {
        None
    } else {
        Some(Arc::new(Codec::new(&runtime_config.secret)))
    };
    let client_ip = gost_core::detect_client_ip().await;
    if let Some(ip) = &client_ip {
        log::info!("detected client_ip {ip} for the control-channel dial URL");
    }

    let shutdown = CancellationToken::new();

    let control = Arc::new(ControlChannel::new(
        core.clone(),
        runtime_config.addr.clone(),
        runtime_config.secret.clone(),
        client_ip,
        Some(env!("CARGO_PKG_VERSION").to_string()),
        codec.clone(),
    ));
    let control_handle = tokio::spawn(control.run(shutdown.child_token()));

    let traffic_reporter_handle = tokio::spawn(gost_core::run_traffic_reporter(
        runtime_config.addr.clone(),
        runtime_config.secret.clone(),
        core.traffic.clone(),
        codec.clone(),
        shutdown.child_token(),
    ));

    let config_reporter_handle = tokio::spawn(gost_core::run_config_reporter(
        runtime_config.addr.clone(),
        runtime_config.secret.clone(),
        core.clone(),
        codec,
        shutdown.child_token(),
    ));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining");

    shutdown.cancel();
    let _ = tokio::try_join!(control_handle, traffic_reporter_handle, config_reporter_handle);

    log::info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received");
        }
        _ = terminate_signal() => {
            log::info!("SIGTERM received");
        }
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        term.recv().await;
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
