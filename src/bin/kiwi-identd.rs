//! kiwi-identd - RFC 1413 ident server backed by a controller-fed registry
//!
//! Answers ident queries on one listener and accepts registry updates from
//! trusted local controllers on another. Runs in the foreground until
//! SIGTERM or SIGINT; supervise it with systemd or similar.
//!
//! # Usage
//!
//! ```bash
//! # Default listeners (tcp://:113, tcp://:1133)
//! kiwi-identd
//!
//! # Unix control socket; single-dash long flags are accepted too
//! kiwi-identd -rpc unix:///run/kiwi-identd.sock -identd tcp://:113
//!
//! # Print the resolved configuration and exit
//! kiwi-identd --check
//!
//! # Enable debug logging
//! RUST_LOG=identd=debug kiwi-identd
//! ```

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use identd::config::{ConfigOverrides, DaemonConfig};
use identd::server::serve;
use identd_core::Registry;

/// Long flags that may also be spelled with a single dash.
const LONG_FLAGS: &[&str] = &["config", "identd", "rpc", "system-id"];

/// kiwi-identd - ident server for IRC gateways
#[derive(Parser, Debug)]
#[command(name = "kiwi-identd", version, about)]
struct Args {
    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ident listener, e.g. tcp://:113
    #[arg(long)]
    identd: Option<String>,

    /// Control socket listener, e.g. tcp://:1133 or unix:///run/kiwi-identd.sock
    #[arg(long)]
    rpc: Option<String>,

    /// Operating-system field reported in USERID replies
    #[arg(long)]
    system_id: Option<String>,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check: bool,
}

/// Rewrites `-rpc`, `-identd=...` and friends to their `--` form.
fn normalize_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            let Some(rest) = text.strip_prefix('-').filter(|rest| !rest.starts_with('-')) else {
                return arg;
            };
            let name = rest.split_once('=').map_or(rest, |(name, _)| name);
            if LONG_FLAGS.contains(&name) {
                OsString::from(format!("-{text}"))
            } else {
                arg
            }
        })
        .collect()
}

fn load_config(args: Args) -> Result<DaemonConfig> {
    let config = DaemonConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?
        .with_overrides(ConfigOverrides {
            identd_listen: args.identd,
            control_listen: args.rpc,
            system_id: args.system_id,
        });

    config.identd_addr()?;
    config.control_addr()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_from(normalize_flags(std::env::args_os()));
    let check = args.check;
    let config = load_config(args)?;

    if check {
        println!("identd_listen = {:?}", config.identd_listen);
        println!("control_listen = {:?}", config.control_listen);
        println!("system_id = {:?}", config.system_id);
        println!("identd_timeout_secs = {}", config.identd_timeout_secs);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("identd=info".parse()?)
                .add_directive("identd_core=info".parse()?)
                .add_directive("identd_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "kiwi-identd starting"
    );

    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel_token.clone()));

    if let Err(e) = serve(&config, Registry::new(), cancel_token).await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("kiwi-identd stopped");
    Ok(())
}

/// Cancels `token` on the first SIGTERM or SIGINT.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let received = {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => tokio::select! {
                _ = sigterm.recv() => Ok("SIGTERM"),
                _ = sigint.recv() => Ok("SIGINT"),
            },
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    };

    #[cfg(not(unix))]
    let received = tokio::signal::ctrl_c().await.map(|()| "Ctrl+C");

    match received {
        Ok(signal) => info!(signal, "Shutdown signal received"),
        Err(e) => error!(error = %e, "Cannot install signal handlers; shutting down"),
    }
    token.cancel();
}
