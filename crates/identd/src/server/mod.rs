//! Listeners for the ident and control protocols.
//!
//! Both servers:
//! - Accept connections until a shared `CancellationToken` fires
//! - Spawn one session task per connection
//! - Share a single `Registry` handed to them at construction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐         ┌─────────────────┐
//! │  IdentdServer   │         │  ControlServer  │
//! │  TcpListener    │         │  Tcp/Unix       │
//! └───────┬─────────┘         └───────┬─────────┘
//!         │ accept()                  │ accept()
//!         ▼                           ▼
//! ┌─────────────────┐         ┌─────────────────┐
//! │  IdentSession   │────┐┌───│ ControlSession  │
//! │  (one query)    │    ││   │ (per client)    │
//! └─────────────────┘    ▼▼   └─────────────────┘
//!                   ┌──────────┐
//!                   │ Registry │
//!                   └──────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged, followed by a short pause, and the loop continues

mod connection;
mod control;
mod ident;

pub use connection::{SessionError, WRITE_TIMEOUT};
pub use control::{ControlServer, ControlSession, ControlState, MAX_COMMAND_LENGTH};
pub use ident::{IdentService, IdentSession, IdentdServer, MAX_QUERY_LENGTH};

use std::io;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use identd_core::Registry;

use crate::config::{ConfigError, DaemonConfig};

/// Binds both listeners from `config` and runs them until `cancel_token`
/// fires.
///
/// Both accept loops share `registry`. A bind failure on either listener is
/// returned before any connection is accepted.
pub async fn serve(
    config: &DaemonConfig,
    registry: Registry,
    cancel_token: CancellationToken,
) -> Result<(), ServerError> {
    let identd_addr = config.identd_addr()?;
    let control_addr = config.control_addr()?;

    let service = IdentService::new(registry.clone(), &config.system_id, config.identd_timeout());
    let identd = IdentdServer::bind(&identd_addr, service, cancel_token.clone()).await?;
    let control = ControlServer::bind(&control_addr, registry, cancel_token).await?;

    info!(
        identd = %identd_addr,
        control = %control.local_addr(),
        system_id = %config.system_id,
        "Listeners bound"
    );

    let (identd_result, control_result) = tokio::join!(identd.run(), control.run());
    identd_result?;
    control_result
}

/// Pause after a failed `accept()` before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Logs an accept failure and waits [`ACCEPT_ERROR_BACKOFF`].
///
/// Errors such as EMFILE persist until some connection closes.
pub(crate) async fn accept_backoff(listener: &'static str, err: &io::Error) {
    error!(listener, error = %err, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Binds a TCP listener. An empty host (`:port`) binds the IPv6 wildcard,
/// which also accepts IPv4 on dual-stack hosts, and falls back to the IPv4
/// wildcard where IPv6 is unavailable.
pub(crate) async fn bind_tcp(address: &str) -> io::Result<TcpListener> {
    let Some(port) = address.strip_prefix(':') else {
        return TcpListener::bind(address).await;
    };

    match TcpListener::bind(format!("[::]:{port}")).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!(error = %e, port, "IPv6 wildcard bind failed; using 0.0.0.0");
            TcpListener::bind(format!("0.0.0.0:{port}")).await
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("The {listener} listener does not support {addr}")]
    UnsupportedListener { listener: &'static str, addr: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listen::ListenAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            addr: "tcp://0.0.0.0:113".to_string(),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("0.0.0.0:113"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff_waits() {
        let start = tokio::time::Instant::now();
        let err = io::Error::from_raw_os_error(24);

        accept_backoff("identd", &err).await;

        assert!(start.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_bind_tcp_empty_host_accepts_ipv4() {
        let listener = bind_tcp(":0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
        let (accepted, connected) = tokio::join!(listener.accept(), connect);

        let (stream, _) = accepted.unwrap();
        assert!(connected.is_ok());
        assert_eq!(
            stream.local_addr().unwrap().ip().to_canonical().to_string(),
            "127.0.0.1"
        );
    }

    #[tokio::test]
    async fn test_bind_tcp_explicit_host() {
        let listener = bind_tcp("127.0.0.1:0").await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_identd_rejects_unix_listener() {
        let addr = ListenAddr::Unix(PathBuf::from("/tmp/identd-test.sock"));
        let service = IdentService::new(Registry::new(), "KiwiIRC", Duration::from_secs(1));

        let result = IdentdServer::bind(&addr, service, CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::UnsupportedListener { .. })));
    }

    #[tokio::test]
    async fn test_serve_reports_invalid_config() {
        let config = DaemonConfig {
            control_listen: "nonsense".to_string(),
            ..Default::default()
        };

        let result = serve(&config, Registry::new(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let config = DaemonConfig {
            identd_listen: "tcp://127.0.0.1:0".to_string(),
            control_listen: "tcp://127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn({
            let cancel_token = cancel_token.clone();
            async move { serve(&config, Registry::new(), cancel_token).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve should stop")
            .expect("task should not panic");
        assert!(result.is_ok());
    }
}
