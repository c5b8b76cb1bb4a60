//! Control listener for trusted local controllers.
//!
//! Each accepted connection gets a `ControlSession` that executes commands
//! line by line until the peer disconnects. Every session carries its own
//! app ID, starting at `"1"`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use identd_core::{AppId, Registry};
use identd_protocol::{AdminCommand, LookupReply};

use super::connection::{line_reader, next_line, write_text, LineReader, SessionError};
use super::{accept_backoff, bind_tcp, ServerError};
use crate::listen::ListenAddr;

/// Longest control line accepted.
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// Per-connection control state: the registry and this connection's app ID.
#[derive(Debug, Clone)]
pub struct ControlState {
    registry: Registry,
    app_id: AppId,
}

impl ControlState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            app_id: AppId::default(),
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Parses and executes one line. Returns the text to send back, if any.
    pub fn handle_line(&mut self, line: &str) -> Option<LookupReply> {
        match AdminCommand::parse(line) {
            Some(command) => {
                trace!(verb = command.verb(), app_id = %self.app_id, "Executing control command");
                self.execute(command)
            }
            None => {
                trace!(line, "Ignoring control line");
                None
            }
        }
    }

    /// Executes a validated command against the registry.
    pub fn execute(&mut self, command: AdminCommand) -> Option<LookupReply> {
        match command {
            AdminCommand::SetAppId(app_id) => {
                debug!(from = %self.app_id, to = %app_id, "Control app ID changed");
                self.app_id = app_id;
                None
            }

            AdminCommand::Add {
                username,
                ports,
                interface,
            } => {
                self.registry
                    .add_entry(ports.local, ports.remote, &interface, &username, &self.app_id);
                None
            }

            AdminCommand::Delete { ports, interface } => {
                if self
                    .registry
                    .remove_matching(ports.local, ports.remote, &interface)
                    .is_none()
                {
                    trace!(ports = %ports, interface = %interface, "Nothing to delete");
                }
                None
            }

            AdminCommand::Clear => {
                let removed = self.registry.clear_app_id(&self.app_id);
                info!(app_id = %self.app_id, removed, "Cleared identities");
                None
            }

            AdminCommand::Lookup { ports, interface } => {
                let record = self.registry.lookup(ports.local, ports.remote, &interface);
                Some(LookupReply::new(ports, record.as_ref()))
            }
        }
    }
}

/// One control connection.
pub struct ControlSession<R, W> {
    lines: LineReader<R>,
    writer: W,
    state: ControlState,
    cancel_token: CancellationToken,
    connection: u64,
}

impl<R, W> ControlSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        registry: Registry,
        cancel_token: CancellationToken,
        connection: u64,
    ) -> Self {
        Self {
            lines: line_reader(reader, MAX_COMMAND_LENGTH),
            writer,
            state: ControlState::new(registry),
            cancel_token,
            connection,
        }
    }

    /// Processes commands until EOF, a read/write failure or shutdown.
    ///
    /// Returns the final state so callers can see the last app ID.
    pub async fn run(mut self) -> Result<ControlState, SessionError> {
        loop {
            let line = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!(connection = self.connection, "Control session cancelled");
                    return Ok(self.state);
                }

                line = next_line(&mut self.lines) => line?,
            };

            let Some(line) = line else {
                debug!(connection = self.connection, "Controller sent EOF");
                return Ok(self.state);
            };

            if let Some(reply) = self.state.handle_line(&line) {
                write_text(&mut self.writer, &reply.to_string()).await?;
            }
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// Accept loop for the control listener (TCP or Unix socket).
pub struct ControlServer {
    listener: Listener,
    registry: Registry,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl ControlServer {
    /// Wraps an already-bound TCP listener.
    pub fn new(listener: TcpListener, registry: Registry, cancel_token: CancellationToken) -> Self {
        Self::with_listener(Listener::Tcp(listener), registry, cancel_token)
    }

    fn with_listener(listener: Listener, registry: Registry, cancel_token: CancellationToken) -> Self {
        Self {
            listener,
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Binds the listener described by `addr`.
    ///
    /// For Unix sockets a stale socket file is removed and the parent
    /// directory created first.
    pub async fn bind(
        addr: &ListenAddr,
        registry: Registry,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let bind_error = |e: std::io::Error| ServerError::Bind {
            addr: addr.to_string(),
            error: e.to_string(),
        };

        let listener = match addr {
            ListenAddr::Tcp(address) => Listener::Tcp(bind_tcp(address).await.map_err(bind_error)?),
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(bind_error)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(bind_error)?;
                    }
                }
                Listener::Unix {
                    listener: UnixListener::bind(path).map_err(bind_error)?,
                    path: path.clone(),
                }
            }
        };

        Ok(Self::with_listener(listener, registry, cancel_token))
    }

    /// Human-readable bound address, for logs and status output.
    pub fn local_addr(&self) -> String {
        match &self.listener {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map_or_else(|_| "tcp://?".to_string(), |addr| format!("tcp://{addr}")),
            Listener::Unix { path, .. } => format!("unix://{}", path.display()),
        }
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr(), "Control server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Control server shutdown requested");
                    break;
                }

                result = self.accept() => {
                    if let Err(e) = result {
                        accept_backoff("control", &e).await;
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    async fn accept(&self) -> std::io::Result<()> {
        let connection = match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let connection = self.next_connection();
                debug!(connection, peer = %peer, "Controller connected");
                let (reader, writer) = stream.into_split();
                self.spawn_session(reader, writer, connection);
                connection
            }
            Listener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                let connection = self.next_connection();
                debug!(connection, "Controller connected over unix socket");
                let (reader, writer) = stream.into_split();
                self.spawn_session(reader, writer, connection);
                connection
            }
        };
        trace!(connection, "Control session spawned");
        Ok(())
    }

    fn next_connection(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_session<R, W>(&self, reader: R, writer: W, connection: u64)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = ControlSession::new(
            reader,
            writer,
            self.registry.clone(),
            self.cancel_token.clone(),
            connection,
        );

        tokio::spawn(async move {
            match session.run().await {
                Ok(state) => {
                    debug!(connection, app_id = %state.app_id(), "Controller disconnected");
                }
                Err(e) => {
                    debug!(connection, error = %e, "Control session ended with error");
                }
            }
        });
    }

    fn cleanup(&self) {
        if let Listener::Unix { path, .. } = &self.listener {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(
                        socket = %path.display(),
                        error = %e,
                        "Failed to remove socket file"
                    );
                }
            }
        }
    }
}
