//! RFC 1413 listener.
//!
//! Each accepted connection gets an `IdentSession` that reads exactly one
//! query, writes at most one reply and closes. Malformed queries close the
//! connection without a reply.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use identd_core::Registry;
use identd_protocol::{IdentQuery, IdentReply, ProtocolError};

use super::connection::{line_reader, next_line, write_text, LineReader, SessionError};
use super::{accept_backoff, bind_tcp, ServerError};
use crate::listen::ListenAddr;

/// Longest query line accepted. Real queries are under 20 bytes.
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Answers ident queries from the registry.
///
/// Holds everything a session needs besides its socket; cheap to clone.
#[derive(Debug, Clone)]
pub struct IdentService {
    registry: Registry,
    system_id: Arc<str>,
    read_timeout: Duration,
}

impl IdentService {
    pub fn new(registry: Registry, system_id: &str, read_timeout: Duration) -> Self {
        Self {
            registry,
            system_id: Arc::from(system_id),
            read_timeout,
        }
    }

    /// Answers one query line received on `interface`.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed lines; the caller closes the
    /// connection without replying.
    pub fn answer(&self, line: &str, interface: &str) -> Result<IdentReply, ProtocolError> {
        let query = IdentQuery::parse(line)?;
        let record = query
            .ports()
            .and_then(|ports| self.registry.lookup(ports.local, ports.remote, interface));
        Ok(query.reply(record.as_ref(), &self.system_id))
    }
}

/// One ident connection.
pub struct IdentSession<R, W> {
    lines: LineReader<R>,
    writer: W,
    service: IdentService,
    /// Local address the peer connected to, without port
    interface: String,
    connection: u64,
}

impl<R, W> IdentSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        service: IdentService,
        interface: impl Into<String>,
        connection: u64,
    ) -> Self {
        Self {
            lines: line_reader(reader, MAX_QUERY_LENGTH),
            writer,
            service,
            interface: interface.into(),
            connection,
        }
    }

    /// Handles the single query and closes the write side.
    ///
    /// Returns the reply that was sent, or `None` when the peer sent nothing
    /// usable.
    pub async fn run(mut self) -> Result<Option<IdentReply>, SessionError> {
        let line = match timeout(self.service.read_timeout, next_line(&mut self.lines)).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::Timeout),
        };

        let Some(line) = line else {
            debug!(connection = self.connection, "Peer closed before querying");
            return Ok(None);
        };

        let reply = match self.service.answer(&line, &self.interface) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(
                    connection = self.connection,
                    error = %e,
                    "Closing connection on malformed query"
                );
                return Ok(None);
            }
        };

        debug!(
            connection = self.connection,
            interface = %self.interface,
            reply = %reply,
            "Answering ident query"
        );

        write_text(&mut self.writer, &reply.to_string()).await?;
        // Best effort: the reply is already flushed
        let _ = self.writer.shutdown().await;

        Ok(Some(reply))
    }
}

/// Accept loop for the ident listener.
pub struct IdentdServer {
    listener: TcpListener,
    service: IdentService,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl IdentdServer {
    /// Wraps an already-bound listener.
    pub fn new(listener: TcpListener, service: IdentService, cancel_token: CancellationToken) -> Self {
        Self {
            listener,
            service,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Binds the listener described by `addr`. Only TCP is supported.
    pub async fn bind(
        addr: &ListenAddr,
        service: IdentService,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let ListenAddr::Tcp(address) = addr else {
            return Err(ServerError::UnsupportedListener {
                listener: "identd",
                addr: addr.to_string(),
            });
        };

        let listener = bind_tcp(address)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                error: e.to_string(),
            })?;

        Ok(Self::new(listener, service, cancel_token))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(addr = ?self.listener.local_addr().ok(), "Ident server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Ident server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let connection = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, peer, connection);
                        }
                        Err(e) => accept_backoff("identd", &e).await,
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, connection: u64) {
        let interface = match stream.local_addr() {
            Ok(local) => local.ip().to_canonical().to_string(),
            Err(e) => {
                debug!(connection, error = %e, "Dropping connection without local address");
                return;
            }
        };

        debug!(connection, peer = %peer, interface = %interface, "Ident peer connected");

        let (reader, writer) = stream.into_split();
        let session = IdentSession::new(reader, writer, self.service.clone(), interface, connection);

        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(connection, error = %e, "Ident session ended with error");
            }
        });
    }
}
