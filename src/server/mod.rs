//! Plug-in side TCP listener.
//!
//! The listener serves one connection at a time: read one frame, dispatch
//! it, write one reply, close. A connection that fails at any step is logged
//! and the loop goes back to accepting, so no single peer can take the
//! plug-in down.
//!
//! The address is bound without `SO_REUSEADDR`, so a second instance on the
//! same port fails with [`ServerError::AddressInUse`] instead of silently
//! sharing it.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{FrameError, ServerError};
use crate::wire::frame::DEFAULT_MAX_MESSAGE_BYTES;
use crate::wire::{read_frame, Response};

/// Pending connections the kernel queues while one is being served.
pub const ACCEPT_BACKLOG: u32 = 8;

/// Default time allowed between request chunks.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// A bound plug-in listener.
#[derive(Debug)]
pub struct PluginServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    read_timeout: Duration,
    max_message_bytes: usize,
}

impl PluginServer {
    /// Binds `addr` exclusively with the default timeout and size limit.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AddressInUse`] if another process holds the
    /// address, or [`ServerError::Bind`] for any other socket failure.
    pub fn bind(addr: SocketAddr, dispatcher: Dispatcher) -> Result<Self, ServerError> {
        let listener = bind_exclusive(addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            local_addr,
            dispatcher,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        })
    }

    /// Binds the address named in the `server` section of the config.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Resolve`] if the host does not resolve, or any
    /// error [`Self::bind`] returns.
    pub fn from_config(config: &ServerConfig, dispatcher: Dispatcher) -> Result<Self, ServerError> {
        let endpoint = format!("{}:{}", config.host, config.port);
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved addresses")
                })
            })
            .map_err(|source| ServerError::Resolve { endpoint, source })?;

        Ok(Self::bind(addr, dispatcher)?
            .with_read_timeout(config.read_timeout())
            .with_max_message_bytes(config.max_message_bytes))
    }

    /// Sets the time allowed between request chunks.
    #[must_use]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Sets the largest accepted request.
    #[must_use]
    pub const fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    /// The bound address, with the real port if 0 was requested.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until `shutdown` completes.
    ///
    /// Shutdown is observed between connections; a connection in progress
    /// is always finished.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(addr = %self.local_addr, "Plug-in listening");

        let mut last_error = None::<io::ErrorKind>;
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(addr = %self.local_addr, "Plug-in listener stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        last_error = None;
                        self.serve_connection(stream, peer).await;
                    }
                    Err(e) => {
                        let kind = e.kind();
                        if last_error != Some(kind) {
                            warn!(error = %e, "Accept failed");
                        }
                        last_error = Some(kind);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    /// Runs the accept loop on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> ServerHandle {
        let addr = self.local_addr;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.serve(async move {
            // A dropped sender also stops the loop.
            let _ = shutdown_rx.await;
        }));

        ServerHandle {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "Connection accepted");

        let reply = match read_frame(&mut stream, self.read_timeout, self.max_message_bytes).await
        {
            Ok(document) => Some(self.dispatcher.dispatch(document)),
            Err(FrameError::Closed) => {
                debug!(peer = %peer, "Peer closed without sending a command");
                None
            }
            Err(FrameError::Malformed { received, reason }) => {
                warn!(peer = %peer, bytes = received, reason = %reason, "Malformed command");
                Some(Response::error(format!("invalid JSON format received: {reason}")))
            }
            Err(e @ FrameError::Timeout { .. }) => {
                warn!(peer = %peer, error = %e, "Command read timed out");
                None
            }
            Err(e @ FrameError::TooLarge { .. }) => {
                warn!(peer = %peer, error = %e, "Command rejected");
                None
            }
            Err(FrameError::Io(e)) => {
                warn!(peer = %peer, error = %e, "Connection failed while reading");
                None
            }
        };

        if let Some(reply) = reply {
            let bytes = reply.to_bytes();
            match tokio::time::timeout(self.read_timeout, stream.write_all(&bytes)).await {
                Ok(Ok(())) => debug!(peer = %peer, ok = reply.is_ok(), bytes = bytes.len(), "Reply sent"),
                Ok(Err(e)) => warn!(peer = %peer, error = %e, "Failed to send reply"),
                Err(_) => warn!(peer = %peer, "Timed out sending reply"),
            }
        }

        if let Err(e) = stream.shutdown().await {
            debug!(peer = %peer, error = %e, "Socket shutdown failed");
        }
    }
}

/// Handle to a listener running on a background task.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and waits for the loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            // The loop may already have exited.
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            error!(error = %e, "Plug-in listener task failed");
        }
    }
}

fn bind_exclusive(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let to_error = |source: io::Error| {
        if source.kind() == io::ErrorKind::AddrInUse {
            ServerError::AddressInUse { addr }
        } else {
            ServerError::Bind { addr, source }
        }
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(to_error)?;

    socket.bind(addr).map_err(to_error)?;
    socket.listen(ACCEPT_BACKLOG).map_err(to_error)
}
