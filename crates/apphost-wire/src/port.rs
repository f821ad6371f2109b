//! Registered ports and their incoming connections.
//!
//! A [`Port`] owns the local listener the daemon forwards connections to.
//! Taking a connection off a port is a two-phase operation:
//!
//! 1. [`Port::next`] waits for the daemon to open a forwarded connection and
//!    returns a [`PendingConnection`] without reading from it.
//! 2. [`PendingConnection::materialize`] reads the caller identity and the
//!    requested query, producing a [`Connection`].
//!
//! A [`Connection`] is then either accepted (one `0` byte, the transport
//! becomes a [`Stream`]) or rejected (one `1` byte, the transport is closed).
//! Both consume the connection, so exactly one of them can happen.

use crate::error::{WireError, WireResult};
use crate::frame::{FrameReadExt, FrameWriteExt};
use crate::stream::Stream;
use apphost_types::Identity;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Indicator byte written when a connection is accepted.
pub const ACCEPT: i8 = 0;
/// Indicator byte written when a connection is rejected.
pub const REJECT: i8 = 1;

struct PortShared {
    name: String,
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: watch::Sender<bool>,
}

impl PortShared {
    fn listener(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn close(&self) -> bool {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            info!(port = %self.name, "Port closed");
        }
        drop(listener);
        !was_closed
    }
}

/// Resolves once the port is closed or every handle to it is gone.
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// A live registration of a port name with the daemon.
///
/// Cloning yields another handle to the same registration; closing any
/// handle closes the port for all of them.
#[derive(Clone)]
pub struct Port {
    shared: Arc<PortShared>,
    local_addr: SocketAddr,
}

impl Port {
    /// Wrap a bound listener that is not tied to a daemon registration.
    pub fn from_listener(name: impl Into<String>, listener: TcpListener) -> WireResult<Self> {
        let local_addr = listener.local_addr()?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(PortShared {
                name: name.into(),
                listener: Mutex::new(Some(Arc::new(listener))),
                closed,
            }),
            local_addr,
        })
    }

    /// Wrap a listener registered over `control`.
    ///
    /// The daemon drops a registration when its control stream ends, so the
    /// stream is held until the port closes, and the port closes if the
    /// daemon ends the stream first.
    pub(crate) fn with_registration(
        name: impl Into<String>,
        listener: TcpListener,
        mut control: Stream,
    ) -> WireResult<Self> {
        let port = Self::from_listener(name, listener)?;
        let closed = port.shared.closed.subscribe();
        let shared: Weak<PortShared> = Arc::downgrade(&port.shared);
        let name = port.name().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            tokio::select! {
                _ = wait_closed(closed) => {}
                _ = async {
                    loop {
                        match control.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => continue,
                        }
                    }
                } => {
                    debug!(port = %name, "Daemon ended the registration");
                    if let Some(shared) = shared.upgrade() {
                        shared.close();
                    }
                }
            }
            control.close().await;
        });
        Ok(port)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Address of the local listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Wait for the daemon to forward one connection.
    ///
    /// Fails with [`WireError::PortClosed`] once the port is closed,
    /// including while a call is waiting.
    pub async fn next(&self) -> WireResult<PendingConnection> {
        let closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            return Err(WireError::PortClosed);
        }
        let listener = self.shared.listener().ok_or(WireError::PortClosed)?;
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, addr) = accepted?;
                let _ = tcp.set_nodelay(true);
                debug!(port = %self.name(), %addr, "Accepted forwarded connection");
                Ok(PendingConnection {
                    stream: Stream::new(tcp, format!("{}<-{}", self.name(), addr)),
                    port: Arc::clone(&self.shared),
                })
            }
            _ = wait_closed(closed) => Err(WireError::PortClosed),
        }
    }

    /// Close the port and release its listener.
    ///
    /// Idempotent; returns `false` if the port was already closed.
    pub fn close(&self) -> bool {
        self.shared.close()
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.shared.name)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A forwarded connection whose request metadata has not been read yet.
pub struct PendingConnection {
    stream: Stream,
    port: Arc<PortShared>,
}

impl PendingConnection {
    /// Read the caller identity and query from the connection.
    ///
    /// On failure the connection and its port are closed and the error is
    /// scoped to the port.
    pub async fn materialize(mut self) -> WireResult<Connection> {
        let read = async {
            let caller = self.stream.read_identity().await?;
            let query = self.stream.read_string8().await?;
            Ok::<_, WireError>((caller, query))
        }
        .await;

        match read {
            Ok((caller, query)) => {
                debug!(port = %self.port.name, %caller, %query, "Connection request");
                Ok(Connection {
                    stream: self.stream,
                    caller,
                    query,
                })
            }
            Err(e) => {
                self.stream.close().await;
                self.port.close();
                Err(WireError::Port {
                    port: self.port.name.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
}

/// An inbound request that has not been answered yet.
pub struct Connection {
    stream: Stream,
    caller: Identity,
    query: String,
}

impl Connection {
    /// Identity of the node that opened the connection.
    pub fn caller(&self) -> &Identity {
        &self.caller
    }

    /// Port name or query string the caller asked for.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Accept the request and hand over the stream.
    pub async fn accept(mut self) -> WireResult<Stream> {
        let sent = async {
            self.stream.write_int8(ACCEPT).await?;
            self.stream.flush().await?;
            Ok::<_, WireError>(())
        }
        .await;
        match sent {
            Ok(()) => Ok(self.stream),
            Err(e) => {
                self.stream.close().await;
                Err(WireError::Accept {
                    caller: self.caller,
                    query: self.query,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Reject the request and close the transport.
    pub async fn reject(mut self) -> WireResult<()> {
        let sent = async {
            self.stream.write_int8(REJECT).await?;
            self.stream.flush().await?;
            Ok::<_, WireError>(())
        }
        .await;
        self.stream.close().await;
        sent.map_err(|e| {
            warn!(caller = %self.caller, query = %self.query, error = %e, "Reject failed");
            WireError::Reject {
                caller: self.caller,
                query: self.query.clone(),
                source: Box::new(e),
            }
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("caller", &self.caller)
            .field("query", &self.query)
            .finish()
    }
}
