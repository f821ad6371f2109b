//! Serving registered ports and running single-shot queries.
//!
//! [`serve`] registers a port and spawns an accept loop; every inbound
//! connection is handled on its own task, and the stream is closed when the
//! handler returns, whatever it returned.
//!
//! [`query_once`] opens a stream, runs one handler against it and closes it
//! on every exit path: success, handler failure or an expired deadline.

use crate::codec::{Encoded, JsonCodec, PayloadCodec};
use crate::error::{WireError, WireResult};
use crate::network::Network;
use crate::port::{PendingConnection, Port};
use crate::stream::Stream;
use apphost_types::Identity;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Application logic behind a registered port.
#[async_trait]
pub trait ServiceHandler<C: PayloadCodec = JsonCodec>: Send + Sync + 'static {
    /// Decide whether to take a request. Declined requests are rejected.
    async fn admit(&self, _caller: &Identity, _query: &str) -> bool {
        true
    }

    /// Serve one accepted connection.
    ///
    /// The stream is closed by the caller once this returns.
    async fn serve(
        &self,
        stream: &mut Encoded<Stream, C>,
        caller: &Identity,
        query: &str,
    ) -> WireResult<()>;
}

/// Register `port_name` and serve its connections with `handler`.
pub async fn serve<C: PayloadCodec>(
    network: &Network,
    port_name: &str,
    codec: C,
    handler: Arc<dyn ServiceHandler<C>>,
) -> WireResult<ServeHandle> {
    let port = network.register(port_name).await?;
    Ok(ServeHandle::spawn(port, codec, handler))
}

/// A running serve loop.
///
/// Dropping the handle detaches the loop: it keeps its own clone of the
/// [`Port`], so the registration stays alive until the port is closed
/// through [`shutdown`](Self::shutdown), another clone, or the daemon.
#[derive(Debug)]
pub struct ServeHandle {
    port: Port,
    task: JoinHandle<()>,
}

impl ServeHandle {
    /// Serve an already registered port.
    pub fn spawn<C: PayloadCodec>(
        port: Port,
        codec: C,
        handler: Arc<dyn ServiceHandler<C>>,
    ) -> Self {
        let loop_port = port.clone();
        let task = tokio::spawn(async move {
            accept_loop(loop_port, codec, handler).await;
        });
        Self { port, task }
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the port and wait for the accept loop to stop.
    ///
    /// Connections already being served run to completion on their own.
    pub async fn shutdown(self) {
        self.port.close();
        if let Err(e) = self.task.await {
            warn!(port = %self.port.name(), error = %e, "Serve loop ended abnormally");
        }
    }

    /// Wait until the port closes by other means.
    pub async fn join(self) -> WireResult<()> {
        self.task
            .await
            .map_err(|e| WireError::TaskFailed(e.to_string()))
    }
}

async fn accept_loop<C: PayloadCodec>(port: Port, codec: C, handler: Arc<dyn ServiceHandler<C>>) {
    loop {
        match port.next().await {
            Ok(pending) => {
                let codec = codec.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handle_connection(pending, codec, &*handler).await;
                });
            }
            Err(WireError::PortClosed) => {
                info!(port = %port.name(), "Serve loop stopped");
                break;
            }
            Err(e) => {
                error!(port = %port.name(), error = %e, "Accept error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_connection<C: PayloadCodec>(
    pending: PendingConnection,
    codec: C,
    handler: &dyn ServiceHandler<C>,
) {
    let conn = match pending.materialize().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "Dropping connection with unreadable request");
            return;
        }
    };
    let caller = *conn.caller();
    let query = conn.query().to_string();

    if !handler.admit(&caller, &query).await {
        debug!(%caller, %query, "Request declined");
        if let Err(e) = conn.reject().await {
            debug!(error = %e, "Reject not delivered");
        }
        return;
    }

    let stream = match conn.accept().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Accept failed");
            return;
        }
    };
    let mut stream = Encoded::new(stream, codec);
    if let Err(e) = handler.serve(&mut stream, &caller, &query).await {
        warn!(%caller, %query, error = %e, "Handler failed");
    }
    stream.close().await;
}

async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Query `port` on `identity`, run `handler` on the stream, then close it.
///
/// `timeout` bounds the whole exchange; when it expires the stream is
/// closed and [`WireError::Timeout`] is returned. A timeout too large to
/// express as a deadline means no deadline. Any error the handler
/// returns is passed through unchanged after the stream is closed.
pub async fn query_once<C, T, E, F>(
    network: &Network,
    port: &str,
    identity: &Identity,
    codec: C,
    timeout: Option<Duration>,
    handler: F,
) -> Result<T, E>
where
    C: PayloadCodec,
    E: From<WireError>,
    F: for<'a> FnOnce(&'a mut Encoded<Stream, C>) -> BoxFuture<'a, Result<T, E>>,
{
    let deadline = timeout.and_then(|d| Instant::now().checked_add(d));
    let expired = || E::from(WireError::Timeout(timeout.unwrap_or_default()));

    let stream = match until(deadline, network.query(port, identity)).await {
        Some(stream) => stream?,
        None => return Err(expired()),
    };
    let mut stream = Encoded::new(stream, codec);

    let result = until(deadline, handler(&mut stream)).await;
    stream.close().await;
    match result {
        Some(result) => result,
        None => {
            debug!(%port, %identity, "Query deadline expired");
            Err(expired())
        }
    }
}

/// A query running on its own task.
#[derive(Debug)]
pub struct QueryTask<T, E> {
    handle: JoinHandle<Result<T, E>>,
}

impl<T, E: From<WireError>> QueryTask<T, E> {
    /// Wait for the query. A panicking handler surfaces as
    /// [`WireError::TaskFailed`].
    pub async fn join(self) -> Result<T, E> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(E::from(WireError::TaskFailed(e.to_string()))),
        }
    }

    /// Cancel the query. Dropping the task's stream closes the transport.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// [`query_once`] on a spawned task.
pub fn spawn_query<C, T, E, F>(
    network: Network,
    port: impl Into<String>,
    identity: Identity,
    codec: C,
    timeout: Option<Duration>,
    handler: F,
) -> QueryTask<T, E>
where
    C: PayloadCodec,
    T: Send + 'static,
    E: From<WireError> + Send + 'static,
    F: for<'a> FnOnce(&'a mut Encoded<Stream, C>) -> BoxFuture<'a, Result<T, E>> + Send + 'static,
{
    let port = port.into();
    let handle = tokio::spawn(async move {
        query_once(&network, &port, &identity, codec, timeout, handler).await
    });
    QueryTask { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameReadExt, FrameWriteExt};
    use futures::FutureExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    struct Upper;

    #[async_trait]
    impl ServiceHandler for Upper {
        async fn admit(&self, _caller: &Identity, query: &str) -> bool {
            query == "upper"
        }

        async fn serve(
            &self,
            stream: &mut Encoded<Stream>,
            _caller: &Identity,
            _query: &str,
        ) -> WireResult<()> {
            let text = stream.read_string8().await?;
            stream.write_string8(&text.to_uppercase()).await?;
            stream.flush().await?;
            Ok(())
        }
    }

    async fn open(port: &Port, query: &str) -> TcpStream {
        let mut conn = TcpStream::connect(port.local_addr()).await.unwrap();
        conn.write_identity(&Identity::Local).await.unwrap();
        conn.write_string8(query).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_serve_loop_handles_and_rejects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = Port::from_listener("upper", listener).unwrap();
        let handle = ServeHandle::spawn(port.clone(), JsonCodec::default(), Arc::new(Upper));

        let mut ok = open(&port, "upper").await;
        assert_eq!(ok.read_int8().await.unwrap(), 0);
        ok.write_string8("hello").await.unwrap();
        assert_eq!(ok.read_string8().await.unwrap(), "HELLO");

        let mut declined = open(&port, "other").await;
        assert_eq!(declined.read_int8().await.unwrap(), 1);

        handle.shutdown().await;
        assert!(port.is_closed());
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = Port::from_listener("upper", listener).unwrap();
        let handle = ServeHandle::spawn(port.clone(), JsonCodec::default(), Arc::new(Upper));

        // Accepted, then hang up before sending the text the handler wants.
        let mut first = open(&port, "upper").await;
        assert_eq!(first.read_int8().await.unwrap(), 0);
        drop(first);

        let mut second = open(&port, "upper").await;
        assert_eq!(second.read_int8().await.unwrap(), 0);
        second.write_string8("again").await.unwrap();
        assert_eq!(second.read_string8().await.unwrap(), "AGAIN");

        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unbounded_timeout_means_no_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let network = Network::new(apphost_types::ClientConfig::with_daemon(addr.to_string()));

        let result: WireResult<()> = query_once(
            &network,
            "echo",
            &Identity::Local,
            JsonCodec::default(),
            Some(Duration::MAX),
            |_stream| async { Ok::<_, WireError>(()) }.boxed(),
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err.root_cause(), WireError::DaemonUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_drop_detaches_serve_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = Port::from_listener("upper", listener).unwrap();
        drop(ServeHandle::spawn(port.clone(), JsonCodec::default(), Arc::new(Upper)));

        let mut conn = open(&port, "upper").await;
        assert_eq!(conn.read_int8().await.unwrap(), 0);
        conn.write_string8("still").await.unwrap();
        assert_eq!(conn.read_string8().await.unwrap(), "STILL");
        port.close();
    }

    #[tokio::test]
    async fn test_join_returns_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = Port::from_listener("idle", listener).unwrap();
        let handle = ServeHandle::spawn(port.clone(), JsonCodec::default(), Arc::new(Upper));
        port.close();
        handle.join().await.unwrap();
    }
}
