//! Network: the entry point for talking to the local daemon.
//!
//! Every control operation opens a fresh connection to the daemon's
//! control endpoint. Configured endpoints are tried in order and the first
//! one that accepts the connection is used.

use crate::codec::{Encoded, PayloadCodec};
use crate::control::{self, LOCAL_NODE_NAME};
use crate::error::{WireError, WireResult};
use crate::port::Port;
use crate::stream::Stream;
use apphost_types::{AppHostAddr, ClientConfig, Identity};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

struct NetworkInner {
    config: ClientConfig,
    identity: OnceCell<Identity>,
}

/// Handle to the local daemon. Cheap to clone; clones share the cached
/// local identity.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                config,
                identity: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Layer a payload codec over this network.
    pub fn with_codec<C: PayloadCodec>(self, codec: C) -> Encoded<Network, C> {
        Encoded::new(self, codec)
    }

    /// Open a raw connection to the daemon's control endpoint.
    pub async fn connect(&self, label: &str) -> WireResult<Stream> {
        let addrs = &self.inner.config.daemon_addrs;
        let mut last_err: Option<WireError> = None;

        for addr in addrs {
            match connect_addr(addr, label).await {
                Ok(stream) => return Ok(stream),
                Err(WireError::Io(e)) => {
                    debug!(%addr, error = %e, "Control endpoint unavailable");
                    last_err = Some(WireError::DaemonUnreachable {
                        addr: addr.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(%addr, error = %e, "Skipping control endpoint");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            WireError::UnsupportedAddress("no usable daemon address configured".to_string())
        }))
    }

    /// Register `port` and start listening for forwarded connections.
    pub async fn register(&self, port: &str) -> WireResult<Port> {
        self.try_register(port)
            .await
            .map_err(|e| WireError::Register {
                port: port.to_string(),
                source: Box::new(e),
            })
    }

    async fn try_register(&self, port: &str) -> WireResult<Port> {
        let host = self.inner.config.forward_host.as_str();
        let listener = TcpListener::bind((host, 0)).await?;
        let forward_addr = format!("tcp:{}:{}", host, listener.local_addr()?.port());

        let mut stream = self.connect(&format!("register:{port}")).await?;
        if let Err(e) = control::register(&mut stream, port, &forward_addr).await {
            stream.close().await;
            return Err(e);
        }
        info!(%port, %forward_addr, "Port registered");
        Port::with_registration(port, listener, stream)
    }

    /// Open a stream to `port` on the node `identity`.
    ///
    /// [`Identity::Local`] targets this node.
    pub async fn query(&self, port: &str, identity: &Identity) -> WireResult<Stream> {
        self.try_query(port, identity)
            .await
            .map_err(|e| WireError::Query {
                port: port.to_string(),
                identity: *identity,
                source: Box::new(e),
            })
    }

    async fn try_query(&self, port: &str, identity: &Identity) -> WireResult<Stream> {
        let mut stream = self.connect(&format!("query:{port}@{identity}")).await?;
        match control::query(&mut stream, identity, port).await {
            Ok(()) => {
                debug!(%port, %identity, "Query accepted");
                Ok(stream)
            }
            Err(e) => {
                stream.close().await;
                Err(e)
            }
        }
    }

    /// Resolve `name` to a node identity.
    pub async fn resolve(&self, name: &str) -> WireResult<Identity> {
        let result = async {
            let mut stream = self.connect(&format!("resolve:{name}")).await?;
            let resolved = control::resolve(&mut stream, name).await;
            stream.close().await;
            resolved
        }
        .await;
        result.map_err(|e| WireError::Resolve {
            name: name.to_string(),
            source: Box::new(e),
        })
    }

    /// Resolve `name`, then query `port` on the resulting node.
    pub async fn query_name(&self, name: &str, port: &str) -> WireResult<Stream> {
        let identity = self.resolve(name).await?;
        self.query(port, &identity).await
    }

    /// This node's identity.
    ///
    /// The daemon answers with the all-zero identity until it knows its own
    /// key, so the lookup is repeated at the configured poll interval. The
    /// first real identity is cached; errors are returned and not cached.
    pub async fn identity(&self) -> WireResult<Identity> {
        self.inner
            .identity
            .get_or_try_init(|| self.poll_identity())
            .await
            .copied()
    }

    async fn poll_identity(&self) -> WireResult<Identity> {
        let interval = self.inner.config.identity_poll_interval();
        loop {
            let identity = self.resolve(LOCAL_NODE_NAME).await?;
            if !identity.is_local() {
                info!(%identity, "Local identity resolved");
                return Ok(identity);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// The cached local identity, if [`Network::identity`] has completed.
    pub fn cached_identity(&self) -> Option<Identity> {
        self.inner.identity.get().copied()
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("daemon_addrs", &self.inner.config.daemon_addrs)
            .field("identity", &self.cached_identity())
            .finish()
    }
}

async fn connect_addr(addr: &AppHostAddr, label: &str) -> WireResult<Stream> {
    match addr {
        AppHostAddr::Tcp(host_port) => {
            let tcp = TcpStream::connect(host_port.as_str()).await?;
            let _ = tcp.set_nodelay(true);
            Ok(Stream::new(tcp, label))
        }
        #[cfg(unix)]
        AppHostAddr::Unix(path) => {
            let unix = tokio::net::UnixStream::connect(path).await?;
            Ok(Stream::new(unix, label))
        }
        #[cfg(not(unix))]
        AppHostAddr::Unix(path) => Err(WireError::UnsupportedAddress(format!(
            "unix:{}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_daemon() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let network = Network::new(ClientConfig::with_daemon(addr.to_string()));
        let err = network.resolve("anyone").await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            WireError::DaemonUnreachable { .. }
        ));
        assert!(err.to_string().starts_with("Cannot resolve anyone: Cannot connect"));
    }

    #[tokio::test]
    async fn test_empty_address_list() {
        let mut config = ClientConfig::default();
        config.daemon_addrs.clear();
        let network = Network::new(config);
        let err = network.connect("test").await.unwrap_err();
        assert!(matches!(err, WireError::UnsupportedAddress(_)));
    }

    #[cfg(not(unix))]
    #[tokio::test]
    async fn test_unsupported_address_is_reported() {
        let mut config = ClientConfig::default();
        config.daemon_addrs = vec![AppHostAddr::Unix(std::path::PathBuf::from("/run/a.sock"))];
        let network = Network::new(config);
        let err = network.connect("test").await.unwrap_err();
        assert!(matches!(&err, WireError::UnsupportedAddress(addr) if addr.starts_with("unix:")));
    }

    #[tokio::test]
    async fn test_last_unreachable_address_is_reported() {
        let mut dead = Vec::new();
        for _ in 0..2 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            dead.push(listener.local_addr().unwrap());
        }
        let mut config = ClientConfig::with_daemon(dead[0].to_string());
        config.daemon_addrs.push(AppHostAddr::Tcp(dead[1].to_string()));
        let network = Network::new(config);

        let err = network.connect("test").await.unwrap_err();
        match err {
            WireError::DaemonUnreachable { addr, .. } => {
                assert_eq!(addr, format!("tcp:{}", dead[1]))
            }
            other => panic!("Expected DaemonUnreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_falls_through_to_next_address() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();

        let mut config = ClientConfig::with_daemon(dead_addr.to_string());
        config
            .daemon_addrs
            .push(AppHostAddr::Tcp(live_addr.to_string()));
        let network = Network::new(config);

        let accept = tokio::spawn(async move { live.accept().await.map(|_| ()) });
        let stream = network.connect("test").await.unwrap();
        assert_eq!(stream.label(), "test");
        accept.await.unwrap().unwrap();
    }
}
