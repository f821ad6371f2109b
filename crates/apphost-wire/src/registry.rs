//! Service registry: the table of port names this application serves.
//!
//! Handlers are registered up front, then [`ServiceRegistry::serve_all`]
//! registers every port with the daemon and starts one serve loop each.

use crate::codec::{JsonCodec, PayloadCodec};
use crate::dispatch::{ServeHandle, ServiceHandler};
use crate::error::WireResult;
use crate::network::Network;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Port name to handler table.
pub struct ServiceRegistry<C: PayloadCodec = JsonCodec> {
    handlers: BTreeMap<String, Arc<dyn ServiceHandler<C>>>,
    codec: C,
}

impl Default for ServiceRegistry<JsonCodec> {
    fn default() -> Self {
        Self::new(JsonCodec::default())
    }
}

impl<C: PayloadCodec> ServiceRegistry<C> {
    pub fn new(codec: C) -> Self {
        Self {
            handlers: BTreeMap::new(),
            codec,
        }
    }

    /// Add a handler for `port`, replacing any previous one.
    pub fn register(&mut self, port: impl Into<String>, handler: Arc<dyn ServiceHandler<C>>) {
        let port = port.into();
        if self.handlers.insert(port.clone(), handler).is_some() {
            warn!(%port, "Replacing service handler");
        }
    }

    /// Builder-style [`ServiceRegistry::register`].
    pub fn with(mut self, port: impl Into<String>, handler: Arc<dyn ServiceHandler<C>>) -> Self {
        self.register(port, handler);
        self
    }

    pub fn get(&self, port: &str) -> Option<Arc<dyn ServiceHandler<C>>> {
        self.handlers.get(port).cloned()
    }

    /// Registered port names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Register every port and start serving.
    ///
    /// If any registration fails, the ports already started are shut down
    /// and the error is returned.
    pub async fn serve_all(&self, network: &Network) -> WireResult<Vec<ServeHandle>> {
        let mut started = Vec::with_capacity(self.handlers.len());
        for (port, handler) in &self.handlers {
            match crate::dispatch::serve(network, port, self.codec.clone(), Arc::clone(handler))
                .await
            {
                Ok(handle) => started.push(handle),
                Err(e) => {
                    for handle in started {
                        handle.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        info!(ports = ?self.names(), "Serving all registered ports");
        Ok(started)
    }
}

impl<C: PayloadCodec> std::fmt::Debug for ServiceRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("ports", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoded;
    use crate::stream::Stream;
    use apphost_types::{ClientConfig, Identity};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl ServiceHandler for Noop {
        async fn serve(
            &self,
            _stream: &mut Encoded<Stream>,
            _caller: &Identity,
            _query: &str,
        ) -> WireResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::<JsonCodec>::default()
            .with("beta", Arc::new(Noop))
            .with("alpha", Arc::new(Noop));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("gamma").is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ServiceRegistry::<JsonCodec>::default();
        registry.register("echo", Arc::new(Noop));
        registry.register("echo", Arc::new(Noop));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_serve_all_fails_without_daemon() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = ServiceRegistry::<JsonCodec>::default().with("echo", Arc::new(Noop));
        let network = Network::new(ClientConfig::with_daemon(addr.to_string()));
        let err = registry.serve_all(&network).await.unwrap_err();
        assert!(err.to_string().starts_with("Cannot register port echo"));
    }

    #[tokio::test]
    async fn test_serve_all_empty() {
        let registry = ServiceRegistry::<JsonCodec>::default();
        let network = Network::new(ClientConfig::default());
        assert!(registry.serve_all(&network).await.unwrap().is_empty());
    }
}
