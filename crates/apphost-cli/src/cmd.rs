//! Subcommand implementations.

use crate::ui;
use apphost_types::Identity;
use apphost_wire::{
    query_once, Encoded, JsonCodec, Network, ServiceHandler, Stream, WireError, WireResult,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Where a query goes, as given on the command line.
#[derive(Debug, PartialEq, Eq)]
pub enum Target {
    Node(Identity),
    Name(String),
}

impl Target {
    /// Hex identities and `localnode` are used as-is; anything else is a
    /// node name.
    pub fn parse(arg: Option<&str>) -> Self {
        match arg {
            None => Target::Node(Identity::Local),
            Some(arg) => match arg.parse::<Identity>() {
                Ok(identity) => Target::Node(identity),
                Err(_) => Target::Name(arg.to_string()),
            },
        }
    }

    async fn identity(self, network: &Network) -> WireResult<Identity> {
        match self {
            Target::Node(identity) => Ok(identity),
            Target::Name(name) => network.resolve(&name).await,
        }
    }
}

pub async fn cmd_identity(network: &Network) -> WireResult<()> {
    let identity = network.identity().await?;
    println!("{identity}");
    Ok(())
}

pub async fn cmd_resolve(network: &Network, name: &str) -> WireResult<()> {
    let identity = network.resolve(name).await?;
    println!("{identity}");
    Ok(())
}

pub async fn cmd_query(
    network: &Network,
    port: &str,
    target: Target,
    timeout: Option<Duration>,
) -> WireResult<()> {
    let identity = target.identity(network).await?;
    let copied = query_once(
        network,
        port,
        &identity,
        JsonCodec::default(),
        timeout,
        |stream| {
            async move {
                let mut stdin = tokio::io::stdin();
                let sent = tokio::io::copy(&mut stdin, &mut *stream).await?;
                stream.shutdown().await?;
                let mut stdout = tokio::io::stdout();
                let received = tokio::io::copy(&mut *stream, &mut stdout).await?;
                stdout.flush().await?;
                Ok::<_, WireError>((sent, received))
            }
            .boxed()
        },
    )
    .await?;
    debug!(sent = copied.0, received = copied.1, "Query finished");
    Ok(())
}

/// Writes back whatever it reads until the caller hangs up.
struct EchoService;

#[async_trait]
impl ServiceHandler for EchoService {
    async fn serve(
        &self,
        stream: &mut Encoded<Stream>,
        caller: &Identity,
        _query: &str,
    ) -> WireResult<()> {
        let mut buf = vec![0u8; 4096];
        let mut total = 0usize;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
            stream.flush().await?;
            total += n;
        }
        info!(%caller, bytes = total, "Echo finished");
        Ok(())
    }
}

pub async fn cmd_echo(network: &Network, port: &str) -> WireResult<()> {
    let handle =
        apphost_wire::serve(network, port, JsonCodec::default(), Arc::new(EchoService)).await?;
    ui::success(&format!("Serving echo on port {port}"));
    ui::hint("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(%port, "Interrupted, closing port");
        }
        _ = wait_port_closed(&handle) => {
            ui::hint("The daemon ended the registration");
        }
    }
    handle.shutdown().await;
    Ok(())
}

async fn wait_port_closed(handle: &apphost_wire::ServeHandle) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_defaults_to_local() {
        assert_eq!(Target::parse(None), Target::Node(Identity::Local));
        assert_eq!(Target::parse(Some("localnode")), Target::Node(Identity::Local));
    }

    #[test]
    fn test_target_hex_or_name() {
        let hex = format!("02{}", "ab".repeat(32));
        match Target::parse(Some(&hex)) {
            Target::Node(Identity::Node(key)) => assert_eq!(key[0], 0x02),
            other => panic!("Expected node identity, got {other:?}"),
        }
        assert_eq!(Target::parse(Some("alice")), Target::Name("alice".into()));
    }
}
