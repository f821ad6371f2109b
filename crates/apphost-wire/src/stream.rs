//! A live bidirectional byte channel to the daemon.
//!
//! A [`Stream`] owns its transport until [`Stream::close`] is called. Close
//! is best-effort and idempotent: failures are logged, a second close does
//! nothing, and reads or writes after close fail with `NotConnected`.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

/// Any raw byte channel a [`Stream`] can sit on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// A live bidirectional byte channel.
pub struct Stream {
    transport: Option<Box<dyn Transport>>,
    label: String,
}

impl Stream {
    /// Wrap a raw transport. `label` only appears in logs.
    pub fn new<T: Transport>(transport: T, label: impl Into<String>) -> Self {
        Self {
            transport: Some(Box::new(transport)),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Shut down and release the transport.
    ///
    /// Returns `true` if this call closed the stream and `false` if it was
    /// already closed. Never fails.
    pub async fn close(&mut self) -> bool {
        let Some(mut transport) = self.transport.take() else {
            return false;
        };
        if let Err(e) = transport.shutdown().await {
            // The peer may have gone already; the transport is dropped anyway.
            if e.kind() != io::ErrorKind::NotConnected {
                warn!(stream = %self.label, error = %e, "Cannot close stream");
            }
        }
        debug!(stream = %self.label, "Stream closed");
        true
    }

    fn transport(&mut self) -> io::Result<&mut Box<dyn Transport>> {
        self.transport
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream closed"))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().transport() {
            Ok(t) => Pin::new(t).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().transport() {
            Ok(t) => Pin::new(t).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().transport() {
            Ok(t) => Pin::new(t).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    /// Half-close: the peer sees end of stream, reading stays possible.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().transport() {
            Ok(t) => Pin::new(t).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
