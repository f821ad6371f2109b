//! Framing primitives for the apphost protocol.
//!
//! All integers are big-endian. Variable-size fields carry an unsigned
//! 8, 16 or 32-bit length prefix. Identities occupy a fixed 33-byte field
//! where all zeroes mean the local node.
//!
//! Fixed-size reads loop until the requested number of bytes has arrived:
//! a TCP socket may legitimately hand out a field in several pieces. Only
//! an end of stream before the field is complete is an error
//! ([`WireError::ConnectionClosed`]).

use crate::error::{WireError, WireResult};
use apphost_types::{Identity, IDENTITY_LEN};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size accepted for a 32-bit length-prefixed field or an unframed
/// message (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Buffer size used by [`FrameReadExt::read_message`].
pub const MESSAGE_CHUNK: usize = 4096;

/// Maximum length of a newline-terminated text line.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Text that the payload codec produces for an absent value.
const NULL_MESSAGE: &str = "null";

fn eof_aware(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::ConnectionClosed
    } else {
        WireError::Io(e)
    }
}

/// Read side of the framing.
#[async_trait]
pub trait FrameReadExt: AsyncRead + Unpin + Send {
    /// Read exactly `n` bytes.
    async fn read_field(&mut self, n: usize) -> WireResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf).await.map_err(eof_aware)?;
        Ok(buf)
    }

    async fn read_int8(&mut self) -> WireResult<i8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await.map_err(eof_aware)?;
        Ok(i8::from_be_bytes(buf))
    }

    async fn read_int16(&mut self) -> WireResult<i16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await.map_err(eof_aware)?;
        Ok(i16::from_be_bytes(buf))
    }

    async fn read_int32(&mut self) -> WireResult<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await.map_err(eof_aware)?;
        Ok(i32::from_be_bytes(buf))
    }

    async fn read_int64(&mut self) -> WireResult<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await.map_err(eof_aware)?;
        Ok(i64::from_be_bytes(buf))
    }

    async fn read_bytes8(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_int8().await? as u8;
        self.read_field(len as usize).await
    }

    async fn read_bytes16(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_int16().await? as u16;
        self.read_field(len as usize).await
    }

    async fn read_bytes32(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_int32().await? as u32;
        if len > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        self.read_field(len as usize).await
    }

    async fn read_string8(&mut self) -> WireResult<String> {
        Ok(String::from_utf8(self.read_bytes8().await?)?)
    }

    async fn read_string16(&mut self) -> WireResult<String> {
        Ok(String::from_utf8(self.read_bytes16().await?)?)
    }

    async fn read_string32(&mut self) -> WireResult<String> {
        Ok(String::from_utf8(self.read_bytes32().await?)?)
    }

    /// Read a 33-byte identity field.
    async fn read_identity(&mut self) -> WireResult<Identity> {
        let mut field = [0u8; IDENTITY_LEN];
        self.read_exact(&mut field).await.map_err(eof_aware)?;
        Ok(Identity::from_field(field))
    }

    /// Read one unframed message.
    ///
    /// Bytes are accumulated over reads of a [`MESSAGE_CHUNK`] buffer until
    /// a read comes back short. An end of stream before any byte arrives is
    /// `None`, and so is the literal text `null`. A message that grows past
    /// [`MAX_MESSAGE_SIZE`] fails with [`WireError::MessageTooLarge`].
    async fn read_message(&mut self) -> WireResult<Option<String>> {
        self.read_message_limited(MAX_MESSAGE_SIZE as usize).await
    }

    /// [`read_message`](Self::read_message) with a caller-chosen size cap.
    async fn read_message_limited(&mut self, max: usize) -> WireResult<Option<String>> {
        let mut message = Vec::new();
        let mut buf = vec![0u8; MESSAGE_CHUNK];
        loop {
            let n = self.read(&mut buf).await?;
            message.extend_from_slice(&buf[..n]);
            if message.len() > max {
                return Err(WireError::MessageTooLarge {
                    size: u32::try_from(message.len()).unwrap_or(u32::MAX),
                    max: u32::try_from(max).unwrap_or(u32::MAX),
                });
            }
            if n < buf.len() {
                break;
            }
        }
        if message.is_empty() {
            return Ok(None);
        }
        let text = String::from_utf8(message)?;
        Ok((text != NULL_MESSAGE).then_some(text))
    }

    /// Read text up to a `\n`, which is consumed but not returned.
    ///
    /// Reads one byte at a time so nothing past the newline is taken off
    /// the stream. That is one read call per byte on a bare socket; owners
    /// that read many lines should wrap the stream in a
    /// [`tokio::io::BufReader`], which gets this method through the blanket
    /// impl. End of stream with no bytes read is `None`; end of stream
    /// mid-line returns the partial line.
    async fn read_text_line(&mut self) -> WireResult<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.read(&mut byte).await? == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() >= MAX_LINE_LEN {
                return Err(WireError::FieldTooLong {
                    len: line.len() + 1,
                    max: MAX_LINE_LEN,
                });
            }
            line.push(byte[0]);
        }
        Ok(Some(String::from_utf8(line)?))
    }
}

impl<R: AsyncRead + Unpin + Send + ?Sized> FrameReadExt for R {}

/// Prefix `bytes` with its length in `width` bytes, rejecting overflow.
fn prefixed(bytes: &[u8], width: usize) -> WireResult<Vec<u8>> {
    let max = match width {
        1 => u8::MAX as usize,
        2 => u16::MAX as usize,
        _ => u32::MAX as usize,
    };
    if bytes.len() > max {
        return Err(WireError::FieldTooLong {
            len: bytes.len(),
            max,
        });
    }
    let len = (bytes.len() as u64).to_be_bytes();
    let mut out = Vec::with_capacity(width + bytes.len());
    out.extend_from_slice(&len[8 - width..]);
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Write side of the framing.
#[async_trait]
pub trait FrameWriteExt: AsyncWrite + Unpin + Send {
    async fn write_int8(&mut self, v: i8) -> WireResult<()> {
        self.write_all(&v.to_be_bytes()).await?;
        Ok(())
    }

    async fn write_int16(&mut self, v: i16) -> WireResult<()> {
        self.write_all(&v.to_be_bytes()).await?;
        Ok(())
    }

    async fn write_int32(&mut self, v: i32) -> WireResult<()> {
        self.write_all(&v.to_be_bytes()).await?;
        Ok(())
    }

    async fn write_int64(&mut self, v: i64) -> WireResult<()> {
        self.write_all(&v.to_be_bytes()).await?;
        Ok(())
    }

    async fn write_bytes8(&mut self, bytes: &[u8]) -> WireResult<()> {
        let frame = prefixed(bytes, 1)?;
        self.write_all(&frame).await?;
        Ok(())
    }

    async fn write_bytes16(&mut self, bytes: &[u8]) -> WireResult<()> {
        let frame = prefixed(bytes, 2)?;
        self.write_all(&frame).await?;
        Ok(())
    }

    async fn write_bytes32(&mut self, bytes: &[u8]) -> WireResult<()> {
        let frame = prefixed(bytes, 4)?;
        self.write_all(&frame).await?;
        Ok(())
    }

    async fn write_string8(&mut self, s: &str) -> WireResult<()> {
        self.write_bytes8(s.as_bytes()).await
    }

    async fn write_string16(&mut self, s: &str) -> WireResult<()> {
        self.write_bytes16(s.as_bytes()).await
    }

    async fn write_string32(&mut self, s: &str) -> WireResult<()> {
        self.write_bytes32(s.as_bytes()).await
    }

    /// Write a 33-byte identity field.
    async fn write_identity(&mut self, identity: &Identity) -> WireResult<()> {
        self.write_all(&identity.to_field()).await?;
        Ok(())
    }

    /// Write raw identity bytes, applying the local-node encoding rules.
    async fn write_identity_bytes(&mut self, bytes: &[u8]) -> WireResult<()> {
        let identity = Identity::from_bytes(bytes)?;
        self.write_identity(&identity).await
    }

    /// Write `text` followed by `\n`.
    async fn write_text_line(&mut self, text: &str) -> WireResult<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_all(&line).await?;
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send + ?Sized> FrameWriteExt for W {}
