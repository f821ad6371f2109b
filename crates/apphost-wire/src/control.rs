//! Control handshake: the register, query and resolve request sequences.
//!
//! Every sequence is written on a fresh stream to the daemon's control
//! endpoint and ends with a one-byte [`ResultCode`]. The result code is the
//! first thing read after the request; nothing is pipelined.
//!
//! ```text
//! register: string8 "register" | string8 port | string8 "tcp:<host>:<port>"  -> code
//! query:    string8 "query"    | identity[33] | string8 port                 -> code
//! resolve:  string8 "resolve"  | string8 name                 -> code | identity[33]
//! ```

use crate::error::{WireError, WireResult};
use crate::frame::{FrameReadExt, FrameWriteExt};
use apphost_types::{Identity, ResultCode};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Name resolved to find this node's own identity.
pub const LOCAL_NODE_NAME: &str = "localnode";

/// A control operation, sent as its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Register,
    Query,
    Resolve,
}

impl ControlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOp::Register => "register",
            ControlOp::Query => "query",
            ControlOp::Resolve => "resolve",
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read the one-byte result code and turn a failure code into an error.
pub async fn read_result_code<S>(stream: &mut S) -> WireResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    stream.flush().await?;
    let code = ResultCode::from_byte(stream.read_int8().await? as u8);
    if code.is_success() {
        Ok(())
    } else {
        Err(WireError::Result(code))
    }
}

/// Register `port` so the daemon forwards its connections to `forward_addr`.
pub async fn register<S>(stream: &mut S, port: &str, forward_addr: &str) -> WireResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    stream.write_string8(ControlOp::Register.as_str()).await?;
    stream.write_string8(port).await?;
    stream.write_string8(forward_addr).await?;
    read_result_code(stream).await
}

/// Ask the daemon to connect this stream to `port` on `identity`.
///
/// On success the stream carries the application payload from here on.
pub async fn query<S>(stream: &mut S, identity: &Identity, port: &str) -> WireResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    stream.write_string8(ControlOp::Query.as_str()).await?;
    stream.write_identity(identity).await?;
    stream.write_string8(port).await?;
    read_result_code(stream).await
}

/// Resolve a node name to its identity.
pub async fn resolve<S>(stream: &mut S, name: &str) -> WireResult<Identity>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    stream.write_string8(ControlOp::Resolve.as_str()).await?;
    stream.write_string8(name).await?;
    read_result_code(stream).await?;
    stream.read_identity().await
}
