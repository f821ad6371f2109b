//! Astral apphost protocol: the client side of the local daemon link.
//!
//! Applications reach the peer-to-peer daemon over a loopback transport
//! using a small framed binary protocol. Three control operations exist:
//! `register` a named port, `query` a port on some node, and `resolve` a
//! node name to its identity. Every control sequence ends with a one-byte
//! result code.
//!
//! ## Architecture
//!
//! - **frame**: exact-size reads, big-endian integers, length-prefixed fields
//! - **control**: the register/query/resolve request sequences
//! - **Network / Port / Connection / Stream**: the session surface
//! - **Encoded**: pluggable payload codec layered over any session object
//! - **dispatch**: serve loops and single-shot queries with guaranteed teardown
//! - **ServiceRegistry**: port name to handler table driving the serve loops

pub mod codec;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod network;
pub mod port;
pub mod registry;
pub mod stream;

pub use apphost_types::{AppHostAddr, ClientConfig, Identity, ResultCode};
pub use codec::{Encoded, JsonCodec, PayloadCodec};
pub use dispatch::{query_once, serve, spawn_query, QueryTask, ServeHandle, ServiceHandler};
pub use error::{WireError, WireResult};
pub use frame::{FrameReadExt, FrameWriteExt};
pub use network::Network;
pub use port::{Connection, PendingConnection, Port};
pub use registry::ServiceRegistry;
pub use stream::Stream;
