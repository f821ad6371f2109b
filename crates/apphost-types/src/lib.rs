//! Core types for the astral apphost client.
//!
//! This crate defines the data shared by the wire protocol, the session
//! layer and the command-line front end: node identities, daemon result
//! codes and client configuration. It performs no network I/O.

pub mod config;
pub mod identity;
pub mod result_code;

pub use config::{AppHostAddr, ClientConfig};
pub use identity::{Identity, IdentityError, IDENTITY_LEN};
pub use result_code::ResultCode;
