//! Node identities.
//!
//! A node is identified by its 33-byte public key. On the wire an identity
//! always occupies a fixed 33-byte field; the all-zero field stands for the
//! local node, so the daemon can be asked about "this node" without knowing
//! its key first.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of the identity field on the wire.
pub const IDENTITY_LEN: usize = 33;

/// Marker accepted in place of an identity to mean "the local node".
pub const LOCAL_NODE: &str = "localnode";

/// Errors produced when building an [`Identity`] from raw input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid identity size {0}, have to be {IDENTITY_LEN} or 0")]
    InvalidLength(usize),
    #[error("Invalid identity hex: {0}")]
    InvalidHex(String),
}

/// A node identity, or the local-node sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Identity {
    /// The node the daemon runs on. Encoded as 33 zero bytes.
    #[default]
    Local,
    /// A concrete node public key.
    Node([u8; IDENTITY_LEN]),
}

impl Identity {
    /// Build an identity from raw bytes.
    ///
    /// Empty input and the literal `localnode` marker map to [`Identity::Local`],
    /// as does an all-zero key. Any other input must be exactly 33 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.is_empty() || bytes == LOCAL_NODE.as_bytes() {
            return Ok(Identity::Local);
        }
        let key: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self::from_field(key))
    }

    /// Decode a 33-byte wire field. All zeroes decode to [`Identity::Local`].
    pub fn from_field(field: [u8; IDENTITY_LEN]) -> Self {
        if field.iter().all(|b| *b == 0) {
            Identity::Local
        } else {
            Identity::Node(field)
        }
    }

    /// Encode into the 33-byte wire field.
    pub fn to_field(&self) -> [u8; IDENTITY_LEN] {
        match self {
            Identity::Local => [0u8; IDENTITY_LEN],
            Identity::Node(key) => *key,
        }
    }

    /// True for the local-node sentinel.
    pub fn is_local(&self) -> bool {
        matches!(self, Identity::Local)
    }

    /// Raw key bytes; empty for the local node.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Identity::Local => &[],
            Identity::Node(key) => key,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Local => f.write_str(LOCAL_NODE),
            Identity::Node(key) => f.write_str(&hex::encode(key)),
        }
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    /// Parse the text form: blank or `localnode` for the local node,
    /// otherwise 66 hex characters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == LOCAL_NODE {
            return Ok(Identity::Local);
        }
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidHex(e.to_string()))?;
        Identity::from_bytes(&bytes)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
