//! Identifier newtypes used across the Evolu sync core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 21-character base64url owner identifier, derived via SLIP-21 (§3, §4.2).
///
/// `OwnerId` does not validate its own length or alphabet on construction from
/// a raw string — only [`crate::ports::Random`]-backed derivation in
/// `evolu-crypto` produces well-formed values. The newtype exists so callers
/// cannot accidentally compare an `OwnerId` to an arbitrary `String`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Wrap a raw base64url string as an `OwnerId` without validation.
    ///
    /// Used by decoders that have already validated shape (e.g. the wire
    /// format in `evolu-protocol`, which fixes the field at 21 ASCII bytes).
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the owner id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OwnerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Application-supplied row identifier (§3). The core never mints these; the
/// host application does, typically a UUID rendered as a string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(String);

impl RowId {
    /// Wrap a raw row identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the row id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 16-hex-character device node identifier used as the tie-break component
/// of a [`crate::time::Timestamp`] (§3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap a raw 16-hex-character node id without validation.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random node id from 8 bytes of entropy, hex-encoded to 16
    /// characters.
    pub fn generate(entropy: [u8; 8]) -> Self {
        Self(hex::encode(entropy))
    }

    /// Borrow the node id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render as the fixed 8-byte binary form used in [`crate::time::Timestamp::to_binary`].
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        if let Ok(decoded) = hex::decode(&self.0) {
            let n = decoded.len().min(8);
            out[..n].copy_from_slice(&decoded[..n]);
        }
        out
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
