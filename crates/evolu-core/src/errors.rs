//! Unified error type for the Evolu sync core.
//!
//! Each subsystem (timestamps, crypto, storage, sync, relay) defines the
//! disjoint error variants it can raise; this module composes them into a
//! single top-level type so a host application has one error to match on.

use serde::{Deserialize, Serialize};

/// Errors raised by the HLC timestamp algebra (§4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum TimestampError {
    /// `clock_now_ms` produced a value outside the allowed millis range.
    #[error("timestamp time out of range")]
    TimeOutOfRange,

    /// The proposed next timestamp would exceed `max_drift_ms` ahead of the
    /// local wall clock.
    #[error("timestamp drift: now={now} next={next}")]
    Drift {
        /// Local wall-clock time in milliseconds at the moment of the check.
        now: i64,
        /// The timestamp millis that would have been produced.
        next: i64,
    },

    /// The logical counter for the current millisecond would wrap past
    /// `u16::MAX`.
    #[error("timestamp counter overflow")]
    CounterOverflow,

    /// A remote timestamp carried the same `nodeId` as this device.
    #[error("duplicate node id: {node_id}")]
    DuplicateNode {
        /// The colliding node identifier.
        node_id: String,
    },
}

/// Errors raised by `evolu-crypto` (§4.1, §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum CryptoError {
    /// AEAD decryption failed authentication.
    #[error("symmetric decryption failed")]
    DecryptFailed,

    /// A BIP-39 mnemonic failed checksum or wordlist validation.
    #[error("invalid mnemonic")]
    InvalidMnemonic,

    /// An input to a derivation or encoding routine had the wrong length.
    #[error("invalid key material length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected byte length.
        expected: usize,
        /// Actual byte length supplied.
        actual: usize,
    },
}

/// Errors raised by `evolu-store` (§4.5) and the `Sqlite` port (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum StoreError {
    /// The underlying SQLite port reported a failure.
    #[error("sqlite error {code}: {message}")]
    Sqlite {
        /// Driver-reported error code.
        code: i32,
        /// Driver-reported error message.
        message: String,
    },

    /// A transaction was rolled back, optionally because the rollback itself
    /// failed.
    #[error("transaction rolled back: {cause}")]
    TransactionRollback {
        /// The error that triggered the rollback.
        cause: String,
        /// A secondary error encountered while rolling back, if any.
        rollback_error: Option<String>,
    },
}

impl From<crate::ports::SqliteError> for StoreError {
    fn from(err: crate::ports::SqliteError) -> Self {
        StoreError::Sqlite {
            code: err.code,
            message: err.message,
        }
    }
}

/// Errors raised by `evolu-sync` (§4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum SyncError {
    /// Transport-level failure; eligible for exponential-backoff retry.
    #[error("network error: {0}")]
    Network(String),

    /// The relay responded with a non-success HTTP-like status.
    #[error("server error: status={status}")]
    Server {
        /// The reported status code.
        status: u16,
    },

    /// The relay requires payment before accepting further writes.
    #[error("payment required")]
    PaymentRequired,

    /// A Merkle diff round failed to strictly decrease; sync was aborted to
    /// avoid looping forever.
    #[error("sync divergence did not converge")]
    Divergence,
}

/// Errors raised by `evolu-relay` (§4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum RelayError {
    /// The owner's storage quota would be exceeded by this write.
    #[error("storage quota exceeded for owner {owner_id}")]
    StorageQuota {
        /// The owner whose quota was exceeded.
        owner_id: String,
    },

    /// The supplied write key does not match the one already on file.
    #[error("write key mismatch")]
    WriteKeyMismatch,

    /// The requested owner has no record at the relay.
    #[error("resource not found")]
    ResourceNotFound,

    /// The underlying `Sqlite` port reported a failure while serving a
    /// relay storage operation (§4.7's "any SQL error aborts the
    /// transaction").
    #[error("sqlite error {code}: {message}")]
    Sqlite {
        /// Driver-reported error code.
        code: i32,
        /// Driver-reported error message.
        message: String,
    },
}

impl From<crate::ports::SqliteError> for RelayError {
    fn from(err: crate::ports::SqliteError) -> Self {
        RelayError::Sqlite {
            code: err.code,
            message: err.message,
        }
    }
}

/// Errors raised by `evolu-protocol` (§4.8) while framing or parsing the
/// binary wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum ProtocolError {
    /// The frame's leading two bytes did not match the expected magic.
    #[error("bad magic bytes")]
    BadMagic,

    /// The frame declared a protocol version this build does not speak.
    #[error("unsupported protocol version: {version}")]
    UnsupportedVersion {
        /// The version byte pair found in the frame.
        version: u16,
    },

    /// The frame's `kind` byte did not match any known message kind.
    #[error("unknown frame kind: {kind}")]
    UnknownKind {
        /// The raw kind byte.
        kind: u8,
    },

    /// The buffer ended before a length-prefixed field could be read in full.
    #[error("truncated frame: expected {expected} more bytes, found {found}")]
    Truncated {
        /// Bytes the field's prefix promised.
        expected: usize,
        /// Bytes actually remaining in the buffer.
        found: usize,
    },

    /// A varuint-encoded length exceeded the sanity ceiling for a single
    /// frame, most likely a corrupt or hostile payload.
    #[error("field length {length} exceeds the maximum frame size")]
    LengthTooLarge {
        /// The decoded length.
        length: u64,
    },
}

/// Unified error type for all Evolu core operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum EvoluError {
    /// See [`TimestampError`].
    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    /// See [`CryptoError`].
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// See [`StoreError`].
    #[error(transparent)]
    Store(#[from] StoreError),

    /// See [`SyncError`].
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// See [`RelayError`].
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Catch-all for serialization failures at the wire boundary.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EvoluError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for EvoluError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Standard result type for Evolu operations.
pub type Result<T> = std::result::Result<T, EvoluError>;
