//! Host ports: the interfaces the sync core owns but does not implement
//! (§6). Implementations — a SQLite driver adapter, a WebSocket client, a
//! platform clock, a CSPRNG, secure storage — are supplied by the host
//! application; this crate only defines the contract.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of executing a single SQL statement against the [`Sqlite`] port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqliteExecResult {
    /// Rows returned by the statement, each row a list of column values
    /// encoded as opaque bytes (driver-specific; the core never inspects
    /// them beyond passing them to a caller-supplied decoder).
    pub rows: Vec<Vec<Vec<u8>>>,
    /// Number of rows inserted/updated/deleted by the statement.
    pub changes: u64,
}

/// Error surfaced by a [`Sqlite`] port implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("sqlite error {code}: {message}")]
pub struct SqliteError {
    /// Driver-reported error code.
    pub code: i32,
    /// Driver-reported error message.
    pub message: String,
}

/// The database port (§6). Implementations adapt a platform SQLite driver
/// (e.g. a WASM-compiled SQLite, or a native `rusqlite` handle) behind a
/// single `exec`/`transaction`/`export` surface so the core never links a
/// driver crate directly.
#[async_trait]
pub trait Sqlite: Send + Sync {
    /// Execute a single SQL statement with positional parameters.
    async fn exec(&self, query: &str, params: &[Vec<u8>]) -> Result<SqliteExecResult, SqliteError>;

    /// Run `f` inside a single SQLite transaction. `f` receives a handle
    /// scoped to the transaction; if the returned future resolves to `Err`,
    /// the transaction is rolled back and the error is propagated.
    async fn transaction<'a>(
        &'a self,
        f: Box<dyn FnOnce(&'a dyn Sqlite) -> BoxFuture<'a, Result<(), SqliteError>> + Send + 'a>,
    ) -> Result<(), SqliteError>;

    /// Export the whole database as a single opaque byte blob (used by
    /// `Evolu::exportDatabase`, §6).
    async fn export(&self) -> Result<Vec<u8>, SqliteError>;
}

/// Connection state reported by a [`WebSocket`] port implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebSocketState {
    /// Not currently connected; a reconnect attempt may be scheduled.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Ready to send and receive.
    Open,
}

/// Failure a [`WebSocket`] port implementation reports back to the sync
/// engine (§4.6, §7).
///
/// A strict subset of [`crate::errors::SyncError`]: a transport can report a
/// network failure, a relay-reported status, or a payment requirement, but
/// never a sync divergence — that outcome is computed by the engine itself
/// from two Merkle tries, never reported by the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    /// The underlying connection failed, timed out, or was unreachable.
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
}

impl From<TransportError> for crate::errors::SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(msg) => Self::Network(msg),
            TransportError::Server { status } => Self::Server { status },
            TransportError::PaymentRequired => Self::PaymentRequired,
        }
    }
}

/// The transport port (§6). The sync engine prefers this over HTTP when the
/// host supplies one.
#[async_trait]
pub trait WebSocket: Send + Sync {
    /// Send a length-prefixed binary envelope (§4.8).
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Await the next inbound length-prefixed binary envelope.
    ///
    /// `spec.md` §6 describes this host port as an `onMessage(cb)`
    /// registration; a pull-based `recv` is used here instead so the sync
    /// engine can simply `.await` the next frame rather than bridging a
    /// callback into an async call, which is the idiomatic Rust shape for a
    /// single-consumer inbound stream.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Current connection state.
    fn state(&self) -> WebSocketState;
}

/// The wall-clock port (§6), abstracting platform time so the core can be
/// tested with a deterministic fake clock.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Current time as an ISO-8601 string, used for host-facing diagnostics
    /// only (never fed back into the HLC algebra).
    fn now_iso(&self) -> String;
}

/// The randomness port (§6), abstracting the CSPRNG so WASM and native hosts
/// can each supply their platform's source of entropy.
pub trait Random: Send + Sync {
    /// Generate a random `u32`.
    fn next_u32(&self) -> u32;

    /// Fill `buf` with random bytes.
    fn fill_bytes(&self, buf: &mut [u8]);
}

/// Opaque handle returned by [`SecureStorage::get`]/`set`, kept generic over
/// the host's platform keychain/credential store.
pub type SecureStorageKey = String;

/// Optional port for persisting small secrets (e.g. a cached mnemonic) in a
/// platform-appropriate secure store (§6). Not required for core operation —
/// hosts without a secure storage facility simply omit it.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Store `value` under `key`.
    async fn set(&self, key: &SecureStorageKey, value: Vec<u8>) -> Result<(), String>;

    /// Retrieve the value stored under `key`, if any.
    async fn get(&self, key: &SecureStorageKey) -> Result<Option<Vec<u8>>, String>;

    /// Remove the value stored under `key`.
    async fn remove(&self, key: &SecureStorageKey) -> Result<(), String>;
}

impl fmt::Display for WebSocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
        }
    }
}
