//! Client sync engine (§4.6): a single-task actor drains a FIFO command
//! queue, running sync rounds against a `WebSocket` port and reconciling
//! state through `evolu-store`'s `apply_remote`.

mod backoff;
mod engine;
mod state;

pub use backoff::{fibonacci_reconnect_delay_ms, Backoff};
pub use engine::{spawn, SyncCommand, SyncConfig, SyncHandle};
pub use state::{SyncFailure, SyncState};
