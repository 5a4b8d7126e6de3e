//! Convenient re-exports of the most commonly used `evolu-core` types.
//!
//! ```
//! use evolu_core::prelude::*;
//! ```

pub use crate::errors::{EvoluError, Result};
pub use crate::identifiers::{NodeId, OwnerId, RowId};
pub use crate::ports::{Clock, Random, SecureStorage, Sqlite, TransportError, WebSocket, WebSocketState};
pub use crate::time::{Timestamp, TimestampConfig};
pub use crate::types::{ColumnName, CrdtMessage, DbChange, EncryptedCrdtMessage, HistoryRow, TableName, Value};
