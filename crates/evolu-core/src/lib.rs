//! # Evolu Core
//!
//! Foundation types for the Evolu sync core: the HLC timestamp algebra
//! (§4.3), the CRDT data model (§3), the unified error hierarchy (§7), and
//! the host port traits the core depends on but does not implement (§6).
//!
//! Everything downstream — crypto, merkle, store, protocol, sync, relay —
//! depends on this crate; this crate depends on nothing workspace-local.

pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod prelude;
pub mod time;
pub mod types;

pub use errors::{EvoluError, Result};
pub use identifiers::{NodeId, OwnerId, RowId};
pub use time::{Timestamp, TimestampConfig};
pub use types::{ColumnName, CrdtMessage, DbChange, EncryptedCrdtMessage, HistoryRow, TableName, Value};
