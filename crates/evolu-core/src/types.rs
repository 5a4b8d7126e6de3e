//! CRDT data model shared by the store, sync, and relay layers (§3).

use crate::identifiers::{OwnerId, RowId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single column value. Closed tagged union — no reflection, matches the
/// design note in `spec.md` §9: JSON is stored as an opaque byte string and
/// parsed lazily by the host at query time, never by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit IEEE-754 float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// An opaque byte blob.
    Blob(Vec<u8>),
    /// A JSON document, stored and transmitted as raw bytes.
    Json(Vec<u8>),
}

/// A table name. Kept as a plain string newtype rather than an enum because
/// the schema is defined by the host application, not the core.
pub type TableName = String;

/// A column name within a table.
pub type ColumnName = String;

/// One column-level mutation against a single row (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbChange {
    /// The table the row belongs to.
    pub table: TableName,
    /// The row identifier within that table.
    pub id: RowId,
    /// The column-level values being written in this change.
    pub values: BTreeMap<ColumnName, Value>,
}

impl DbChange {
    /// Construct a change touching a single column.
    pub fn single(table: impl Into<TableName>, id: RowId, column: impl Into<ColumnName>, value: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(column.into(), value);
        Self {
            table: table.into(),
            id,
            values,
        }
    }
}

/// A timestamped, plaintext CRDT message: the atomic unit of replication
/// before encryption for the wire (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtMessage {
    /// The HLC timestamp ordering this message relative to all others.
    pub timestamp: Timestamp,
    /// The column-level change this message carries.
    pub change: DbChange,
}

/// The on-disk and on-wire encrypted form of a [`CrdtMessage`] (§3, §4.8).
///
/// The plaintext `CrdtMessage` is encrypted as a whole with the owner's
/// encryption key; only the timestamp is kept in the clear so relays can
/// order and deduplicate messages without decrypting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedCrdtMessage {
    /// The HLC timestamp, kept in the clear for ordering and dedup.
    pub timestamp: Timestamp,
    /// The XChaCha20-Poly1305 ciphertext of the serialized `CrdtMessage`,
    /// including its 24-byte nonce prefix (see `evolu-crypto`).
    pub ciphertext: Vec<u8>,
}

/// A history row as persisted in `evolu_history` (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    /// The owning device/account this row belongs to.
    pub owner_id: OwnerId,
    /// The table the row belongs to.
    pub table: TableName,
    /// The row identifier within that table.
    pub id: RowId,
    /// The column this history entry records a value for.
    pub column: ColumnName,
    /// The value written at `timestamp`.
    pub value: Value,
    /// The HLC timestamp of this write.
    pub timestamp: Timestamp,
}
