//! Relay storage (§4.7): write-key validation, deduplicated message
//! ingestion with per-owner quota accounting, and range reads.
//!
//! Ownership of data is parallel across owners, serialized within an owner
//! (§5): the outer owner table is a plain `std::sync::Mutex`-guarded map
//! held only long enough to fetch or create an owner's entry; the entry
//! itself is an `Arc<tokio::sync::Mutex<_>>` held for the duration of a
//! single operation, so two different owners never block each other.

use evolu_core::errors::{RelayError, Result as EvoluResult};
use evolu_core::identifiers::OwnerId;
use evolu_core::ports::Sqlite;
use evolu_core::time::Timestamp;
use evolu_core::types::EncryptedCrdtMessage;
use evolu_crypto::timing_safe_eq;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::Mutex as AsyncMutex;

/// A message row as persisted to `evolu_message`/`evolu_timestamp` on the
/// relay, used to rebuild in-memory state at startup.
#[derive(Debug, Clone)]
pub struct RelayMessageRow {
    /// The owner this message belongs to.
    pub owner_id: OwnerId,
    /// The message itself.
    pub message: EncryptedCrdtMessage,
}

/// Tunable knobs for the relay (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Maximum total ciphertext bytes a single owner may store.
    pub quota_bytes_per_owner: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            // 100 MiB: an arbitrary default free-tier ceiling; hosts
            // configure per-plan quotas via their own policy layer.
            quota_bytes_per_owner: 100 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct OwnerState {
    write_key: Option<[u8; 16]>,
    stored_bytes: u64,
    messages: BTreeMap<Timestamp, EncryptedCrdtMessage>,
}

/// The relay's storage layer, keyed by `ownerIdBytes` (§4.7).
pub struct RelayStorage {
    sqlite: Arc<dyn Sqlite>,
    config: RelayConfig,
    owners: SyncMutex<HashMap<OwnerId, Arc<AsyncMutex<OwnerState>>>>,
}

impl RelayStorage {
    /// A fresh relay with no owners yet on record.
    pub fn new(sqlite: Arc<dyn Sqlite>, config: RelayConfig) -> Self {
        Self {
            sqlite,
            config,
            owners: SyncMutex::new(HashMap::new()),
        }
    }

    /// Rebuild relay state from persisted rows read back at startup.
    pub fn restore(
        sqlite: Arc<dyn Sqlite>,
        config: RelayConfig,
        write_keys: Vec<(OwnerId, [u8; 16])>,
        messages: Vec<RelayMessageRow>,
    ) -> Self {
        let mut table: HashMap<OwnerId, Arc<AsyncMutex<OwnerState>>> = HashMap::new();

        for (owner_id, key) in write_keys {
            table
                .entry(owner_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(OwnerState::default())))
                .blocking_lock()
                .write_key = Some(key);
        }

        for row in messages {
            let entry = table
                .entry(row.owner_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(OwnerState::default())));
            let mut state = entry.blocking_lock();
            state.stored_bytes += row.message.ciphertext.len() as u64;
            state.messages.insert(row.message.timestamp.clone(), row.message);
        }

        Self {
            sqlite,
            config,
            owners: SyncMutex::new(table),
        }
    }

    fn owner_entry(&self, owner_id: &OwnerId) -> Arc<AsyncMutex<OwnerState>> {
        let mut table = self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        table
            .entry(owner_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(OwnerState::default())))
            .clone()
    }

    /// Validate `key` against the owner's write key, establishing it on
    /// first use (§4.7): "if no record, store it and return true; else
    /// timing-safe compare and return match."
    #[tracing::instrument(skip(self, key), fields(owner = %owner_id))]
    pub async fn validate_write_key(&self, owner_id: &OwnerId, key: &[u8; 16]) -> EvoluResult<bool> {
        let entry = self.owner_entry(owner_id);
        let mut state = entry.lock().await;

        match state.write_key {
            Some(existing) => Ok(timing_safe_eq(&existing, key)),
            None => {
                self.persist_write_key(owner_id, key).await?;
                state.write_key = Some(*key);
                Ok(true)
            }
        }
    }

    /// Set the owner's write key only if one is not already on file.
    /// Returns `true` if this call set it, `false` if a key already existed.
    pub async fn set_write_key(&self, owner_id: &OwnerId, key: &[u8; 16]) -> EvoluResult<bool> {
        let entry = self.owner_entry(owner_id);
        let mut state = entry.lock().await;

        if state.write_key.is_some() {
            return Ok(false);
        }
        self.persist_write_key(owner_id, key).await?;
        state.write_key = Some(*key);
        Ok(true)
    }

    /// Insert `messages` for `owner_id`, enforcing the owner's storage
    /// quota and deduplicating by timestamp (§4.7).
    #[tracing::instrument(skip(self, messages), fields(owner = %owner_id, count = messages.len()))]
    pub async fn write_messages(&self, owner_id: &OwnerId, messages: Vec<EncryptedCrdtMessage>) -> EvoluResult<()> {
        let entry = self.owner_entry(owner_id);
        let mut state = entry.lock().await;

        let requested: u64 = messages.iter().map(|m| m.ciphertext.len() as u64).sum();
        let required = state.stored_bytes.saturating_add(requested);
        if required > self.config.quota_bytes_per_owner {
            return Err(RelayError::StorageQuota {
                owner_id: owner_id.to_string(),
            }
            .into());
        }

        let mut inserted_bytes = 0u64;
        for message in messages {
            if state.messages.contains_key(&message.timestamp) {
                continue;
            }
            self.persist_message(owner_id, &message).await?;
            inserted_bytes += message.ciphertext.len() as u64;
            state.messages.insert(message.timestamp.clone(), message);
        }
        state.stored_bytes += inserted_bytes;

        tracing::debug!(inserted_bytes, "relay write_messages committed");
        Ok(())
    }

    /// Every message for `owner_id` with `timestamp >= since`, ordered by
    /// binary timestamp (§4.7, §5).
    pub async fn read_messages_since(&self, owner_id: &OwnerId, since: &Timestamp) -> Vec<EncryptedCrdtMessage> {
        let entry = self.owner_entry(owner_id);
        let state = entry.lock().await;
        state.messages.range(since.clone()..).map(|(_, m)| m.clone()).collect()
    }

    /// Remove every trace of `owner_id` from the relay: `evolu_timestamp`,
    /// `evolu_message`, `evolu_writeKey`, `evolu_usage` (§4.7).
    pub async fn delete_owner(&self, owner_id: &OwnerId) -> EvoluResult<()> {
        {
            let mut table = self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            table.remove(owner_id);
        }

        for table_name in ["evolu_timestamp", "evolu_message", "evolu_writeKey", "evolu_usage"] {
            self.sqlite
                .exec(
                    &format!("DELETE FROM {table_name} WHERE owner_id = ?"),
                    &[owner_id.as_str().as_bytes().to_vec()],
                )
                .await
                .map_err(RelayError::from)?;
        }
        Ok(())
    }

    /// Count of stored messages for `owner_id` (§4.7).
    pub async fn size(&self, owner_id: &OwnerId) -> usize {
        let entry = self.owner_entry(owner_id);
        let state = entry.lock().await;
        state.messages.len()
    }

    /// Validate `key` and write `messages` in one authenticated operation
    /// (§4.7's failure model: "write-key mismatches are reported to the
    /// client"), rather than leaving the caller to interpret a bare `false`
    /// from [`Self::validate_write_key`] itself.
    #[tracing::instrument(skip(self, key, messages), fields(owner = %owner_id, count = messages.len()))]
    pub async fn write_messages_authenticated(
        &self,
        owner_id: &OwnerId,
        key: &[u8; 16],
        messages: Vec<EncryptedCrdtMessage>,
    ) -> EvoluResult<()> {
        if !self.validate_write_key(owner_id, key).await? {
            return Err(RelayError::WriteKeyMismatch.into());
        }
        self.write_messages(owner_id, messages).await
    }

    /// Current usage for an owner already on record at the relay, without
    /// creating a fresh zero-usage entry for an owner that has never
    /// written or established a write key (§4.7).
    pub async fn usage(&self, owner_id: &OwnerId) -> EvoluResult<(u64, usize)> {
        let entry = {
            let table = self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            table.get(owner_id).cloned()
        };
        let entry = entry.ok_or(RelayError::ResourceNotFound)?;
        let state = entry.lock().await;
        Ok((state.stored_bytes, state.messages.len()))
    }

    async fn persist_write_key(&self, owner_id: &OwnerId, key: &[u8; 16]) -> EvoluResult<()> {
        self.sqlite
            .exec(
                "INSERT INTO evolu_writeKey (owner_id, key) VALUES (?, ?) ON CONFLICT DO NOTHING",
                &[owner_id.as_str().as_bytes().to_vec(), key.to_vec()],
            )
            .await
            .map_err(RelayError::from)?;
        Ok(())
    }

    async fn persist_message(&self, owner_id: &OwnerId, message: &EncryptedCrdtMessage) -> EvoluResult<()> {
        let encoded = bincode::serialize(message)?;
        self.sqlite
            .exec(
                "INSERT INTO evolu_message (owner_id, timestamp, row) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
                &[
                    owner_id.as_str().as_bytes().to_vec(),
                    message.timestamp.to_binary().to_vec(),
                    encoded,
                ],
            )
            .await
            .map_err(RelayError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::identifiers::NodeId;
    use evolu_core::ports::{SqliteError, SqliteExecResult};
    use futures::future::BoxFuture;

    #[derive(Default)]
    struct FakeSqlite;

    #[async_trait::async_trait]
    impl Sqlite for FakeSqlite {
        async fn exec(&self, _query: &str, _params: &[Vec<u8>]) -> Result<SqliteExecResult, SqliteError> {
            Ok(SqliteExecResult::default())
        }
        async fn transaction<'a>(
            &'a self,
            f: Box<dyn FnOnce(&'a dyn Sqlite) -> BoxFuture<'a, Result<(), SqliteError>> + Send + 'a>,
        ) -> Result<(), SqliteError> {
            f(self).await
        }
        async fn export(&self) -> Result<Vec<u8>, SqliteError> {
            Ok(Vec::new())
        }
    }

    fn owner() -> OwnerId {
        OwnerId::from_raw("r".repeat(21))
    }

    fn message(millis: i64, ciphertext_len: usize) -> EncryptedCrdtMessage {
        EncryptedCrdtMessage {
            timestamp: Timestamp {
                millis,
                counter: 0,
                node_id: NodeId::generate([1; 8]),
            },
            ciphertext: vec![0u8; ciphertext_len],
        }
    }

    fn relay() -> RelayStorage {
        RelayStorage::new(Arc::new(FakeSqlite::default()), RelayConfig::default())
    }

    #[tokio::test]
    async fn first_validate_establishes_the_write_key() {
        let relay = relay();
        let owner_id = owner();
        let key = [7u8; 16];
        assert!(relay.validate_write_key(&owner_id, &key).await.unwrap());
        assert!(relay.validate_write_key(&owner_id, &key).await.unwrap());
        assert!(!relay.validate_write_key(&owner_id, &[8u8; 16]).await.unwrap());
    }

    #[tokio::test]
    async fn set_write_key_is_noop_once_set() {
        let relay = relay();
        let owner_id = owner();
        assert!(relay.set_write_key(&owner_id, &[1u8; 16]).await.unwrap());
        assert!(!relay.set_write_key(&owner_id, &[2u8; 16]).await.unwrap());
    }

    #[tokio::test]
    async fn write_messages_dedups_by_timestamp() {
        let relay = relay();
        let owner_id = owner();
        let msg = message(1_000_000_000_000, 10);

        relay.write_messages(&owner_id, vec![msg.clone()]).await.unwrap();
        relay.write_messages(&owner_id, vec![msg]).await.unwrap();

        assert_eq!(relay.size(&owner_id).await, 1);
    }

    #[tokio::test]
    async fn write_messages_rejects_over_quota() {
        let relay = RelayStorage::new(Arc::new(FakeSqlite::default()), RelayConfig { quota_bytes_per_owner: 5 });
        let owner_id = owner();
        let msg = message(1_000_000_000_000, 10);

        let err = relay.write_messages(&owner_id, vec![msg]).await.unwrap_err();
        assert!(matches!(err, evolu_core::errors::EvoluError::Relay(RelayError::StorageQuota { .. })));
        assert_eq!(relay.size(&owner_id).await, 0);
    }

    #[tokio::test]
    async fn read_messages_since_is_ordered_and_filtered() {
        let relay = relay();
        let owner_id = owner();
        let early = message(1_000_000_000_000, 1);
        let late = message(1_000_000_100_000, 1);
        relay
            .write_messages(&owner_id, vec![late.clone(), early.clone()])
            .await
            .unwrap();

        let since = Timestamp {
            millis: 1_000_000_050_000,
            counter: 0,
            node_id: NodeId::generate([9; 8]),
        };
        let results = relay.read_messages_since(&owner_id, &since).await;
        assert_eq!(results, vec![late]);
    }

    #[tokio::test]
    async fn write_messages_authenticated_rejects_bad_key() {
        let relay = relay();
        let owner_id = owner();
        relay.set_write_key(&owner_id, &[1u8; 16]).await.unwrap();

        let err = relay
            .write_messages_authenticated(&owner_id, &[9u8; 16], vec![message(1_000_000_000_000, 4)])
            .await
            .unwrap_err();
        assert!(matches!(err, evolu_core::errors::EvoluError::Relay(RelayError::WriteKeyMismatch)));
        assert_eq!(relay.size(&owner_id).await, 0);
    }

    #[tokio::test]
    async fn write_messages_authenticated_accepts_matching_key() {
        let relay = relay();
        let owner_id = owner();
        relay.set_write_key(&owner_id, &[1u8; 16]).await.unwrap();

        relay
            .write_messages_authenticated(&owner_id, &[1u8; 16], vec![message(1_000_000_000_000, 4)])
            .await
            .unwrap();
        assert_eq!(relay.size(&owner_id).await, 1);
    }

    #[tokio::test]
    async fn usage_reports_not_found_for_unknown_owner() {
        let relay = relay();
        let err = relay.usage(&owner()).await.unwrap_err();
        assert!(matches!(err, evolu_core::errors::EvoluError::Relay(RelayError::ResourceNotFound)));
    }

    #[tokio::test]
    async fn usage_reports_known_owner() {
        let relay = relay();
        let owner_id = owner();
        relay.write_messages(&owner_id, vec![message(1_000_000_000_000, 4)]).await.unwrap();

        let (stored_bytes, count) = relay.usage(&owner_id).await.unwrap();
        assert_eq!(stored_bytes, 4);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn delete_owner_clears_all_state() {
        let relay = relay();
        let owner_id = owner();
        relay.write_messages(&owner_id, vec![message(1_000_000_000_000, 4)]).await.unwrap();
        relay.set_write_key(&owner_id, &[1u8; 16]).await.unwrap();

        relay.delete_owner(&owner_id).await.unwrap();

        assert_eq!(relay.size(&owner_id).await, 0);
        // A fresh per-owner entry with no write key is created on demand.
        assert!(relay.set_write_key(&owner_id, &[2u8; 16]).await.unwrap());
    }
}
