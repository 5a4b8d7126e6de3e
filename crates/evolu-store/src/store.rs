//! Local CRDT store (§4.5): the history log, projection maintenance, and the
//! `apply_local_change`/`apply_remote` entry points the sync engine and host
//! application drive.

use crate::projection::Projection;
use evolu_core::errors::{Result as EvoluResult, StoreError};
use evolu_core::identifiers::{OwnerId, RowId};
use evolu_core::ports::Sqlite;
use evolu_core::time::{self, Timestamp, TimestampConfig};
use evolu_core::types::{ColumnName, CrdtMessage, DbChange, HistoryRow, TableName, Value};
use evolu_merkle::MerkleTrie;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

type SeenKey = (TableName, RowId, ColumnName, Timestamp);

struct StoreState {
    local_ts: Timestamp,
    merkle: MerkleTrie,
    projection: Projection,
    seen: HashSet<SeenKey>,
    /// Every history row ever applied, ordered by timestamp. Lets the sync
    /// engine answer "all messages since `t`" (§4.6 step 4's follow-up
    /// request) without a round-trip through the `Sqlite` port.
    history: BTreeMap<Timestamp, HistoryRow>,
}

/// Local encrypted CRDT store for one owner.
///
/// Durability lives behind the host-supplied [`Sqlite`] port; `Store` keeps
/// the fast-path Merkle trie and materialized projection in memory,
/// consistent with what has been persisted.
pub struct Store {
    owner_id: OwnerId,
    sqlite: Arc<dyn Sqlite>,
    ts_config: TimestampConfig,
    state: Mutex<StoreState>,
}

impl Store {
    /// Restore a store for `owner_id` from the history rows read back at
    /// startup (§3's supplemental `evolu_owner`/`evolu_clock` restore) and
    /// the local timestamp recovered alongside them.
    pub fn restore(owner_id: OwnerId, sqlite: Arc<dyn Sqlite>, initial_ts: Timestamp, history: Vec<HistoryRow>) -> Self {
        let mut merkle = MerkleTrie::new();
        let mut projection = Projection::new();
        let mut seen = HashSet::with_capacity(history.len());
        let mut log = BTreeMap::new();

        for row in history {
            merkle.insert(&row.timestamp);
            projection.apply(&row.table, &row.id, &row.column, row.value.clone(), &row.timestamp);
            seen.insert((row.table.clone(), row.id.clone(), row.column.clone(), row.timestamp.clone()));
            log.insert(row.timestamp.clone(), row);
        }

        Self {
            owner_id,
            sqlite,
            ts_config: TimestampConfig::default(),
            state: Mutex::new(StoreState {
                local_ts: initial_ts,
                merkle,
                projection,
                seen,
                history: log,
            }),
        }
    }

    /// Every history row with `timestamp.millis >= floor_millis`, as
    /// `CrdtMessage`s ready to re-enqueue for a sync follow-up request
    /// (§4.6 step 4).
    pub async fn history_since(&self, floor_millis: i64) -> Vec<CrdtMessage> {
        let guard = self.state.lock().await;
        guard
            .history
            .iter()
            .filter(|(ts, _)| ts.millis >= floor_millis)
            .map(|(ts, row)| CrdtMessage {
                timestamp: ts.clone(),
                change: DbChange::single(row.table.clone(), row.id.clone(), row.column.clone(), row.value.clone()),
            })
            .collect()
    }

    /// A store with no prior history, seeded with a fresh `local_ts` minted
    /// for `node_id` at the allowed range's floor.
    pub fn new_empty(owner_id: OwnerId, sqlite: Arc<dyn Sqlite>, initial_ts: Timestamp) -> Self {
        Self::restore(owner_id, sqlite, initial_ts, Vec::new())
    }

    /// A snapshot of the current Merkle trie, used to build a sync request.
    pub async fn merkle_snapshot(&self) -> MerkleTrie {
        self.state.lock().await.merkle.clone()
    }

    /// The current local timestamp, used to build a sync request.
    pub async fn local_timestamp(&self) -> Timestamp {
        self.state.lock().await.local_ts.clone()
    }

    /// Current value of every column of `(table, id)` (§6 supplemental read
    /// surface).
    pub async fn get_row(&self, table: &TableName, id: &RowId) -> Option<BTreeMap<ColumnName, Value>> {
        self.state.lock().await.projection.get_row(table, id)
    }

    /// Every row of `table` whose projection satisfies `predicate` (§6
    /// supplemental read surface).
    pub async fn query_table(
        &self,
        table: &TableName,
        predicate: impl Fn(&BTreeMap<ColumnName, Value>) -> bool,
    ) -> Vec<(RowId, BTreeMap<ColumnName, Value>)> {
        self.state.lock().await.projection.query_table(table, predicate)
    }

    /// Apply a local `insert`/`update`/`delete` (§4.5). Each column write
    /// mints a fresh HLC timestamp, is persisted to history with dedup,
    /// updates the projection if it wins, and is folded into the Merkle
    /// trie. Returns one `CrdtMessage` per column written, for the sync
    /// engine to enqueue.
    #[tracing::instrument(skip(self, change), fields(table = %change.table, id = %change.id))]
    pub async fn apply_local_change(&self, now_ms: i64, change: DbChange) -> EvoluResult<Vec<CrdtMessage>> {
        let mut messages = Vec::with_capacity(change.values.len());
        let mut guard = self.state.lock().await;

        for (column, value) in change.values {
            let ts = time::send(now_ms, &guard.local_ts, self.ts_config)?;
            guard.local_ts = ts.clone();

            let row = HistoryRow {
                owner_id: self.owner_id.clone(),
                table: change.table.clone(),
                id: change.id.clone(),
                column: column.clone(),
                value: value.clone(),
                timestamp: ts.clone(),
            };
            self.persist_history_row(&row).await?;
            guard.seen.insert((row.table.clone(), row.id.clone(), row.column.clone(), row.timestamp.clone()));
            guard.projection.apply(&row.table, &row.id, &row.column, row.value.clone(), &row.timestamp);
            guard.merkle.insert(&ts);
            guard.history.insert(row.timestamp.clone(), row.clone());

            tracing::debug!(column = %column, millis = ts.millis, "local change applied");

            messages.push(CrdtMessage {
                timestamp: ts,
                change: DbChange::single(change.table.clone(), change.id.clone(), column, value),
            });
        }

        Ok(messages)
    }

    /// Apply a batch of remote messages (§4.5). Every message's timestamp is
    /// merged into the local clock via `receive` before any of the batch is
    /// committed, so a single invalid timestamp (e.g. a duplicate node id)
    /// aborts the whole batch atomically. Returns the set of `(table, id)`
    /// rows whose projection changed, for query invalidation.
    #[tracing::instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn apply_remote(&self, now_ms: i64, messages: Vec<CrdtMessage>) -> EvoluResult<BTreeSet<(TableName, RowId)>> {
        let mut guard = self.state.lock().await;

        // Step 1: validate every message against the local clock in arrival
        // order, advancing it; a single bad timestamp aborts the whole batch
        // before anything is persisted.
        for msg in &messages {
            let merged = time::receive(now_ms, &guard.local_ts, &msg.timestamp, self.ts_config)?;
            guard.local_ts = merged;
        }

        // Step 2-3: persist each message under its own timestamp (not the
        // merged local clock, which only advances the receiver's clock),
        // update the projection if it wins, and fold into the Merkle trie.
        let mut affected = BTreeSet::new();
        for msg in messages {
            let ts = msg.timestamp;
            let table = msg.change.table;
            let id = msg.change.id;

            for (column, value) in msg.change.values {
                let key = (table.clone(), id.clone(), column.clone(), ts.clone());
                if guard.seen.contains(&key) {
                    continue;
                }

                let row = HistoryRow {
                    owner_id: self.owner_id.clone(),
                    table: table.clone(),
                    id: id.clone(),
                    column,
                    value,
                    timestamp: ts.clone(),
                };
                self.persist_history_row(&row).await?;
                guard.seen.insert(key);

                if guard.projection.apply(&row.table, &row.id, &row.column, row.value.clone(), &row.timestamp) {
                    affected.insert((row.table.clone(), row.id.clone()));
                }
                guard.merkle.insert(&ts);
                guard.history.insert(row.timestamp.clone(), row);
            }
        }

        Ok(affected)
    }

    async fn persist_history_row(&self, row: &HistoryRow) -> EvoluResult<()> {
        let encoded = bincode::serialize(row).map_err(|e| StoreError::TransactionRollback {
            cause: e.to_string(),
            rollback_error: None,
        })?;
        self.sqlite
            .exec(
                "INSERT INTO evolu_history (owner_id, row) VALUES (?, ?) ON CONFLICT DO NOTHING",
                &[self.owner_id.as_str().as_bytes().to_vec(), encoded],
            )
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::identifiers::NodeId;
    use evolu_core::ports::{SqliteError, SqliteExecResult};
    use futures::future::BoxFuture;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct FakeSqlite {
        exec_count: SyncMutex<u64>,
    }

    #[async_trait::async_trait]
    impl Sqlite for FakeSqlite {
        async fn exec(&self, _query: &str, _params: &[Vec<u8>]) -> Result<SqliteExecResult, SqliteError> {
            *self.exec_count.lock() += 1;
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
        OwnerId::from_raw("a".repeat(21))
    }

    fn initial_ts() -> Timestamp {
        Timestamp {
            millis: 1_000_000_000_000,
            counter: 0,
            node_id: NodeId::generate([1; 8]),
        }
    }

    #[tokio::test]
    async fn apply_local_change_updates_projection_and_merkle() {
        let sqlite = Arc::new(FakeSqlite::default());
        let store = Store::new_empty(owner(), sqlite, initial_ts());

        let change = DbChange::single("todos", RowId::new("row-1"), "title", Value::Text("hello".into()));
        let messages = store.apply_local_change(1_000_000_000_500, change).await.unwrap();

        assert_eq!(messages.len(), 1);
        let row = store.get_row(&"todos".to_string(), &RowId::new("row-1")).await.unwrap();
        assert_eq!(row.get("title"), Some(&Value::Text("hello".into())));
        assert_ne!(store.merkle_snapshot().await.root_hash(), 0);
    }

    #[tokio::test]
    async fn apply_remote_is_atomic_on_duplicate_node() {
        let sqlite = Arc::new(FakeSqlite::default());
        let local = initial_ts();
        let store = Store::new_empty(owner(), sqlite, local.clone());

        let bad = CrdtMessage {
            timestamp: Timestamp {
                millis: local.millis,
                counter: 0,
                node_id: local.node_id.clone(),
            },
            change: DbChange::single("todos", RowId::new("row-1"), "title", Value::Text("x".into())),
        };

        let err = store.apply_remote(local.millis, vec![bad]).await.unwrap_err();
        assert!(matches!(err, evolu_core::errors::EvoluError::Timestamp(_)));
        assert!(store.get_row(&"todos".to_string(), &RowId::new("row-1")).await.is_none());
    }

    #[tokio::test]
    async fn apply_remote_dedups_already_seen_messages() {
        let sqlite = Arc::new(FakeSqlite::default());
        let store = Store::new_empty(owner(), sqlite, initial_ts());

        let remote_ts = Timestamp {
            millis: initial_ts().millis + 10,
            counter: 0,
            node_id: NodeId::generate([2; 8]),
        };
        let msg = CrdtMessage {
            timestamp: remote_ts.clone(),
            change: DbChange::single("todos", RowId::new("row-1"), "title", Value::Text("hi".into())),
        };

        store.apply_remote(remote_ts.millis, vec![msg.clone()]).await.unwrap();
        let affected_again = store.apply_remote(remote_ts.millis, vec![msg]).await.unwrap();
        assert!(affected_again.is_empty());
    }
}
