//! The sync engine actor (§4.6): a single task owns the connection and
//! drains a FIFO command queue, so at most one sync round is ever in flight
//! per owner (§5's single-threaded cooperative client, ported to `tokio` as
//! a single-task-owns-the-connection actor rather than a literal OS thread).

use crate::backoff::Backoff;
use crate::state::{SyncFailure, SyncState};
use evolu_core::identifiers::{NodeId, OwnerId};
use evolu_core::ports::{Clock, Random, WebSocket};
use evolu_core::types::{CrdtMessage, EncryptedCrdtMessage};
use evolu_crypto::{padme_padded_length, xchacha20poly1305_decrypt, xchacha20poly1305_encrypt, Owner, XCHACHA20_NONCE_LEN};
use evolu_merkle::MerkleTrie;
use evolu_protocol::{decode_sync_response, encode_sync_request, SyncRequest};
use evolu_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Tunable knobs for the sync engine (§5).
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Timeout for a single request/response exchange, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { request_timeout_ms: 30_000 }
    }
}

/// Commands the FIFO queue accepts (§4.6, §5).
pub enum SyncCommand {
    /// Freshly minted local messages to include in the next round.
    Enqueue(Vec<CrdtMessage>),
    /// A transport reconnect occurred; trigger a new round.
    Reconnect,
    /// The host application regained focus; trigger a new round.
    Focus,
    /// The owner was reset; abort anything in flight and clear queued work.
    ResetOwner,
}

/// A handle to a running sync engine. Cheap to clone; every clone shares the
/// same command queue and state broadcast.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Queue local messages (e.g. from `Store::apply_local_change`) and
    /// request a sync round.
    pub async fn enqueue_local_messages(&self, messages: Vec<CrdtMessage>) {
        let _ = self.commands.send(SyncCommand::Enqueue(messages)).await;
    }

    /// Request a sync round after a transport reconnect.
    pub async fn reconnect(&self) {
        let _ = self.commands.send(SyncCommand::Reconnect).await;
    }

    /// Request a sync round after the host application regained focus.
    pub async fn focus(&self) {
        let _ = self.commands.send(SyncCommand::Focus).await;
    }

    /// Abort any in-flight round and drop queued messages (owner reset).
    pub async fn reset_owner(&self) {
        let _ = self.commands.send(SyncCommand::ResetOwner).await;
    }
}

struct SyncEngine<T, C, R> {
    store: Arc<Store>,
    owner_id: OwnerId,
    node_id: NodeId,
    encryption_key: [u8; 32],
    transport: Arc<T>,
    clock: Arc<C>,
    random: Arc<R>,
    config: SyncConfig,
    state_tx: watch::Sender<SyncState>,
}

/// Spawn a sync engine actor for `owner`, returning a handle to drive it and
/// a `watch::Receiver` to observe `subscribeSyncState` transitions (§6).
pub fn spawn<T, C, R>(
    store: Arc<Store>,
    owner: &Owner,
    node_id: NodeId,
    transport: Arc<T>,
    clock: Arc<C>,
    random: Arc<R>,
    config: SyncConfig,
) -> (SyncHandle, watch::Receiver<SyncState>)
where
    T: WebSocket + 'static,
    C: Clock + 'static,
    R: Random + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(SyncState::Initial);
    let (gen_tx, gen_rx) = watch::channel(0u64);

    let engine = SyncEngine {
        store,
        owner_id: owner.id.clone(),
        node_id,
        encryption_key: owner.encryption_key,
        transport,
        clock,
        random,
        config,
        state_tx,
    };

    tokio::spawn(engine.run(cmd_rx, gen_tx, gen_rx));

    (SyncHandle { commands: cmd_tx }, state_rx)
}

impl<T, C, R> SyncEngine<T, C, R>
where
    T: WebSocket,
    C: Clock,
    R: Random,
{
    async fn run(self, mut commands: mpsc::Receiver<SyncCommand>, gen_tx: watch::Sender<u64>, mut generation: watch::Receiver<u64>) {
        let mut pending: Vec<CrdtMessage> = Vec::new();
        let mut backoff = Backoff::new();

        while let Some(cmd) = commands.recv().await {
            match cmd {
                SyncCommand::Enqueue(mut msgs) => pending.append(&mut msgs),
                SyncCommand::Reconnect | SyncCommand::Focus => {}
                SyncCommand::ResetOwner => {
                    pending.clear();
                    backoff.reset();
                    gen_tx.send_modify(|g| *g = g.wrapping_add(1));
                    let _ = self.state_tx.send(SyncState::Initial);
                    continue;
                }
            }

            let my_generation = *generation.borrow();
            self.drive_to_convergence(&mut pending, &mut backoff, &mut generation, my_generation)
                .await;
        }
    }

    /// Run sync rounds until convergence, a terminal failure, or preemption
    /// by a newer `ResetOwner` generation.
    async fn drive_to_convergence(
        &self,
        pending: &mut Vec<CrdtMessage>,
        backoff: &mut Backoff,
        generation: &mut watch::Receiver<u64>,
        my_generation: u64,
    ) {
        let _ = self.state_tx.send(SyncState::Syncing);
        let mut last_diff: Option<i64> = None;

        loop {
            if *generation.borrow() != my_generation {
                return;
            }

            let outgoing = std::mem::take(pending);
            let round = tokio::select! {
                biased;
                _ = generation.changed() => return,
                result = self.run_sync_round(outgoing) => result,
            };

            match round {
                Ok(None) => {
                    backoff.reset();
                    let _ = self.state_tx.send(SyncState::Synced { time: self.clock.now_ms() });
                    return;
                }
                Ok(Some(divergence)) => {
                    if last_diff.is_some_and(|prev| divergence >= prev) {
                        let _ = self.state_tx.send(SyncState::NotSynced(SyncFailure::Divergence));
                        return;
                    }
                    last_diff = Some(divergence);
                    *pending = self.store.history_since(divergence).await;
                }
                Err(SyncFailure::Network(msg)) => {
                    tracing::debug!(error = %msg, "sync round network error, retrying with backoff");
                    let delay = backoff.next_delay_ms(self.random.as_ref());
                    tokio::select! {
                        _ = generation.changed() => return,
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                }
                Err(other) => {
                    let _ = self.state_tx.send(SyncState::NotSynced(other));
                    return;
                }
            }
        }
    }

    /// One request/response exchange (§4.6 steps 1-4). Returns `Ok(None)` on
    /// convergence, `Ok(Some(millis))` when a follow-up round is needed at
    /// the given divergence point, or `Err` on a failure the caller decides
    /// whether to retry.
    #[tracing::instrument(skip(self, outgoing), fields(owner = %self.owner_id))]
    async fn run_sync_round(&self, outgoing: Vec<CrdtMessage>) -> Result<Option<i64>, SyncFailure> {
        let local_merkle = self.store.merkle_snapshot().await;

        let encrypted = outgoing
            .iter()
            .map(|msg| self.encrypt_message(msg))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncFailure::Fatal(e.to_string()))?;

        let request = SyncRequest {
            owner_id: self.owner_id.clone(),
            node_id: self.node_id.clone(),
            merkle_tree: local_merkle.to_bytes(),
            messages: encrypted,
        };

        let frame = encode_sync_request(&request);
        self.transport.send(frame).await.map_err(SyncFailure::from)?;

        let response_bytes = tokio::time::timeout(
            Duration::from_millis(self.config.request_timeout_ms),
            self.transport.recv(),
        )
        .await
        .map_err(|_| SyncFailure::Network("request timed out".to_string()))?
        .map_err(SyncFailure::from)?;

        let response = decode_sync_response(&response_bytes).map_err(|e| SyncFailure::Network(e.to_string()))?;

        let mut remote_messages = Vec::with_capacity(response.messages.len());
        for encrypted in &response.messages {
            remote_messages.push(self.decrypt_message(encrypted).map_err(|e| SyncFailure::Fatal(e.to_string()))?);
        }

        self.store
            .apply_remote(self.clock.now_ms(), remote_messages)
            .await
            .map_err(|e| SyncFailure::Fatal(e.to_string()))?;

        let remote_merkle =
            MerkleTrie::from_bytes(&response.merkle_tree).ok_or_else(|| SyncFailure::Network("corrupt merkle tree in response".to_string()))?;
        let local_merkle_after = self.store.merkle_snapshot().await;

        Ok(local_merkle_after.diff(&remote_merkle))
    }

    fn encrypt_message(&self, message: &CrdtMessage) -> Result<EncryptedCrdtMessage, evolu_core::errors::EvoluError> {
        let plaintext = bincode::serialize(message)?;
        let padded_len = padme_padded_length(plaintext.len());
        let mut padded = plaintext;
        padded.resize(padded_len, 0);

        let (nonce, ciphertext) = xchacha20poly1305_encrypt(&self.encryption_key, &padded)?;
        let mut framed = Vec::with_capacity(XCHACHA20_NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);

        Ok(EncryptedCrdtMessage {
            timestamp: message.timestamp.clone(),
            ciphertext: framed,
        })
    }

    fn decrypt_message(&self, encrypted: &EncryptedCrdtMessage) -> Result<CrdtMessage, evolu_core::errors::EvoluError> {
        if encrypted.ciphertext.len() < XCHACHA20_NONCE_LEN {
            return Err(evolu_core::errors::CryptoError::InvalidLength {
                expected: XCHACHA20_NONCE_LEN,
                actual: encrypted.ciphertext.len(),
            }
            .into());
        }
        let (nonce_bytes, ciphertext) = encrypted.ciphertext.split_at(XCHACHA20_NONCE_LEN);
        let mut nonce = [0u8; XCHACHA20_NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let padded = xchacha20poly1305_decrypt(&self.encryption_key, &nonce, ciphertext)?;
        // The plaintext is PADMÉ-padded before encryption; bincode's
        // self-describing length prefix means deserialize simply stops
        // consuming once the struct is complete, ignoring the trailing
        // zero padding bytes.
        let message: CrdtMessage = bincode::deserialize(&padded)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::identifiers::RowId;
    use evolu_core::ports::{SqliteError, SqliteExecResult, WebSocketState};
    use evolu_core::time::Timestamp;
    use evolu_core::types::{DbChange, Value};
    use evolu_crypto::create_app_owner;
    use futures::future::BoxFuture;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeSqlite;

    #[async_trait::async_trait]
    impl evolu_core::ports::Sqlite for FakeSqlite {
        async fn exec(&self, _query: &str, _params: &[Vec<u8>]) -> Result<SqliteExecResult, SqliteError> {
            Ok(SqliteExecResult::default())
        }
        async fn transaction<'a>(
            &'a self,
            f: Box<dyn FnOnce(&'a dyn evolu_core::ports::Sqlite) -> BoxFuture<'a, Result<(), SqliteError>> + Send + 'a>,
        ) -> Result<(), SqliteError> {
            f(self).await
        }
        async fn export(&self) -> Result<Vec<u8>, SqliteError> {
            Ok(Vec::new())
        }
    }

    struct FixedClock(i64);
    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0
        }
        fn now_iso(&self) -> String {
            "2027-01-01T00:00:00Z".to_string()
        }
    }

    struct FixedRandom;
    impl Random for FixedRandom {
        fn next_u32(&self) -> u32 {
            0
        }
        fn fill_bytes(&self, buf: &mut [u8]) {
            buf.fill(0);
        }
    }

    /// A fake transport that immediately answers every request with an
    /// empty `SyncResponse` whose Merkle tree matches whatever the request
    /// carried, i.e. always converges on the first round.
    struct EchoingTransport {
        inbox: SyncMutex<VecDeque<Vec<u8>>>,
    }

    impl EchoingTransport {
        fn new() -> Self {
            Self {
                inbox: SyncMutex::new(VecDeque::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl WebSocket for EchoingTransport {
        async fn send(&self, bytes: Vec<u8>) -> Result<(), evolu_core::ports::TransportError> {
            let parsed = evolu_protocol::decode_sync_request(&bytes).unwrap();
            let response = evolu_protocol::SyncResponse {
                merkle_tree: parsed.merkle_tree,
                messages: vec![],
            };
            self.inbox.lock().push_back(evolu_protocol::encode_sync_response(&response));
            Ok(())
        }

        async fn recv(&self) -> Result<Vec<u8>, evolu_core::ports::TransportError> {
            loop {
                if let Some(bytes) = self.inbox.lock().pop_front() {
                    return Ok(bytes);
                }
                tokio::task::yield_now().await;
            }
        }

        fn state(&self) -> WebSocketState {
            WebSocketState::Open
        }
    }

    fn node(tag: u8) -> NodeId {
        NodeId::generate([tag; 8])
    }

    fn initial_ts() -> Timestamp {
        Timestamp {
            millis: 1_000_000_000_000,
            counter: 0,
            node_id: node(1),
        }
    }

    #[tokio::test]
    async fn round_trips_to_synced_with_no_peer_messages() {
        let sqlite = Arc::new(FakeSqlite::default());
        let store = Arc::new(Store::new_empty(OwnerId::from_raw("d".repeat(21)), sqlite, initial_ts()));

        let change = DbChange::single("todos", RowId::new("row-1"), "title", Value::Text("hi".into()));
        let messages = store.apply_local_change(1_000_000_000_500, change).await.unwrap();

        let owner = create_app_owner(evolu_crypto::OwnerSecret::from_bytes([3u8; 32]), None);
        let transport = Arc::new(EchoingTransport::new());
        let clock = Arc::new(FixedClock(1_000_000_000_600));
        let random = Arc::new(FixedRandom);

        let (handle, mut state_rx) = spawn(store, &owner, node(2), transport, clock, random, SyncConfig::default());
        handle.enqueue_local_messages(messages).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            state_rx.changed().await.unwrap();
            let state = state_rx.borrow().clone();
            if matches!(state, SyncState::Synced { .. }) {
                break;
            }
            if matches!(state, SyncState::NotSynced(_)) {
                panic!("unexpected sync failure: {state:?}");
            }
            if tokio::time::Instant::now() > deadline {
                panic!("sync did not converge in time");
            }
        }
    }
}
