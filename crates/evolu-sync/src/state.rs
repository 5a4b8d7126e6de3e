//! Sync state machine (§4.6): `Initial → Syncing → (Synced | NotSynced)`.

use serde::{Deserialize, Serialize};

/// Why a sync round failed to reach `Synced` (§4.6, §7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncFailure {
    /// A transport-level failure; eligible for backoff retry.
    Network(String),
    /// The relay responded with a non-success status.
    Server {
        /// The reported status code.
        status: u16,
    },
    /// The relay requires payment before accepting further writes.
    PaymentRequired,
    /// Repeated identical Merkle diffs; sync was aborted rather than loop
    /// forever.
    Divergence,
    /// A local error outside the four kinds above (clock drift, counter
    /// overflow, a corrupt store) that halts sync rather than being retried.
    ///
    /// Not one of `spec.md` §7's four listed `Sync*` error kinds; added so
    /// the propagation policy's distinct clause for clock/store errors
    /// ("halt further local mutations... the host must correct the clock
    /// and restart") has somewhere to land instead of being coerced into
    /// `Network` (which would wrongly trigger a backoff retry) or silently
    /// dropped.
    Fatal(String),
}

impl From<evolu_core::ports::TransportError> for SyncFailure {
    fn from(err: evolu_core::ports::TransportError) -> Self {
        match err {
            evolu_core::ports::TransportError::Network(msg) => Self::Network(msg),
            evolu_core::ports::TransportError::Server { status } => Self::Server { status },
            evolu_core::ports::TransportError::PaymentRequired => Self::PaymentRequired,
        }
    }
}

/// The client-visible sync state (§4.6), published on a `watch` channel so
/// `subscribeSyncState` (§6) observers see every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncState {
    /// No sync round has run yet this session.
    Initial,
    /// A sync round is in flight.
    Syncing,
    /// The last sync round completed and the local and remote Merkle tries
    /// converged.
    Synced {
        /// Wall-clock time the round completed, in milliseconds.
        time: i64,
    },
    /// The last sync round did not reach convergence.
    NotSynced(SyncFailure),
}

impl SyncState {
    /// Whether this state permits queuing further sync rounds
    /// (§4.6: "any new local mutation, reconnect, or focus event while
    /// Synced ⇒ Syncing" — `NotSynced` and `Initial` also accept a new
    /// round; only `Syncing` itself is exclusive, enforced by the engine's
    /// single-in-flight-round invariant rather than this state check).
    pub fn is_settled(&self) -> bool {
        !matches!(self, SyncState::Syncing)
    }
}
