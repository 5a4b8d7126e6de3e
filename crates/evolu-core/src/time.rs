//! Hybrid-logical-clock timestamp algebra (§4.3).
//!
//! `Timestamp` totally orders every column-level change across every device.
//! `send` advances the local clock for a freshly authored mutation; `receive`
//! merges a remote timestamp into the local clock when applying an incoming
//! message. Both guard against clock drift and counter exhaustion so that a
//! misbehaving or merely fast clock cannot silently break the total order.

use crate::errors::TimestampError;
use crate::identifiers::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Exclusive lower bound for `millis`, matching `spec.md` §3
/// (2027-04-01T00:00:19.999Z).
pub const MIN_ALLOWED_MILLIS: i64 = 860_934_419_999;

/// Exclusive upper bound for `millis`, matching `spec.md` §3.
pub const MAX_ALLOWED_MILLIS: i64 = 2_582_803_260_000;

/// Default maximum allowed clock drift, five minutes (§4.3).
pub const DEFAULT_MAX_DRIFT_MS: i64 = 5 * 60 * 1000;

/// Length in bytes of the binary encoding of a [`Timestamp`] (§3): 6 bytes
/// millis + 2 bytes counter + 8 bytes node id.
///
/// `spec.md` §3 labels this encoding "14-byte" but then lists component
/// widths that sum to 16; see `DESIGN.md` for the resolution (16 is used,
/// since the component widths are each independently specified while the
/// total byte count is not otherwise load-bearing).
pub const BINARY_TIMESTAMP_LEN: usize = 16;

/// Configuration for the HLC algebra. Only `max_drift_ms` is currently
/// tunable; the allowed millis range is a protocol constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// Maximum number of milliseconds a proposed timestamp may run ahead of
    /// the local wall clock before being rejected as drift.
    pub max_drift_ms: i64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
        }
    }
}

/// A hybrid-logical-clock timestamp: `(millis, counter, nodeId)`, totally
/// ordered lexicographically (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Milliseconds since the Unix epoch, constrained to
    /// `(MIN_ALLOWED_MILLIS, MAX_ALLOWED_MILLIS)`.
    pub millis: i64,
    /// Logical counter disambiguating multiple timestamps within the same
    /// millisecond.
    pub counter: u16,
    /// The device that minted this timestamp.
    pub node_id: NodeId,
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.as_str().cmp(other.node_id.as_str()))
    }
}

impl Timestamp {
    /// Encode as the big-endian binary form whose bytewise order equals the
    /// logical order (§3).
    ///
    /// Layout: 6 bytes millis, 2 bytes counter, 8 bytes node id.
    pub fn to_binary(&self) -> [u8; BINARY_TIMESTAMP_LEN] {
        let mut out = [0u8; BINARY_TIMESTAMP_LEN];
        let millis_be = self.millis.to_be_bytes();
        // millis is non-negative by construction (checked range), so the top
        // two bytes of the i64 are always zero and safely dropped.
        out[0..6].copy_from_slice(&millis_be[2..8]);
        out[6..8].copy_from_slice(&self.counter.to_be_bytes());
        out[8..16].copy_from_slice(&self.node_id.to_bytes());
        out
    }

    /// Decode from the binary form produced by [`Timestamp::to_binary`].
    pub fn from_binary(bytes: &[u8; BINARY_TIMESTAMP_LEN]) -> Self {
        let mut millis_be = [0u8; 8];
        millis_be[2..8].copy_from_slice(&bytes[0..6]);
        let millis = i64::from_be_bytes(millis_be);
        let counter = u16::from_be_bytes([bytes[6], bytes[7]]);
        let mut node_bytes = [0u8; 8];
        node_bytes.copy_from_slice(&bytes[8..16]);
        Self {
            millis,
            counter,
            node_id: NodeId::generate(node_bytes),
        }
    }

    /// Canonical string form used as the hash input for Merkle trie nodes
    /// (§4.4's `timestamp_string(ts)`): `millis-counter(hex,4)-nodeId`, sortable
    /// lexicographically the same way the binary form is.
    pub fn to_sync_string(&self) -> String {
        format!("{:013}-{:04X}-{}", self.millis, self.counter, self.node_id.as_str())
    }
}

fn check_range(millis: i64) -> Result<(), TimestampError> {
    if millis <= MIN_ALLOWED_MILLIS || millis >= MAX_ALLOWED_MILLIS {
        Err(TimestampError::TimeOutOfRange)
    } else {
        Ok(())
    }
}

/// Advance the local clock to mint a timestamp for a freshly authored
/// mutation (§4.3, step `send`).
pub fn send(now_ms: i64, local: &Timestamp, config: TimestampConfig) -> Result<Timestamp, TimestampError> {
    check_range(now_ms)?;

    let next_millis = now_ms.max(local.millis);
    if next_millis - now_ms > config.max_drift_ms {
        return Err(TimestampError::Drift {
            now: now_ms,
            next: next_millis,
        });
    }

    let counter = if next_millis == local.millis {
        local.counter.checked_add(1)
    } else {
        Some(0)
    };
    let counter = counter.ok_or(TimestampError::CounterOverflow)?;
    if counter > u16::MAX {
        return Err(TimestampError::CounterOverflow);
    }

    Ok(Timestamp {
        millis: next_millis,
        counter,
        node_id: local.node_id.clone(),
    })
}

/// Merge a remote timestamp into the local clock when applying an incoming
/// message (§4.3, step `receive`).
///
/// The local `nodeId` is always preserved in the result; the remote node id
/// is only used to order the remote's own messages and is never adopted.
/// Per `spec.md` §9 (Open Question, resolved as required behavior), a device
/// MUST reject a remote timestamp carrying its own node id to avoid two
/// clocks claiming the same identity.
pub fn receive(
    now_ms: i64,
    local: &Timestamp,
    remote: &Timestamp,
    config: TimestampConfig,
) -> Result<Timestamp, TimestampError> {
    if local.node_id == remote.node_id {
        return Err(TimestampError::DuplicateNode {
            node_id: remote.node_id.to_string(),
        });
    }

    check_range(now_ms)?;
    check_range(local.millis)?;
    check_range(remote.millis)?;

    let next = now_ms.max(local.millis).max(remote.millis);
    if next - now_ms > config.max_drift_ms {
        return Err(TimestampError::Drift { now: now_ms, next });
    }

    let counter = if next == local.millis && next == remote.millis {
        local.counter.max(remote.counter).checked_add(1)
    } else if next == local.millis {
        local.counter.checked_add(1)
    } else if next == remote.millis {
        remote.counter.checked_add(1)
    } else {
        Some(0)
    };
    let counter = counter.ok_or(TimestampError::CounterOverflow)?;
    if counter > u16::MAX {
        return Err(TimestampError::CounterOverflow);
    }

    Ok(Timestamp {
        millis: next,
        counter,
        node_id: local.node_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tag: u8) -> NodeId {
        NodeId::generate([tag; 8])
    }

    fn ts(millis: i64, counter: u16, tag: u8) -> Timestamp {
        Timestamp {
            millis,
            counter,
            node_id: node(tag),
        }
    }

    #[test]
    fn binary_order_matches_logical_order() {
        let a = ts(1_000_000_000_000, 3, 1);
        let b = ts(1_000_000_000_000, 4, 1);
        let c = ts(1_000_000_000_001, 0, 1);

        assert!(a < b);
        assert!(b < c);
        assert!(a.to_binary() < b.to_binary());
        assert!(b.to_binary() < c.to_binary());
    }

    #[test]
    fn send_advances_counter_within_same_millisecond() {
        let local = ts(1_000_000_000_000, 5, 1);
        let config = TimestampConfig::default();
        let out = send(1_000_000_000_000, &local, config).unwrap();
        assert_eq!(out.millis, 1_000_000_000_000);
        assert_eq!(out.counter, 6);
    }

    #[test]
    fn send_resets_counter_on_new_millisecond() {
        let local = ts(1_000_000_000_000, 999, 1);
        let config = TimestampConfig::default();
        let out = send(1_000_000_000_050, &local, config).unwrap();
        assert_eq!(out.millis, 1_000_000_000_050);
        assert_eq!(out.counter, 0);
    }

    #[test]
    fn send_rejects_drift_beyond_budget() {
        let local = ts(1_000_000_000_000, 0, 1);
        let config = TimestampConfig { max_drift_ms: 1000 };
        // local is far ahead of now, which should be rejected as drift.
        let err = send(1_000_000_000_000 - 5000, &local, config).unwrap_err();
        assert!(matches!(err, TimestampError::Drift { .. }));
    }

    #[test]
    fn send_rejects_counter_overflow() {
        let local = ts(1_000_000_000_000, u16::MAX, 1);
        let config = TimestampConfig::default();
        let err = send(1_000_000_000_000, &local, config).unwrap_err();
        assert!(matches!(err, TimestampError::CounterOverflow));
    }

    #[test]
    fn receive_dominates_both_inputs() {
        let local = ts(1_000_000_000_000, 3, 1);
        let remote = ts(1_000_000_000_005, 1, 2);
        let config = TimestampConfig::default();
        let out = receive(1_000_000_000_000, &local, &remote, config).unwrap();
        assert!(out.millis >= local.millis.max(remote.millis));
        assert!(out > local);
        assert!(out > remote);
        // local node id is preserved, not the remote's.
        assert_eq!(out.node_id, local.node_id);
    }

    #[test]
    fn receive_tie_breaks_on_equal_millis() {
        let local = ts(1_000_000_000_000, 3, 1);
        let remote = ts(1_000_000_000_000, 7, 2);
        let config = TimestampConfig::default();
        let out = receive(1_000_000_000_000, &local, &remote, config).unwrap();
        assert_eq!(out.millis, 1_000_000_000_000);
        assert_eq!(out.counter, 8);
    }

    #[test]
    fn receive_rejects_duplicate_node_id() {
        let local = ts(1_000_000_000_000, 3, 1);
        let remote = ts(1_000_000_000_000, 7, 1);
        let config = TimestampConfig::default();
        let err = receive(1_000_000_000_000, &local, &remote, config).unwrap_err();
        assert!(matches!(err, TimestampError::DuplicateNode { .. }));
    }

    #[test]
    fn binary_round_trips() {
        let t = ts(1_234_567_890_123, 42, 9);
        let bytes = t.to_binary();
        let back = Timestamp::from_binary(&bytes);
        assert_eq!(t, back);
    }
}
