//! Relay storage (§4.7): a stateless-service-friendly store keyed by owner,
//! validating write keys, deduplicating messages, and enforcing a per-owner
//! storage quota. Ownership-parallel, within-owner-serial (§5).

mod storage;

pub use storage::{RelayConfig, RelayMessageRow, RelayStorage};
