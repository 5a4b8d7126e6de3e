//! Local encrypted CRDT store (§4.5): append-only history, materialized
//! projection, and `apply_local_change`/`apply_remote`.

mod projection;
mod store;

pub use projection::Projection;
pub use store::Store;
