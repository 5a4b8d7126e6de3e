//! Base-3 Merkle trie for detecting where two devices' timestamp sets
//! diverge, without transferring the full history (§4.4).

mod murmur;
mod trie;

pub use murmur::murmurhash32;
pub use trie::{MerkleTrie, Node, PATH_DIGITS};
