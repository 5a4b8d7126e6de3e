//! Base-3 Merkle trie keyed by minute, used to find the earliest point at
//! which two devices' timestamp sets diverge (§4.4).

use crate::murmur::murmurhash32;
use evolu_core::time::Timestamp;
use std::collections::BTreeMap;

/// Number of base-3 digits in a path: `⌊ts.millis/60_000⌋` fits in 16 base-3
/// digits for every timestamp in the allowed millis range (§4.3, §9 — the
/// spec's Open Question "MUST clamp path length to 16 digits" is resolved as
/// a hard invariant, not merely advisory: [`path_digits`] always returns
/// exactly 16 digits, truncating any minute value that would overflow it).
pub const PATH_DIGITS: usize = 16;

/// One node of the trie: an XOR-accumulated 32-bit hash plus up to three
/// children keyed by the base-3 digit `0`, `1`, or `2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// XOR of every `murmurhash32(timestamp_string(ts))` for timestamps whose
    /// path passes through this node.
    pub hash: u32,
    /// Present children, keyed by digit.
    pub children: BTreeMap<u8, Node>,
}

/// The root of a Merkle trie. `MerkleTrie::default()` is the empty tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleTrie {
    root: Node,
}

/// Convert a minute value into exactly [`PATH_DIGITS`] base-3 digits, most
/// significant first. Values wider than `3^PATH_DIGITS` are truncated to
/// their low-order digits, matching the fixed-width path invariant.
fn path_digits(minute: u64) -> [u8; PATH_DIGITS] {
    let mut digits = [0u8; PATH_DIGITS];
    let mut m = minute;
    for i in (0..PATH_DIGITS).rev() {
        digits[i] = (m % 3) as u8;
        m /= 3;
    }
    digits
}

fn minute_of(ts: &Timestamp) -> u64 {
    (ts.millis / 60_000) as u64
}

impl MerkleTrie {
    /// An empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// The root hash, `0` for an empty trie.
    pub fn root_hash(&self) -> u32 {
        self.root.hash
    }

    /// Insert a timestamp's contribution into the trie: XOR its hash into
    /// every node from the root to the leaf named by its minute, creating
    /// nodes along the path as needed (§4.4).
    pub fn insert(&mut self, ts: &Timestamp) {
        let h = murmurhash32(ts.to_sync_string().as_bytes());
        let digits = path_digits(minute_of(ts));

        self.root.hash ^= h;
        let mut node = &mut self.root;
        for digit in digits {
            node = node.children.entry(digit).or_default();
            node.hash ^= h;
        }
    }

    /// Find the earliest minute at which `self` and `other` may diverge
    /// (§4.4). Returns `None` if the two trees are identical.
    pub fn diff(&self, other: &MerkleTrie) -> Option<i64> {
        if self.root.hash == other.root.hash {
            return None;
        }

        let mut prefix = Vec::with_capacity(PATH_DIGITS);
        let mut a = &self.root;
        let mut b = &other.root;

        loop {
            let mut descended = false;
            for digit in 0u8..3 {
                let child_a = a.children.get(&digit);
                let child_b = b.children.get(&digit);
                match (child_a, child_b) {
                    (Some(ca), Some(cb)) if ca.hash != cb.hash => {
                        prefix.push(digit);
                        a = ca;
                        b = cb;
                        descended = true;
                        break;
                    }
                    (Some(_), None) | (None, Some(_)) => {
                        prefix.push(digit);
                        descended = true;
                        break;
                    }
                    _ => continue,
                }
            }
            if !descended {
                break;
            }
            if prefix.len() == PATH_DIGITS {
                break;
            }
        }

        Some(prefix_to_millis(&prefix))
    }

    /// Pre-order byte walk used by the wire format (§4.8): for each node, a
    /// byte whose low 3 bits indicate which of `{0,1,2}` children are
    /// present, followed by the 4-byte big-endian XOR hash, followed
    /// recursively by the present children in digit order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_node(&self.root, &mut out);
        out
    }

    /// Inverse of [`MerkleTrie::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut cursor = 0usize;
        let root = read_node(bytes, &mut cursor)?;
        Some(Self { root })
    }
}

fn write_node(node: &Node, out: &mut Vec<u8>) {
    let mut present: u8 = 0;
    for digit in 0u8..3 {
        if node.children.contains_key(&digit) {
            present |= 1 << digit;
        }
    }
    out.push(present);
    out.extend_from_slice(&node.hash.to_be_bytes());
    for digit in 0u8..3 {
        if let Some(child) = node.children.get(&digit) {
            write_node(child, out);
        }
    }
}

fn read_node(bytes: &[u8], cursor: &mut usize) -> Option<Node> {
    let present = *bytes.get(*cursor)?;
    *cursor += 1;
    let hash_bytes = bytes.get(*cursor..*cursor + 4)?;
    let hash = u32::from_be_bytes(hash_bytes.try_into().ok()?);
    *cursor += 4;

    let mut children = BTreeMap::new();
    for digit in 0u8..3 {
        if present & (1 << digit) != 0 {
            let child = read_node(bytes, cursor)?;
            children.insert(digit, child);
        }
    }
    Some(Node { hash, children })
}

/// Pad a partial digit prefix to [`PATH_DIGITS`] with `0` and convert back to
/// a millis value (the start of the earliest diverging minute), per §4.4.
fn prefix_to_millis(prefix: &[u8]) -> i64 {
    let mut minute: u64 = 0;
    for i in 0..PATH_DIGITS {
        let digit = prefix.get(i).copied().unwrap_or(0) as u64;
        minute = minute * 3 + digit;
    }
    (minute * 60_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::identifiers::NodeId;

    fn ts(millis: i64, counter: u16) -> Timestamp {
        Timestamp {
            millis,
            counter,
            node_id: NodeId::generate([1; 8]),
        }
    }

    #[test]
    fn empty_tries_do_not_diverge() {
        let a = MerkleTrie::new();
        let b = MerkleTrie::new();
        assert_eq!(a.diff(&b), None);
    }

    #[test]
    fn insert_is_commutative() {
        let t1 = ts(1_000_000_000_000, 0);
        let t2 = ts(1_000_000_060_000, 1);

        let mut a = MerkleTrie::new();
        a.insert(&t1);
        a.insert(&t2);

        let mut b = MerkleTrie::new();
        b.insert(&t2);
        b.insert(&t1);

        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.diff(&b), None);
    }

    #[test]
    fn identical_trees_do_not_diverge() {
        let t = ts(1_000_000_000_000, 0);
        let mut a = MerkleTrie::new();
        let mut b = MerkleTrie::new();
        a.insert(&t);
        b.insert(&t);
        assert_eq!(a.diff(&b), None);
    }

    #[test]
    fn differing_trees_report_a_divergence_point() {
        let shared = ts(1_000_000_000_000, 0);
        let only_a = ts(1_000_000_600_000, 0);

        let mut a = MerkleTrie::new();
        a.insert(&shared);
        a.insert(&only_a);

        let mut b = MerkleTrie::new();
        b.insert(&shared);

        let divergence = a.diff(&b);
        assert!(divergence.is_some());
    }

    #[test]
    fn wire_round_trips() {
        let mut trie = MerkleTrie::new();
        trie.insert(&ts(1_000_000_000_000, 0));
        trie.insert(&ts(1_000_000_600_000, 3));

        let bytes = trie.to_bytes();
        let back = MerkleTrie::from_bytes(&bytes).unwrap();
        assert_eq!(trie, back);
    }

    #[test]
    fn path_digits_always_has_fixed_width() {
        assert_eq!(path_digits(0).len(), PATH_DIGITS);
        assert_eq!(path_digits(u64::MAX).len(), PATH_DIGITS);
    }
}
