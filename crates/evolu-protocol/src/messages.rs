//! Deterministic-field-order wire bodies for a sync round (§4.8):
//! `SyncRequest`, `SyncResponse`, and the `EncryptedCrdtMessage` they carry
//! repeated.
//!
//! Every field is either fixed-width or `varuint(len) || bytes`, in the
//! order listed by the spec; there is no self-describing schema, so readers
//! and writers must agree on layout, not just content.

use crate::varint::{read_bytes_field, read_varuint, write_bytes_field, write_varuint};
use evolu_core::errors::ProtocolError;
use evolu_core::identifiers::{NodeId, OwnerId};
use evolu_core::time::{Timestamp, BINARY_TIMESTAMP_LEN};
use evolu_core::types::EncryptedCrdtMessage;

const OWNER_ID_LEN: usize = 21;
const NODE_ID_LEN: usize = 16;

fn take(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), ProtocolError> {
    if buf.len() < n {
        return Err(ProtocolError::Truncated {
            expected: n,
            found: buf.len(),
        });
    }
    Ok((&buf[..n], &buf[n..]))
}

/// Encode a single `EncryptedCrdtMessage` as `timestamp(16B) || ciphertext(bytes)`.
pub fn encode_encrypted_message(out: &mut Vec<u8>, msg: &EncryptedCrdtMessage) {
    out.extend_from_slice(&msg.timestamp.to_binary());
    write_bytes_field(out, &msg.ciphertext);
}

/// Decode a single `EncryptedCrdtMessage`, returning it and the number of
/// bytes consumed from the front of `buf`.
pub fn decode_encrypted_message(buf: &[u8]) -> Result<(EncryptedCrdtMessage, usize), ProtocolError> {
    let (ts_bytes, rest) = take(buf, BINARY_TIMESTAMP_LEN)?;
    let mut fixed = [0u8; BINARY_TIMESTAMP_LEN];
    fixed.copy_from_slice(ts_bytes);
    let timestamp = Timestamp::from_binary(&fixed);

    let (ciphertext, consumed) = read_bytes_field(rest)?;
    let total = BINARY_TIMESTAMP_LEN + consumed;

    Ok((
        EncryptedCrdtMessage {
            timestamp,
            ciphertext: ciphertext.to_vec(),
        },
        total,
    ))
}

fn encode_message_list(out: &mut Vec<u8>, messages: &[EncryptedCrdtMessage]) {
    write_varuint(out, messages.len() as u64);
    for msg in messages {
        encode_encrypted_message(out, msg);
    }
}

fn decode_message_list(buf: &[u8]) -> Result<(Vec<EncryptedCrdtMessage>, usize), ProtocolError> {
    let (count, mut offset) = read_varuint(buf)?;
    let mut messages = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (msg, consumed) = decode_encrypted_message(&buf[offset..])?;
        messages.push(msg);
        offset += consumed;
    }
    Ok((messages, offset))
}

/// The client's request to reconcile state with the relay (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// The owner whose encrypted history is being synced.
    pub owner_id: OwnerId,
    /// The requesting device's node id.
    pub node_id: NodeId,
    /// Compact pre-order serialization of the requester's Merkle trie
    /// (`evolu_merkle::MerkleTrie::to_bytes`).
    pub merkle_tree: Vec<u8>,
    /// Encrypted messages the relay has not yet acknowledged.
    pub messages: Vec<EncryptedCrdtMessage>,
}

impl SyncRequest {
    /// Serialize as `ownerId(21B) || nodeId(16B) || merkleTree(bytes) || messages(varuint count + repeated)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let owner_bytes = self.owner_id.as_str().as_bytes();
        debug_assert_eq!(owner_bytes.len(), OWNER_ID_LEN, "owner id must be 21 bytes");
        out.extend_from_slice(owner_bytes);

        let node_bytes = self.node_id.as_str().as_bytes();
        debug_assert_eq!(node_bytes.len(), NODE_ID_LEN, "node id must be 16 bytes");
        out.extend_from_slice(node_bytes);

        write_bytes_field(&mut out, &self.merkle_tree);
        encode_message_list(&mut out, &self.messages);
        out
    }

    /// Parse a `SyncRequest` body produced by [`SyncRequest::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (owner_raw, rest) = take(buf, OWNER_ID_LEN)?;
        let owner_id = OwnerId::from_raw(String::from_utf8_lossy(owner_raw).into_owned());

        let (node_raw, rest) = take(rest, NODE_ID_LEN)?;
        let node_id = NodeId::from_raw(String::from_utf8_lossy(node_raw).into_owned());

        let (merkle_tree, consumed) = read_bytes_field(rest)?;
        let merkle_tree = merkle_tree.to_vec();
        let rest = &rest[consumed..];

        let (messages, _) = decode_message_list(rest)?;

        Ok(Self {
            owner_id,
            node_id,
            merkle_tree,
            messages,
        })
    }
}

/// The relay's reply carrying its own Merkle trie and any messages the
/// requester was missing (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    /// Compact pre-order serialization of the relay's Merkle trie.
    pub merkle_tree: Vec<u8>,
    /// Encrypted messages the requester had not yet seen.
    pub messages: Vec<EncryptedCrdtMessage>,
}

impl SyncResponse {
    /// Serialize as `merkleTree(bytes) || messages(varuint count + repeated)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_bytes_field(&mut out, &self.merkle_tree);
        encode_message_list(&mut out, &self.messages);
        out
    }

    /// Parse a `SyncResponse` body produced by [`SyncResponse::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (merkle_tree, consumed) = read_bytes_field(buf)?;
        let merkle_tree = merkle_tree.to_vec();
        let (messages, _) = decode_message_list(&buf[consumed..])?;
        Ok(Self { merkle_tree, messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::identifiers::NodeId as NodeIdT;

    fn sample_message(millis: i64) -> EncryptedCrdtMessage {
        EncryptedCrdtMessage {
            timestamp: Timestamp {
                millis,
                counter: 1,
                node_id: NodeIdT::generate([9; 8]),
            },
            ciphertext: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn encrypted_message_round_trips() {
        let msg = sample_message(1_000_000_000_000);
        let mut buf = Vec::new();
        encode_encrypted_message(&mut buf, &msg);
        let (decoded, consumed) = decode_encrypted_message(&buf).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn sync_request_round_trips() {
        let req = SyncRequest {
            owner_id: OwnerId::from_raw("a".repeat(21)),
            node_id: NodeId::generate([1; 8]),
            merkle_tree: vec![0xAA; 10],
            messages: vec![sample_message(1_000_000_000_000), sample_message(1_000_000_000_100)],
        };
        let bytes = req.to_bytes();
        let decoded = SyncRequest::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn sync_response_round_trips_with_no_messages() {
        let resp = SyncResponse {
            merkle_tree: vec![],
            messages: vec![],
        };
        let bytes = resp.to_bytes();
        let decoded = SyncResponse::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn sync_request_rejects_truncated_owner_id() {
        let buf = vec![0u8; OWNER_ID_LEN - 1];
        assert!(matches!(SyncRequest::from_bytes(&buf), Err(ProtocolError::Truncated { .. })));
    }
}
