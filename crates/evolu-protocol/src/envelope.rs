//! Outer frame wrapping a sync message body for transport (§4.8).
//!
//! Layout: `magic(2) || version(2) || kind(1) || payloadLen(varuint) || payload`.
//! Unlike `SyncRequest`/`SyncResponse`, whose field order is fixed by
//! convention, the frame header is self-describing enough that a reader can
//! reject a foreign or incompatible stream before touching the body.

use crate::varint::{read_varuint, write_varuint, MAX_FIELD_LEN};
use evolu_core::errors::ProtocolError;

/// Two leading bytes identifying an Evolu sync frame, spelling "EV" in ASCII.
pub const MAGIC: [u8; 2] = [0x45, 0x56];

/// The only protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2 + 1;

/// Discriminates the frame's payload schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Payload is a [`crate::messages::SyncRequest`].
    SyncRequest = 1,
    /// Payload is a [`crate::messages::SyncResponse`].
    SyncResponse = 2,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            1 => Ok(Self::SyncRequest),
            2 => Ok(Self::SyncResponse),
            other => Err(ProtocolError::UnknownKind { kind: other }),
        }
    }
}

/// A framed, but not yet interpreted, sync message: the header fields plus
/// the undecoded payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Which payload schema `payload` holds.
    pub kind: FrameKind,
    /// The `SyncRequest`/`SyncResponse` body, still wire-encoded.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Wrap a payload for `kind` in a frame at the current protocol version.
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Encode the full frame, header and payload, as bytes ready to write to
    /// a transport.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.push(self.kind as u8);
        write_varuint(&mut out, self.payload.len() as u64);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a frame from bytes, validating magic, version, and kind before
    /// returning the (still wire-encoded) payload.
    #[tracing::instrument(skip(bytes))]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < MAGIC.len() {
            return Err(ProtocolError::Truncated {
                expected: MAGIC.len(),
                found: bytes.len(),
            });
        }
        if bytes[..MAGIC.len()] != MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }
        let version = u16::from_be_bytes([bytes[2], bytes[3]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion { version });
        }

        let kind = FrameKind::from_byte(bytes[4])?;

        let (len, prefix_len) = read_varuint(&bytes[HEADER_LEN..])?;
        if len > MAX_FIELD_LEN {
            return Err(ProtocolError::LengthTooLarge { length: len });
        }
        let len = len as usize;
        let body = &bytes[HEADER_LEN + prefix_len..];
        if body.len() < len {
            return Err(ProtocolError::Truncated {
                expected: len,
                found: body.len(),
            });
        }

        tracing::debug!(kind = ?kind, payload_len = len, "decoded frame");

        Ok(Self {
            kind,
            payload: body[..len].to_vec(),
        })
    }
}
