//! Binary wire framing for an Evolu sync round (§4.8).
//!
//! `evolu-sync` and `evolu-relay` exchange [`SyncRequest`]/[`SyncResponse`]
//! bodies wrapped in a [`Frame`]; neither side needs to know anything about
//! HTTP, WebSockets, or whatever transport carries the bytes.

mod envelope;
mod messages;
mod varint;

pub use envelope::{Frame, FrameKind, MAGIC, PROTOCOL_VERSION};
pub use messages::{SyncRequest, SyncResponse};
pub use varint::{read_bytes_field, read_varuint, write_bytes_field, write_varuint};

use evolu_core::errors::ProtocolError;

/// Frame and encode a `SyncRequest` ready to hand to the transport.
pub fn encode_sync_request(request: &SyncRequest) -> Vec<u8> {
    Frame::new(FrameKind::SyncRequest, request.to_bytes()).encode()
}

/// Decode a frame known to carry a `SyncRequest`.
pub fn decode_sync_request(bytes: &[u8]) -> Result<SyncRequest, ProtocolError> {
    let frame = Frame::decode(bytes)?;
    match frame.kind {
        FrameKind::SyncRequest => SyncRequest::from_bytes(&frame.payload),
        FrameKind::SyncResponse => Err(ProtocolError::UnknownKind {
            kind: FrameKind::SyncResponse as u8,
        }),
    }
}

/// Frame and encode a `SyncResponse` ready to hand to the transport.
pub fn encode_sync_response(response: &SyncResponse) -> Vec<u8> {
    Frame::new(FrameKind::SyncResponse, response.to_bytes()).encode()
}

/// Decode a frame known to carry a `SyncResponse`.
pub fn decode_sync_response(bytes: &[u8]) -> Result<SyncResponse, ProtocolError> {
    let frame = Frame::decode(bytes)?;
    match frame.kind {
        FrameKind::SyncResponse => SyncResponse::from_bytes(&frame.payload),
        FrameKind::SyncRequest => Err(ProtocolError::UnknownKind {
            kind: FrameKind::SyncRequest as u8,
        }),
    }
}
