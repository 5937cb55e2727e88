// src/protocol/frame.rs

//! Implements the management-datagram (MAD) wire framing and the
//! corresponding `Encoder` and `Decoder` for network communication.
//!
//! Layout on the wire:
//!
//! ```text
//! +----------------+----------------+   transport header (8 bytes)
//! | marker: u32    | length: u32    |   length covers both headers + payload
//! +----------------+--------+-------+
//! | tid: u64                        |   MAD header (16 bytes)
//! +----------+----------+-----------+
//! | attr:u16 | stat:u16 | rsvd: u32 |
//! +----------+----------+-----------+
//! | payload (opaque)                |
//! +---------------------------------+
//! ```
//!
//! Decoding is streaming: the headers may arrive split across multiple socket
//! reads, so the decoder returns `Ok(None)` until a complete frame is
//! buffered. A failed marker check is a fatal framing error for the whole
//! connection; the connection layer fails every pending command on it.

use crate::core::FabricError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The validity marker every transport header must carry ("MAD1").
pub const TRANSPORT_MARKER: u32 = 0x4D41_4431;

/// Size of the fixed transport header: marker + total length.
pub const TRANSPORT_HEADER_LEN: usize = 8;

/// Size of the MAD header: transaction id, attribute id, status, reserved.
pub const MAD_HEADER_LEN: usize = 16;

/// Upper bound on a declared frame length. Anything larger is a framing
/// error rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A single management datagram exchanged with an FE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MadFrame {
    /// Correlates an outbound command with its inbound response. Zero for
    /// unsolicited notices.
    pub tid: u64,
    /// Attribute identifier; routing only, payload semantics live upstream.
    pub attr: u16,
    /// Status code; see [`crate::protocol::status`].
    pub status: u16,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl MadFrame {
    /// Builds a request frame with a success status.
    pub fn request(tid: u64, attr: u16, payload: Bytes) -> Self {
        Self {
            tid,
            attr,
            status: super::status::STATUS_OK,
            payload,
        }
    }

    /// Total encoded length of this frame, headers included.
    pub fn encoded_len(&self) -> usize {
        TRANSPORT_HEADER_LEN + MAD_HEADER_LEN + self.payload.len()
    }

    /// A convenience method to encode a frame into a `Vec<u8>`.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, FabricError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        MadCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding
/// [`MadFrame`]s.
#[derive(Debug, Default)]
pub struct MadCodec;

impl Encoder<MadFrame> for MadCodec {
    type Error = FabricError;

    fn encode(&mut self, item: MadFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = item.encoded_len();
        if total > MAX_FRAME_LEN {
            return Err(FabricError::Framing(format!(
                "outbound frame of {total} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        dst.reserve(total);
        dst.put_u32(TRANSPORT_MARKER);
        dst.put_u32(total as u32);
        dst.put_u64(item.tid);
        dst.put_u16(item.attr);
        dst.put_u16(item.status);
        dst.put_u32(0); // reserved
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for MadCodec {
    type Item = MadFrame;
    type Error = FabricError;

    /// Decodes a single `MadFrame` from the buffer, or `Ok(None)` when the
    /// buffered bytes do not yet hold a complete frame.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // The transport header may itself be split across reads.
        if src.len() < TRANSPORT_HEADER_LEN {
            return Ok(None);
        }

        let marker = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if marker != TRANSPORT_MARKER {
            return Err(FabricError::Framing(format!(
                "invalid transport marker {marker:#010x}"
            )));
        }

        let total = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if total < TRANSPORT_HEADER_LEN + MAD_HEADER_LEN || total > MAX_FRAME_LEN {
            return Err(FabricError::Framing(format!(
                "declared frame length {total} outside valid bounds"
            )));
        }

        if src.len() < total {
            // Reserve up front so the read loop can pull the whole body in
            // as few syscalls as possible.
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(TRANSPORT_HEADER_LEN);
        let tid = src.get_u64();
        let attr = src.get_u16();
        let status = src.get_u16();
        let _reserved = src.get_u32();
        let payload = src
            .split_to(total - TRANSPORT_HEADER_LEN - MAD_HEADER_LEN)
            .freeze();

        Ok(Some(MadFrame {
            tid,
            attr,
            status,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = MadFrame::request(42, 0x11, Bytes::from_static(b"hello fabric"));
        let mut buf = BytesMut::new();
        MadCodec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = MadCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_header_is_incomplete_not_error() {
        let frame = MadFrame::request(7, 0x12, Bytes::from_static(b"xyz"));
        let encoded = frame.encode_to_vec().unwrap();

        let mut buf = BytesMut::new();
        // Feed the frame three bytes at a time; the decoder must keep asking
        // for more until the whole frame is present.
        let mut codec = MadCodec;
        for chunk in encoded.chunks(3) {
            let before = buf.len();
            buf.extend_from_slice(chunk);
            if before + chunk.len() < encoded.len() {
                assert!(codec.decode(&mut buf).unwrap().is_none());
            }
        }
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn bad_marker_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u32(64);
        buf.put_bytes(0, 64);
        let err = MadCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FabricError::Framing(_)));
    }

    #[test]
    fn oversized_declared_length_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32(TRANSPORT_MARKER);
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        let err = MadCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FabricError::Framing(_)));
    }
}
