// src/protocol/mod.rs

//! Wire-level framing for the management-datagram protocol.

pub mod frame;
pub mod status;

pub use frame::{MAD_HEADER_LEN, MAX_FRAME_LEN, MadCodec, MadFrame, TRANSPORT_HEADER_LEN};
