//! Framing helpers shared by every transport
//!
//! A frame is a raw payload optionally followed by a 2-byte CRC16 trailer.

pub mod crc;

pub use crc::{append_crc, compute_crc, seal_frame, verify_crc, Crc16, CRC_SIZE};
