//! Table-driven CRC16 used for frame integrity on every transport
//!
//! The accumulator starts at zero and folds each byte through a 256-entry
//! table derived from the generator polynomial (CRC-16/XMODEM for the default
//! `0x1021`). [`compute_crc`] returns the accumulator with its two bytes
//! swapped; the frame trailer is that value written little-endian, which puts
//! the accumulator's high byte first on the wire on every host.
//!
//! ```
//! use comms_rust::protocol::crc::{append_crc, verify_crc};
//!
//! let mut frame = b"payload".to_vec();
//! append_crc(&mut frame);
//! assert_eq!(frame.len(), 9);
//! assert!(verify_crc(&frame));
//! ```

use std::sync::OnceLock;

/// Generator polynomial used by the shared table (CRC-CCITT)
pub const DEFAULT_POLYNOMIAL: u16 = 0x1021;

/// Number of trailer bytes a checksum occupies in a frame
pub const CRC_SIZE: usize = 2;

static DEFAULT_TABLE: OnceLock<Crc16> = OnceLock::new();

/// CRC16 engine holding a lookup table for one generator polynomial
#[derive(Clone)]
pub struct Crc16 {
    polynomial: u16,
    table: [u16; 256],
}

impl Crc16 {
    /// Build the lookup table for `polynomial`
    pub fn new(polynomial: u16) -> Self {
        let mut table = [0u16; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = (i as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ polynomial
                } else {
                    crc << 1
                };
            }
            *entry = crc;
        }
        Crc16 { polynomial, table }
    }

    /// Process-wide engine for [`DEFAULT_POLYNOMIAL`]
    ///
    /// The table is built on first use, exactly once, even when several
    /// threads race to initialize it.
    pub fn shared() -> &'static Crc16 {
        DEFAULT_TABLE.get_or_init(|| Crc16::new(DEFAULT_POLYNOMIAL))
    }

    /// Generator polynomial this table was derived from
    pub fn polynomial(&self) -> u16 {
        self.polynomial
    }

    /// Lookup table entries
    pub fn table(&self) -> &[u16; 256] {
        &self.table
    }

    /// Checksum of `data` in trailer order (bytes of the accumulator swapped)
    ///
    /// The checksum of an empty slice is 0.
    pub fn compute(&self, data: &[u8]) -> u16 {
        let mut acc: u16 = 0;
        for &byte in data {
            acc = (acc << 8) ^ self.table[usize::from((acc >> 8) ^ u16::from(byte))];
        }
        acc.swap_bytes()
    }

    /// Verify a frame whose last [`CRC_SIZE`] bytes hold the checksum of the rest
    ///
    /// Frames shorter than the trailer never verify.
    pub fn verify(&self, frame: &[u8]) -> bool {
        match split_frame(frame) {
            Some((payload, trailer)) => self.compute(payload) == trailer,
            None => false,
        }
    }
}

impl std::fmt::Debug for Crc16 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc16")
            .field("polynomial", &format_args!("{:#06x}", self.polynomial))
            .finish()
    }
}

/// Checksum of `data` using the shared default table
pub fn compute_crc(data: &[u8]) -> u16 {
    Crc16::shared().compute(data)
}

/// Verify a frame (payload followed by its 2-byte trailer) against the shared table
pub fn verify_crc(frame: &[u8]) -> bool {
    Crc16::shared().verify(frame)
}

/// Trailer bytes for a checksum value
pub fn encode_crc(crc: u16) -> [u8; CRC_SIZE] {
    crc.to_le_bytes()
}

/// Split a frame into payload and trailer value
pub fn split_frame(frame: &[u8]) -> Option<(&[u8], u16)> {
    if frame.len() < CRC_SIZE {
        return None;
    }
    let (payload, trailer) = frame.split_at(frame.len() - CRC_SIZE);
    Some((payload, u16::from_le_bytes([trailer[0], trailer[1]])))
}

/// Append the checksum of the current contents of `buf`
pub fn append_crc(buf: &mut Vec<u8>) {
    let crc = compute_crc(buf);
    buf.extend_from_slice(&encode_crc(crc));
}

/// Fill the caller-reserved last two bytes of `frame` with the checksum of the rest
///
/// Returns `false` (leaving the buffer untouched) when `frame` has no room for
/// a trailer.
pub fn seal_frame(frame: &mut [u8]) -> bool {
    if frame.len() < CRC_SIZE {
        return false;
    }
    let split = frame.len() - CRC_SIZE;
    let crc = compute_crc(&frame[..split]);
    frame[split..].copy_from_slice(&encode_crc(crc));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_first_entries() {
        let crc = Crc16::new(DEFAULT_POLYNOMIAL);
        assert_eq!(crc.table()[0], 0x0000);
        assert_eq!(crc.table()[1], 0x1021);
        assert_eq!(crc.table()[2], 0x2042);
        assert_eq!(crc.table()[255], 0x1ef0);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(compute_crc(&[]), 0);
    }

    #[test]
    fn test_check_value() {
        // CRC-16/XMODEM check value is 0x31c3; the engine reports it swapped.
        assert_eq!(compute_crc(b"123456789"), 0xc331);
        assert_eq!(encode_crc(compute_crc(b"123456789")), [0x31, 0xc3]);
    }

    #[test]
    fn test_deterministic() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(compute_crc(&data), compute_crc(&data));
    }

    #[test]
    fn test_fresh_table_matches_shared() {
        let fresh = Crc16::new(DEFAULT_POLYNOMIAL);
        let data = b"re-initialised tables agree";
        assert_eq!(fresh.compute(data), compute_crc(data));
    }

    #[test]
    fn test_detects_single_byte_change() {
        assert_ne!(compute_crc(&[1, 2, 3, 4]), compute_crc(&[1, 2, 3, 5]));
        assert_ne!(compute_crc(&[0x00]), compute_crc(&[0xff]));
    }

    #[test]
    fn test_seal_and_verify() {
        let mut frame = [0xab, 0xcd, 0xef, 0x12, 0x00, 0x00];
        assert!(seal_frame(&mut frame));
        assert!(verify_crc(&frame));

        frame[2] = 0xff;
        assert!(!verify_crc(&frame));
    }

    #[test]
    fn test_seal_too_short() {
        let mut frame = [0x42];
        assert!(!seal_frame(&mut frame));
        assert_eq!(frame, [0x42]);
        assert!(!verify_crc(&frame));
    }

    #[test]
    fn test_bit_flips_detected() {
        let mut frame = b"Hello TCP".to_vec();
        append_crc(&mut frame);
        let payload_len = frame.len() - CRC_SIZE;

        for byte in 0..payload_len {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(!verify_crc(&corrupted), "flip {byte}:{bit} undetected");
            }
        }
    }

    #[test]
    fn test_shared_is_initialised_once() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| Crc16::shared() as *const Crc16 as usize))
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }
}
