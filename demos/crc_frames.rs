//! CRC framing walkthrough
//!
//! Seals a payload with its trailer, verifies it, then shows that a single
//! flipped bit is caught.

use comms_rust::protocol::crc;

fn main() {
    let payload = b"123456789";
    println!(
        "CRC of \"{}\": {:#06x}",
        String::from_utf8_lossy(payload),
        crc::compute_crc(payload)
    );

    let mut frame = payload.to_vec();
    crc::append_crc(&mut frame);
    println!("Frame: {:02x?}", frame);
    println!("Valid: {}", crc::verify_crc(&frame));

    frame[4] ^= 0x10;
    println!("After bit flip, valid: {}", crc::verify_crc(&frame));

    let mut sealed = [0u8; 6];
    sealed[..4].copy_from_slice(b"ping");
    crc::seal_frame(&mut sealed);
    println!("Sealed in place: {:02x?}", sealed);
}
