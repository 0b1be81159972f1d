//! Integration tests for CRC framing
//!
//! Checks the published check value and how trailers travel through clients.

use comms_rust::io::{Client, TcpClient};
use comms_rust::protocol::crc::{self, Crc16};
use comms_rust::CommError;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

#[test]
fn test_check_value() {
    assert_eq!(crc::compute_crc(b"123456789"), 0xc331);
    assert_eq!(crc::encode_crc(0xc331), [0x31, 0xc3]);
}

#[test]
fn test_trailer_is_big_endian_accumulator() {
    let mut frame = b"123456789".to_vec();
    crc::append_crc(&mut frame);
    // CRC-16/XMODEM of the check string is 0x31c3, sent high byte first.
    assert_eq!(&frame[9..], &[0x31, 0xc3]);
    assert!(crc::verify_crc(&frame));
}

#[test]
fn test_shared_table_matches_fresh_table() {
    let fresh = Crc16::new(crc::DEFAULT_POLYNOMIAL);
    assert_eq!(fresh.table(), Crc16::shared().table());
    assert_eq!(fresh.compute(b"Hello TCP"), crc::compute_crc(b"Hello TCP"));
}

#[test]
fn test_corrupted_frame_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut frame = b"status".to_vec();
        crc::append_crc(&mut frame);
        stream.write_all(&frame).unwrap();

        frame[0] ^= 0x01;
        stream.write_all(&frame).unwrap();

        let mut echo = [0u8; 8];
        stream.read_exact(&mut echo).unwrap();
        echo
    });

    let client = TcpClient::new();
    client
        .connect("127.0.0.1", port, Some(Duration::from_secs(2)))
        .unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf, true, true).unwrap(), 8);
    assert_eq!(&buf[..6], b"status");

    let err = client.read(&mut buf, true, true).unwrap_err();
    assert!(matches!(err, CommError::CrcMismatch { .. }));
    assert_eq!(&buf[1..6], b"tatus");

    assert_eq!(client.write(b"status", true).unwrap(), 8);
    let echo = peer.join().unwrap();
    assert!(crc::verify_crc(&echo));
}
