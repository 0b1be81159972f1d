//! Serial line monitor
//!
//! Opens a tty in raw 8N1 mode and prints every chunk that arrives. With
//! `--crc`, each read expects a fixed-size frame ending in a CRC trailer.
//!
//! ```bash
//! cargo run --example serial_monitor -- /dev/ttyUSB0 115200 --crc
//! ```

use comms_rust::io::{Client, ClientBuilder};
use comms_rust::CommError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FRAME_SIZE: usize = 130;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let baud: u32 = args.next().map(|b| b.parse()).transpose()?.unwrap_or(115200);
    let with_crc = args.any(|a| a == "--crc");

    let port = ClientBuilder::new().serial(&path).baud(baud).build()?;
    info!(port = %port.label(), with_crc, "Monitoring");

    let mut frame = [0u8; FRAME_SIZE];
    loop {
        match port.read(&mut frame, with_crc, with_crc) {
            Ok(0) => continue,
            Ok(n) => info!(bytes = n, data = ?&frame[..n], "Received"),
            Err(CommError::CrcMismatch { expected, actual }) => {
                warn!(expected, actual, "Dropped corrupted frame");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
