//! TCP echo server
//!
//! Accepts any number of clients and echoes every chunk back to its sender.
//! Press Enter to stop.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example tcp_echo_server -- 5000
//! ```

use comms_rust::io::{Server, ServerConfig, TcpServer};
use std::io::BufRead;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|p| p.parse())
        .transpose()?
        .unwrap_or(5000);

    let server = TcpServer::new(ServerConfig::new(port).with_nodelay(true));
    server.set_new_peer_callback(|_, addr, peer| {
        info!(peer, %addr, "New client");
    });
    server.set_data_callback(|server, data, peer| {
        if let Err(e) = server.send_to(peer, data) {
            info!(peer, error = %e, "Echo failed");
        }
    });
    server.start()?;
    info!(addr = ?server.local_addr(), "Echo server running, press Enter to stop");

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    server.stop();
    Ok(())
}
