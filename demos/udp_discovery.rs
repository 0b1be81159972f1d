//! UDP discovery responder and probe
//!
//! Starts a UDP server that answers every datagram by echoing it, then
//! probes it once through a `UdpClient` and announces itself on the local
//! broadcast address.
//!
//! ```bash
//! RUST_LOG=comms_rust=debug cargo run --example udp_discovery
//! ```

use comms_rust::io::{Client, ClientBuilder, Server, ServerConfig, UdpServer};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = UdpServer::new(ServerConfig::new(0));
    server.set_new_peer_callback(|_, addr, _| info!(%addr, "Discovered peer"));
    server.start()?;
    let port = server
        .local_addr()
        .map(|addr| addr.port())
        .ok_or("server has no address")?;

    let probe = ClientBuilder::new()
        .udp("127.0.0.1", port)
        .read_timeout(Duration::from_secs(1))
        .build()?;
    probe.write(b"DISCOVER", true)?;

    let mut reply = [0u8; 10];
    match probe.read(&mut reply, true, false) {
        Ok(n) => info!(bytes = n, reply = %String::from_utf8_lossy(&reply[..n - 2]), "Probe answered"),
        Err(e) => warn!(error = %e, "No answer"),
    }

    if let Err(e) = server.broadcast(b"HELLO") {
        warn!(error = %e, "Broadcast not permitted here");
    }

    server.stop();
    Ok(())
}
