//! Integration tests for the UDP server

use comms_rust::io::{Client, ClientBuilder, Server, ServerConfig, UdpServer};
use comms_rust::CommError;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn loopback_server() -> UdpServer {
    UdpServer::new(
        ServerConfig::new(0)
            .with_bind_address("127.0.0.1".parse().unwrap())
            .with_poll_interval(Duration::from_millis(20)),
    )
}

fn client_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(1)))
        .unwrap();
    socket
}

#[test]
fn test_echo_without_callback() {
    let server = loopback_server();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let client = ClientBuilder::new()
        .udp("127.0.0.1", addr.port())
        .read_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    assert_eq!(client.write(b"ping", false).unwrap(), 4);

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf, false, false).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(server.peer_count(), 1);
    server.stop();
}

#[test]
fn test_callback_receives_source_and_suppresses_echo() {
    let server = loopback_server();
    let (tx, rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>();
    let tx = Mutex::new(tx);
    server.set_data_callback(move |_, data, from| {
        let _ = tx.lock().unwrap().send((data.to_vec(), *from));
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let socket = client_socket();
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    socket.send_to(b"hello", addr).unwrap();

    let (data, from) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(from, socket.local_addr().unwrap());

    let mut buf = [0u8; 16];
    assert!(socket.recv_from(&mut buf).is_err());
    server.stop();
}

#[test]
fn test_new_peer_callback_fires_once_per_sender() {
    let server = loopback_server();
    let (tx, rx) = mpsc::channel::<SocketAddr>();
    let tx = Mutex::new(tx);
    server.set_new_peer_callback(move |_, addr, _| {
        let _ = tx.lock().unwrap().send(addr);
    });
    server.set_data_callback(|_, _, _| {});
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let socket = client_socket();
    for _ in 0..3 {
        socket.send_to(b"x", addr).unwrap();
    }
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        socket.local_addr().unwrap()
    );
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(server.peer_count(), 1);
    server.stop();
}

#[test]
fn test_read_bytes_by_address() {
    let server = loopback_server();
    server.set_data_callback(|_, _, _| {});
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let socket = client_socket();
    socket.send_to(b"abc", addr).unwrap();
    socket.send_to(b"def", addr).unwrap();

    let from = socket.local_addr().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.available(&from).unwrap_or(0) < 6 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let mut buf = [0u8; 6];
    assert_eq!(server.read_bytes(&from, &mut buf, true, true).unwrap(), 6);
    assert_eq!(&buf, b"abcdef");
    assert_eq!(server.available(&from).unwrap(), 0);
    server.stop();
}

#[test]
fn test_send_to_reaches_client() {
    let server = loopback_server();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let client = ClientBuilder::new()
        .udp("127.0.0.1", addr.port())
        .read_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let local = SocketAddr::from(([127, 0, 0, 1], client.local_addr().unwrap().port()));

    assert_eq!(server.send_to(&local, b"notify").unwrap(), 6);
    let mut buf = [0u8; 6];
    assert_eq!(client.read(&mut buf, false, false).unwrap(), 6);
    assert_eq!(&buf, b"notify");
    server.stop();
}

#[test]
fn test_stop_when_stopped_is_noop() {
    let server = loopback_server();
    server.stop();
    server.start().unwrap();
    assert!(matches!(server.start(), Err(CommError::AlreadyRunning)));
    server.stop();
    server.stop();
    assert!(!server.is_running());
}
