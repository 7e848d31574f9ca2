//! Test utilities and mocks for Soxy
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use soxy::config::{ServerConfig, UpstreamConfig};
use soxy::server::Server;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Success reply the fake upstream sends after a connect request
pub const UPSTREAM_SUCCESS: &[u8] = &[5, 0, 0, 1, 127, 0, 0, 1, 0, 0];

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// An address nothing listens on
pub async fn unused_addr() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    drop(listener);
    addr
}

/// Spawn a server that echoes every byte back on each connection
pub async fn start_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A running proxy
pub struct TestProxy {
    /// Address clients connect to
    pub addr: SocketAddr,
    /// Live session count
    pub live: watch::Receiver<usize>,
    shutdown_tx: broadcast::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestProxy {
    /// Signal shutdown and wait for the server to stop
    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

/// Start a proxy on an ephemeral loopback port
pub async fn start_proxy(upstream: Option<UpstreamConfig>) -> TestProxy {
    let config = ServerConfig {
        port: 0,
        upstream,
        ..Default::default()
    };
    let server = Server::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let live = server.subscribe_live();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(server.run(shutdown_rx));

    TestProxy {
        addr,
        live,
        shutdown_tx,
        handle,
    }
}

/// Upstream configuration pointing at a local address
pub fn upstream_at(addr: SocketAddr) -> UpstreamConfig {
    UpstreamConfig::new(addr.ip().to_string(), addr.port())
}

/// Connect request bytes for an IPv4 target
pub fn ipv4_request(command: u8, target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(target) = target else {
        panic!("IPv4 target expected");
    };
    let mut request = vec![5, command, 0, 1];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

/// Connect request bytes for a domain target
pub fn domain_request(domain: &str, port: u16) -> Vec<u8> {
    let mut request = vec![5, 1, 0, 3, domain.len() as u8];
    request.extend_from_slice(domain.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// Perform the no-auth handshake and send `request`, returning the raw
/// reply bytes (`reply_len` of them)
pub async fn handshake(stream: &mut TcpStream, request: &[u8], reply_len: usize) -> Vec<u8> {
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    stream.write_all(request).await.unwrap();
    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

/// Read until the peer closes; true when nothing more arrived
pub async fn closed_without_data(stream: &mut TcpStream) -> bool {
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest).await {
        Ok(_) => rest.is_empty(),
        Err(_) => true,
    }
}

/// What a fake upstream proxy received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRecord {
    /// Method-selection bytes
    pub greeting: Vec<u8>,
    /// Connect request bytes
    pub request: Vec<u8>,
}

/// Spawn a one-shot upstream SOCKS5 proxy that answers the connect request
/// with `reply`, then echoes bytes when the reply is a success
pub async fn start_fake_upstream(reply: &'static [u8]) -> (SocketAddr, JoinHandle<UpstreamRecord>) {
    let (listener, addr) = create_test_listener().await;
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = vec![0u8; 2];
        stream.read_exact(&mut greeting).await.unwrap();
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        greeting.extend_from_slice(&methods);
        stream.write_all(&[5, 0]).await.unwrap();

        let mut request = vec![0u8; 4];
        stream.read_exact(&mut request).await.unwrap();
        let address_len = match request[3] {
            1 => 4,
            4 => 16,
            _ => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                request.push(len[0]);
                len[0] as usize
            }
        };
        let mut rest = vec![0u8; address_len + 2];
        stream.read_exact(&mut rest).await.unwrap();
        request.extend_from_slice(&rest);

        stream.write_all(reply).await.unwrap();
        if reply[1] == 0 {
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        } else {
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        }

        UpstreamRecord { greeting, request }
    });
    (addr, handle)
}
