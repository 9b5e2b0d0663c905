// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Management channel over a real socket and its interaction with the
//! scan response host name.

use openidn::config::RuntimeConfig;
use openidn::mgmt::MgmtServer;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    addr: SocketAddr,
    config: Arc<RuntimeConfig>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(RuntimeConfig::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut server = MgmtServer::bind(
            0,
            Arc::clone(&config),
            dir.path().join("settings.ini"),
            Arc::clone(&shutdown),
        )
        .expect("bind mgmt");
        let port = server.local_addr().expect("addr").port();
        let addr = SocketAddr::new("127.0.0.1".parse().expect("ip"), port);
        let handle = std::thread::spawn(move || server.run());
        Harness {
            addr,
            config,
            shutdown,
            handle: Some(handle),
            _dir: dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("client bind");
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .expect("timeout");
    socket.send_to(request, addr).expect("send");
    let mut buf = [0u8; 4096];
    let (len, _) = socket.recv_from(&mut buf).expect("response expected");
    buf[..len].to_vec()
}

#[test]
fn test_ping_over_socket() {
    let harness = Harness::start();
    assert_eq!(exchange(harness.addr, &[0xE5, 0x01]), vec![0xE6, 0x01]);
}

#[test]
fn test_version_over_socket() {
    let harness = Harness::start();
    let response = exchange(harness.addr, &[0xE5, 0x02]);
    assert_eq!(&response[..2], &[0xE6, 0x02]);
    assert_eq!(response.len(), 20);
}

#[test]
fn test_set_host_name_updates_shared_config() {
    let harness = Harness::start();
    let mut request = vec![0xE5, 0x03];
    request.extend_from_slice(b"Backstage");
    assert_eq!(exchange(harness.addr, &request), vec![0xE6, 0x03]);
    assert_eq!(*harness.config.host_name(), "Backstage");
}
