// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Management channel: small vendor protocol on UDP port 7355.
//!
//! Requests start with `0xE5`, responses with `0xE6`, followed by the
//! subcommand byte. The channel is for provisioning tools, not streaming:
//! ping, software version, host name changes (persisted to the settings
//! file) and settings-file retrieval.

use crate::config::{
    RuntimeConfig, MAX_DATAGRAM_LEN, MGMT_UDP_PORT, NAME_FIELD_LEN, RECV_TIMEOUT_US,
};
use crate::error::Error;
use crate::protocol::constants::{
    MGMT_REQUEST_MAGIC, MGMT_RESPONSE_MAGIC, MGMT_SUBCMD_GET_SETTINGS, MGMT_SUBCMD_PING,
    MGMT_SUBCMD_SET_HOST_NAME, MGMT_SUBCMD_VERSION, MGMT_VERSION_LEN,
};
use crate::settings::Settings;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Settings retrieval status codes (subcommand 0x04).
const SETTINGS_STATUS_OK: u16 = 0x0000;
const SETTINGS_STATUS_NOT_FOUND: u16 = 0x0002;
const SETTINGS_STATUS_READ_ERROR: u16 = 0x0003;

/// Management channel server.
pub struct MgmtServer {
    socket: UdpSocket,
    config: Arc<RuntimeConfig>,
    settings_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    recv_buf: Vec<u8>,
}

impl MgmtServer {
    /// Bind the management socket. Pass port 0 for an ephemeral port
    /// (tests); production uses [`MGMT_UDP_PORT`].
    pub fn bind(
        port: u16,
        config: Arc<RuntimeConfig>,
        settings_path: PathBuf,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&addr.into())
            .map_err(|_| Error::BindFailed(addr.to_string()))?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(Duration::from_micros(RECV_TIMEOUT_US)))?;

        log::info!("[MGMT] listening on {}", socket.local_addr()?);
        Ok(MgmtServer {
            socket,
            config,
            settings_path,
            shutdown,
            recv_buf: vec![0u8; MAX_DATAGRAM_LEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn port() -> u16 {
        MGMT_UDP_PORT
    }

    /// Receive loop; returns when the shutdown flag is raised.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let mut buf = std::mem::take(&mut self.recv_buf);
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => self.handle_request(&buf[..len], peer),
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => log::warn!("[MGMT] recv error: {}", err),
            }
            self.recv_buf = buf;
        }
        log::info!("[MGMT] server loop stopped");
    }

    /// Dispatch one management request. Anything that is not a valid
    /// command is ignored.
    pub fn handle_request(&self, request: &[u8], peer: SocketAddr) {
        if request.len() < 2 || request[0] != MGMT_REQUEST_MAGIC {
            return;
        }

        match request[1] {
            MGMT_SUBCMD_PING => {
                self.send(&[MGMT_RESPONSE_MAGIC, MGMT_SUBCMD_PING], peer);
            }
            MGMT_SUBCMD_VERSION => {
                let mut response = vec![0u8; 2 + MGMT_VERSION_LEN];
                response[0] = MGMT_RESPONSE_MAGIC;
                response[1] = MGMT_SUBCMD_VERSION;
                let version = crate::VERSION.as_bytes();
                let take = version.len().min(MGMT_VERSION_LEN);
                response[2..2 + take].copy_from_slice(&version[..take]);
                self.send(&response, peer);
            }
            MGMT_SUBCMD_SET_HOST_NAME => {
                self.send(&[MGMT_RESPONSE_MAGIC, MGMT_SUBCMD_SET_HOST_NAME], peer);
                self.set_host_name(&request[2..]);
            }
            MGMT_SUBCMD_GET_SETTINGS => {
                self.send(&self.settings_response(), peer);
            }
            other => {
                log::debug!("[MGMT] unknown subcommand {:#04x} from {}", other, peer);
            }
        }
    }

    fn set_host_name(&self, raw: &[u8]) {
        // Name field convention: not terminated, at most 20 bytes
        let end = raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(raw.len())
            .min(NAME_FIELD_LEN);
        let name = String::from_utf8_lossy(&raw[..end]);
        let name = name.trim();
        if name.is_empty() {
            return;
        }

        log::info!("[MGMT] host name set to {:?}", name);
        self.config.set_host_name(name);

        // Persist alongside the other settings; failure to persist is not
        // failure to apply
        let mut settings = Settings::load(&self.settings_path).unwrap_or_default();
        settings.set("idn_server", "name", name);
        if let Err(err) = settings.store(&self.settings_path) {
            log::warn!("[MGMT] could not persist host name: {}", err);
        }
    }

    fn settings_response(&self) -> Vec<u8> {
        let mut response = vec![MGMT_RESPONSE_MAGIC, MGMT_SUBCMD_GET_SETTINGS];
        match std::fs::read(&self.settings_path) {
            Ok(text) => {
                response.extend_from_slice(&SETTINGS_STATUS_OK.to_be_bytes());
                let max_text = MAX_DATAGRAM_LEN - response.len();
                let take = text.len().min(max_text);
                response.extend_from_slice(&text[..take]);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                response.extend_from_slice(&SETTINGS_STATUS_NOT_FOUND.to_be_bytes());
            }
            Err(err) => {
                log::warn!("[MGMT] settings read failed: {}", err);
                response.extend_from_slice(&SETTINGS_STATUS_READ_ERROR.to_be_bytes());
            }
        }
        response
    }

    fn send(&self, response: &[u8], peer: SocketAddr) {
        if let Err(err) = self.socket.send_to(response, peer) {
            log::debug!("[MGMT] response to {} failed: {}", peer, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;

    fn test_server(settings_path: PathBuf) -> MgmtServer {
        MgmtServer::bind(
            0,
            Arc::new(RuntimeConfig::new()),
            settings_path,
            Arc::new(AtomicBool::new(false)),
        )
        .expect("bind ephemeral")
    }

    fn request(server: &MgmtServer, bytes: &[u8]) -> Vec<u8> {
        let client = StdUdpSocket::bind("127.0.0.1:0").expect("client bind");
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");
        server.handle_request(bytes, client.local_addr().expect("client addr"));
        let mut buf = [0u8; 4096];
        let (len, _) = client.recv_from(&mut buf).expect("response");
        buf[..len].to_vec()
    }

    #[test]
    fn test_ping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = test_server(dir.path().join("settings.ini"));
        assert_eq!(request(&server, &[0xE5, 0x01]), vec![0xE6, 0x01]);
    }

    #[test]
    fn test_version_padded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = test_server(dir.path().join("settings.ini"));
        let response = request(&server, &[0xE5, 0x02]);
        assert_eq!(response.len(), 2 + MGMT_VERSION_LEN);
        assert_eq!(&response[..2], &[0xE6, 0x02]);
        let text = String::from_utf8_lossy(&response[2..]);
        assert!(text.trim_end_matches('\0').starts_with(char::is_numeric));
    }

    #[test]
    fn test_set_host_name_applies_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.ini");
        let config = Arc::new(RuntimeConfig::new());
        let server = MgmtServer::bind(
            0,
            Arc::clone(&config),
            path.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .expect("bind");

        let mut req = vec![0xE5, 0x03];
        req.extend_from_slice(b"Stage Left");
        let response = request(&server, &req);
        assert_eq!(response, vec![0xE6, 0x03]);
        assert_eq!(*config.host_name(), "Stage Left");

        let settings = Settings::load(&path).expect("persisted");
        assert_eq!(settings.get("idn_server", "name"), Some("Stage Left"));
    }

    #[test]
    fn test_get_settings_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = test_server(dir.path().join("nope.ini"));
        let response = request(&server, &[0xE5, 0x04]);
        assert_eq!(&response[..2], &[0xE6, 0x04]);
        assert_eq!(
            u16::from_be_bytes([response[2], response[3]]),
            SETTINGS_STATUS_NOT_FOUND
        );
    }

    #[test]
    fn test_get_settings_returns_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.ini");
        std::fs::write(&path, "[idn_server]\nname=Rig\n").expect("write");
        let server = test_server(path);
        let response = request(&server, &[0xE5, 0x04]);
        assert_eq!(
            u16::from_be_bytes([response[2], response[3]]),
            SETTINGS_STATUS_OK
        );
        let text = String::from_utf8_lossy(&response[4..]);
        assert!(text.contains("name=Rig"));
    }

    #[test]
    fn test_garbage_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = test_server(dir.path().join("settings.ini"));
        // Wrong magic: no response, so handle_request must simply return
        server.handle_request(&[0xAA, 0x01], "127.0.0.1:9".parse().expect("addr"));
        server.handle_request(&[0xE5], "127.0.0.1:9".parse().expect("addr"));
    }
}
