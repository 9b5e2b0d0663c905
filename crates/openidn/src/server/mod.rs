// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! IDN server front end: the UDP port 7255 receive loop, discovery
//! responses and realtime packet dispatch.
//!
//! One network thread owns everything here - the socket, the connection
//! list, every session and the shaper. The driver thread is reached only
//! through the BEX, so no session state ever needs cross-thread locking.

pub mod connection;
pub mod events;
pub mod service;
pub mod session;

pub use connection::Connection;
pub use service::{DecoderMode, ResolvedService, ServiceEntry, ServiceRegistry};
pub use session::{Session, SessionState};

use crate::adapter::DacAdapter;
use crate::bex::Bex;
use crate::config::{
    RuntimeConfig, IDN_HELLO_UDP_PORT, LINK_TIMEOUT_US, MAX_DATAGRAM_LEN, NAME_FIELD_LEN,
    RECV_TIMEOUT_US, SESSION_TIMEOUT_US,
};
use crate::error::Error;
use crate::protocol::constants::{
    CMD_PING_REQUEST, CMD_PING_RESPONSE, CMD_RT_ABORT, CMD_RT_ACKNOWLEDGE, CMD_RT_CNLMSG,
    CMD_RT_CNLMSG_ACKREQ, CMD_RT_CNLMSG_CLOSE, CMD_RT_CNLMSG_CLOSE_ACKREQ, CMD_SCAN_REQUEST,
    CMD_SCAN_RESPONSE, CMD_SERVICEMAP_REQUEST, CMD_SERVICEMAP_RESPONSE, IEV_MVERR, IEV_NEW,
    MAPENTRY_FLAG_DEFAULT, PKTFLAGS_GROUP_MASK, RTACK_ERR_PAYLOAD, RTACK_STRUCT_LEN,
    RTACK_SUCCESS, SCAN_PROTOCOL_VERSION, SCAN_STATUS_REALTIME, SERVICEMAP_ENTRY_LEN, STS_DOBUF,
    STS_SOCNL, UNITID_CATEGORY_MAC, UNITID_FIELD_LEN,
};
use crate::server::events::DeviceEventSink;
use crate::shaper::Shaper;
use crate::types::DriverMode;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic microsecond clock shared by the server's timeout logic.
///
/// Wraps at u32 range (about 71 minutes); all comparisons use wrapping
/// differences, so the wrap is harmless.
pub struct MonoClock {
    base: Instant,
}

impl MonoClock {
    pub fn new() -> Self {
        MonoClock {
            base: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u32 {
        self.base.elapsed().as_micros() as u32
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The network-side output pipeline: shaper plus the shared hand-off and
/// adapter handles. Owned by the network thread.
pub struct Pipeline {
    pub shaper: Shaper,
    pub bex: Arc<Bex>,
    pub adapter: Arc<dyn DacAdapter>,
    pub device_events: Arc<DeviceEventSink>,
}

impl Pipeline {
    pub fn new(
        adapter: Arc<dyn DacAdapter>,
        bex: Arc<Bex>,
        device_events: Arc<DeviceEventSink>,
        chunk_length_us: f64,
    ) -> Self {
        Pipeline {
            shaper: Shaper::new(chunk_length_us),
            bex,
            adapter,
            device_events,
        }
    }
}

/// IDN-Hello streaming server.
pub struct IdnServer {
    socket: UdpSocket,
    config: Arc<RuntimeConfig>,
    services: ServiceRegistry,
    pipeline: Pipeline,
    clock: MonoClock,
    unit_mac: [u8; 6],
    connections: Vec<Connection>,
    /// Sessions whose connection is gone but whose output still drains,
    /// paired with the detach timestamp.
    detached: Vec<(Session, u32)>,
    shutdown: Arc<AtomicBool>,
    recv_buf: Vec<u8>,
}

impl IdnServer {
    /// Bind the streaming socket. Pass port 0 for an ephemeral port
    /// (tests); production uses [`IDN_HELLO_UDP_PORT`].
    pub fn bind(
        port: u16,
        config: Arc<RuntimeConfig>,
        adapter: Arc<dyn DacAdapter>,
        bex: Arc<Bex>,
        device_events: Arc<DeviceEventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let socket = bind_udp(port)?;
        let services = ServiceRegistry::laser_projector(adapter.name());
        let pipeline = Pipeline::new(adapter, bex, device_events, config.chunk_length_us());
        let unit_mac = primary_mac();

        log::info!(
            "[IDN] listening on {} (unit {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x})",
            socket.local_addr()?,
            unit_mac[0],
            unit_mac[1],
            unit_mac[2],
            unit_mac[3],
            unit_mac[4],
            unit_mac[5]
        );

        Ok(IdnServer {
            socket,
            config,
            services,
            pipeline,
            clock: MonoClock::new(),
            unit_mac,
            connections: Vec::new(),
            detached: Vec::new(),
            shutdown,
            recv_buf: vec![0u8; MAX_DATAGRAM_LEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Default bind on the well-known port.
    pub fn port() -> u16 {
        IDN_HELLO_UDP_PORT
    }

    /// Receive loop; returns when the shutdown flag is raised.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let mut buf = std::mem::take(&mut self.recv_buf);
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    self.handle_datagram(&buf[..len], peer);
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => {
                    log::warn!("[IDN] recv error: {}", err);
                }
            }
            self.recv_buf = buf;
            self.sweep(self.clock.now_us());
        }
        log::info!("[IDN] server loop stopped");
    }

    /// Parse and dispatch one datagram. Malformed packets are dropped.
    pub fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        let mut cursor = crate::protocol::Cursor::new(datagram);
        let (command, flags, sequence) = match (
            cursor.read_u8(),
            cursor.read_u8(),
            cursor.read_u16(),
        ) {
            (Ok(command), Ok(flags), Ok(sequence)) => (command, flags, sequence),
            _ => {
                log::debug!("[IDN] short packet from {} dropped", peer);
                return;
            }
        };

        match command {
            CMD_PING_REQUEST => self.send_ping_response(sequence, cursor.rest(), peer),
            CMD_SCAN_REQUEST => self.send_scan_response(sequence, peer),
            CMD_SERVICEMAP_REQUEST => self.send_servicemap_response(sequence, peer),
            CMD_RT_CNLMSG | CMD_RT_CNLMSG_ACKREQ | CMD_RT_CNLMSG_CLOSE
            | CMD_RT_CNLMSG_CLOSE_ACKREQ | CMD_RT_ABORT => {
                self.handle_rt(command, flags, sequence, &mut cursor, peer);
            }
            other => {
                // Unknown commands are ignored, not an error
                log::debug!("[IDN] unknown command {:#04x} from {}", other, peer);
            }
        }
    }

    // ===== Discovery responses =====

    fn send_ping_response(&self, sequence: u16, payload: &[u8], peer: SocketAddr) {
        let mut buf = vec![0u8; 4 + payload.len()];
        let mut writer = crate::protocol::CursorMut::new(&mut buf);
        let ok = writer.write_u8(CMD_PING_RESPONSE).is_ok()
            && writer.write_u8(0).is_ok()
            && writer.write_u16(sequence).is_ok()
            && writer.write_bytes(payload).is_ok();
        if ok {
            self.send_response(&buf, peer);
        }
    }

    fn send_scan_response(&self, sequence: u16, peer: SocketAddr) {
        let mut buf = [0u8; 4 + 40];
        let mut writer = crate::protocol::CursorMut::new(&mut buf);

        // Unit ID field: length, category, EUI-48, zero padded
        let mut unit_id = [0u8; UNITID_FIELD_LEN];
        unit_id[0] = 7;
        unit_id[1] = UNITID_CATEGORY_MAC;
        unit_id[2..8].copy_from_slice(&self.unit_mac);

        let host_name = self.config.host_name();
        let ok = writer.write_u8(CMD_SCAN_RESPONSE).is_ok()
            && writer.write_u8(0).is_ok()
            && writer.write_u16(sequence).is_ok()
            && writer.write_u8(40).is_ok() // struct size
            && writer.write_u8(SCAN_PROTOCOL_VERSION).is_ok()
            && writer.write_u8(SCAN_STATUS_REALTIME).is_ok()
            && writer.write_u8(0).is_ok() // reserved
            && writer.write_bytes(&unit_id).is_ok()
            && writer
                .write_name_field(host_name.as_bytes(), NAME_FIELD_LEN)
                .is_ok();
        if ok {
            self.send_response(&buf, peer);
        }
    }

    fn send_servicemap_response(&self, sequence: u16, peer: SocketAddr) {
        let entries = self.services.entries();
        let mut buf = vec![0u8; 4 + 4 + entries.len() * usize::from(SERVICEMAP_ENTRY_LEN)];
        let mut writer = crate::protocol::CursorMut::new(&mut buf);

        let mut ok = writer.write_u8(CMD_SERVICEMAP_RESPONSE).is_ok()
            && writer.write_u8(0).is_ok()
            && writer.write_u16(sequence).is_ok()
            && writer.write_u8(4).is_ok() // struct size
            && writer.write_u8(SERVICEMAP_ENTRY_LEN).is_ok()
            && writer.write_u8(0).is_ok() // relay entries
            && writer.write_u8(entries.len() as u8).is_ok();

        for entry in entries {
            let flags = if entry.default_service {
                MAPENTRY_FLAG_DEFAULT
            } else {
                0
            };
            ok = ok
                && writer.write_u8(entry.service_id).is_ok()
                && writer.write_u8(entry.service_type).is_ok()
                && writer.write_u8(flags).is_ok()
                && writer.write_u8(0).is_ok() // relay number: root
                && writer
                    .write_name_field(entry.name.as_bytes(), NAME_FIELD_LEN)
                    .is_ok();
        }
        if ok {
            self.send_response(&buf, peer);
        }
    }

    fn send_response(&self, buf: &[u8], peer: SocketAddr) {
        if let Err(err) = self.socket.send_to(buf, peer) {
            log::debug!("[IDN] response to {} failed: {}", peer, err);
        }
    }

    // ===== Realtime dispatch =====

    fn handle_rt(
        &mut self,
        command: u8,
        flags: u8,
        sequence: u16,
        cursor: &mut crate::protocol::Cursor<'_>,
        peer: SocketAddr,
    ) {
        let client_group = flags & PKTFLAGS_GROUP_MASK;
        let now = self.clock.now_us();

        let index = match self
            .connections
            .iter()
            .position(|c| c.matches(&peer, client_group))
        {
            Some(index) => index,
            None => {
                let mut connection = Connection::new(peer, client_group, now);
                connection.input_events.latch(IEV_NEW);
                log::info!("[IDN] client connected: {}", connection.log_ident);
                self.connections.push(connection);
                self.connections.len() - 1
            }
        };

        let IdnServer {
            ref socket,
            ref mut connections,
            ref services,
            ref mut pipeline,
            ..
        } = *self;
        let connection = &mut connections[index];
        connection.input_time_us = now;
        connection.validate_sequence(sequence);

        if command == CMD_RT_ABORT {
            log::info!("[IDN] {}: abort", connection.log_ident);
            connection.session.cancel_immediately(pipeline);
            connections.swap_remove(index);
            return;
        }

        let mut result_code = RTACK_SUCCESS;
        let mut ack_channel = 0u8;
        if cursor.remaining() > 0 {
            match connection.session.process_channel_message(
                cursor,
                services,
                pipeline,
                &mut connection.input_events,
            ) {
                Ok(outcome) => ack_channel = outcome.channel_id,
                Err(err) => {
                    log::debug!(
                        "[IDN] {}: malformed channel message: {}",
                        connection.log_ident,
                        err
                    );
                    connection.input_events.latch(IEV_MVERR);
                    result_code = RTACK_ERR_PAYLOAD;
                }
            }
        }

        if command == CMD_RT_CNLMSG_CLOSE || command == CMD_RT_CNLMSG_CLOSE_ACKREQ {
            connection.session.cancel_gracefully();
        }

        if command == CMD_RT_CNLMSG_ACKREQ || command == CMD_RT_CNLMSG_CLOSE_ACKREQ {
            let input_flags = connection.input_events.take();
            let pipeline_flags = connection.session.take_pipeline_events(ack_channel)
                | pipeline.device_events.take();
            let mut status = 0u8;
            if connection.session.has_open_channels() {
                status |= STS_SOCNL;
            }
            if pipeline.bex.has_buffered_frame() {
                status |= STS_DOBUF;
            }

            let mut buf = [0u8; 16];
            let mut writer = crate::protocol::CursorMut::new(&mut buf);
            let ok = writer.write_u8(CMD_RT_ACKNOWLEDGE).is_ok()
                && writer.write_u8(0).is_ok()
                && writer.write_u16(sequence).is_ok()
                && writer.write_u8(RTACK_STRUCT_LEN).is_ok()
                && writer.write_u8(result_code).is_ok()
                && writer.write_u16(input_flags).is_ok()
                && writer.write_u16(pipeline_flags).is_ok()
                && writer.write_u8(status).is_ok()
                && writer.write_u8(0).is_ok() // link quality: unknown
                && writer.write_u32(0).is_ok(); // latency: unknown
            if ok {
                if let Err(err) = socket.send_to(&buf, peer) {
                    log::debug!("[IDN] acknowledge to {} failed: {}", peer, err);
                }
            }
        }
    }

    // ===== Teardown sweep =====

    /// Apply link/session timeouts and finalize draining sessions.
    fn sweep(&mut self, now: u32) {
        let IdnServer {
            ref mut connections,
            ref mut detached,
            ref mut pipeline,
            ..
        } = *self;

        // Closing sessions on live connections: park once drained
        for connection in connections.iter_mut() {
            if connection.session.state() == SessionState::Closing
                && !pipeline.bex.has_buffered_frame()
            {
                pipeline.shaper.reset();
                pipeline.bex.set_mode(DriverMode::Inactive);
                connection.session.set_state(SessionState::Abandoned);
            }
        }

        // Link timeouts
        let mut index = 0;
        while index < connections.len() {
            let idle = now.wrapping_sub(connections[index].input_time_us);
            if idle < LINK_TIMEOUT_US {
                index += 1;
                continue;
            }

            let mut connection = connections.swap_remove(index);
            log::info!("[IDN] {}: link timeout", connection.log_ident);
            if connection.session.has_open_channels() || pipeline.bex.has_buffered_frame() {
                // Output still draining: keep the session around
                connection.session.cancel_gracefully();
                connection.session.set_state(SessionState::Detached);
                detached.push((connection.session, now));
            } else {
                pipeline.shaper.reset();
                pipeline.bex.set_mode(DriverMode::Inactive);
            }
        }

        // Detached sessions: reap once drained or timed out
        detached.retain_mut(|(session, since)| {
            let drained = !pipeline.bex.has_buffered_frame();
            let expired = now.wrapping_sub(*since) >= SESSION_TIMEOUT_US;
            if drained || expired {
                log::info!("[IDN] {}: session reaped", session.log_ident());
                pipeline.shaper.reset();
                pipeline.bex.set_mode(DriverMode::Inactive);
                session.set_state(SessionState::Abandoned);
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub(crate) fn force_input_time(&mut self, delta_us: u32) {
        for connection in &mut self.connections {
            connection.input_time_us = connection.input_time_us.wrapping_sub(delta_us);
        }
    }

    #[cfg(test)]
    pub(crate) fn run_sweep(&mut self) {
        self.sweep(self.clock.now_us());
    }
}

/// Bind a UDP socket with address reuse and the short receive timeout the
/// cancellation model requires.
fn bind_udp(port: u16) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Io)?;
    socket.set_reuse_address(true).map_err(Error::Io)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(|_| Error::BindFailed(addr.to_string()))?;
    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(Duration::from_micros(RECV_TIMEOUT_US)))
        .map_err(Error::Io)?;
    Ok(socket)
}

/// EUI-48 of the first non-loopback interface; zeros when none is found.
fn primary_mac() -> [u8; 6] {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                if entry.file_name() == "lo" {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(entry.path().join("address")) else {
                    continue;
                };
                let mut mac = [0u8; 6];
                let mut parsed = 0;
                for (slot, part) in mac.iter_mut().zip(text.trim().split(':')) {
                    let Ok(byte) = u8::from_str_radix(part, 16) else {
                        break;
                    };
                    *slot = byte;
                    parsed += 1;
                }
                if parsed == 6 && mac.iter().any(|&b| b != 0) {
                    return mac;
                }
            }
        }
    }
    [0u8; 6]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DummyAdapter;

    fn test_server() -> IdnServer {
        let config = Arc::new(RuntimeConfig::new());
        let adapter: Arc<dyn DacAdapter> = Arc::new(DummyAdapter::new());
        IdnServer::bind(
            0,
            config,
            adapter,
            Arc::new(Bex::new()),
            Arc::new(DeviceEventSink::new()),
            Arc::new(AtomicBool::new(false)),
        )
        .expect("bind ephemeral")
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:45000".parse().expect("addr")
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server = test_server();
        assert_ne!(server.local_addr().expect("addr").port(), 0);
    }

    #[test]
    fn test_rt_message_creates_connection() {
        let mut server = test_server();
        // Keepalive: header only
        server.handle_datagram(&[0x40, 0x00, 0x00, 0x01], peer());
        assert_eq!(server.connection_count(), 1);

        // Same endpoint+group reuses the connection
        server.handle_datagram(&[0x40, 0x00, 0x00, 0x02], peer());
        assert_eq!(server.connection_count(), 1);

        // Different client group is a different connection
        server.handle_datagram(&[0x40, 0x03, 0x00, 0x01], peer());
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn test_abort_removes_connection() {
        let mut server = test_server();
        server.handle_datagram(&[0x40, 0x00, 0x00, 0x01], peer());
        assert_eq!(server.connection_count(), 1);
        server.handle_datagram(&[0x46, 0x00, 0x00, 0x02], peer());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_unknown_command_ignored() {
        let mut server = test_server();
        server.handle_datagram(&[0x7F, 0x00, 0x00, 0x01], peer());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_short_packet_dropped() {
        let mut server = test_server();
        server.handle_datagram(&[0x40], peer());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_link_timeout_reaps_idle_connection() {
        let mut server = test_server();
        server.handle_datagram(&[0x40, 0x00, 0x00, 0x01], peer());
        assert_eq!(server.connection_count(), 1);

        // Age the connection past the link timeout and sweep
        server.force_input_time(LINK_TIMEOUT_US + 1);
        server.run_sweep();
        assert_eq!(server.connection_count(), 0);
    }
}
