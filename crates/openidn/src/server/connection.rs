// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Network-level peer binding: one connection per remote endpoint and
//! client group, carrying sequence validation state and the input event
//! accumulator.
//!
//! Sequence anomalies are recorded but never cause a drop - realtime
//! streaming trumps ordering, the client learns about gaps through the
//! acknowledgement flags.

use super::events::InputEvents;
use super::session::Session;
use crate::protocol::constants::{
    IEV_SEQERR_DUPLICATE, IEV_SEQERR_MISSING, IEV_SEQERR_NOT_INCREMENTED,
};
use std::net::SocketAddr;

/// One remote client endpoint.
pub struct Connection {
    pub addr: SocketAddr,
    pub client_group: u8,
    pub log_ident: String,
    /// Monotonic microseconds of the last received packet.
    pub input_time_us: u32,
    pub input_events: InputEvents,
    pub session: Session,
    sequence_valid: bool,
    next_sequence: u16,
    seq_error_count: u32,
}

impl Connection {
    pub fn new(addr: SocketAddr, client_group: u8, now_us: u32) -> Self {
        let log_ident = format!("{}#{}", addr, client_group);
        let session = Session::new(&log_ident);
        Connection {
            addr,
            client_group,
            log_ident,
            input_time_us: now_us,
            input_events: InputEvents::default(),
            session,
            sequence_valid: false,
            next_sequence: 0,
            seq_error_count: 0,
        }
    }

    pub fn matches(&self, addr: &SocketAddr, client_group: u8) -> bool {
        self.addr == *addr && self.client_group == client_group
    }

    /// Validate a packet sequence number against the expected one.
    ///
    /// Non-strict: anomalies latch their flag and the stream resynchronizes
    /// to the received number. Kind 1 = not incremented by one, kind 2 =
    /// duplicate, kind 3 = gap (missing packets).
    pub fn validate_sequence(&mut self, sequence: u16) {
        if !self.sequence_valid {
            self.sequence_valid = true;
            self.next_sequence = sequence.wrapping_add(1);
            return;
        }

        if sequence == self.next_sequence {
            self.next_sequence = sequence.wrapping_add(1);
            return;
        }

        self.seq_error_count += 1;
        let delta = sequence.wrapping_sub(self.next_sequence) as i16;
        if delta > 0 {
            self.input_events
                .latch(IEV_SEQERR_NOT_INCREMENTED | IEV_SEQERR_MISSING);
        } else if delta == -1 {
            self.input_events.latch(IEV_SEQERR_DUPLICATE);
        } else {
            self.input_events.latch(IEV_SEQERR_NOT_INCREMENTED);
        }

        // Resynchronize; the stream continues either way
        self.next_sequence = sequence.wrapping_add(1);
    }

    pub fn sequence_error_count(&self) -> u32 {
        self.seq_error_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_connection() -> Connection {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        Connection::new(addr, 0, 0)
    }

    #[test]
    fn test_first_sequence_accepted_unchecked() {
        let mut conn = test_connection();
        conn.validate_sequence(0x1234);
        assert_eq!(conn.input_events.peek(), 0);
    }

    #[test]
    fn test_monotonic_sequence_clean() {
        let mut conn = test_connection();
        for seq in 100..200u16 {
            conn.validate_sequence(seq);
        }
        assert_eq!(conn.input_events.peek(), 0);
        assert_eq!(conn.sequence_error_count(), 0);
    }

    #[test]
    fn test_sequence_wraparound_clean() {
        let mut conn = test_connection();
        conn.validate_sequence(0xFFFE);
        conn.validate_sequence(0xFFFF);
        conn.validate_sequence(0x0000);
        conn.validate_sequence(0x0001);
        assert_eq!(conn.input_events.peek(), 0);
    }

    #[test]
    fn test_gap_latches_missing() {
        let mut conn = test_connection();
        conn.validate_sequence(1);
        conn.validate_sequence(5);
        let flags = conn.input_events.take();
        assert_ne!(flags & IEV_SEQERR_MISSING, 0);
        assert_ne!(flags & IEV_SEQERR_NOT_INCREMENTED, 0);
    }

    #[test]
    fn test_duplicate_latches_duplicate() {
        let mut conn = test_connection();
        conn.validate_sequence(1);
        conn.validate_sequence(1);
        assert_ne!(conn.input_events.take() & IEV_SEQERR_DUPLICATE, 0);
    }

    #[test]
    fn test_resync_after_anomaly() {
        let mut conn = test_connection();
        conn.validate_sequence(1);
        conn.validate_sequence(10);
        conn.input_events.take();
        // Stream resynchronized at 10, so 11 is clean
        conn.validate_sequence(11);
        assert_eq!(conn.input_events.peek(), 0);
    }
}
