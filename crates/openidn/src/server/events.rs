// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Latching event flag accumulators.
//!
//! Errors on the streaming path are not failures: they latch a flag bit and
//! the stream keeps running. The accumulated bits travel to the client in
//! the next acknowledgement response and clear on report.
//!
//! Input events live on the connection, pipeline events per channel. The
//! driver thread latches device irregularities through [`DeviceEventSink`]
//! (the only event state shared across threads).

use std::sync::atomic::{AtomicU16, Ordering};

/// Connection/session level event bits (`IEV_*` constants).
#[derive(Debug, Default)]
pub struct InputEvents(u16);

impl InputEvents {
    /// Latch flag bits.
    pub fn latch(&mut self, flags: u16) {
        self.0 |= flags;
    }

    /// Report and clear, acknowledgement semantics.
    pub fn take(&mut self) -> u16 {
        std::mem::take(&mut self.0)
    }

    pub fn peek(&self) -> u16 {
        self.0
    }
}

/// Per-channel pipeline event bits (`PEV_*` constants).
#[derive(Debug, Default)]
pub struct PipelineEvents(u16);

impl PipelineEvents {
    pub fn latch(&mut self, flags: u16) {
        self.0 |= flags;
    }

    pub fn take(&mut self) -> u16 {
        std::mem::take(&mut self.0)
    }

    pub fn peek(&self) -> u16 {
        self.0
    }
}

/// Pipeline events latched by the driver thread (device irregularities,
/// internal assertions). The network thread folds these into the next
/// acknowledgement it builds.
#[derive(Debug, Default)]
pub struct DeviceEventSink(AtomicU16);

impl DeviceEventSink {
    pub fn new() -> Self {
        DeviceEventSink(AtomicU16::new(0))
    }

    pub fn latch(&self, flags: u16) {
        self.0.fetch_or(flags, Ordering::Relaxed);
    }

    pub fn take(&self) -> u16 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{IEV_MVERR, IEV_NEW, PEV_DVIERR, PEV_ROUTED};

    #[test]
    fn test_latch_accumulates_until_taken() {
        let mut events = InputEvents::default();
        events.latch(IEV_NEW);
        events.latch(IEV_MVERR);
        assert_eq!(events.peek(), IEV_NEW | IEV_MVERR);
        assert_eq!(events.take(), IEV_NEW | IEV_MVERR);
        assert_eq!(events.take(), 0);
    }

    #[test]
    fn test_pipeline_events_clear_on_take() {
        let mut events = PipelineEvents::default();
        events.latch(PEV_ROUTED);
        assert_eq!(events.take(), PEV_ROUTED);
        assert_eq!(events.peek(), 0);
    }

    #[test]
    fn test_device_sink_cross_thread_semantics() {
        let sink = DeviceEventSink::new();
        sink.latch(PEV_DVIERR);
        sink.latch(PEV_DVIERR);
        assert_eq!(sink.take(), PEV_DVIERR);
        assert_eq!(sink.take(), 0);
    }
}
