// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! OpenIDN global configuration - single source of truth.
//!
//! This module centralizes the network constants and the runtime
//! configuration. **Never hardcode these elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (static)**: compile-time constants (ports, timeouts, control
//!   loop defaults)
//! - **Level 2 (dynamic)**: [`RuntimeConfig`] for values that change at
//!   runtime (host name via the management channel, tuning via CLI)
//!
//! # Performance
//!
//! Runtime values are read on the streaming path (host name excepted), so
//! all of them are lock-free: `ArcSwap` for the host name, atomics for the
//! numeric tunables. Readers never block writers and vice versa.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// =======================================================================
// Network constants (IDN-Hello specification)
// =======================================================================

/// UDP port for IDN-Hello streaming and discovery.
pub const IDN_HELLO_UDP_PORT: u16 = 7255;

/// UDP port for the vendor management channel.
pub const MGMT_UDP_PORT: u16 = 7355;

/// Largest datagram accepted on either port.
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// Socket read timeout. Short so cancellation is noticed quickly.
pub const RECV_TIMEOUT_US: u64 = 1000;

// =======================================================================
// Session/connection lifecycle (microseconds)
// =======================================================================

/// Connection/link inactivity timeout.
pub const LINK_TIMEOUT_US: u32 = 1_000_000;

/// Session inactivity timeout.
pub const SESSION_TIMEOUT_US: u32 = 1_000_000;

/// Number of channel slots per session.
pub const CHANNEL_COUNT: usize = 64;

// =======================================================================
// Driver defaults
// =======================================================================

/// Default WAVE slice target duration produced by the shaper.
pub const DEFAULT_CHUNK_LENGTH_US: f64 = 10_000.0;

/// Default fill-depth setpoint for the driver's speed control loop.
pub const DEFAULT_BUFFER_TARGET_MS: f64 = 40.0;

/// Hysteresis band around the buffer target where the speed error is
/// treated as zero.
pub const SPEED_HYSTERESIS_MS: f64 = 10.0;

/// Default playback speed-factor clamp.
///
/// A wider band ([0.01, 10.0]) existed historically; the tight band is the
/// current intent and the band is configurable through [`RuntimeConfig`].
pub const DEFAULT_SPEED_FACTOR_MIN: f64 = 0.83;
pub const DEFAULT_SPEED_FACTOR_MAX: f64 = 1.3;

/// Duration of the safe parked-beam point emitted on underrun/shutdown.
pub const EMPTY_POINT_DURATION_US: f64 = 1000.0;

/// Driver idle sleep on WAVE underrun.
pub const UNDERRUN_SLEEP_NS: u64 = 500_000;

/// Driver idle sleep while inactive.
pub const INACTIVE_SLEEP_NS: u64 = 2_000_000;

// =======================================================================
// Identity defaults
// =======================================================================

/// Default host name reported in scan responses (20-byte field, padded).
pub const DEFAULT_HOST_NAME: &str = "OpenIDN";

/// Scan response name field width.
pub const NAME_FIELD_LEN: usize = 20;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Runtime configuration shared across the network, driver and management
/// threads.
///
/// All accessors are lock-free. Numeric tunables use relaxed atomics (each
/// value is independently consistent); the host name uses an atomic Arc
/// swap so the scan-response path never takes a lock.
pub struct RuntimeConfig {
    host_name: ArcSwap<String>,
    chunk_length_us: AtomicU64,
    buffer_target_ms: AtomicU64,
    speed_factor_min: AtomicU64,
    speed_factor_max: AtomicU64,
    max_pointrate: AtomicU32,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            host_name: ArcSwap::from_pointee(DEFAULT_HOST_NAME.to_string()),
            chunk_length_us: AtomicU64::new(DEFAULT_CHUNK_LENGTH_US.to_bits()),
            buffer_target_ms: AtomicU64::new(DEFAULT_BUFFER_TARGET_MS.to_bits()),
            speed_factor_min: AtomicU64::new(DEFAULT_SPEED_FACTOR_MIN.to_bits()),
            speed_factor_max: AtomicU64::new(DEFAULT_SPEED_FACTOR_MAX.to_bits()),
            max_pointrate: AtomicU32::new(0),
        }
    }

    /// Current host name for scan responses.
    pub fn host_name(&self) -> Arc<String> {
        self.host_name.load_full()
    }

    /// Replace the host name (management subcommand 0x03). Truncated to the
    /// scan-response field width.
    pub fn set_host_name(&self, name: &str) {
        let mut name = name.to_string();
        name.truncate(NAME_FIELD_LEN);
        self.host_name.store(Arc::new(name));
    }

    /// WAVE slice target duration for the shaper.
    pub fn chunk_length_us(&self) -> f64 {
        f64::from_bits(self.chunk_length_us.load(Ordering::Relaxed))
    }

    pub fn set_chunk_length_us(&self, us: f64) {
        self.chunk_length_us.store(us.to_bits(), Ordering::Relaxed);
    }

    /// Driver speed-control setpoint in milliseconds of buffered output.
    pub fn buffer_target_ms(&self) -> f64 {
        f64::from_bits(self.buffer_target_ms.load(Ordering::Relaxed))
    }

    pub fn set_buffer_target_ms(&self, ms: f64) {
        self.buffer_target_ms.store(ms.to_bits(), Ordering::Relaxed);
    }

    /// Speed-factor clamp band applied by the driver.
    pub fn speed_factor_band(&self) -> (f64, f64) {
        (
            f64::from_bits(self.speed_factor_min.load(Ordering::Relaxed)),
            f64::from_bits(self.speed_factor_max.load(Ordering::Relaxed)),
        )
    }

    pub fn set_speed_factor_band(&self, min: f64, max: f64) {
        self.speed_factor_min.store(min.to_bits(), Ordering::Relaxed);
        self.speed_factor_max.store(max.to_bits(), Ordering::Relaxed);
    }

    /// CLI override for the adapter point-rate ceiling (0 = no override).
    pub fn max_pointrate(&self) -> u32 {
        self.max_pointrate.load(Ordering::Relaxed)
    }

    pub fn set_max_pointrate(&self, pps: u32) {
        self.max_pointrate.store(pps, Ordering::Relaxed);
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new();
        assert_eq!(*config.host_name(), "OpenIDN");
        assert_eq!(config.chunk_length_us(), DEFAULT_CHUNK_LENGTH_US);
        assert_eq!(config.buffer_target_ms(), DEFAULT_BUFFER_TARGET_MS);
        assert_eq!(config.speed_factor_band(), (0.83, 1.3));
        assert_eq!(config.max_pointrate(), 0);
    }

    #[test]
    fn test_host_name_truncated_to_field_width() {
        let config = RuntimeConfig::new();
        config.set_host_name("a-rather-long-projector-name");
        assert_eq!(config.host_name().len(), NAME_FIELD_LEN);
    }

    #[test]
    fn test_tunables_roundtrip() {
        let config = RuntimeConfig::new();
        config.set_chunk_length_us(5000.0);
        config.set_buffer_target_ms(25.0);
        config.set_speed_factor_band(0.5, 2.0);
        config.set_max_pointrate(30_000);

        assert_eq!(config.chunk_length_us(), 5000.0);
        assert_eq!(config.buffer_target_ms(), 25.0);
        assert_eq!(config.speed_factor_band(), (0.5, 2.0));
        assert_eq!(config.max_pointrate(), 30_000);
    }
}
