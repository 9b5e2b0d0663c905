// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Dummy adapter: full pipeline exercise without hardware.
//!
//! Encodes points in the 20-byte DB25 register layout (address nibble plus
//! a 12-bit value spread over three bytes per channel) and paces
//! `write_frame` to the requested duration so the driver loop experiences
//! realistic timing.

use super::{DacAdapter, TX_UNLIMITED};
use crate::types::{Point, Slice};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

const BYTES_PER_POINT: usize = 20;

/// Hardware-free adapter used as the default output.
pub struct DummyAdapter {
    max_pointrate: AtomicU32,
}

impl DummyAdapter {
    pub fn new() -> Self {
        DummyAdapter {
            max_pointrate: AtomicU32::new(u32::MAX),
        }
    }

    /// One channel in the DB25 register layout: address nibble in the
    /// second byte's high bits, 12-bit value spread over the low bytes.
    fn encode_channel(out: &mut Vec<u8>, prefix: u8, address: u8, value: u16) {
        out.push(prefix);
        out.push((address << 4) | ((value >> 12) as u8 & 0x0F));
        out.push((value >> 4) as u8);
        out.push(((value & 0x000F) << 4) as u8);
    }
}

impl Default for DummyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DacAdapter for DummyAdapter {
    fn convert_points(&self, points: &[Point]) -> Vec<u8> {
        let mut out = Vec::with_capacity(points.len() * BYTES_PER_POINT);
        for point in points {
            Self::encode_channel(&mut out, 0x00, 0x0, point.x);
            Self::encode_channel(&mut out, 0x00, 0x1, point.y);
            Self::encode_channel(&mut out, 0x00, 0x2, point.r);
            Self::encode_channel(&mut out, 0x00, 0x3, point.g);
            // Last channel of the point carries the latch marker
            Self::encode_channel(&mut out, 0x02, 0x4, point.b);
        }
        out
    }

    fn bytes_per_point(&self) -> u32 {
        BYTES_PER_POINT as u32
    }

    fn max_bytes_per_transmission(&self) -> u32 {
        TX_UNLIMITED
    }

    fn max_pointrate(&self) -> u32 {
        self.max_pointrate.load(Ordering::Relaxed)
    }

    fn set_max_pointrate(&self, pps: u32) {
        self.max_pointrate.store(pps, Ordering::Relaxed);
    }

    fn write_frame(&self, _slice: &Slice, duration_us: f64) -> io::Result<()> {
        // No device to feed; just honor the playback cadence
        if duration_us > 0.0 {
            thread::sleep(Duration::from_micros(duration_us as u64));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "Dummy"
    }
}
