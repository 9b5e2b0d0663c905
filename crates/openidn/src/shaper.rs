// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Point-rate shaping and re-chunking between the decoder and the BEX.
//!
//! Decoded chunks arrive in whatever granularity the client chose; the
//! device wants transmissions bounded in duration and size, at a point rate
//! it can actually scan. The shaper downsamples when the incoming rate
//! exceeds the device ceiling and cuts the stream into slices:
//!
//! - WAVE: a slice closes when its target duration elapses or the next
//!   point would exceed the device's transmission size.
//! - FRAME: the frame is split into evenly sized slices only when the
//!   transmission size forces it; otherwise one slice per frame.
//!
//! Downsampling keeps a fractional skip accumulator so the dropped points
//! are spread evenly; dropped points still advance the slice clock, so
//! slice durations stay true to the source timeline.

use crate::adapter::{DacAdapter, TX_UNLIMITED};
use crate::bex::Bex;
use crate::types::{Chunk, ChunkMode, Point, Slice};
use std::sync::Arc;

/// Stream shaper owned by the network side of one output pipeline.
pub struct Shaper {
    accu: Vec<Point>,
    slice_time: f64,
    skip: f64,
    us_per_slice: f64,
}

impl Shaper {
    pub fn new(us_per_slice: f64) -> Self {
        Shaper {
            accu: Vec::new(),
            slice_time: us_per_slice,
            skip: 0.0,
            us_per_slice,
        }
    }

    /// Change the WAVE slice target duration. Takes effect from the next
    /// committed slice.
    pub fn set_us_per_slice(&mut self, us: f64) {
        self.us_per_slice = us;
    }

    /// Drop any partial slice and restart the slice clock (mode change,
    /// frame overrun, channel close).
    pub fn reset(&mut self) {
        self.accu.clear();
        self.slice_time = self.us_per_slice;
        self.skip = 0.0;
    }

    /// Shape one decoded chunk into device slices, appending them to the
    /// BEX. FRAME chunks are committed and published at the end.
    pub fn feed(&mut self, chunk: &Chunk, adapter: &dyn DacAdapter, bex: &Bex) {
        let count = chunk.points.len();
        if count == 0 || chunk.duration_us == 0 {
            return;
        }

        let is_wave = chunk.mode == ChunkMode::Wave;
        let once = chunk.mode == ChunkMode::FrameOnce;
        if !is_wave {
            // A new frame replaces whatever partial frame was accumulating
            self.reset();
        }

        let point_duration = f64::from(chunk.duration_us) / count as f64;
        let target_rate = 1_000_000.0 * count as f64 / f64::from(chunk.duration_us);
        let ratio = f64::from(adapter.max_pointrate()) / target_rate;

        let max_tx = adapter.max_bytes_per_transmission();
        let bytes_per_point = u64::from(adapter.bytes_per_point());

        // FRAME splitting: evenly sized slices, forced only by the
        // transmission limit
        let frame_slice_points = if !is_wave && max_tx != TX_UNLIMITED {
            let frame_bytes = count as u64 * bytes_per_point;
            let slices = frame_bytes.div_ceil(u64::from(max_tx)).max(1);
            Some((count as u64).div_ceil(slices) as usize)
        } else {
            None
        };

        for point in &chunk.points {
            if ratio < 1.0 {
                // Skip the point but keep its share of the timeline
                if self.skip >= ratio {
                    self.skip += ratio;
                    self.skip -= self.skip.floor();
                    self.slice_time -= point_duration;
                    continue;
                }
                self.skip += ratio;
                self.skip -= self.skip.floor();
            }

            self.accu.push(*point);
            self.slice_time -= point_duration;

            if is_wave {
                let next_bytes = bytes_per_point * (self.accu.len() as u64 + 1);
                if self.slice_time <= 0.0 || next_bytes > u64::from(max_tx) {
                    self.commit(adapter, bex, once);
                }
            } else if let Some(limit) = frame_slice_points {
                if self.accu.len() + 1 > limit {
                    self.commit(adapter, bex, once);
                }
            }
        }

        if !is_wave {
            // Push the final partial slice and hand the frame over
            self.commit(adapter, bex, once);
            bex.publish_reset();
        }
    }

    /// Encode the accumulated points into a slice and append it.
    fn commit(&mut self, adapter: &dyn DacAdapter, bex: &Bex, once: bool) {
        if self.accu.is_empty() {
            return;
        }
        let slice = Slice {
            data: adapter.convert_points(&self.accu),
            duration_us: self.us_per_slice - self.slice_time,
            once,
        };
        bex.append(Arc::new(slice));
        self.accu.clear();
        self.slice_time = self.us_per_slice;
    }
}
