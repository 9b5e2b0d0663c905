// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Driver loop: plays slice queues against the DAC adapter and keeps its
//! in-flight buffer near the configured fill depth.
//!
//! The loop swaps queues out of the BEX, writes each slice with the
//! playback duration scaled by a speed factor, and reacts to the three
//! activity modes:
//!
//! - WAVE: slices are consumed once; a proportional controller nudges the
//!   speed factor so the buffered playback time stays near the target.
//! - FRAME: slices cycle back into the queue so the image repeats until a
//!   new frame replaces it (play-once slices are not recycled).
//! - INACTIVE / underrun: the beam parks on the safe center point.
//!
//! Speed control rationale: keeping the downstream buffer near center
//! minimizes underrun probability (visible as flicker) without racing
//! ahead and draining the upstream stream.

use crate::adapter::DacAdapter;
use crate::bex::Bex;
use crate::config::{
    RuntimeConfig, EMPTY_POINT_DURATION_US, INACTIVE_SLEEP_NS, SPEED_HYSTERESIS_MS,
    UNDERRUN_SLEEP_NS,
};
use crate::protocol::constants::PEV_DVIERR;
use crate::server::events::DeviceEventSink;
use crate::types::{DriverMode, Point, Slice, SliceQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Low-pass smoothing weight of the speed control law.
const SPEED_SMOOTHING: f64 = 5.0;
/// Proportional gain of the speed control law.
const SPEED_GAIN: f64 = 0.3;
/// Integral gain; reserved, currently nullified.
const SPEED_INTEGRAL_GAIN: f64 = 0.0;

/// Once-per-second playback statistics, reported at debug verbosity.
#[derive(Default)]
struct Stats {
    slices_written: u32,
    points_written: u64,
    write_time_us: u64,
    buffer_usage_sum: f64,
    buffer_usage_samples: u32,
}

impl Stats {
    fn clear(&mut self) {
        *self = Stats::default();
    }
}

/// Playback driver for one hardware output.
pub struct Driver {
    bex: Arc<Bex>,
    adapter: Arc<dyn DacAdapter>,
    config: Arc<RuntimeConfig>,
    device_events: Arc<DeviceEventSink>,
    shutdown: Arc<AtomicBool>,
    speed_factor: f64,
    accum_oc: f64,
    stats: Stats,
}

impl Driver {
    pub fn new(
        bex: Arc<Bex>,
        adapter: Arc<dyn DacAdapter>,
        config: Arc<RuntimeConfig>,
        device_events: Arc<DeviceEventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Driver {
            bex,
            adapter,
            config,
            device_events,
            shutdown,
            speed_factor: 1.0,
            accum_oc: 0.0,
            stats: Stats::default(),
        }
    }

    /// Run until shutdown. Parks the beam before returning so an
    /// interrupted write never leaves the laser active.
    pub fn run(&mut self) {
        let mut current: Box<SliceQueue> = Box::default();
        let mut underrun_logged = false;
        let mut last_report = Instant::now();

        log::info!("[DRV] driver loop started (adapter: {})", self.adapter.name());

        while !self.shutdown.load(Ordering::Relaxed) {
            if last_report.elapsed() >= Duration::from_secs(1) {
                self.report_stats();
                last_report = Instant::now();
            }

            let mode = self.bex.mode();
            match self.bex.driver_swap_request() {
                Some(next) if !next.is_empty() => {
                    current = next;
                    match mode {
                        DriverMode::Wave => {
                            self.speed_factor = self.calculate_speed_factor(&current);
                        }
                        _ => self.speed_factor = 1.0,
                    }
                }
                _ => {
                    if current.is_empty() || mode != DriverMode::Frame {
                        // Underrun (WAVE) or inactivity: park the beam
                        if !underrun_logged && mode == DriverMode::Wave {
                            log::debug!("[DRV] wave underrun, parking beam");
                        }
                        underrun_logged = true;
                        self.emit_empty_point();
                        thread::sleep(Duration::from_nanos(UNDERRUN_SLEEP_NS));
                        if mode == DriverMode::Inactive {
                            self.accum_oc = 0.0;
                            current.clear();
                            thread::sleep(Duration::from_nanos(INACTIVE_SLEEP_NS));
                        }
                        continue;
                    }
                    // FRAME keeps replaying the current queue
                }
            }
            underrun_logged = false;

            // Rotate through the queue once
            let queue_len = current.len();
            for _ in 0..queue_len {
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Some(slice) = current.pop_front() else {
                    break;
                };

                // FRAME repeats until replaced; play-once slices drain out
                if mode == DriverMode::Frame && !slice.once {
                    current.push_back(slice.clone());
                }

                self.write_slice(&slice, queue_len);
            }
        }

        self.emit_empty_point();
        log::info!("[DRV] driver loop stopped");
    }

    fn write_slice(&mut self, slice: &Slice, queue_len: usize) {
        let started = Instant::now();
        let scaled_us = self.speed_factor * slice.duration_us;
        if let Err(err) = self.adapter.write_frame(slice, scaled_us) {
            // Device irregularity: skip the slice, keep streaming
            self.device_events.latch(PEV_DVIERR);
            log::warn!("[DRV] write_frame failed, slice skipped: {}", err);
            return;
        }

        self.stats.slices_written += 1;
        self.stats.points_written +=
            slice.data.len() as u64 / u64::from(self.adapter.bytes_per_point());
        self.stats.write_time_us += started.elapsed().as_micros() as u64;
        self.stats.buffer_usage_sum += queue_len as f64 * slice.duration_us / 1000.0;
        self.stats.buffer_usage_samples += 1;
    }

    /// Proportional speed control with hysteresis and low-pass smoothing.
    ///
    /// `off_center` is the normalized distance of the buffered playback
    /// time from the setpoint; inside the hysteresis band it counts as
    /// zero. The integral accumulator is kept but currently weighted out.
    fn calculate_speed_factor(&mut self, queue: &SliceQueue) -> f64 {
        let Some(front) = queue.front() else {
            return 1.0;
        };

        let target_ms = self.config.buffer_target_ms();
        let usage_ms = queue.len() as f64 * front.duration_us / 1000.0;
        let mut off_center = (target_ms - usage_ms) / target_ms;
        let hysteresis = SPEED_HYSTERESIS_MS / target_ms;
        if off_center.abs() < hysteresis {
            off_center = 0.0;
        }
        self.accum_oc += off_center;

        let raw = 1.0 + SPEED_GAIN * off_center + SPEED_INTEGRAL_GAIN * self.accum_oc;
        let smoothed = (raw + (SPEED_SMOOTHING - 1.0) * self.speed_factor) / SPEED_SMOOTHING;

        let (min, max) = self.config.speed_factor_band();
        let clamped = smoothed.clamp(min, max);
        log::trace!(
            "[DRV] speed control: usage {:.2} ms, target {:.2} ms, factor {:.3}",
            usage_ms,
            target_ms,
            clamped
        );
        clamped
    }

    /// Write the safe parked-beam point (center position, emitters off).
    pub fn emit_empty_point(&self) {
        let data = self.adapter.convert_points(&[Point::center()]);
        let slice = Slice {
            data,
            duration_us: EMPTY_POINT_DURATION_US,
            once: false,
        };
        if let Err(err) = self.adapter.write_frame(&slice, slice.duration_us) {
            self.device_events.latch(PEV_DVIERR);
            log::warn!("[DRV] empty point write failed: {}", err);
        }
    }

    fn report_stats(&mut self) {
        if !log::log_enabled!(log::Level::Debug) {
            self.stats.clear();
            return;
        }
        if self.stats.slices_written > 0 {
            let kpps = if self.stats.write_time_us > 0 {
                1000.0 * self.stats.points_written as f64 / self.stats.write_time_us as f64
            } else {
                0.0
            };
            let usage = if self.stats.buffer_usage_samples > 0 {
                self.stats.buffer_usage_sum / f64::from(self.stats.buffer_usage_samples)
            } else {
                0.0
            };
            log::debug!(
                "[DRV] {:?}: {:.2} kpps, {:.2} ms buffered, speed {:.3}",
                self.bex.mode(),
                kpps,
                usage,
                self.speed_factor
            );
        }
        self.stats.clear();
    }
}
