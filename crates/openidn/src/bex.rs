// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Buffer exchange: the single-slot hand-off between the network thread
//! (producer) and the driver thread (consumer).
//!
//! Two slice queues exist at any time. The `hot` queue is writable by the
//! producer only; the `published` slot holds an atomic pointer the consumer
//! may take. Ownership of a queue transfers exclusively through the atomic
//! exchange, so neither side ever reads a queue the other is mutating.
//!
//! The producer side (and the rare mode changes) serialize on a small
//! mutex; the consumer's swap request is a single lock-free exchange.
//!
//! # WAVE publish protocol
//!
//! On append the producer publishes its hot queue and takes back whatever
//! the slot held. If the slot was empty the consumer took the previous
//! publication - but the queue just published predates this append's
//! bookkeeping, so the producer builds a replacement containing only the
//! new slice and exchanges again. Whatever that second exchange returns
//! (null, or the stale queue the consumer never saw) the producer ends up
//! holding a hot queue that contains the new slice, and the consumer can
//! only ever observe a fully-written queue at most one append behind.

use crate::types::{DriverMode, Slice, SliceQueue};
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

struct ProducerState {
    hot: Box<SliceQueue>,
    mode: DriverMode,
}

/// Lock-free network-to-driver buffer exchange.
pub struct Bex {
    state: Mutex<ProducerState>,
    /// Null, or a queue visible to (and takeable by) the consumer.
    published: AtomicPtr<SliceQueue>,
    /// Mirror of "published holds slices", readable from any thread
    /// without touching the pointer (the consumer frees queues without
    /// taking the producer lock, so peeking through the pointer from
    /// another thread would race the free).
    frame_ready: AtomicBool,
}

impl Bex {
    pub fn new() -> Self {
        Bex {
            state: Mutex::new(ProducerState {
                hot: Box::default(),
                mode: DriverMode::Inactive,
            }),
            published: AtomicPtr::new(Box::into_raw(Box::default())),
            frame_ready: AtomicBool::new(false),
        }
    }

    /// Current driver mode.
    pub fn mode(&self) -> DriverMode {
        self.state.lock().mode
    }

    /// Switch driver mode. Any actual change clears both queues so WAVE and
    /// FRAME sample types never mix.
    pub fn set_mode(&self, mode: DriverMode) {
        let mut state = self.state.lock();
        if state.mode != mode {
            log::debug!("[BEX] mode change {:?} -> {:?}", state.mode, mode);
            self.reset_buffers_locked(&mut state);
        }
        state.mode = mode;
    }

    /// Clear both queues (mode change, abort).
    pub fn reset_buffers(&self) {
        let mut state = self.state.lock();
        self.reset_buffers_locked(&mut state);
    }

    fn reset_buffers_locked(&self, state: &mut ProducerState) {
        state.hot.clear();
        self.frame_ready.store(false, Ordering::Release);
        let prev = self
            .published
            .swap(Box::into_raw(Box::default()), Ordering::AcqRel);
        if !prev.is_null() {
            // SAFETY: a non-null published pointer is owned by the slot;
            // the swap above transferred that ownership to us.
            drop(unsafe { Box::from_raw(prev) });
        }
    }

    /// Producer: append a slice and, in WAVE mode, publish.
    pub fn append(&self, slice: Arc<Slice>) {
        let mut state = self.state.lock();
        if state.mode == DriverMode::Inactive {
            return;
        }

        state.hot.push_back(slice.clone());
        if state.mode != DriverMode::Wave {
            // FRAME mode publishes at end of frame via publish_reset
            return;
        }

        // Publish the appended queue, take back what the consumer left
        let hot = std::mem::take(&mut state.hot);
        self.frame_ready.store(true, Ordering::Release);
        let prev = self.published.swap(Box::into_raw(hot), Ordering::AcqRel);
        if prev.is_null() {
            // The consumer took the previous publication, so the queue we
            // just published is one append stale. Publish a replacement
            // holding only the new slice.
            let mut fresh: Box<SliceQueue> = Box::default();
            fresh.push_back(slice.clone());
            let stale = self.published.swap(Box::into_raw(fresh), Ordering::AcqRel);
            state.hot = if stale.is_null() {
                // Consumer grabbed the stale copy in the window between the
                // two exchanges; it is not pursued any further
                Box::default()
            } else {
                // SAFETY: non-null publications are slot-owned; the swap
                // handed this one back to us.
                let mut queue = unsafe { Box::from_raw(stale) };
                queue.clear();
                queue
            };
        } else {
            // SAFETY: as above - the swap transferred ownership.
            state.hot = unsafe { Box::from_raw(prev) };
        }

        // Either way the retained hot queue must contain the new slice
        state.hot.push_back(slice);
    }

    /// Producer: publish the hot queue without mirroring it back (FRAME
    /// end-of-frame). The exchanged-out queue is cleared, not replayed.
    pub fn publish_reset(&self) {
        let mut state = self.state.lock();
        let hot = std::mem::take(&mut state.hot);
        self.frame_ready.store(!hot.is_empty(), Ordering::Release);
        let prev = self.published.swap(Box::into_raw(hot), Ordering::AcqRel);
        if !prev.is_null() {
            // SAFETY: slot ownership transferred by the swap.
            let mut queue = unsafe { Box::from_raw(prev) };
            queue.clear();
            state.hot = queue;
        }
    }

    /// Consumer: take the published queue, leaving null to mark it taken.
    ///
    /// Lock-free; the returned queue is exclusively owned until dropped.
    pub fn driver_swap_request(&self) -> Option<Box<SliceQueue>> {
        self.frame_ready.store(false, Ordering::Release);
        let prev = self.published.swap(ptr::null_mut(), Ordering::AcqRel);
        if prev.is_null() {
            None
        } else {
            // SAFETY: slot ownership transferred by the swap.
            Some(unsafe { Box::from_raw(prev) })
        }
    }

    /// Whether a publication with slices is waiting for the consumer.
    /// Safe from any thread (drain checks run on the network thread).
    pub fn has_buffered_frame(&self) -> bool {
        self.frame_ready.load(Ordering::Acquire)
    }
}

impl Default for Bex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bex {
    fn drop(&mut self) {
        let prev = self.published.swap(ptr::null_mut(), Ordering::AcqRel);
        if !prev.is_null() {
            // SAFETY: last owner of the slot; no other thread can hold
            // a reference during drop.
            drop(unsafe { Box::from_raw(prev) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn slice(tag: u8) -> Arc<Slice> {
        Arc::new(Slice {
            data: vec![tag],
            duration_us: 1000.0,
            once: false,
        })
    }

    #[test]
    fn test_inactive_drops_appends() {
        let bex = Bex::new();
        bex.append(slice(1));
        assert!(bex.driver_swap_request().map_or(true, |q| q.is_empty()));
    }

    #[test]
    fn test_wave_append_publishes() {
        let bex = Bex::new();
        bex.set_mode(DriverMode::Wave);
        bex.append(slice(1));
        bex.append(slice(2));

        let queue = bex.driver_swap_request().expect("publication expected");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].data, vec![1]);
        assert_eq!(queue[1].data, vec![2]);
    }

    #[test]
    fn test_wave_liveness_after_consumer_took() {
        let bex = Bex::new();
        bex.set_mode(DriverMode::Wave);
        bex.append(slice(1));

        // Consumer takes the publication; the slot is now null
        let first = bex.driver_swap_request().expect("first publication");
        assert_eq!(first.len(), 1);

        // The next append must still reach the consumer
        bex.append(slice(2));
        let second = bex.driver_swap_request().expect("second publication");
        assert_eq!(second.back().expect("non-empty").data, vec![2]);
    }

    #[test]
    fn test_frame_append_not_published_until_reset() {
        let bex = Bex::new();
        bex.set_mode(DriverMode::Frame);
        bex.append(slice(1));
        bex.append(slice(2));

        // Nothing published yet (initial empty queue may still be there)
        assert!(bex.driver_swap_request().map_or(true, |q| q.is_empty()));

        bex.publish_reset();
        let queue = bex.driver_swap_request().expect("frame publication");
        assert_eq!(queue.len(), 2);
        assert!(!bex.has_buffered_frame());
    }

    #[test]
    fn test_mode_change_resets_buffers() {
        let bex = Bex::new();
        bex.set_mode(DriverMode::Frame);
        bex.append(slice(1));
        bex.publish_reset();
        assert!(bex.has_buffered_frame());

        bex.set_mode(DriverMode::Wave);
        // Both queues are empty immediately after the transition
        assert!(!bex.has_buffered_frame());
        assert!(bex.driver_swap_request().map_or(true, |q| q.is_empty()));
    }

    #[test]
    fn test_set_same_mode_keeps_buffers() {
        let bex = Bex::new();
        bex.set_mode(DriverMode::Frame);
        bex.append(slice(1));
        bex.publish_reset();
        bex.set_mode(DriverMode::Frame);
        assert!(bex.has_buffered_frame());
    }

    #[test]
    fn test_consumer_sees_last_append() {
        // BEX liveness: after k appends and one swap, the consumer
        // observes at least the last appended slice.
        let bex = Bex::new();
        bex.set_mode(DriverMode::Wave);
        for tag in 0..50u8 {
            bex.append(slice(tag));
        }
        let queue = bex.driver_swap_request().expect("publication");
        assert_eq!(queue.back().expect("non-empty").data, vec![49]);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        // Race a fast producer against a consumer issuing randomized swap
        // requests; every observed queue must end with its newest slice
        // in append order and never be empty.
        let bex = Arc::new(Bex::new());
        bex.set_mode(DriverMode::Wave);

        let producer = {
            let bex = Arc::clone(&bex);
            thread::spawn(move || {
                for round in 0..10_000u32 {
                    bex.append(Arc::new(Slice {
                        data: round.to_be_bytes().to_vec(),
                        duration_us: 100.0,
                        once: false,
                    }));
                }
            })
        };

        let consumer = {
            let bex = Arc::clone(&bex);
            thread::spawn(move || {
                let mut last_seen = 0u32;
                for _ in 0..10_000 {
                    if fastrand::u8(..4) == 0 {
                        std::thread::yield_now();
                    }
                    if let Some(queue) = bex.driver_swap_request() {
                        if let Some(newest) = queue.back() {
                            let mut tag = [0u8; 4];
                            tag.copy_from_slice(&newest.data);
                            let tag = u32::from_be_bytes(tag);
                            assert!(tag >= last_seen, "publication went backwards");
                            last_seen = tag;
                        }
                    }
                }
                last_seen
            })
        };

        producer.join().expect("producer");
        let last_seen = consumer.join().expect("consumer");
        // The final swap after all appends must surface the newest slice
        if let Some(queue) = bex.driver_swap_request() {
            if let Some(newest) = queue.back() {
                let mut tag = [0u8; 4];
                tag.copy_from_slice(&newest.data);
                assert_eq!(u32::from_be_bytes(tag), 9_999);
                return;
            }
        }
        assert_eq!(last_seen, 9_999, "last append never became visible");
    }
}
