// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Session and channel state.
//!
//! A session belongs to one connection and owns up to 64 channel slots.
//! A channel opens when a routing configuration resolves against the
//! service registry and closes on the close flag, session teardown or a
//! service error. Pipeline events latch per channel slot and survive the
//! channel itself (a failed routing must still be reportable).
//!
//! Channel message processing runs entirely on the network thread; the
//! only cross-thread effects are BEX operations.

use super::service::{DecoderMode, ResolvedService, ServiceRegistry};
use super::{events::InputEvents, events::PipelineEvents, Pipeline};
use crate::config::CHANNEL_COUNT;
use crate::protocol::constants::{
    CFL_CLOSE, CFL_ROUTING, CFL_SDM_MASK, CFL_SDM_SHIFT, CHUNK_TYPE_LASER_FRAME,
    CHUNK_TYPE_LASER_WAVE, CHUNK_TYPE_VOID, CNL_CHANNEL_MASK, CNL_CONFIG_MASK, IEV_CCERR,
    PEV_CFGERR, PEV_CKTERR, PEV_CLOSED, PEV_DCMERR, PEV_MCLERR, PEV_PVLERR, PEV_ROUTED,
    PEV_SMERR, SAMPLE_ONCE, SAMPLE_SCM_MASK, SAMPLE_SCM_SHIFT,
};
use crate::protocol::decoder::{decode_idtf_sample, SampleDecoder, IDTF_SAMPLE_SIZE};
use crate::protocol::{Cursor, Dictionary, ProtocolResult};
use crate::types::{Chunk, ChunkMode, DriverMode, Point};
use std::sync::Arc;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached to a live connection.
    Attached,
    /// Connection went away while output is still draining.
    Detached,
    /// Gracefully closed; waiting for the last slices to play out.
    Closing,
    /// Done; to be reaped.
    Abandoned,
}

/// One open, routed channel.
struct Channel {
    service_id: u8,
    service_mode: u8,
    /// Service data match bits from the routing configuration.
    sdm: u8,
    decoder_mode: DecoderMode,
    /// Immutable once installed; re-routing installs a new one.
    dictionary: Arc<Dictionary>,
}

/// Result of processing one channel message.
pub struct ProcessOutcome {
    pub channel_id: u8,
}

/// Per-connection streaming session.
pub struct Session {
    log_ident: String,
    state: SessionState,
    channels: Vec<Option<Channel>>,
    /// Event accumulators per channel slot; independent of the channel's
    /// existence so routing failures stay reportable.
    pipeline_events: Vec<PipelineEvents>,
    open_count: usize,
}

impl Session {
    pub fn new(log_ident: &str) -> Self {
        Session {
            log_ident: log_ident.to_string(),
            state: SessionState::Attached,
            channels: (0..CHANNEL_COUNT).map(|_| None).collect(),
            pipeline_events: (0..CHANNEL_COUNT).map(|_| PipelineEvents::default()).collect(),
            open_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn log_ident(&self) -> &str {
        &self.log_ident
    }

    pub fn has_open_channels(&self) -> bool {
        self.open_count != 0
    }

    /// Report and clear the pipeline events of one channel slot.
    pub fn take_pipeline_events(&mut self, channel_id: u8) -> u16 {
        self.pipeline_events
            .get_mut(usize::from(channel_id & CNL_CHANNEL_MASK))
            .map_or(0, PipelineEvents::take)
    }

    fn latch_pipeline_event(&mut self, channel_id: u8, flags: u16) {
        if let Some(events) = self.pipeline_events.get_mut(usize::from(channel_id)) {
            events.latch(flags);
        }
    }

    /// Process one realtime channel message (everything after the packet
    /// header). An `Err` means the message was malformed mid-field; the
    /// caller drops it and latches `MVERR`.
    pub fn process_channel_message(
        &mut self,
        cursor: &mut Cursor<'_>,
        services: &ServiceRegistry,
        pipeline: &mut Pipeline,
        input_events: &mut InputEvents,
    ) -> ProtocolResult<ProcessOutcome> {
        let _total_size = cursor.read_u16()?;
        let cnl = cursor.read_u8()?;
        let chunk_type = cursor.read_u8()?;
        let _timestamp = cursor.read_u32()?;

        let channel_id = cnl & CNL_CHANNEL_MASK;
        let outcome = ProcessOutcome { channel_id };
        let mut close_requested = false;

        if cnl & CNL_CONFIG_MASK != 0 {
            let scwc = cursor.read_u8()?;
            let cfl = cursor.read_u8()?;
            let service_id = cursor.read_u8()?;
            let service_mode = cursor.read_u8()?;
            close_requested = cfl & CFL_CLOSE != 0;

            if cfl & CFL_ROUTING != 0 {
                let sdm = (cfl & CFL_SDM_MASK) >> CFL_SDM_SHIFT;
                match services.resolve(service_id, service_mode) {
                    Some(resolved) => {
                        let dictionary = if scwc != 0 {
                            match Dictionary::parse(cursor, scwc) {
                                Ok(dictionary) => Arc::new(dictionary),
                                Err(err) => {
                                    log::warn!(
                                        "[IDN] {}: channel {} dictionary rejected: {}",
                                        self.log_ident,
                                        channel_id,
                                        err
                                    );
                                    self.latch_pipeline_event(channel_id, PEV_CFGERR);
                                    return Ok(outcome);
                                }
                            }
                        } else {
                            // No dictionary in this config: keep the
                            // installed one across the re-route
                            self.channels[usize::from(channel_id)]
                                .as_ref()
                                .map_or_else(|| Arc::new(Dictionary::default()), |c| {
                                    Arc::clone(&c.dictionary)
                                })
                        };
                        self.open_channel(
                            channel_id,
                            resolved,
                            service_mode,
                            sdm,
                            dictionary,
                        );
                    }
                    None => {
                        log::warn!(
                            "[IDN] {}: channel {} routing failed (service {} mode {:#04x})",
                            self.log_ident,
                            channel_id,
                            service_id,
                            service_mode
                        );
                        self.latch_pipeline_event(channel_id, PEV_SMERR);
                        self.close_channel(channel_id, pipeline);
                        return Ok(outcome);
                    }
                }
            }
        }

        if cursor.remaining() > 0 && chunk_type != CHUNK_TYPE_VOID {
            self.process_sample_chunk(channel_id, chunk_type, cursor, pipeline, input_events)?;
        }

        if close_requested {
            self.close_channel(channel_id, pipeline);
        }

        Ok(outcome)
    }

    fn process_sample_chunk(
        &mut self,
        channel_id: u8,
        chunk_type: u8,
        cursor: &mut Cursor<'_>,
        pipeline: &mut Pipeline,
        input_events: &mut InputEvents,
    ) -> ProtocolResult<()> {
        if chunk_type != CHUNK_TYPE_LASER_WAVE && chunk_type != CHUNK_TYPE_LASER_FRAME {
            self.latch_pipeline_event(channel_id, PEV_CKTERR);
            return Ok(());
        }

        let (sdm, decoder_mode, dictionary) =
            match self.channels[usize::from(channel_id)].as_ref() {
                Some(channel) => (
                    channel.sdm,
                    channel.decoder_mode,
                    Arc::clone(&channel.dictionary),
                ),
                None => {
                    // Samples on a closed channel
                    input_events.latch(IEV_CCERR);
                    return Ok(());
                }
            };

        let flags = cursor.read_u8()?;
        let duration_us = cursor.read_u24()?;
        let scm = (flags & SAMPLE_SCM_MASK) >> SAMPLE_SCM_SHIFT;

        if scm != sdm {
            // Client's data layout hint disagrees with the channel config
            self.latch_pipeline_event(channel_id, PEV_DCMERR);
            return Ok(());
        }

        if decoder_mode == DecoderMode::Dictionary && dictionary.is_empty() {
            self.latch_pipeline_event(channel_id, PEV_CFGERR);
            return Ok(());
        }

        let is_wave = chunk_type == CHUNK_TYPE_LASER_WAVE;
        let mode = if is_wave {
            ChunkMode::Wave
        } else if flags & SAMPLE_ONCE != 0 {
            ChunkMode::FrameOnce
        } else {
            ChunkMode::Frame
        };

        let points = Self::decode_points(decoder_mode, &dictionary, cursor)?;
        if cursor.remaining() > 0 {
            // Trailing bytes that are not a whole sample
            self.latch_pipeline_event(channel_id, PEV_PVLERR);
        }
        if points.is_empty() || duration_us == 0 {
            self.latch_pipeline_event(channel_id, PEV_MCLERR);
            return Ok(());
        }

        // Activate/switch the driver mode; a switch clears the BEX queues
        // and any partial slice so sample types never mix
        let driver_mode = if is_wave {
            DriverMode::Wave
        } else {
            DriverMode::Frame
        };
        if pipeline.bex.mode() != driver_mode {
            pipeline.shaper.reset();
        }
        pipeline.bex.set_mode(driver_mode);

        let chunk = Chunk {
            points,
            duration_us,
            mode,
        };
        pipeline
            .shaper
            .feed(&chunk, pipeline.adapter.as_ref(), &pipeline.bex);
        Ok(())
    }

    fn decode_points(
        decoder_mode: DecoderMode,
        dictionary: &Dictionary,
        cursor: &mut Cursor<'_>,
    ) -> ProtocolResult<Vec<Point>> {
        let mut points = Vec::new();
        match decoder_mode {
            DecoderMode::Idtf => {
                while cursor.remaining() >= IDTF_SAMPLE_SIZE {
                    points.push(decode_idtf_sample(cursor)?);
                }
            }
            DecoderMode::Dictionary => {
                let decoder = SampleDecoder::new(dictionary)?;
                while cursor.remaining() >= decoder.sample_size() {
                    points.push(decoder.decode_sample(cursor)?);
                }
            }
        }
        Ok(points)
    }

    fn open_channel(
        &mut self,
        channel_id: u8,
        resolved: ResolvedService,
        service_mode: u8,
        sdm: u8,
        dictionary: Arc<Dictionary>,
    ) {
        let index = usize::from(channel_id);
        if self.channels[index].is_none() {
            self.open_count += 1;
        }
        self.channels[index] = Some(Channel {
            service_id: resolved.service_id,
            service_mode,
            sdm,
            decoder_mode: resolved.decoder_mode,
            dictionary,
        });
        // A routed channel revives a closing session
        self.state = SessionState::Attached;
        self.latch_pipeline_event(channel_id, PEV_ROUTED);
        log::info!(
            "[IDN] {}: channel {} routed to service {} mode {:#04x}",
            self.log_ident,
            channel_id,
            resolved.service_id,
            service_mode
        );
    }

    fn close_channel(&mut self, channel_id: u8, pipeline: &mut Pipeline) {
        if self.channels[usize::from(channel_id)].take().is_none() {
            return;
        }
        self.open_count -= 1;
        self.latch_pipeline_event(channel_id, PEV_CLOSED);
        log::info!("[IDN] {}: channel {} closed", self.log_ident, channel_id);
        if self.open_count == 0 {
            // Last channel gone: park the driver
            pipeline.shaper.reset();
            pipeline.bex.set_mode(DriverMode::Inactive);
        }
    }

    /// Graceful teardown: channels close but buffered output keeps
    /// draining; the teardown sweep parks the driver once the last slice
    /// has played.
    pub fn cancel_gracefully(&mut self) {
        for channel_id in 0..CHANNEL_COUNT {
            if self.channels[channel_id].take().is_some() {
                self.open_count -= 1;
                self.latch_pipeline_event(channel_id as u8, PEV_CLOSED);
            }
        }
        self.state = SessionState::Closing;
        log::info!("[IDN] {}: session closing, draining output", self.log_ident);
    }

    /// Abort: everything stops within one driver iteration.
    pub fn cancel_immediately(&mut self, pipeline: &mut Pipeline) {
        for channel_id in 0..CHANNEL_COUNT as u8 {
            self.close_channel(channel_id, pipeline);
        }
        pipeline.bex.reset_buffers();
        pipeline.bex.set_mode(DriverMode::Inactive);
        self.state = SessionState::Abandoned;
    }

    #[cfg(test)]
    pub(crate) fn channel_dictionary(&self, channel_id: u8) -> Option<Arc<Dictionary>> {
        self.channels[usize::from(channel_id)]
            .as_ref()
            .map(|c| Arc::clone(&c.dictionary))
    }

    #[cfg(test)]
    pub(crate) fn channel_service(&self, channel_id: u8) -> Option<(u8, u8)> {
        self.channels[usize::from(channel_id)]
            .as_ref()
            .map(|c| (c.service_id, c.service_mode))
    }
}
