// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! # OpenIDN - Real-time IDN streaming server
//!
//! A Rust implementation of an ILDA Digital Network (IDN-Hello / IDN-Stream)
//! streaming server for galvanometer laser projection DACs. The server
//! receives IDN packets over UDP, reconstructs the sample stream described by
//! the session's descriptor dictionary, reshapes it into fixed-duration
//! slices and plays them against a hardware adapter at real-time cadence.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                         Network thread                             |
//! |  UDP 7255 -> parse -> connection/session -> decode -> shape        |
//! +--------------------------------------------------------------------+
//! |                      BEX (buffer exchange)                         |
//! |        single-slot atomic pointer hand-off, lock-free hot path     |
//! +--------------------------------------------------------------------+
//! |                          Driver thread                             |
//! |  swap -> write slices to DAC adapter -> adaptive speed control     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`IdnServer`] | UDP front end, connection/session/channel state |
//! | [`Bex`] | Lock-free network-to-driver buffer exchange |
//! | [`Driver`] | Playback loop with adaptive speed control |
//! | [`DacAdapter`] | Device capability trait implemented per DAC |
//! | [`Point`] | Canonical sample (XY + RGB + intensity, all u16) |

/// DAC adapter trait and bundled adapters.
pub mod adapter;
/// Buffer exchange between the network and driver threads.
pub mod bex;
/// Protocol constants and runtime configuration.
pub mod config;
/// Driver loop and adaptive playback-rate control.
pub mod driver;
/// Crate-level error type.
pub mod error;
/// Management channel (UDP port 7355).
pub mod mgmt;
/// IDN-Hello / IDN-Stream wire protocol (cursor, dictionary, decoders).
pub mod protocol;
/// IDN server front end (connections, sessions, channels, discovery).
pub mod server;
/// Settings file (key=value INI) persistence.
pub mod settings;
/// Point-rate shaping and re-chunking ahead of the buffer exchange.
pub mod shaper;
/// Thread lifecycle, real-time priorities and shutdown.
pub mod supervisor;
/// Canonical sample model (points, chunks, slices).
pub mod types;

pub use adapter::{DacAdapter, DummyAdapter};
pub use bex::Bex;
pub use config::RuntimeConfig;
pub use driver::Driver;
pub use error::Error;
pub use server::IdnServer;
pub use supervisor::Supervisor;
pub use types::{Chunk, ChunkMode, DriverMode, Point, Slice, SliceQueue};

/// Result alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// OpenIDN version string (reported on the management channel).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
