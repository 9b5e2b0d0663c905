// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! IDN-Hello / IDN-Stream wire protocol.
//!
//! All multi-byte integers on the wire are big-endian. The submodules are
//! layered: [`cursor`] does bounds-checked primitive access, [`dictionary`]
//! parses the descriptor tags a channel configuration carries, and
//! [`decoder`] turns dictionary-described sample bytes into [`crate::Point`]s.

pub mod constants;
pub mod cursor;
pub mod decoder;
pub mod dictionary;

pub use cursor::{Cursor, CursorMut};
pub use decoder::{decode_idtf_sample, SampleDecoder};
pub use dictionary::{Descriptor, DescriptorKind, Dictionary};

use std::fmt;

/// Wire-level decode error.
///
/// Never fatal: the server drops the offending packet, latches `MVERR` on
/// the session and keeps streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes remain than the read requires.
    Underflow { offset: usize, need: usize },
    /// Response buffer too small for the write.
    Overflow { offset: usize, need: usize },
    /// Descriptor tag walk ran past the declared word count.
    DictionaryDesync { offset: usize },
    /// A dictionary that describes zero sample bytes cannot decode data.
    EmptySampleLayout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Underflow { offset, need } => {
                write!(f, "buffer underflow at offset {} (need {} bytes)", offset, need)
            }
            ProtocolError::Overflow { offset, need } => {
                write!(f, "buffer overflow at offset {} (need {} bytes)", offset, need)
            }
            ProtocolError::DictionaryDesync { offset } => {
                write!(f, "descriptor tag walk desynchronized at offset {}", offset)
            }
            ProtocolError::EmptySampleLayout => {
                write!(f, "dictionary describes an empty sample layout")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Result alias for wire-level operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
