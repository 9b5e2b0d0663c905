// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Crate-level error type for setup and control paths.
//!
//! Wire-level decode failures use [`crate::protocol::ProtocolError`] and are
//! non-fatal (the offending packet is dropped and an event flag is latched);
//! this type covers the paths where failing is the right answer: socket
//! setup, settings persistence, thread startup.

use std::fmt;
use std::io;

/// Errors surfaced by server setup and control operations.
#[derive(Debug)]
pub enum Error {
    /// Underlying socket or file I/O failure.
    Io(io::Error),
    /// Failed to bind a UDP socket to the given address.
    BindFailed(String),
    /// Settings file exists but could not be parsed.
    SettingsParse { line: usize, reason: String },
    /// Invalid configuration value (CLI or settings file).
    InvalidConfig(String),
    /// A worker thread could not be spawned.
    ThreadSpawn(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::BindFailed(addr) => write!(f, "failed to bind UDP socket to {}", addr),
            Error::SettingsParse { line, reason } => {
                write!(f, "settings parse error at line {}: {}", line, reason)
            }
            Error::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            Error::ThreadSpawn(name) => write!(f, "failed to spawn thread: {}", name),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_variants() {
        let err = Error::BindFailed("0.0.0.0:7255".into());
        assert_eq!(err.to_string(), "failed to bind UDP socket to 0.0.0.0:7255");

        let err = Error::SettingsParse {
            line: 3,
            reason: "missing '='".into(),
        };
        assert_eq!(err.to_string(), "settings parse error at line 3: missing '='");
    }

    #[test]
    fn test_io_source_preserved() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = Error::from(io_err);
        assert!(std::error::Error::source(&err).is_some());
    }
}
