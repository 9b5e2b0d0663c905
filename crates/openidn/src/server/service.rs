// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Service registry: the outputs a channel can be routed to.
//!
//! Each entry is one advertised service (ID, type, name); the service map
//! response enumerates them. Channel routing resolves a requested
//! `(service_id, service_mode)` pair against the registry - service ID 0
//! selects the default service of the requested mode.

use crate::protocol::constants::{
    SERVICE_MODE_IDTF, SERVICE_MODE_LAPRO_CONTINUOUS, SERVICE_MODE_LAPRO_DISCRETE,
    SERVICE_TYPE_LAPRO,
};

/// How sample data on a routed channel is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderMode {
    /// Dictionary-described samples (IDN-Stream laser graphics).
    Dictionary,
    /// Fixed 8-byte IDTF layout, no dictionary required.
    Idtf,
}

/// One advertised service.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Nonzero service ID.
    pub service_id: u8,
    /// Service type byte for the service map (0x80 = laser projector).
    pub service_type: u8,
    /// Name reported in the service map (at most 20 bytes).
    pub name: String,
    /// Default service of its type (at most one per type).
    pub default_service: bool,
}

/// Successful routing resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedService {
    pub service_id: u8,
    pub decoder_mode: DecoderMode,
}

/// Registered services of this unit.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            entries: Vec::new(),
        }
    }

    /// Registry with the single standard laser projector service, named
    /// after the adapter (falling back when the adapter has no name).
    pub fn laser_projector(adapter_name: &str) -> Self {
        let name = if adapter_name.is_empty() {
            "Unknown DAC".to_string()
        } else {
            adapter_name.to_string()
        };
        ServiceRegistry {
            entries: vec![ServiceEntry {
                service_id: 1,
                service_type: SERVICE_TYPE_LAPRO,
                name,
                default_service: true,
            }],
        }
    }

    pub fn register(&mut self, entry: ServiceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ServiceEntry] {
        &self.entries
    }

    /// Resolve a routing request. `None` means invalid service ID or mode
    /// (the caller latches `SMERR`).
    pub fn resolve(&self, service_id: u8, service_mode: u8) -> Option<ResolvedService> {
        let decoder_mode = match service_mode {
            SERVICE_MODE_LAPRO_CONTINUOUS | SERVICE_MODE_LAPRO_DISCRETE => {
                DecoderMode::Dictionary
            }
            SERVICE_MODE_IDTF => DecoderMode::Idtf,
            _ => return None,
        };

        let entry = if service_id == 0 {
            self.entries.iter().find(|e| e.default_service)
        } else {
            self.entries.iter().find(|e| e.service_id == service_id)
        }?;

        Some(ResolvedService {
            service_id: entry.service_id,
            decoder_mode,
        })
    }
}
