// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Descriptor dictionary: the sample-field layout a channel configuration
//! publishes.
//!
//! The wire form is a packed sequence of 16-bit tags; each tag decomposes
//! as `category:4 | sub:4 | id:4 | param:4` (COLOR tags overload the low 10
//! bits as a wavelength). The parsed form is a dense vector walked once per
//! sample - the dictionary is small and rebuilt rarely, sample decoding is
//! the hot path.

use super::constants::{
    TAG_CATEGORY_MASK, TAG_CATEGORY_SHIFT, TAG_ID_MASK, TAG_ID_SHIFT, TAG_PRM_MASK, TAG_SUB_MASK,
    TAG_SUB_SHIFT, TAG_WAVELENGTH_MASK,
};
use super::{Cursor, ProtocolError, ProtocolResult};

/// Sample field described by one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Consumes one sample byte, carries no data.
    Nop,
    /// Draw control byte with embedded color/intensity scale shifts.
    DrawControl0,
    DrawControl1,
    X,
    Y,
    Z,
    /// Color channel; `wavelength` selects which.
    Color,
    /// Tunable-wavelength channel (consumed, not mapped).
    Wavelength,
    /// Intensity hint byte (consumed, not mapped).
    Intensity,
    /// Beam brush channel (consumed, not mapped).
    BeamBrush,
}

/// One parsed descriptor tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    /// 0 = 8-bit field, >= 1 = 16-bit field (precision tags promote).
    pub precision: u8,
    /// Scanner the X/Y/Z field addresses; only scanner 0 maps to the
    /// canonical point, others are consumed and discarded.
    pub scanner_id: u8,
    /// Wavelength in nanometers for COLOR descriptors.
    pub wavelength: u16,
}

impl Descriptor {
    fn new(kind: DescriptorKind) -> Self {
        Descriptor {
            kind,
            precision: 0,
            scanner_id: 0,
            wavelength: 0,
        }
    }

    /// Bytes this descriptor consumes from each wire sample.
    pub fn byte_width(&self) -> usize {
        match self.kind {
            // Single-byte fields regardless of precision tags
            DescriptorKind::Nop
            | DescriptorKind::DrawControl0
            | DescriptorKind::DrawControl1
            | DescriptorKind::Intensity => 1,
            _ => {
                if self.precision == 0 {
                    1
                } else {
                    2
                }
            }
        }
    }
}

/// Parsed field layout of a channel's sample data.
///
/// Immutable once installed on a channel; a new routing configuration
/// replaces the whole dictionary.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    descriptors: Vec<Descriptor>,
}

impl Dictionary {
    /// Parse `scwc` 32-bit configuration words of descriptor tags.
    ///
    /// Every tag read is bounds-checked against both the buffer and the
    /// declared word count: a category-0 skip that would run past the
    /// declared count is a desync (the payload misstates `scwc`) and
    /// terminates parsing with an error rather than free-running.
    pub fn parse(cursor: &mut Cursor<'_>, scwc: u8) -> ProtocolResult<Dictionary> {
        let total = usize::from(scwc) * 4;
        let mut consumed = 0usize;
        let mut descriptors = Vec::new();

        while consumed < total {
            let tag = cursor.read_u16()?;
            consumed += 2;

            let category = (tag & TAG_CATEGORY_MASK) >> TAG_CATEGORY_SHIFT;
            let sub = (tag & TAG_SUB_MASK) >> TAG_SUB_SHIFT;
            let id = (tag & TAG_ID_MASK) >> TAG_ID_SHIFT;
            let prm = tag & TAG_PRM_MASK;

            match category {
                0 => {
                    // Reserved/padding: skip prm further 16-bit words
                    let skip = usize::from(prm) * 2;
                    if consumed + skip > total {
                        return Err(ProtocolError::DictionaryDesync {
                            offset: cursor.offset(),
                        });
                    }
                    cursor.skip(skip)?;
                    consumed += skip;
                }
                1 => {
                    // Break / coordinate and color space modifier tags:
                    // no sample data, nothing to record
                }
                4 => match (sub, id) {
                    (0, 0) => descriptors.push(Descriptor::new(DescriptorKind::Nop)),
                    (0, 1) => {
                        // Precision tag promotes the previous descriptor
                        if let Some(last) = descriptors.last_mut() {
                            last.precision += 1;
                        }
                    }
                    (1, _) => {
                        let kind = if prm == 0 {
                            DescriptorKind::DrawControl0
                        } else {
                            DescriptorKind::DrawControl1
                        };
                        descriptors.push(Descriptor::new(kind));
                    }
                    (2, 0..=2) => {
                        let kind = match id {
                            0 => DescriptorKind::X,
                            1 => DescriptorKind::Y,
                            _ => DescriptorKind::Z,
                        };
                        let mut descriptor = Descriptor::new(kind);
                        descriptor.scanner_id = prm as u8;
                        descriptors.push(descriptor);
                    }
                    _ => {}
                },
                5 => match (sub, id) {
                    (0..=3, _) => {
                        let mut descriptor = Descriptor::new(DescriptorKind::Color);
                        descriptor.wavelength = tag & TAG_WAVELENGTH_MASK;
                        descriptors.push(descriptor);
                    }
                    (12, 0) => descriptors.push(Descriptor::new(DescriptorKind::Wavelength)),
                    (12, 1) => descriptors.push(Descriptor::new(DescriptorKind::Intensity)),
                    (12, 2) => descriptors.push(Descriptor::new(DescriptorKind::BeamBrush)),
                    _ => {}
                },
                _ => {}
            }
        }

        Ok(Dictionary { descriptors })
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Bytes one wire sample occupies under this layout.
    pub fn sample_size(&self) -> usize {
        self.descriptors.iter().map(Descriptor::byte_width).sum()
    }
}
