// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Sample decoders: dictionary-driven IDN samples and the fixed IDTF layout.
//!
//! Decoding is a pure function of the dictionary and the sample bytes. Wire
//! coordinates are signed with center 0; the canonical point is unsigned
//! with center `0x8000`, so X/Y get a bias on the way in. 8-bit fields are
//! replicated into both halves of the 16-bit field so full scale maps to
//! full scale.

use super::constants::{BLUE_WAVELENGTH, GREEN_WAVELENGTH, RED_WAVELENGTH};
use super::dictionary::{Descriptor, DescriptorKind, Dictionary};
use super::{Cursor, ProtocolError, ProtocolResult};
use crate::types::Point;

/// Widen an 8-bit field by byte replication (0x00 -> 0x0000, 0xFF -> 0xFFFF).
#[inline]
fn replicate(value: u8) -> u16 {
    (u16::from(value) << 8) | u16::from(value)
}

/// Decoder for one channel's dictionary-described sample stream.
pub struct SampleDecoder<'a> {
    dictionary: &'a Dictionary,
}

impl<'a> SampleDecoder<'a> {
    /// Refuses a dictionary with an empty sample layout: a zero-byte sample
    /// would make the sample loop spin forever.
    pub fn new(dictionary: &'a Dictionary) -> ProtocolResult<Self> {
        if dictionary.sample_size() == 0 {
            return Err(ProtocolError::EmptySampleLayout);
        }
        Ok(SampleDecoder { dictionary })
    }

    pub fn sample_size(&self) -> usize {
        self.dictionary.sample_size()
    }

    /// Decode one sample at the cursor.
    pub fn decode_sample(&self, cursor: &mut Cursor<'_>) -> ProtocolResult<Point> {
        let mut point = Point::default();
        let mut cscl = 0u8;
        let mut iscl = 0u8;

        for descriptor in self.dictionary.descriptors() {
            match descriptor.kind {
                DescriptorKind::Nop
                | DescriptorKind::Intensity
                | DescriptorKind::Wavelength
                | DescriptorKind::BeamBrush => {
                    cursor.skip(descriptor.byte_width())?;
                }
                DescriptorKind::DrawControl0 | DescriptorKind::DrawControl1 => {
                    let hint = cursor.read_u8()?;
                    cscl = (hint & 0xC0) >> 6;
                    iscl = (hint & 0x30) >> 4;
                }
                DescriptorKind::X | DescriptorKind::Y | DescriptorKind::Z => {
                    Self::decode_axis(descriptor, cursor, &mut point)?;
                }
                DescriptorKind::Color => {
                    Self::decode_color(descriptor, cursor, &mut point)?;
                }
            }
        }

        // Draw-control scale shifts apply after the whole sample is read
        if cscl > 0 {
            point.r >>= 2 * cscl;
            point.g >>= 2 * cscl;
            point.b >>= 2 * cscl;
        }
        if iscl > 0 {
            point.intensity >>= 2 * iscl;
        }

        Ok(point)
    }

    fn decode_axis(
        descriptor: &Descriptor,
        cursor: &mut Cursor<'_>,
        point: &mut Point,
    ) -> ProtocolResult<()> {
        // Foreign scanners and the Z axis are consumed but not mapped
        if descriptor.scanner_id != 0 || descriptor.kind == DescriptorKind::Z {
            return cursor.skip(descriptor.byte_width());
        }

        let value = if descriptor.precision == 0 {
            replicate(cursor.read_u8()?.wrapping_add(0x80))
        } else {
            cursor.read_u16()?.wrapping_add(0x8000)
        };
        match descriptor.kind {
            DescriptorKind::X => point.x = value,
            _ => point.y = value,
        }
        Ok(())
    }

    fn decode_color(
        descriptor: &Descriptor,
        cursor: &mut Cursor<'_>,
        point: &mut Point,
    ) -> ProtocolResult<()> {
        let slot = match descriptor.wavelength {
            RED_WAVELENGTH => &mut point.r,
            GREEN_WAVELENGTH => &mut point.g,
            BLUE_WAVELENGTH => &mut point.b,
            // Unrecognized wavelength: consume and discard
            _ => return cursor.skip(descriptor.byte_width()),
        };
        *slot = if descriptor.precision == 0 {
            replicate(cursor.read_u8()?)
        } else {
            cursor.read_u16()?
        };
        Ok(())
    }
}

/// Fixed IDTF sample layout: 8 bytes, little-endian u16 X/Y followed by
/// u8 R/G/B/intensity. Selected by service mode, no dictionary involved.
pub const IDTF_SAMPLE_SIZE: usize = 8;

pub fn decode_idtf_sample(cursor: &mut Cursor<'_>) -> ProtocolResult<Point> {
    let mut point = Point::default();
    let lo = cursor.read_u8()?;
    let hi = cursor.read_u8()?;
    point.x = u16::from_le_bytes([lo, hi]);
    let lo = cursor.read_u8()?;
    let hi = cursor.read_u8()?;
    point.y = u16::from_le_bytes([lo, hi]);
    point.r = u16::from(cursor.read_u8()?);
    point.g = u16::from(cursor.read_u8()?);
    point.b = u16::from(cursor.read_u8()?);
    point.intensity = u16::from(cursor.read_u8()?);
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Dictionary: draw-control + 16-bit X/Y + 16-bit RGB (the standard
    /// streaming layout).
    fn xyrgb16_dictionary() -> Dictionary {
        let tags: [u16; 12] = [
            0x4100,
            0x4200,
            0x4010,
            0x4210,
            0x4010,
            0x5000 | RED_WAVELENGTH,
            0x4010,
            0x5000 | GREEN_WAVELENGTH,
            0x4010,
            0x5000 | BLUE_WAVELENGTH,
            0x4010,
            0x0000,
        ];
        let buf: Vec<u8> = tags.iter().flat_map(|t| t.to_be_bytes()).collect();
        Dictionary::parse(&mut Cursor::new(&buf), 6).unwrap()
    }

    #[test]
    fn test_decode_xyrgb16_sample() {
        let dict = xyrgb16_dictionary();
        let decoder = SampleDecoder::new(&dict).unwrap();
        assert_eq!(decoder.sample_size(), 11);

        // draw-control 0, x 0xFF80, y 0xFF80, r 0xAAAA, g 0xBBBB, b 0xCCCC
        let sample = [
            0x00, 0xFF, 0x80, 0xFF, 0x80, 0xAA, 0xAA, 0xBB, 0xBB, 0xCC, 0xCC,
        ];
        let mut cursor = Cursor::new(&sample);
        let point = decoder.decode_sample(&mut cursor).unwrap();

        assert_eq!(
            point,
            Point {
                x: 0x7F80, // 0xFF80 + 0x8000 (mod 2^16)
                y: 0x7F80,
                r: 0xAAAA,
                g: 0xBBBB,
                b: 0xCCCC,
                ..Point::default()
            }
        );
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_decode_bias_roundtrip() {
        // decoded.x == wire + 0x8000 (mod 2^16) for every 16-bit wire value
        let dict = xyrgb16_dictionary();
        let decoder = SampleDecoder::new(&dict).unwrap();
        for wire in [0u16, 1, 0x7FFF, 0x8000, 0xFF80, 0xFFFF] {
            let mut sample = vec![0u8; 11];
            sample[1..3].copy_from_slice(&wire.to_be_bytes());
            let point = decoder.decode_sample(&mut Cursor::new(&sample)).unwrap();
            assert_eq!(point.x, wire.wrapping_add(0x8000));
        }
    }

    #[test]
    fn test_decode_8bit_replication() {
        // 8-bit layout: X, Y, red - no precision tags
        let tags: [u16; 4] = [0x4200, 0x4210, 0x5000 | RED_WAVELENGTH, 0x0000];
        let buf: Vec<u8> = tags.iter().flat_map(|t| t.to_be_bytes()).collect();
        let dict = Dictionary::parse(&mut Cursor::new(&buf), 2).unwrap();
        let decoder = SampleDecoder::new(&dict).unwrap();

        // x = 0x7F (wire) -> +0x80 -> 0xFF -> replicated 0xFFFF
        let sample = [0x7F, 0x00, 0xFF];
        let point = decoder.decode_sample(&mut Cursor::new(&sample)).unwrap();
        assert_eq!(point.x, 0xFFFF);
        assert_eq!(point.y, 0x8080);
        assert_eq!(point.r, 0xFFFF);
    }

    #[test]
    fn test_decode_scale_shifts() {
        let dict = xyrgb16_dictionary();
        let decoder = SampleDecoder::new(&dict).unwrap();

        // draw-control: cscl = 1 (bits 6..7), iscl = 2 (bits 4..5)
        let sample = [
            0x60, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xF0, 0x00, 0x0F, 0xFF,
        ];
        let point = decoder.decode_sample(&mut Cursor::new(&sample)).unwrap();
        assert_eq!(point.r, 0xFFFF >> 2);
        assert_eq!(point.g, 0xF000 >> 2);
        assert_eq!(point.b, 0x0FFF >> 2);
    }

    #[test]
    fn test_decode_scale_idempotent_at_zero() {
        // cscl = iscl = 0 leaves channels untouched
        let dict = xyrgb16_dictionary();
        let decoder = SampleDecoder::new(&dict).unwrap();
        let sample = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC,
        ];
        let point = decoder.decode_sample(&mut Cursor::new(&sample)).unwrap();
        assert_eq!((point.r, point.g, point.b), (0x1234, 0x5678, 0x9ABC));
    }

    #[test]
    fn test_decode_foreign_scanner_discarded() {
        // X scanner 1 (16-bit) then X scanner 0 (16-bit)
        let tags: [u16; 4] = [0x4201, 0x4010, 0x4200, 0x4010];
        let buf: Vec<u8> = tags.iter().flat_map(|t| t.to_be_bytes()).collect();
        let dict = Dictionary::parse(&mut Cursor::new(&buf), 2).unwrap();
        let decoder = SampleDecoder::new(&dict).unwrap();

        let sample = [0xDE, 0xAD, 0x00, 0x10];
        let point = decoder.decode_sample(&mut Cursor::new(&sample)).unwrap();
        assert_eq!(point.x, 0x0010u16.wrapping_add(0x8000));
    }

    #[test]
    fn test_decode_determinism() {
        let dict = xyrgb16_dictionary();
        let decoder = SampleDecoder::new(&dict).unwrap();
        let sample = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
        ];
        let first = decoder.decode_sample(&mut Cursor::new(&sample)).unwrap();
        let second = decoder.decode_sample(&mut Cursor::new(&sample)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_short_sample_is_underflow() {
        let dict = xyrgb16_dictionary();
        let decoder = SampleDecoder::new(&dict).unwrap();
        let sample = [0x00, 0xFF];
        assert!(decoder.decode_sample(&mut Cursor::new(&sample)).is_err());
    }

    #[test]
    fn test_empty_layout_rejected() {
        let dict = Dictionary::default();
        assert!(matches!(
            SampleDecoder::new(&dict),
            Err(ProtocolError::EmptySampleLayout)
        ));
    }

    #[test]
    fn test_decode_idtf_sample() {
        let sample = [0x34, 0x12, 0x78, 0x56, 0x10, 0x20, 0x30, 0x40];
        let point = decode_idtf_sample(&mut Cursor::new(&sample)).unwrap();
        assert_eq!(point.x, 0x1234);
        assert_eq!(point.y, 0x5678);
        assert_eq!((point.r, point.g, point.b, point.intensity), (0x10, 0x20, 0x30, 0x40));
    }
}
