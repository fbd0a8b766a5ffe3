//! Byte-stream to complex-sample converters.
//!
//! Shared by the capture-file and stdin sources. A converter carries
//! partial samples between feeds, so arbitrarily-chunked byte input
//! produces a contiguous sample stream.

use byteorder::{
    ByteOrder,
    LittleEndian,
};
use num_complex::Complex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawFormat {
    F32,
    U8,
    S8,
    S16,
}

impl RawFormat {
    /// stdin format keys: complex variants are interleaved I/Q pairs,
    /// plain variants are real-only.
    pub fn from_key(key: &str) -> Option<(Self, bool)> {
        match key {
            "cf32" | "complex" => Some((Self::F32, true)),
            "f32" | "float" => Some((Self::F32, false)),
            "cu8" => Some((Self::U8, true)),
            "u8" => Some((Self::U8, false)),
            "cs8" => Some((Self::S8, true)),
            "s8" => Some((Self::S8, false)),
            "cs16" => Some((Self::S16, true)),
            "s16" => Some((Self::S16, false)),
            _ => None,
        }
    }

    pub fn component_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::U8 | Self::S8 => 1,
            Self::S16 => 2,
        }
    }
}

/// Integer scaling convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scaling {
    /// divide by the symmetric full scale (128 / 32768), the convention
    /// sound-file libraries use
    #[default]
    Symmetric,
    /// divide by the peak-to-peak range (255 / 65535)
    PeakToPeak,
}

#[derive(Clone, Debug)]
pub struct Converter {
    format: RawFormat,
    complex: bool,
    scaling: Scaling,
    pending: Vec<u8>,
}

impl Converter {
    pub fn new(format: RawFormat, complex: bool, scaling: Scaling) -> Self {
        Self {
            format,
            complex,
            scaling,
            pending: Vec::new(),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.format.component_size() * if self.complex { 2 } else { 1 }
    }

    fn component(&self, raw: &[u8]) -> f32 {
        match (self.format, self.scaling) {
            (RawFormat::F32, _) => LittleEndian::read_f32(raw),
            (RawFormat::U8, Scaling::Symmetric) => (raw[0] as f32 - 128.0) / 128.0,
            (RawFormat::U8, Scaling::PeakToPeak) => raw[0] as f32 / 255.0,
            (RawFormat::S8, Scaling::Symmetric) => raw[0] as i8 as f32 / 128.0,
            (RawFormat::S8, Scaling::PeakToPeak) => raw[0] as i8 as f32 / 255.0,
            (RawFormat::S16, Scaling::Symmetric) => LittleEndian::read_i16(raw) as f32 / 32768.0,
            (RawFormat::S16, Scaling::PeakToPeak) => LittleEndian::read_i16(raw) as f32 / 65535.0,
        }
    }

    /// Convert `input` into samples appended to `out`. Trailing bytes of
    /// an incomplete sample are carried to the next feed.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<Complex<f32>>) {
        self.pending.extend_from_slice(input);

        let sample_size = self.sample_size();
        let component_size = self.format.component_size();
        let whole = self.pending.len() / sample_size * sample_size;

        for raw in self.pending[..whole].chunks_exact(sample_size) {
            let re = self.component(&raw[..component_size]);
            let im = if self.complex {
                self.component(&raw[component_size..])
            }
            else {
                0.0
            };
            out.push(Complex::new(re, im));
        }

        self.pending.drain(..whole);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cf32_pairs_pass_through() {
        let mut converter = Converter::new(RawFormat::F32, true, Scaling::Symmetric);
        let mut bytes = Vec::new();
        for value in [0.5f32, -0.25, 1.0, 0.0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let mut out = Vec::new();
        converter.feed(&bytes, &mut out);
        assert_eq!(out, vec![Complex::new(0.5, -0.25), Complex::new(1.0, 0.0)]);
    }

    #[test]
    fn partial_samples_carry_across_feeds() {
        let mut converter = Converter::new(RawFormat::S16, true, Scaling::PeakToPeak);
        let bytes: Vec<u8> = [100i16, -100, 200, -200]
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect();

        let mut out = Vec::new();
        converter.feed(&bytes[..3], &mut out);
        assert!(out.is_empty());
        converter.feed(&bytes[3..], &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn stdin_scaling_uses_peak_to_peak_range() {
        // the stdin converters divide by 255 / 65535, not 256 / 32768
        let mut u8c = Converter::new(RawFormat::U8, false, Scaling::PeakToPeak);
        let mut out = Vec::new();
        u8c.feed(&[255], &mut out);
        assert_eq!(out[0].re, 1.0);

        let mut s16c = Converter::new(RawFormat::S16, false, Scaling::PeakToPeak);
        out.clear();
        s16c.feed(&1000i16.to_le_bytes(), &mut out);
        assert_eq!(out[0].re, 1000.0 / 65535.0);
    }

    #[test]
    fn symmetric_scaling_uses_full_scale() {
        let mut s16c = Converter::new(RawFormat::S16, true, Scaling::Symmetric);
        let mut out = Vec::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&i16::MIN.to_le_bytes());
        bytes.extend_from_slice(&16384i16.to_le_bytes());
        s16c.feed(&bytes, &mut out);
        assert_eq!(out[0], Complex::new(-1.0, 0.5));
    }
}
