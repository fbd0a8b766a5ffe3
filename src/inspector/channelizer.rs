//! Frequency-translating decimator.
//!
//! Mixes the inspected sub-band down to baseband with an NCO and
//! decimates by an integer factor with a boxcar accumulator. This is the
//! whole of the DSP the inspector interface needs; demodulator-grade
//! filtering belongs to the consumers of the decimated stream.

use std::f32::consts::TAU;

use num_complex::Complex;

#[derive(Clone, Debug)]
pub struct Channelizer {
    samp_rate: f64,
    phase: f32,
    omega: f32,
    decimation: u32,

    accum: Complex<f32>,
    count: u32,
}

impl Channelizer {
    pub fn new(samp_rate: f64, fc_offset: f64, decimation: u32) -> Self {
        let mut channelizer = Self {
            samp_rate,
            phase: 0.0,
            omega: 0.0,
            decimation: decimation.max(1),
            accum: Complex::default(),
            count: 0,
        };
        channelizer.retune(fc_offset);
        channelizer
    }

    /// Center-frequency offset from the source center, in Hz.
    pub fn retune(&mut self, fc_offset: f64) {
        self.omega = (-TAU as f64 * fc_offset / self.samp_rate) as f32;
    }

    pub fn set_decimation(&mut self, decimation: u32) {
        self.decimation = decimation.max(1);
        self.accum = Complex::default();
        self.count = 0;
    }

    pub fn decimation(&self) -> u32 {
        self.decimation
    }

    pub fn feed(&mut self, input: &[Complex<f32>], out: &mut Vec<Complex<f32>>) {
        let scale = 1.0 / self.decimation as f32;

        for sample in input {
            let mixed = *sample * Complex::from_polar(1.0, self.phase);
            self.phase = (self.phase + self.omega) % TAU;

            self.accum += mixed;
            self.count += 1;
            if self.count == self.decimation {
                out.push(self.accum * scale);
                self.accum = Complex::default();
                self.count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimation_reduces_rate() {
        let mut channelizer = Channelizer::new(8000.0, 0.0, 4);
        let input = vec![Complex::new(1.0, 0.0); 16];
        let mut out = Vec::new();
        channelizer.feed(&input, &mut out);
        assert_eq!(out.len(), 4);
        // DC passes through the boxcar untouched
        assert!((out[0].re - 1.0).abs() < 1e-6);
    }

    #[test]
    fn partial_decimation_groups_carry_over() {
        let mut channelizer = Channelizer::new(8000.0, 0.0, 4);
        let input = vec![Complex::new(1.0, 0.0); 6];
        let mut out = Vec::new();
        channelizer.feed(&input, &mut out);
        assert_eq!(out.len(), 1);
        channelizer.feed(&input[..2], &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn mixing_recenters_a_tone() {
        use std::f32::consts::TAU;

        let samp_rate = 1000.0;
        let offset = 100.0;
        let mut channelizer = Channelizer::new(samp_rate, offset, 1);

        // a tone at +100 Hz lands at DC after mixing
        let input: Vec<_> = (0..1000)
            .map(|i| Complex::from_polar(1.0, TAU * offset as f32 * i as f32 / samp_rate as f32))
            .collect();
        let mut out = Vec::new();
        channelizer.feed(&input, &mut out);

        let mean: Complex<f32> = out.iter().sum::<Complex<f32>>() / out.len() as f32;
        assert!(mean.norm() > 0.9, "expected near-DC output, got {mean}");
    }
}
