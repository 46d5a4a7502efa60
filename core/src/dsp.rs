//! Front-end DSP for the receive path: DC removal, analytic-signal
//! conversion and the derotation oscillator.

use rustfft::num_complex::Complex;
use std::f32::consts::PI;

/// Moving-average DC blocker.
pub struct BlockDc {
    buf: Vec<f32>,
    pos: usize,
    sum: f32,
}

impl BlockDc {
    pub fn new(window: usize) -> Self {
        Self {
            buf: vec![0.0; window.max(1)],
            pos: 0,
            sum: 0.0,
        }
    }

    pub fn process(&mut self, sample: f32) -> f32 {
        self.sum += sample - self.buf[self.pos];
        self.buf[self.pos] = sample;
        self.pos += 1;
        if self.pos == self.buf.len() {
            self.pos = 0;
            // Rebuild the running sum once per revolution to stop float
            // drift from accumulating over long captures.
            self.sum = self.buf.iter().sum();
        }
        sample - self.sum / self.buf.len() as f32
    }

    pub fn reset(&mut self) {
        self.buf.fill(0.0);
        self.sum = 0.0;
        self.pos = 0;
    }
}

/// Odd-length FIR Hilbert transformer producing the analytic signal.
/// The real branch is the input delayed to the filter centre.
pub struct Hilbert {
    taps: Vec<f32>,
    buf: Vec<f32>,
    pos: usize,
}

impl Hilbert {
    pub fn new(length: usize) -> Self {
        assert!(length % 2 == 1, "Hilbert filter length must be odd");
        let center = length / 2;
        let mut taps = vec![0.0f32; length];
        for (i, tap) in taps.iter_mut().enumerate() {
            let k = i as i32 - center as i32;
            if k % 2 != 0 {
                // Blackman window keeps the stopband ripple down.
                let x = i as f32 / (length - 1) as f32;
                let window = 0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos();
                *tap = window * 2.0 / (PI * k as f32);
            }
        }
        Self {
            taps,
            buf: vec![0.0; length],
            pos: 0,
        }
    }

    pub fn process(&mut self, sample: f32) -> Complex<f32> {
        let len = self.buf.len();
        self.buf[self.pos] = sample;
        let newest = self.pos;
        self.pos = (self.pos + 1) % len;
        let center = len / 2;
        // x[n - center]
        let re = self.buf[(newest + len - center) % len];
        let mut im = 0.0f32;
        for (j, &tap) in self.taps.iter().enumerate() {
            if tap != 0.0 {
                im += tap * self.buf[(newest + len - j) % len];
            }
        }
        Complex::new(re, im)
    }

    pub fn reset(&mut self) {
        self.buf.fill(0.0);
        self.pos = 0;
    }
}

/// Complex oscillator for carrier derotation.
pub struct Phasor {
    value: Complex<f32>,
    delta: Complex<f32>,
    steps: u32,
}

impl Phasor {
    pub fn new(start_phase: f32, omega: f32) -> Self {
        Self {
            value: Complex::from_polar(1.0, start_phase),
            delta: Complex::from_polar(1.0, omega),
            steps: 0,
        }
    }

    pub fn next(&mut self) -> Complex<f32> {
        let out = self.value;
        self.value *= self.delta;
        self.steps += 1;
        if self.steps == 4096 {
            self.steps = 0;
            let norm = self.value.norm();
            if norm > 0.0 {
                self.value /= norm;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blockdc_removes_offset() {
        let mut dc = BlockDc::new(129);
        let mut out = 0.0;
        for _ in 0..2000 {
            out = dc.process(0.75);
        }
        assert!(out.abs() < 1e-3, "residual {}", out);
    }

    #[test]
    fn hilbert_makes_cosine_analytic() {
        // Mid-band tone, well inside the transformer's passband. Band-edge
        // droop is absorbed by the per-tone channel estimate downstream.
        let mut hilbert = Hilbert::new(129);
        let omega = 2.0 * PI * 6000.0 / 48000.0;
        let mut mags = Vec::new();
        for n in 0..4000 {
            let sample = (omega * n as f32).cos();
            let analytic = hilbert.process(sample);
            if n > 400 {
                mags.push(analytic.norm());
            }
        }
        let avg: f32 = mags.iter().sum::<f32>() / mags.len() as f32;
        assert!((avg - 1.0).abs() < 0.05, "average magnitude {}", avg);
        let spread = mags.iter().fold(0.0f32, |acc, &m| acc.max((m - avg).abs()));
        assert!(spread < 0.1, "magnitude ripple {}", spread);
    }

    #[test]
    fn phasor_tracks_reference() {
        let omega = -0.01f32;
        let mut osc = Phasor::new(0.3, omega);
        for n in 0..10000u32 {
            let reference = Complex::from_polar(1.0, 0.3 + omega * n as f32);
            let value = osc.next();
            assert!((value - reference).norm() < 1e-2);
        }
    }
}
