//! Schmidl-Cox preamble synchronisation.
//!
//! The burst carries two identical preamble symbols back to back, so a
//! sliding correlation at lag `symbol_len` plateaus over them. The peak of
//! the timing metric gives coarse timing and the correlation phase gives
//! the fractional carrier offset. Fine timing and the integer bin offset
//! (which also absorbs the unknown centre frequency) come from matching
//! the differential spectrum of the candidate symbol against the known
//! preamble sequence.

use crate::mls::{nrz, Mls};
use crate::modes::{MLS0_POLY, MLS0_SEED, TONE_COUNT};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::TAU;
use std::sync::Arc;

/// Ring of complex baseband history addressed by absolute sample index.
pub struct SampleRing {
    buf: Vec<Complex<f32>>,
    count: u64,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![Complex::new(0.0, 0.0); capacity],
            count: 0,
        }
    }

    pub fn push(&mut self, sample: Complex<f32>) {
        let len = self.buf.len() as u64;
        self.buf[(self.count % len) as usize] = sample;
        self.count += 1;
    }

    /// Total samples pushed so far; valid indices are
    /// `count - capacity .. count`.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn contains(&self, abs: u64) -> bool {
        abs < self.count && self.count - abs <= self.buf.len() as u64
    }

    pub fn get(&self, abs: u64) -> Complex<f32> {
        debug_assert!(self.contains(abs));
        let len = self.buf.len() as u64;
        self.buf[(abs % len) as usize]
    }

    pub fn reset(&mut self) {
        self.buf.fill(Complex::new(0.0, 0.0));
        self.count = 0;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncLock {
    /// Absolute index of the first preamble symbol body.
    pub symbol_pos: u64,
    /// Carrier offset in radians per sample, centre frequency included.
    pub cfo_rad: f32,
}

const METRIC_THRESHOLD: f32 = 0.2;
const QUALITY_THRESHOLD: f32 = 0.5;

pub struct SchmidlCox {
    symbol_len: usize,
    guard_len: usize,
    tone_off: i32,
    fft: Arc<dyn Fft<f32>>,
    mls_diff: Vec<f32>,
    cross: Vec<Complex<f32>>,
    p_sum: Complex<f32>,
    r_sum: f32,
    tracking: bool,
    track_until: u64,
    best_metric: f32,
    best_pos: u64,
    best_p: Complex<f32>,
    holdoff_until: u64,
    scratch: Vec<Complex<f32>>,
    diff: Vec<Complex<f32>>,
}

impl SchmidlCox {
    pub fn new(symbol_len: usize, guard_len: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(symbol_len);
        // Differential of the preamble chips; entry zero has no
        // predecessor and stays out of the correlation.
        let mut seq = Mls::with_seed(MLS0_POLY, MLS0_SEED);
        let mut mls_diff = vec![0.0f32; TONE_COUNT];
        let mut prev = 0.0f32;
        for slot in mls_diff.iter_mut() {
            let cur = nrz(seq.next());
            *slot = prev * cur;
            prev = cur;
        }
        Self {
            symbol_len,
            guard_len,
            tone_off: -(TONE_COUNT as i32) / 2,
            fft,
            mls_diff,
            cross: vec![Complex::new(0.0, 0.0); symbol_len],
            p_sum: Complex::new(0.0, 0.0),
            r_sum: 0.0,
            tracking: false,
            track_until: 0,
            best_metric: 0.0,
            best_pos: 0,
            best_p: Complex::new(0.0, 0.0),
            holdoff_until: 0,
            scratch: vec![Complex::new(0.0, 0.0); symbol_len],
            diff: vec![Complex::new(0.0, 0.0); symbol_len],
        }
    }

    fn bin(&self, carrier: i32) -> usize {
        let n = self.symbol_len as i32;
        (((carrier % n) + n) % n) as usize
    }

    /// Feed the sample at absolute index `t` (already pushed into `ring`).
    /// Returns a lock when the preamble has been found and verified.
    pub fn update(&mut self, ring: &SampleRing, t: u64) -> Option<SyncLock> {
        let n = self.symbol_len as u64;
        if t < 2 * n {
            return None;
        }
        let newest = ring.get(t);
        let mid = ring.get(t - n);

        // The slot being overwritten held the lag term for t - 2n, so the
        // sliding sums stay over a window of exactly one symbol.
        let slot = ((t - n) % n) as usize;
        let fresh = mid.conj() * newest;
        self.p_sum += fresh - self.cross[slot];
        self.cross[slot] = fresh;
        self.r_sum += newest.norm_sqr() - mid.norm_sqr();

        // Floor keeps float residue after a burst from turning silence
        // into a stream of junk metrics.
        if self.r_sum < 1e-6 {
            return None;
        }
        let metric = self.p_sum.norm_sqr() / (self.r_sum * self.r_sum);

        if t < self.holdoff_until {
            return None;
        }

        if metric > METRIC_THRESHOLD {
            if !self.tracking {
                self.tracking = true;
                self.track_until = t + (self.symbol_len + self.guard_len) as u64;
                self.best_metric = 0.0;
            }
            if metric > self.best_metric {
                self.best_metric = metric;
                self.best_pos = t;
                self.best_p = self.p_sum;
            }
        }

        if self.tracking && (t >= self.track_until || metric < METRIC_THRESHOLD * 0.5) {
            self.tracking = false;
            self.holdoff_until = t + n;
            let coarse = self.best_pos + 1 - 2 * n;
            let frac_cfo = self.best_p.arg() / self.symbol_len as f32;
            return self.fine_sync(ring, coarse, frac_cfo);
        }
        None
    }

    fn fine_sync(&mut self, ring: &SampleRing, coarse: u64, frac_cfo: f32) -> Option<SyncLock> {
        let n = self.symbol_len;
        if !ring.contains(coarse) || !ring.contains(coarse + n as u64 - 1) {
            return None;
        }
        for i in 0..n {
            let rot = Complex::from_polar(1.0, -frac_cfo * i as f32);
            self.scratch[i] = ring.get(coarse + i as u64) * rot;
        }
        self.fft.process(&mut self.scratch);
        for k in 0..n {
            let prev = self.scratch[(k + n - 1) % n];
            self.diff[k] = self.scratch[k] * prev.conj();
        }

        let mut best_shift = 0i32;
        let mut best_corr = Complex::new(0.0f32, 0.0);
        let mut best_power = 0.0f32;
        for shift in 0..n as i32 {
            let mut corr = Complex::new(0.0f32, 0.0);
            let mut power = 0.0f32;
            for i in 1..TONE_COUNT {
                let g = self.diff[self.bin(i as i32 + self.tone_off + shift)];
                corr += g * self.mls_diff[i];
                power += g.norm();
            }
            if corr.norm_sqr() > best_corr.norm_sqr() {
                best_corr = corr;
                best_power = power;
                best_shift = shift;
            }
        }
        if best_power <= 0.0 || best_corr.norm() / best_power < QUALITY_THRESHOLD {
            return None;
        }

        // A cyclic advance of the window shows up as a constant phase on
        // every differential term.
        let delta = best_corr.arg() * n as f32 / TAU;
        if delta.abs() > self.guard_len as f32 {
            return None;
        }
        let symbol_pos = coarse as i64 - delta.round() as i64;
        if symbol_pos < 0 {
            return None;
        }
        let shift = if best_shift > n as i32 / 2 {
            best_shift - n as i32
        } else {
            best_shift
        };
        let cfo_rad = frac_cfo + TAU * shift as f32 / n as f32;
        Some(SyncLock {
            symbol_pos: symbol_pos as u64,
            cfo_rad,
        })
    }

    pub fn reset(&mut self) {
        self.cross.fill(Complex::new(0.0, 0.0));
        self.p_sum = Complex::new(0.0, 0.0);
        self.r_sum = 0.0;
        self.tracking = false;
        self.best_metric = 0.0;
        self.holdoff_until = 0;
    }
}
