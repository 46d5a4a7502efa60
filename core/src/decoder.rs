//! Streaming OFDM decoder.
//!
//! Consumes PCM one sample at a time: DC removal, Hilbert transform to
//! complex baseband, ring history, Schmidl-Cox search. After a sync lock
//! the preamble pair gives the channel and sampling-offset estimates, the
//! meta symbol names the sender and the operating mode, and the data
//! symbols accumulate soft bits until the outer polar list decoder and the
//! payload CRC either deliver a frame or send the machine back to search.

use crate::constellation;
use crate::crc::{Crc16, Crc32};
use crate::dsp::{BlockDc, Hilbert, Phasor};
use crate::hadamard;
use crate::mls::{deinterleave, nrz, Mls, Xorshift32};
use crate::modes::{
    decode_callsign, ModeParams, BLOCK_LENGTH, BLOCK_SKEW, CALLSIGN_LIMIT, DATA_CRC_POLY,
    FIRST_SEED, META_CODE_ORDER, META_CRC_BITS, META_CRC_POLY, META_DATA_BITS, MLS0_POLY,
    MLS0_SEED, MLS1_POLY, MLS2_POLY, SEED_TONES, TONE_COUNT,
};
use crate::polar::{self, ListDecoder};
use crate::sync::{SampleRing, SchmidlCox};
use crate::theil_sen::TheilSen;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

const FILTER_LEN: usize = 129;
const HISTORY_SYMBOLS: usize = 5;
const LIST_SIZE: usize = 16;
const PRECISION_MAX: f32 = 1023.0;

#[derive(Clone, Copy)]
enum State {
    Searching,
    AwaitPreamble { pos: u64, cfo: f32 },
    Collecting { j: usize, deadline: u64 },
}

pub struct OfdmDecoder {
    symbol_len: usize,
    guard_len: usize,
    extended_len: usize,
    blockdc: BlockDc,
    hilbert: Hilbert,
    ring: SampleRing,
    sync: SchmidlCox,
    fft: Arc<dyn Fft<f32>>,
    list: ListDecoder,
    state: State,
    tone_off: i32,

    fdom: Vec<Complex<f32>>,
    tone: Vec<Complex<f32>>,
    chan: Vec<Complex<f32>>,
    demod: Vec<Complex<f32>>,
    index_scratch: Vec<f32>,
    phase_scratch: Vec<f32>,

    params: Option<ModeParams>,
    sync_pos: u64,
    cfo: f32,
    seq1: Mls,
    seed_off: usize,
    llr: Vec<f32>,
    k: usize,
    snr: Vec<f32>,

    last_snr: f32,
    rx_errors: u64,
    sync_count: u64,
}

impl OfdmDecoder {
    pub fn new(sample_rate: usize) -> crate::error::Result<Self> {
        if sample_rate == 0 || sample_rate % 300 != 0 {
            return Err(crate::error::TncError::InvalidConfig(format!(
                "sample rate {} is not a multiple of 300",
                sample_rate
            )));
        }
        let guard_len = sample_rate / 300;
        let symbol_len = guard_len * 40;
        let extended_len = symbol_len + guard_len;
        let mut planner = FftPlanner::new();
        Ok(Self {
            symbol_len,
            guard_len,
            extended_len,
            blockdc: BlockDc::new(FILTER_LEN),
            hilbert: Hilbert::new(FILTER_LEN),
            ring: SampleRing::new(HISTORY_SYMBOLS * extended_len),
            sync: SchmidlCox::new(symbol_len, guard_len),
            fft: planner.plan_fft_forward(symbol_len),
            list: ListDecoder::new(LIST_SIZE),
            state: State::Searching,
            tone_off: -(TONE_COUNT as i32) / 2,
            fdom: vec![Complex::new(0.0, 0.0); symbol_len],
            tone: vec![Complex::new(0.0, 0.0); TONE_COUNT],
            chan: vec![Complex::new(0.0, 0.0); TONE_COUNT],
            demod: vec![Complex::new(0.0, 0.0); TONE_COUNT],
            index_scratch: vec![0.0; TONE_COUNT],
            phase_scratch: vec![0.0; TONE_COUNT],
            params: None,
            sync_pos: 0,
            cfo: 0.0,
            seq1: Mls::new(MLS1_POLY),
            seed_off: 0,
            llr: Vec::new(),
            k: 0,
            snr: Vec::new(),
            last_snr: 0.0,
            rx_errors: 0,
            sync_count: 0,
        })
    }

    /// Feed PCM samples; `callback` receives the payload of every frame
    /// that survives the CRC.
    pub fn process(&mut self, samples: &[f32], mut callback: impl FnMut(&[u8])) {
        for &sample in samples {
            self.process_sample(sample, &mut callback);
        }
    }

    /// Average SNR in dB over the data symbols of the last decoded frame.
    pub fn last_snr(&self) -> f32 {
        self.last_snr
    }

    /// Soft failures since construction: damaged seeds, failed CRCs,
    /// rejected meta symbols.
    pub fn rx_errors(&self) -> u64 {
        self.rx_errors
    }

    /// Sync locks seen so far; the MAC uses this to hold off transmit
    /// while a reception is in progress.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    pub fn reset(&mut self) {
        self.state = State::Searching;
        self.params = None;
        self.sync.reset();
    }

    fn process_sample(&mut self, sample: f32, callback: &mut impl FnMut(&[u8])) {
        let analytic = self.hilbert.process(self.blockdc.process(sample));
        self.ring.push(analytic);
        let t = self.ring.count() - 1;
        let lock = self.sync.update(&self.ring, t);

        match self.state {
            State::Searching => {
                if let Some(lock) = lock {
                    self.sync_count += 1;
                    let sample_rate = self.symbol_len as f64 * 7.5;
                    log::debug!(
                        "sync found at sample {}, cfo {:.1} Hz",
                        lock.symbol_pos,
                        lock.cfo_rad as f64 * sample_rate / std::f64::consts::TAU
                    );
                    self.state = State::AwaitPreamble {
                        pos: lock.symbol_pos,
                        cfo: lock.cfo_rad,
                    };
                }
            }
            State::AwaitPreamble { pos, cfo } => {
                let meta_end = pos + 3 * self.symbol_len as u64 + self.guard_len as u64;
                if self.ring.count() >= meta_end {
                    if self.preamble(pos, cfo) {
                        let first_data = pos
                            + self.symbol_len as u64
                            + 2 * self.extended_len as u64
                            + self.symbol_len as u64;
                        self.state = State::Collecting {
                            j: 1,
                            deadline: first_data,
                        };
                    } else {
                        self.rx_errors += 1;
                        self.state = State::Searching;
                    }
                }
            }
            State::Collecting { j, deadline } => {
                if self.ring.count() >= deadline {
                    let body = deadline - self.symbol_len as u64;
                    if !self.symbol(j, body) {
                        self.rx_errors += 1;
                        self.state = State::Searching;
                        return;
                    }
                    let symbol_count = self.params.map(|p| p.symbol_count).unwrap_or(0);
                    if j >= symbol_count {
                        self.finish(callback);
                        self.state = State::Searching;
                    } else {
                        self.state = State::Collecting {
                            j: j + 1,
                            deadline: deadline + self.extended_len as u64,
                        };
                    }
                }
            }
        }
    }

    fn bin(&self, carrier: i32) -> usize {
        let n = self.symbol_len as i32;
        (((carrier % n) + n) % n) as usize
    }

    fn demod_or_erase(curr: Complex<f32>, prev: Complex<f32>) -> Complex<f32> {
        if prev.norm_sqr() > 0.0 {
            let d = curr / prev;
            if d.norm_sqr() < 4.0 {
                return d;
            }
        }
        Complex::new(0.0, 0.0)
    }

    /// Derotate one symbol body starting at `body` and transform it.
    fn spectrum(&mut self, body: u64) {
        let elapsed = (body - self.sync_pos) as f64;
        let phase0 = -((self.cfo as f64 * elapsed) % std::f64::consts::TAU) as f32;
        let mut osc = Phasor::new(phase0, -self.cfo);
        for i in 0..self.symbol_len {
            self.fdom[i] = self.ring.get(body + i as u64) * osc.next();
        }
        self.fft.process(&mut self.fdom);
    }

    fn preamble(&mut self, pos: u64, cfo: f32) -> bool {
        self.sync_pos = pos;
        self.cfo = cfo;

        // First preamble copy.
        self.spectrum(pos);
        for i in 0..TONE_COUNT {
            self.tone[i] = self.fdom[self.bin(i as i32 + self.tone_off)];
        }
        // Second copy, one symbol later with no guard between.
        self.spectrum(pos + self.symbol_len as u64);
        for i in 0..TONE_COUNT {
            self.chan[i] = self.fdom[self.bin(i as i32 + self.tone_off)];
        }

        // Sampling offset shows up as a phase slope between the copies.
        for i in 0..TONE_COUNT {
            self.index_scratch[i] = (self.tone_off + i as i32) as f32;
            self.phase_scratch[i] = Self::demod_or_erase(self.chan[i], self.tone[i]).arg();
        }
        let tse = TheilSen::fit(&self.index_scratch, &self.phase_scratch);
        log::debug!(
            "sfo {:.1} ppm",
            -1e6 * tse.slope() as f64 / std::f64::consts::TAU
        );
        for i in 0..TONE_COUNT {
            let rot = Complex::from_polar(1.0, tse.eval((self.tone_off + i as i32) as f32));
            self.tone[i] *= rot;
        }
        for i in 0..TONE_COUNT {
            self.chan[i] = self.chan[i] + (self.tone[i] - self.chan[i]) * 0.5;
        }
        let mut seq0 = Mls::with_seed(MLS0_POLY, MLS0_SEED);
        for i in 0..TONE_COUNT {
            self.chan[i] *= nrz(seq0.next());
        }

        // Meta symbol: fresh pilot stream for the whole frame.
        self.seq1 = Mls::new(MLS1_POLY);
        self.seed_off = FIRST_SEED;
        let meta_body = pos + 2 * self.symbol_len as u64 + self.guard_len as u64;
        self.spectrum(meta_body);
        for i in 0..TONE_COUNT {
            self.tone[i] = self.fdom[self.bin(i as i32 + self.tone_off)];
        }
        if !self.equalize_symbol() {
            log::debug!("meta pilot seed damaged");
            return false;
        }

        let mut meta_llr = vec![0.0f32; 1 << META_CODE_ORDER];
        let precision = self.raw_snr(1, 0).min(PRECISION_MAX);
        let mut l = 0usize;
        for i in 0..TONE_COUNT {
            if i % BLOCK_LENGTH != self.seed_off {
                constellation::soft(&mut meta_llr[l..l + 1], self.demod[i], precision);
                l += 1;
            }
        }
        self.update_channel();

        let mut code_llr = vec![0.0f32; 1 << META_CODE_ORDER];
        deinterleave(&mut code_llr, &meta_llr, META_CODE_ORDER);
        let frozen = polar::frozen_set(META_CODE_ORDER, META_DATA_BITS + META_CRC_BITS);
        let candidates = self.list.decode(&code_llr, &frozen);
        let mut meta_value = None;
        for candidate in &candidates {
            let mut crc = Crc16::new(META_CRC_POLY);
            for &bit in candidate.iter() {
                crc.feed_bit(bit);
            }
            if crc.value() == 0 {
                let mut md = 0u64;
                for (i, &bit) in candidate.iter().take(META_DATA_BITS).enumerate() {
                    if bit {
                        md |= 1u64 << i;
                    }
                }
                meta_value = Some(md);
                break;
            }
        }
        let Some(md) = meta_value else {
            log::debug!("meta symbol failed crc");
            return false;
        };

        let call = md >> 8;
        if call == 0 || call >= CALLSIGN_LIMIT {
            log::debug!("invalid callsign in meta symbol");
            return false;
        }
        let mode = (md & 0xFF) as u8;
        let Ok(params) = ModeParams::from_mode(mode) else {
            log::debug!("invalid mode {:#04x} in meta symbol", mode);
            return false;
        };
        log::info!(
            "rx from {} mode {} {} {}",
            decode_callsign(call).trim_start(),
            params.modulation.name(),
            params.rate.name(),
            if params.short_frame { "short" } else { "normal" }
        );

        self.llr.clear();
        self.llr.resize(params.code_bits(), 0.0);
        self.k = 0;
        self.snr.clear();
        self.params = Some(params);
        true
    }

    /// Pilot handling shared by meta and data symbols: strip the pilot
    /// stream, divide by the channel, decode and strip the Hadamard seed,
    /// correct the residual phase slope and remove the seed scramble.
    fn equalize_symbol(&mut self) -> bool {
        for i in (self.seed_off..TONE_COUNT).step_by(BLOCK_LENGTH) {
            self.tone[i] *= nrz(self.seq1.next());
        }
        for i in 0..TONE_COUNT {
            self.demod[i] = Self::demod_or_erase(self.tone[i], self.chan[i]);
        }

        let mut soft = [0i32; SEED_TONES];
        for (n, slot) in soft.iter_mut().enumerate() {
            let value = (127.0 * self.demod[n * BLOCK_LENGTH + self.seed_off].re).round();
            *slot = value.clamp(-127.0, 127.0) as i32;
        }
        let Some(seed_value) = hadamard::decode(&soft) else {
            return false;
        };
        let chips = hadamard::encode(seed_value);
        for (n, &chip) in chips.iter().enumerate() {
            let idx = n * BLOCK_LENGTH + self.seed_off;
            self.tone[idx] *= chip as f32;
            self.demod[idx] *= chip as f32;
        }

        for (n, _) in chips.iter().enumerate() {
            let idx = n * BLOCK_LENGTH + self.seed_off;
            self.index_scratch[n] = (self.tone_off + idx as i32) as f32;
            self.phase_scratch[n] = self.demod[idx].arg();
        }
        let tse = TheilSen::fit(
            &self.index_scratch[..SEED_TONES],
            &self.phase_scratch[..SEED_TONES],
        );
        for i in 0..TONE_COUNT {
            let x = (self.tone_off + i as i32) as f32;
            self.demod[i] *= Complex::from_polar(1.0, -tse.eval(x));
            self.chan[i] *= Complex::from_polar(1.0, tse.eval(x));
        }

        if seed_value != 0 {
            let mut scramble = Mls::with_seed(MLS2_POLY, seed_value as u32);
            for i in 0..TONE_COUNT {
                if i % BLOCK_LENGTH != self.seed_off {
                    self.demod[i] *= nrz(scramble.next());
                }
            }
        }
        true
    }

    /// Signal-over-residual ratio of the symbol, from hard decisions.
    fn raw_snr(&mut self, mod_bits: usize, k_start: usize) -> f32 {
        let mut hard_bits = [false; 12];
        let mut sp = 0.0f32;
        let mut np = 0.0f32;
        let mut k = k_start;
        for i in 0..TONE_COUNT {
            let mut hard = Complex::new(1.0f32, 0.0);
            if i % BLOCK_LENGTH != self.seed_off {
                let bits = constellation::bits_at(mod_bits, k);
                constellation::hard(&mut hard_bits[..bits], self.demod[i]);
                hard = constellation::map(&hard_bits[..bits]);
                k += bits;
            }
            let error = self.demod[i] - hard;
            sp += hard.norm_sqr();
            np += error.norm_sqr();
        }
        if np <= 0.0 {
            f32::MAX
        } else {
            sp / np
        }
    }

    fn update_channel(&mut self) {
        for i in (self.seed_off..TONE_COUNT).step_by(BLOCK_LENGTH) {
            self.chan[i] = self.chan[i] + (self.tone[i] - self.chan[i]) * 0.5;
        }
    }

    fn symbol(&mut self, j: usize, body: u64) -> bool {
        let Some(params) = self.params else {
            return false;
        };
        self.seed_off = (BLOCK_SKEW * j + FIRST_SEED) % BLOCK_LENGTH;
        self.spectrum(body);
        for i in 0..TONE_COUNT {
            self.tone[i] = self.fdom[self.bin(i as i32 + self.tone_off)];
        }
        if !self.equalize_symbol() {
            log::debug!("pilot seed damaged at symbol {}", j);
            return false;
        }

        let ratio = self.raw_snr(params.mod_bits, self.k);
        self.snr.push(ratio);
        let precision = ratio.min(PRECISION_MAX);
        log::trace!("symbol {} snr {:.1} dB", j, 10.0 * ratio.log10());

        let mut k = self.k;
        for i in 0..TONE_COUNT {
            if i % BLOCK_LENGTH != self.seed_off {
                let bits = constellation::bits_at(params.mod_bits, k);
                constellation::soft(&mut self.llr[k..k + bits], self.demod[i], precision);
                k += bits;
            }
        }
        self.k = k;
        self.update_channel();
        true
    }

    fn finish(&mut self, callback: &mut impl FnMut(&[u8])) {
        let Some(params) = self.params else {
            return;
        };
        debug_assert_eq!(self.k, params.code_bits());

        let mut code_llr = vec![0.0f32; params.code_bits()];
        deinterleave(&mut code_llr, &self.llr, params.code_order);
        let frozen = polar::frozen_set(params.code_order, params.data_bits + 32);
        let candidates = self.list.decode(&code_llr, &frozen);

        let crc_bits = params.data_bits + 32;
        for candidate in &candidates {
            let mut crc = Crc32::new(DATA_CRC_POLY);
            for &bit in candidate.iter().take(crc_bits) {
                crc.feed_bit(bit);
            }
            if crc.value() != 0 {
                continue;
            }
            let mut data = vec![0u8; params.data_bytes];
            for (i, &bit) in candidate.iter().take(params.data_bits).enumerate() {
                if bit {
                    data[i / 8] |= 1 << (i % 8);
                }
            }
            let mut scrambler = Xorshift32::new();
            for byte in data.iter_mut() {
                *byte ^= scrambler.next();
            }
            let usable: Vec<f32> = self.snr.iter().copied().filter(|&s| s > 0.0).collect();
            if !usable.is_empty() {
                let mean = usable.iter().sum::<f32>() / usable.len() as f32;
                self.last_snr = 10.0 * mean.log10();
            }
            log::debug!(
                "frame decoded, {} bytes, snr {:.1} dB",
                params.data_bytes,
                self.last_snr
            );
            callback(&data);
            return;
        }
        log::debug!("frame crc failed");
        self.rx_errors += 1;
    }
}
