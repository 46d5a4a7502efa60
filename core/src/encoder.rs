//! OFDM burst encoder: byte payload to 48 kHz mono PCM.
//!
//! Burst layout: a noise-seeded guard symbol, two identical Schmidl-Cox
//! preamble symbols written back to back, the meta symbol carrying
//! callsign and mode, then the data symbols. Every symbol after the
//! second preamble copy is preceded by a crossfaded guard interval and
//! the burst ends with a ramped-out tail.

use crate::crc::{Crc16, Crc32};
use crate::error::{Result, TncError};
use crate::hadamard;
use crate::mls::{interleave, nrz, Mls, Xorshift32};
use crate::modes::{
    ModeParams, BLOCK_LENGTH, BLOCK_SKEW, DATA_CRC_POLY, FIRST_SEED, META_CODE_ORDER,
    META_CRC_BITS, META_CRC_POLY, META_DATA_BITS, MLS0_POLY, MLS0_SEED, MLS1_POLY, MLS2_POLY,
    TONE_COUNT,
};
use crate::polar;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

const PAPR_SEARCH: usize = 128;
const PAPR_GOOD_ENOUGH: f32 = 5.0;

pub struct OfdmEncoder {
    sample_rate: usize,
    symbol_len: usize,
    guard_len: usize,
    fwd: Arc<dyn Fft<f32>>,
    bwd: Arc<dyn Fft<f32>>,
    fdom: Vec<Complex<f32>>,
    tdom: Vec<Complex<f32>>,
    trial: Vec<Complex<f32>>,
    guard: Vec<Complex<f32>>,
    weight: Vec<f32>,
    tone: Vec<Complex<f32>>,
    temp: Vec<Complex<f32>>,
    tone_off: i32,
    seed_off: usize,
}

impl OfdmEncoder {
    pub fn new(sample_rate: usize) -> Result<Self> {
        if sample_rate == 0 || sample_rate % 300 != 0 {
            return Err(TncError::InvalidConfig(format!(
                "sample rate {} is not a multiple of 300",
                sample_rate
            )));
        }
        let guard_len = sample_rate / 300;
        let symbol_len = guard_len * 40;
        let mut planner = FftPlanner::new();
        Ok(Self {
            sample_rate,
            symbol_len,
            guard_len,
            fwd: planner.plan_fft_forward(symbol_len),
            bwd: planner.plan_fft_inverse(symbol_len),
            fdom: vec![Complex::new(0.0, 0.0); symbol_len],
            tdom: vec![Complex::new(0.0, 0.0); symbol_len],
            trial: vec![Complex::new(0.0, 0.0); symbol_len],
            guard: vec![Complex::new(0.0, 0.0); guard_len],
            weight: vec![0.0; guard_len],
            tone: vec![Complex::new(0.0, 0.0); TONE_COUNT],
            temp: vec![Complex::new(0.0, 0.0); TONE_COUNT],
            tone_off: 0,
            seed_off: 0,
        })
    }

    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    /// Payload capacity in bytes for a mode, length prefix included.
    pub fn payload_size(&self, oper_mode: u8) -> Result<usize> {
        Ok(ModeParams::from_mode(oper_mode)?.data_bytes)
    }

    /// Encode a payload into a PCM burst. Input longer than the mode's
    /// capacity is truncated, shorter input is zero padded.
    pub fn encode(
        &mut self,
        payload: &[u8],
        freq_off_hz: i32,
        call_sign: u64,
        oper_mode: u8,
    ) -> Result<Vec<f32>> {
        let params = ModeParams::from_mode(oper_mode)?;
        if call_sign == 0 || call_sign >= crate::modes::CALLSIGN_LIMIT {
            return Err(TncError::InvalidCallsign);
        }
        let offset = (freq_off_hz * self.symbol_len as i32) / self.sample_rate as i32;
        self.tone_off = offset - TONE_COUNT as i32 / 2;
        self.guard_weights();
        self.guard.fill(Complex::new(0.0, 0.0));

        let meta_bits = self.meta_codeword((call_sign << 8) | oper_mode as u64);
        let perm = self.data_codeword(payload, &params);

        let mut pcm = Vec::with_capacity(
            (params.symbol_count + 4) * (self.symbol_len + self.guard_len) + self.guard_len,
        );

        // Leading noise symbol settles AGC and the DC blocker.
        let mut noise = Mls::new(MLS2_POLY);
        for tone in self.tone.iter_mut() {
            *tone = Complex::new(nrz(noise.next()), 0.0);
        }
        self.symbol(&mut pcm, -3);

        // Two identical preamble symbols, no guard between them.
        let mut seq0 = Mls::with_seed(MLS0_POLY, MLS0_SEED);
        for tone in self.tone.iter_mut() {
            *tone = Complex::new(nrz(seq0.next()), 0.0);
        }
        self.symbol(&mut pcm, -2);
        self.symbol(&mut pcm, -1);

        // Meta symbol then data symbols; the pilot stream runs across the
        // whole frame.
        let mut seq1 = Mls::new(MLS1_POLY);
        let mut k = 0usize;
        let mut m = 0usize;
        for j in 0..=params.symbol_count {
            self.seed_off = (BLOCK_SKEW * j + FIRST_SEED) % BLOCK_LENGTH;
            for i in 0..TONE_COUNT {
                if i % BLOCK_LENGTH == self.seed_off {
                    self.tone[i] = Complex::new(nrz(seq1.next()), 0.0);
                } else if j > 0 {
                    let bits = crate::constellation::bits_at(params.mod_bits, k);
                    self.tone[i] = crate::constellation::map(&perm[k..k + bits]);
                    k += bits;
                } else {
                    self.tone[i] = crate::constellation::map(&meta_bits[m..m + 1]);
                    m += 1;
                }
            }
            self.symbol(&mut pcm, j as i32);
        }
        debug_assert_eq!(k, perm.len());

        // Ramp the tail of the last symbol out to silence.
        for i in 0..self.guard_len {
            self.guard[i] *= 1.0 - self.weight[i];
        }
        for i in 0..self.guard_len {
            pcm.push(self.guard[i].re);
        }

        log::debug!(
            "encoded {} byte payload, mode {:#04x}, {} samples",
            payload.len().min(params.data_bytes),
            oper_mode,
            pcm.len()
        );
        Ok(pcm)
    }

    fn guard_weights(&mut self) {
        let g = self.guard_len;
        for i in 0..g / 4 {
            self.weight[i] = 0.0;
        }
        for i in g / 4..g / 4 + g / 2 {
            let x = (i - g / 4) as f32 / (g / 2 - 1) as f32;
            self.weight[i] = 0.5 * (1.0 - (std::f32::consts::PI * x).cos());
        }
        for i in g / 4 + g / 2..g {
            self.weight[i] = 1.0;
        }
    }

    fn meta_codeword(&self, md: u64) -> Vec<bool> {
        let mut message = vec![false; META_DATA_BITS + META_CRC_BITS];
        for (i, slot) in message.iter_mut().take(META_DATA_BITS).enumerate() {
            *slot = (md >> i) & 1 != 0;
        }
        let mut crc = Crc16::new(META_CRC_POLY);
        for &bit in message.iter().take(META_DATA_BITS) {
            crc.feed_bit(bit);
        }
        for i in 0..META_CRC_BITS {
            message[META_DATA_BITS + i] = (crc.value() >> i) & 1 != 0;
        }
        let frozen = polar::frozen_set(META_CODE_ORDER, META_DATA_BITS + META_CRC_BITS);
        let mut code = vec![false; 1 << META_CODE_ORDER];
        polar::encode(&mut code, &message, &frozen);
        let mut meta = vec![false; 1 << META_CODE_ORDER];
        interleave(&mut meta, &code, META_CODE_ORDER);
        meta
    }

    fn data_codeword(&self, payload: &[u8], params: &ModeParams) -> Vec<bool> {
        let mut data = vec![0u8; params.data_bytes];
        let take = payload.len().min(params.data_bytes);
        data[..take].copy_from_slice(&payload[..take]);

        let mut scrambler = Xorshift32::new();
        for byte in data.iter_mut() {
            *byte ^= scrambler.next();
        }

        let mut message = vec![false; params.data_bits + 32];
        for (i, slot) in message.iter_mut().take(params.data_bits).enumerate() {
            *slot = (data[i / 8] >> (i % 8)) & 1 != 0;
        }
        let mut crc = Crc32::new(DATA_CRC_POLY);
        for &byte in &data {
            crc.feed_byte(byte);
        }
        for i in 0..32 {
            message[params.data_bits + i] = (crc.value() >> i) & 1 != 0;
        }

        let frozen = polar::frozen_set(params.code_order, params.data_bits + 32);
        let mut code = vec![false; params.code_bits()];
        polar::encode(&mut code, &message, &frozen);
        let mut perm = vec![false; params.code_bits()];
        interleave(&mut perm, &code, params.code_order);
        perm
    }

    fn bin(&self, carrier: i32) -> usize {
        let n = self.symbol_len as i32;
        (((carrier % n) + n) % n) as usize
    }

    /// Synthesise one symbol and append its guard and body to the burst.
    /// Negative numbers are the noise and preamble symbols, which skip
    /// the peak-to-average search.
    fn symbol(&mut self, pcm: &mut Vec<f32>, number: i32) {
        let scale = 0.5 / (TONE_COUNT as f32).sqrt();
        if number < 0 {
            self.fdom.fill(Complex::new(0.0, 0.0));
            for i in 0..TONE_COUNT {
                let b = self.bin(i as i32 + self.tone_off);
                self.fdom[b] = self.tone[i];
            }
            self.tdom.copy_from_slice(&self.fdom);
            self.bwd.process(&mut self.tdom);
            for s in self.tdom.iter_mut() {
                *s *= scale;
            }
        } else {
            let mut best_papr = f32::MAX;
            for seed_value in 0..PAPR_SEARCH {
                self.temp.copy_from_slice(&self.tone);
                let chips = hadamard::encode(seed_value as u8);
                for (i, &chip) in chips.iter().enumerate() {
                    self.temp[i * BLOCK_LENGTH + self.seed_off] *= chip as f32;
                }
                if seed_value != 0 {
                    let mut scramble = Mls::with_seed(MLS2_POLY, seed_value as u32);
                    for (i, tone) in self.temp.iter_mut().enumerate() {
                        if i % BLOCK_LENGTH != self.seed_off {
                            *tone *= nrz(scramble.next());
                        }
                    }
                }
                self.fdom.fill(Complex::new(0.0, 0.0));
                for i in 0..TONE_COUNT {
                    let b = self.bin(i as i32 + self.tone_off);
                    self.fdom[b] = self.temp[i];
                }
                self.trial.copy_from_slice(&self.fdom);
                self.bwd.process(&mut self.trial);
                let mut peak = 0.0f32;
                let mut mean = 0.0f32;
                for s in self.trial.iter_mut() {
                    *s *= scale;
                    let power = s.norm_sqr();
                    peak = peak.max(power);
                    mean += power;
                }
                mean /= self.symbol_len as f32;
                let papr = peak / mean;
                if papr < best_papr {
                    best_papr = papr;
                    self.tdom.copy_from_slice(&self.trial);
                    if papr < PAPR_GOOD_ENOUGH {
                        break;
                    }
                }
            }
            log::trace!("symbol {} papr {:.2}", number, best_papr);
        }
        self.clip_and_filter(scale);

        if number != -1 {
            let tail = self.symbol_len - self.guard_len;
            for i in 0..self.guard_len {
                let blend = self.guard[i]
                    + (self.tdom[tail + i] - self.guard[i]) * self.weight[i];
                pcm.push(blend.re);
            }
        }
        self.guard.copy_from_slice(&self.tdom[..self.guard_len]);
        for s in &self.tdom {
            pcm.push(s.re);
        }
    }

    /// One round of clipping and filtering keeps the peaks bounded while
    /// confining the spectrum to the occupied tones.
    fn clip_and_filter(&mut self, scale: f32) {
        for s in self.tdom.iter_mut() {
            let power = s.norm_sqr();
            if power > 1.0 {
                *s /= power.sqrt();
            }
        }
        self.fdom.copy_from_slice(&self.tdom);
        self.fwd.process(&mut self.fdom);
        let gain = 1.0 / (scale * self.symbol_len as f32);
        self.trial.fill(Complex::new(0.0, 0.0));
        for i in 0..TONE_COUNT {
            let b = self.bin(i as i32 + self.tone_off);
            self.trial[b] = self.fdom[b] * gain;
        }
        self.tdom.copy_from_slice(&self.trial);
        self.bwd.process(&mut self.tdom);
        for s in self.tdom.iter_mut() {
            *s *= scale;
            s.re = s.re.clamp(-1.0, 1.0);
            s.im = s.im.clamp(-1.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::{encode_callsign, encode_mode, CodeRate, Modulation};

    #[test]
    fn burst_has_expected_length() {
        let mut encoder = OfdmEncoder::new(48000).unwrap();
        let mode = encode_mode(Modulation::Qpsk, CodeRate::Half, true);
        let call = encode_callsign("N0CALL").unwrap();
        let samples = encoder.encode(b"HELLO", 1500, call, mode).unwrap();
        // noise + first preamble with guards, bare second preamble, meta
        // and four data symbols with guards, ramp-out tail.
        let expected = 2 * 6560 + 6400 + 5 * 6560 + 160;
        assert_eq!(samples.len(), expected);
    }

    #[test]
    fn samples_stay_in_range() {
        let mut encoder = OfdmEncoder::new(48000).unwrap();
        let mode = encode_mode(Modulation::Qam16, CodeRate::Half, true);
        let call = encode_callsign("W1AW").unwrap();
        let payload: Vec<u8> = (0..255).collect();
        let samples = encoder.encode(&payload, 1500, call, mode).unwrap();
        assert!(samples.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut encoder = OfdmEncoder::new(48000).unwrap();
        let mode = encode_mode(Modulation::Qpsk, CodeRate::Half, true);
        let call = encode_callsign("N0CALL").unwrap();
        let first = encoder.encode(b"PAYLOAD", 1500, call, mode).unwrap();
        let second = encoder.encode(b"PAYLOAD", 1500, call, mode).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let mut encoder = OfdmEncoder::new(48000).unwrap();
        let call = encode_callsign("N0CALL").unwrap();
        assert!(encoder.encode(b"X", 1500, call, 0x80).is_err());
        assert!(encoder.payload_size(0x80).is_err());
    }
}
