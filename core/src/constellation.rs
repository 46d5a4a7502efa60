//! Constellation mapping and soft demapping.
//!
//! PSK up to 8 points and Gray-coded square QAM up to 4096 points, all
//! normalised to unit average power. The soft demappers emit one value per
//! bit with positive meaning bit 0, scaled by the caller's precision
//! estimate; the hard demappers are their sign-only counterparts and are
//! exact inverses of `map` at zero noise.

use rustfft::num_complex::Complex;
use std::f32::consts::FRAC_1_SQRT_2;

/// Bits carried at transmit position `k` for a modulation of `mod_bits`
/// bits per tone. Odd-width constellations drop to a smaller one at fixed
/// positions so the outer code fills the frame exactly.
pub fn bits_at(mod_bits: usize, k: usize) -> usize {
    match mod_bits {
        3 if k % 32 == 30 => 2,
        6 if k % 64 == 60 => 4,
        10 if k % 128 == 120 => 8,
        12 if k % 128 == 120 => 8,
        _ => mod_bits,
    }
}

fn nrz(bit: bool) -> f32 {
    if bit {
        -1.0
    } else {
        1.0
    }
}

/// 8PSK Gray constellation, index = b0 | b1<<1 | b2<<2.
fn psk8_point(index: usize) -> Complex<f32> {
    // Gray sequence around the circle so neighbours differ in one bit.
    const GRAY: [usize; 8] = [0, 1, 3, 2, 6, 7, 5, 4];
    let position = GRAY.iter().position(|&g| g == index).unwrap_or(0);
    let angle = std::f32::consts::PI * (2 * position) as f32 / 8.0;
    Complex::from_polar(1.0, angle)
}

/// Amplitude scale for a square QAM with `h` bits per axis.
fn qam_scale(h: usize) -> f32 {
    let levels = 1usize << h;
    let axis_power = ((levels * levels - 1) as f32) / 3.0;
    1.0 / (2.0 * axis_power).sqrt()
}

/// Map `h` Gray bits onto one ASK axis with odd-integer levels.
/// The construction is the inverse of the folding demapper below.
fn ask_level(bits: &[bool]) -> f32 {
    let mut level = 0.0f32;
    for (k, &bit) in bits.iter().enumerate().rev() {
        let amp = (1usize << (bits.len() - 1 - k)) as f32;
        level = (amp - level) * nrz(bit);
    }
    level
}

/// Fold one axis value into per-bit soft decisions.
fn ask_soft(out: &mut [f32], value: f32, scale: f32) {
    let mut y = value;
    let len = out.len();
    for (k, slot) in out.iter_mut().enumerate() {
        *slot = y * scale;
        let amp = (1usize << (len - 1 - k)) as f32;
        y = amp - y.abs();
    }
}

/// Map `bits.len()` bits onto a constellation point of that size.
pub fn map(bits: &[bool]) -> Complex<f32> {
    match bits.len() {
        1 => Complex::new(nrz(bits[0]), 0.0),
        2 => Complex::new(nrz(bits[0]), nrz(bits[1])) * FRAC_1_SQRT_2,
        3 => {
            let index = bits[0] as usize | (bits[1] as usize) << 1 | (bits[2] as usize) << 2;
            psk8_point(index)
        }
        n => {
            let h = n / 2;
            let scale = qam_scale(h);
            let re = ask_level(&bits[..h]) * scale;
            let im = ask_level(&bits[h..]) * scale;
            Complex::new(re, im)
        }
    }
}

/// Nearest-point hard decisions, written into `out`.
pub fn hard(out: &mut [bool], symbol: Complex<f32>) {
    match out.len() {
        1 => out[0] = symbol.re < 0.0,
        2 => {
            out[0] = symbol.re < 0.0;
            out[1] = symbol.im < 0.0;
        }
        3 => {
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for index in 0..8 {
                let d = (symbol - psk8_point(index)).norm_sqr();
                if d < best_dist {
                    best_dist = d;
                    best = index;
                }
            }
            out[0] = best & 1 != 0;
            out[1] = best & 2 != 0;
            out[2] = best & 4 != 0;
        }
        n => {
            let h = n / 2;
            let scale = qam_scale(h);
            let (re_bits, im_bits) = out.split_at_mut(h);
            axis_hard(re_bits, symbol.re / scale);
            axis_hard(im_bits, symbol.im / scale);
        }
    }
}

fn axis_hard(out: &mut [bool], value: f32) {
    let mut y = value;
    let len = out.len();
    for (k, slot) in out.iter_mut().enumerate() {
        *slot = y < 0.0;
        let amp = (1usize << (len - 1 - k)) as f32;
        y = amp - y.abs();
    }
}

/// Per-bit soft decisions scaled by `precision`, written into `out`.
pub fn soft(out: &mut [f32], symbol: Complex<f32>, precision: f32) {
    match out.len() {
        1 => out[0] = precision * symbol.re,
        2 => {
            out[0] = precision * symbol.re * std::f32::consts::SQRT_2;
            out[1] = precision * symbol.im * std::f32::consts::SQRT_2;
        }
        3 => {
            // Exact max-log LLRs over the eight points.
            for bit in 0..3 {
                let mut d0 = f32::MAX;
                let mut d1 = f32::MAX;
                for index in 0..8usize {
                    let d = (symbol - psk8_point(index)).norm_sqr();
                    if index & (1 << bit) != 0 {
                        d1 = d1.min(d);
                    } else {
                        d0 = d0.min(d);
                    }
                }
                out[bit] = precision * (d1 - d0) * 0.5;
            }
        }
        n => {
            let h = n / 2;
            let scale = qam_scale(h);
            let (re_bits, im_bits) = out.split_at_mut(h);
            ask_soft(re_bits, symbol.re / scale, precision * scale);
            ask_soft(im_bits, symbol.im / scale, precision * scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_patterns(bits: usize) -> impl Iterator<Item = Vec<bool>> {
        (0..1usize << bits).map(move |v| (0..bits).map(|b| v & (1 << b) != 0).collect())
    }

    #[test]
    fn map_then_hard_is_identity() {
        for size in [1usize, 2, 3, 4, 6, 8, 10, 12] {
            for pattern in all_patterns(size) {
                let symbol = map(&pattern);
                let mut decided = vec![false; size];
                hard(&mut decided, symbol);
                assert_eq!(decided, pattern, "size {} pattern {:?}", size, pattern);
            }
        }
    }

    #[test]
    fn soft_signs_agree_with_hard() {
        for size in [1usize, 2, 3, 4, 6, 8, 10, 12] {
            for pattern in all_patterns(size) {
                let symbol = map(&pattern);
                let mut llrs = vec![0.0f32; size];
                soft(&mut llrs, symbol, 8.0);
                for (bit, &llr) in pattern.iter().zip(llrs.iter()) {
                    assert!(
                        llr != 0.0 && (llr < 0.0) == *bit,
                        "size {} pattern {:?} llrs {:?}",
                        size,
                        pattern,
                        llrs
                    );
                }
            }
        }
    }

    #[test]
    fn constellations_have_unit_average_power() {
        for size in [2usize, 4, 6, 8, 10, 12] {
            let count = 1usize << size;
            let power: f32 = all_patterns(size).map(|p| map(&p).norm_sqr()).sum();
            let avg = power / count as f32;
            assert!((avg - 1.0).abs() < 1e-3, "size {} power {}", size, avg);
        }
    }

    #[test]
    fn rate_matching_positions() {
        assert_eq!(bits_at(3, 30), 2);
        assert_eq!(bits_at(3, 29), 3);
        assert_eq!(bits_at(6, 60), 4);
        assert_eq!(bits_at(10, 120), 8);
        assert_eq!(bits_at(12, 120), 8);
        assert_eq!(bits_at(12, 248), 8);
        assert_eq!(bits_at(2, 30), 2);
    }
}
