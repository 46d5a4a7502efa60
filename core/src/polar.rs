//! Polar coding: frozen-set construction, encoder and list decoder.
//!
//! The frozen sets are produced by a deterministic Bhattacharyya-parameter
//! construction in log domain, keyed by (code order, information bits) and
//! cached for the life of the process. Both ends of the link derive the
//! same table, which keeps the wire format stable.
//!
//! The decoder is an LLR-based successive cancellation list decoder. Layer
//! arrays are held behind `Arc` so forked paths copy only the layers they
//! touch; the caller selects among the surviving candidates with a CRC.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

static FROZEN_CACHE: OnceLock<Mutex<HashMap<(usize, usize), Arc<Vec<bool>>>>> = OnceLock::new();

/// Frozen-bit table for a code of length `1 << code_order` carrying
/// `info_bits` information bits. `true` marks a frozen position.
pub fn frozen_set(code_order: usize, info_bits: usize) -> Arc<Vec<bool>> {
    let cache = FROZEN_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().expect("frozen table cache poisoned");
    if let Some(table) = cache.get(&(code_order, info_bits)) {
        return table.clone();
    }
    let table = Arc::new(construct(code_order, info_bits));
    cache.insert((code_order, info_bits), table.clone());
    table
}

fn construct(code_order: usize, info_bits: usize) -> Vec<bool> {
    let size = 1usize << code_order;
    assert!(info_bits <= size);
    // Bhattacharyya recursion in log domain: the check combination degrades
    // (ln(2z - z^2)), the variable combination improves (2 ln z).
    let mut lz = vec![(0.5f64).ln()];
    for _ in 0..code_order {
        let mut next = Vec::with_capacity(lz.len() * 2);
        for &z in &lz {
            let upper = z + (2.0 - z.exp()).ln();
            let lower = 2.0 * z;
            next.push(upper);
            next.push(lower);
        }
        lz = next;
    }
    let mut order: Vec<usize> = (0..size).collect();
    order.sort_by(|&a, &b| lz[a].partial_cmp(&lz[b]).unwrap_or(Ordering::Equal).then(a.cmp(&b)));
    let mut frozen = vec![true; size];
    for &i in order.iter().take(info_bits) {
        frozen[i] = false;
    }
    frozen
}

fn bit_reverse(data: &mut [bool]) {
    let n = data.len();
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = ((i as u32).reverse_bits() >> (32 - bits)) as usize;
        if j > i {
            data.swap(i, j);
        }
    }
}

/// Encode `message` into `codeword`. Message bits fill the non-frozen
/// positions in ascending index order; frozen positions carry zero.
pub fn encode(codeword: &mut [bool], message: &[bool], frozen: &[bool]) {
    let n = codeword.len();
    debug_assert!(n.is_power_of_two());
    debug_assert_eq!(frozen.len(), n);
    let mut bits = message.iter();
    for (slot, &is_frozen) in codeword.iter_mut().zip(frozen.iter()) {
        *slot = if is_frozen {
            false
        } else {
            *bits.next().expect("message shorter than information set")
        };
    }
    debug_assert!(bits.next().is_none(), "message longer than information set");
    let mut step = 1;
    while step < n {
        let mut base = 0;
        while base < n {
            for i in base..base + step {
                let t = codeword[i + step];
                codeword[i] ^= t;
            }
            base += 2 * step;
        }
        step <<= 1;
    }
    // Match the pairing order of the successive cancellation schedule.
    bit_reverse(codeword);
}

fn f_op(a: f32, b: f32) -> f32 {
    a.signum() * b.signum() * a.abs().min(b.abs())
}

fn g_op(a: f32, b: f32, u: u8) -> f32 {
    if u == 0 {
        b + a
    } else {
        b - a
    }
}

#[derive(Clone)]
struct Path {
    /// LLR layers 1..=m; layer lambda lives at index lambda-1 with
    /// `1 << (m - lambda)` entries.
    p: Vec<Arc<Vec<f32>>>,
    /// Partial-sum layers 0..=m; layer lambda holds two bits per branch.
    c: Vec<Arc<Vec<u8>>>,
    msg: Vec<bool>,
    metric: f32,
}

impl Path {
    fn new(m: usize, info_bits: usize) -> Self {
        let p = (1..=m).map(|lam| Arc::new(vec![0.0f32; 1 << (m - lam)])).collect();
        let c = (0..=m).map(|lam| Arc::new(vec![0u8; 2 << (m - lam)])).collect();
        Self {
            p,
            c,
            msg: Vec::with_capacity(info_bits),
            metric: 0.0,
        }
    }

    fn calc_p(&mut self, lam: usize, phi: usize, channel: &[f32], m: usize) {
        if lam == 0 {
            return;
        }
        if phi % 2 == 0 {
            self.calc_p(lam - 1, phi >> 1, channel, m);
        }
        let size = 1usize << (m - lam);
        let src_arc;
        let src: &[f32] = if lam == 1 {
            channel
        } else {
            src_arc = self.p[lam - 2].clone();
            &src_arc
        };
        let sums = self.c[lam].clone();
        let dest = Arc::make_mut(&mut self.p[lam - 1]);
        if phi % 2 == 0 {
            for beta in 0..size {
                dest[beta] = f_op(src[2 * beta], src[2 * beta + 1]);
            }
        } else {
            for beta in 0..size {
                dest[beta] = g_op(src[2 * beta], src[2 * beta + 1], sums[2 * beta]);
            }
        }
    }

    fn update_c(&mut self, lam: usize, phi: usize) {
        debug_assert_eq!(phi % 2, 1);
        let m = self.c.len() - 1;
        let size = 1usize << (m - lam);
        let psi = phi >> 1;
        let src = self.c[lam].clone();
        let dest = Arc::make_mut(&mut self.c[lam - 1]);
        for beta in 0..size {
            let u0 = src[2 * beta];
            let u1 = src[2 * beta + 1];
            dest[2 * (2 * beta) + (psi & 1)] = u0 ^ u1;
            dest[2 * (2 * beta + 1) + (psi & 1)] = u1;
        }
        if psi % 2 == 1 {
            self.update_c(lam - 1, psi);
        }
    }

    fn top_llr(&self, m: usize) -> f32 {
        self.p[m - 1][0]
    }

    fn set_decision(&mut self, m: usize, phi: usize, bit: u8) {
        Arc::make_mut(&mut self.c[m])[phi & 1] = bit;
    }
}

/// Successive cancellation list decoder.
pub struct ListDecoder {
    list_size: usize,
}

impl ListDecoder {
    pub fn new(list_size: usize) -> Self {
        assert!(list_size >= 1);
        Self { list_size }
    }

    /// Decode `llrs` (positive favours bit 0) against `frozen` and return
    /// the message bits of every surviving path, best metric first.
    pub fn decode(&self, llrs: &[f32], frozen: &[bool]) -> Vec<Vec<bool>> {
        let n = llrs.len();
        assert!(n.is_power_of_two());
        assert_eq!(frozen.len(), n);
        let m = n.trailing_zeros() as usize;
        let info_bits = frozen.iter().filter(|&&f| !f).count();

        let mut paths = vec![Path::new(m, info_bits)];
        for phi in 0..n {
            for path in &mut paths {
                path.calc_p(m, phi, llrs, m);
            }
            if frozen[phi] {
                for path in &mut paths {
                    let llr = path.top_llr(m);
                    if llr < 0.0 {
                        path.metric += -llr;
                    }
                    path.set_decision(m, phi, 0);
                }
            } else {
                paths = self.fork(paths, m, phi);
            }
            if phi % 2 == 1 {
                for path in &mut paths {
                    path.update_c(m, phi);
                }
            }
        }
        paths.sort_by(|a, b| a.metric.partial_cmp(&b.metric).unwrap_or(Ordering::Equal));
        paths.into_iter().map(|p| p.msg).collect()
    }

    fn fork(&self, paths: Vec<Path>, m: usize, phi: usize) -> Vec<Path> {
        let mut candidates: Vec<(usize, bool, f32)> = Vec::with_capacity(paths.len() * 2);
        for (idx, path) in paths.iter().enumerate() {
            let llr = path.top_llr(m);
            let penalty = llr.abs();
            let zero_metric = path.metric + if llr < 0.0 { penalty } else { 0.0 };
            let one_metric = path.metric + if llr >= 0.0 { penalty } else { 0.0 };
            candidates.push((idx, false, zero_metric));
            candidates.push((idx, true, one_metric));
        }
        candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal));
        candidates.truncate(self.list_size);

        let mut uses = vec![0usize; paths.len()];
        for &(idx, _, _) in &candidates {
            uses[idx] += 1;
        }
        let mut slots: Vec<Option<Path>> = paths.into_iter().map(Some).collect();
        let mut next = Vec::with_capacity(candidates.len());
        for (idx, bit, metric) in candidates {
            let mut path = if uses[idx] > 1 {
                uses[idx] -= 1;
                slots[idx].as_ref().expect("path already taken").clone()
            } else {
                slots[idx].take().expect("path already taken")
            };
            path.metric = metric;
            path.set_decision(m, phi, bit as u8);
            path.msg.push(bit);
            next.push(path);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noiseless_llrs(codeword: &[bool]) -> Vec<f32> {
        codeword.iter().map(|&b| if b { -4.0 } else { 4.0 }).collect()
    }

    #[test]
    fn uncoded_block_round_trips() {
        // No frozen bits: plain transform plus successive cancellation.
        let frozen = vec![false; 8];
        let decoder = ListDecoder::new(1);
        for value in 0..256usize {
            let message: Vec<bool> = (0..8).map(|b| value & (1 << b) != 0).collect();
            let mut codeword = vec![false; 8];
            encode(&mut codeword, &message, &frozen);
            let decoded = decoder.decode(&noiseless_llrs(&codeword), &frozen);
            assert_eq!(decoded[0], message, "value {}", value);
        }
    }

    #[test]
    fn meta_code_round_trips() {
        let frozen = frozen_set(8, 72);
        assert_eq!(frozen.iter().filter(|&&f| !f).count(), 72);
        let message: Vec<bool> = (0..72).map(|i| (i * 7 + 3) % 5 < 2).collect();
        let mut codeword = vec![false; 256];
        encode(&mut codeword, &message, &frozen);
        let decoder = ListDecoder::new(8);
        let decoded = decoder.decode(&noiseless_llrs(&codeword), &frozen);
        assert_eq!(decoded[0], message);
    }

    #[test]
    fn data_code_round_trips_with_flipped_llrs() {
        let frozen = frozen_set(11, 1056);
        let message: Vec<bool> = (0..1056).map(|i| (i * 13 + 1) % 7 < 3).collect();
        let mut codeword = vec![false; 2048];
        encode(&mut codeword, &message, &frozen);
        let mut llrs = noiseless_llrs(&codeword);
        // Weaken a few positions; the list should still carry the truth.
        for i in (0..llrs.len()).step_by(191) {
            llrs[i] *= 0.05;
        }
        let decoder = ListDecoder::new(8);
        let decoded = decoder.decode(&llrs, &frozen);
        assert!(decoded.iter().any(|m| *m == message));
    }

    #[test]
    fn frozen_set_is_deterministic() {
        let a = frozen_set(11, 1056);
        let b = frozen_set(11, 1056);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2048);
    }
}
