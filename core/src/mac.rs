//! Media access: CSMA, TX lockout, PTT sequencing and the transmit loop.

use crate::audio::AudioDevice;
use crate::encoder::OfdmEncoder;
use crate::framing::frame_with_length;
use crate::ptt::PttBackend;
use crate::queue::TxQueue;
use crate::tnc::{ConfigHandle, TncConfig, TncStats};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const IDLE_POLL: Duration = Duration::from_millis(10);
const LOCKOUT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const LOCKOUT_POLL: Duration = Duration::from_millis(50);
const TX_CHUNK: usize = 1024;

/// Wall-clock instant before which transmission is forbidden. Extensions
/// are monotonic: a lockout can be pushed out but never pulled in.
pub struct TxLockout {
    until: Mutex<Instant>,
}

impl TxLockout {
    pub fn new() -> Self {
        Self {
            until: Mutex::new(Instant::now()),
        }
    }

    pub fn extend(&self, delta: Duration) {
        let candidate = Instant::now() + delta;
        let mut until = self.until.lock().expect("lockout poisoned");
        if candidate > *until {
            *until = candidate;
        }
    }

    pub fn is_clear(&self) -> bool {
        Instant::now() >= *self.until.lock().expect("lockout poisoned")
    }

    /// Block until the lockout expires. Gives up after the timeout so a
    /// stuck receiver cannot starve transmit forever.
    pub fn wait_clear(&self, timeout: Duration, running: &AtomicBool) -> bool {
        let start = Instant::now();
        while !self.is_clear() && running.load(Ordering::Relaxed) {
            if start.elapsed() > timeout {
                log::warn!("tx lockout timeout, transmitting anyway");
                return false;
            }
            std::thread::sleep(LOCKOUT_POLL);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self) -> Instant {
        *self.until.lock().expect("lockout poisoned")
    }
}

impl Default for TxLockout {
    fn default() -> Self {
        Self::new()
    }
}

/// Sole producer of radio output. Pops frames, waits for the channel,
/// keys the radio and plays the encoded burst.
pub struct MacController {
    queue: Arc<TxQueue>,
    audio: Arc<dyn AudioDevice>,
    config: Arc<ConfigHandle>,
    lockout: Arc<TxLockout>,
    stats: Arc<TncStats>,
    running: Arc<AtomicBool>,
    encoder: OfdmEncoder,
    ptt: PttBackend,
}

impl MacController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TxQueue>,
        audio: Arc<dyn AudioDevice>,
        config: Arc<ConfigHandle>,
        lockout: Arc<TxLockout>,
        stats: Arc<TncStats>,
        running: Arc<AtomicBool>,
        encoder: OfdmEncoder,
        ptt: PttBackend,
    ) -> Self {
        Self {
            queue,
            audio,
            config,
            lockout,
            stats,
            running,
            encoder,
            ptt,
        }
    }

    pub fn run(&mut self) {
        if !self.ptt.connect() {
            log::warn!("ptt backend unavailable, continuing without keying");
        }
        let mut rng = rand::thread_rng();
        while self.running.load(Ordering::Relaxed) {
            let Some(frame) = self.queue.pop() else {
                std::thread::sleep(IDLE_POLL);
                continue;
            };
            // Snapshot at pop time so a mode change applies to the next
            // frame as one unit.
            let cfg = self.config.snapshot();
            if !self.lockout.is_clear() {
                log::debug!("waiting for tx lockout to clear");
                self.lockout.wait_clear(LOCKOUT_WAIT_TIMEOUT, &self.running);
            }
            if cfg.csma_enabled {
                self.csma(&cfg, &mut rng);
            }
            self.transmit(&frame, &cfg);
        }
        self.ptt.set_ptt(false);
    }

    /// Carrier sense with binary exponential backoff and p-persistence.
    /// Exhausting the backoff budget transmits anyway.
    fn csma(&mut self, cfg: &TncConfig, rng: &mut impl Rng) {
        let mut backoff_count = 0u32;
        while backoff_count < cfg.max_backoff_slots && self.running.load(Ordering::Relaxed) {
            if !self.lockout.is_clear() {
                self.lockout.wait_clear(LOCKOUT_WAIT_TIMEOUT, &self.running);
            }
            let level_db = self.audio.measure_level(cfg.carrier_sense_ms);
            if level_db > cfg.carrier_threshold_db {
                let cap = (1u32 << backoff_count.min(16)).min(cfg.max_backoff_slots).max(1);
                let slots = rng.gen_range(1..=cap);
                log::debug!(
                    "csma busy ({:.1} dB > {:.1} dB), backing off {} slots",
                    level_db,
                    cfg.carrier_threshold_db,
                    slots
                );
                std::thread::sleep(Duration::from_millis(slots as u64 * cfg.slot_time_ms));
                backoff_count += 1;
                self.stats.csma_backoffs.fetch_add(1, Ordering::Relaxed);
            } else if rng.gen_range(0..=255u32) < cfg.p_persistence as u32 {
                log::debug!("csma clear ({:.1} dB), transmitting", level_db);
                return;
            } else {
                log::debug!("csma clear but deferring (p={}/255)", cfg.p_persistence);
                std::thread::sleep(Duration::from_millis(cfg.slot_time_ms));
            }
        }
        if backoff_count >= cfg.max_backoff_slots {
            log::warn!("csma backoff budget exhausted, transmitting anyway");
        }
    }

    fn transmit(&mut self, frame: &[u8], cfg: &TncConfig) {
        let framed = frame_with_length(frame);
        let samples = match self.encoder.encode(
            &framed,
            cfg.center_freq,
            cfg.call_sign,
            cfg.oper_mode,
        ) {
            Ok(samples) => samples,
            Err(err) => {
                log::warn!("tx encoding failed: {}", err);
                return;
            }
        };
        self.stats.transmitting.store(true, Ordering::Relaxed);
        let duration = samples.len() as f32 / cfg.sample_rate as f32;
        log::info!("tx {} bytes, {:.2} s of audio", frame.len(), duration);

        if self.ptt.is_vox() {
            self.transmit_vox(&samples, cfg);
        } else {
            self.transmit_keyed(&samples, cfg);
        }
        self.stats.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.stats.transmitting.store(false, Ordering::Relaxed);
    }

    fn transmit_keyed(&mut self, samples: &[f32], cfg: &TncConfig) {
        let rate = cfg.sample_rate;
        if self.ptt.keys_line() {
            self.ptt.set_ptt(true);
            self.stats.ptt_on.store(true, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(cfg.ptt_delay_ms));
        }
        self.audio.write_silence(cfg.tx_delay_ms as usize * rate / 1000);
        for chunk in samples.chunks(TX_CHUNK) {
            self.audio.write(chunk);
        }
        self.audio.write_silence(cfg.ptt_tail_ms as usize * rate / 1000);
        self.audio.drain();
        if self.ptt.keys_line() {
            std::thread::sleep(Duration::from_millis(cfg.ptt_tail_ms));
            self.ptt.set_ptt(false);
            self.stats.ptt_on.store(false, Ordering::Relaxed);
        }
    }

    fn transmit_vox(&mut self, samples: &[f32], cfg: &TncConfig) {
        let rate = cfg.sample_rate;
        let lead = vox_tone(cfg.vox_tone_freq, cfg.vox_lead_ms as usize * rate / 1000, rate);
        let tail = vox_tone(cfg.vox_tone_freq, cfg.vox_tail_ms as usize * rate / 1000, rate);
        log::debug!(
            "vox keying: {} Hz tone, {} ms lead, {} ms tail",
            cfg.vox_tone_freq,
            cfg.vox_lead_ms,
            cfg.vox_tail_ms
        );
        self.stats.ptt_on.store(true, Ordering::Relaxed);
        for chunk in lead.chunks(TX_CHUNK) {
            self.audio.write(chunk);
        }
        for chunk in samples.chunks(TX_CHUNK) {
            self.audio.write(chunk);
        }
        for chunk in tail.chunks(TX_CHUNK) {
            self.audio.write(chunk);
        }
        self.audio.drain();
        self.stats.ptt_on.store(false, Ordering::Relaxed);
    }
}

/// Sine burst with 10 ms raised-cosine ramps, loud enough to trip a
/// radio's VOX without clicking.
pub fn vox_tone(freq_hz: u32, num_samples: usize, sample_rate: usize) -> Vec<f32> {
    let ramp = sample_rate / 100;
    let phase_inc = std::f32::consts::TAU * freq_hz as f32 / sample_rate as f32;
    (0..num_samples)
        .map(|i| {
            let envelope = if i < ramp {
                0.5 * (1.0 - (std::f32::consts::PI * i as f32 / ramp as f32).cos())
            } else if i + ramp > num_samples {
                let j = num_samples - i;
                0.5 * (1.0 - (std::f32::consts::PI * j as f32 / ramp as f32).cos())
            } else {
                1.0
            };
            0.8 * envelope * (phase_inc * i as f32).sin()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::LoopbackAudio;
    use crate::modes::{CodeRate, Modulation};

    #[test]
    fn lockout_is_monotonic() {
        let lockout = TxLockout::new();
        lockout.extend(Duration::from_millis(500));
        let first = lockout.deadline();
        // A shorter extension must not pull the deadline in.
        lockout.extend(Duration::from_millis(1));
        assert_eq!(lockout.deadline(), first);
        lockout.extend(Duration::from_millis(900));
        assert!(lockout.deadline() > first);
        assert!(!lockout.is_clear());
    }

    #[test]
    fn wait_clear_times_out() {
        let lockout = TxLockout::new();
        lockout.extend(Duration::from_secs(60));
        let running = AtomicBool::new(true);
        let start = Instant::now();
        let clean = lockout.wait_clear(Duration::from_millis(120), &running);
        assert!(!clean);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn vox_tone_ramps_in_and_out() {
        let tone = vox_tone(1200, 48000 / 2, 48000);
        assert_eq!(tone.len(), 24000);
        assert!(tone[0].abs() < 1e-3);
        assert!(tone[tone.len() - 1].abs() < 0.05);
        let peak = tone.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()));
        assert!(peak > 0.7 && peak <= 0.8);
    }

    /// Carrier levels scripted busy then clear: the controller must back
    /// off at least once and then take the first clear slot.
    struct ScriptedCarrier {
        inner: LoopbackAudio,
        start: Mutex<Option<Instant>>,
        busy_for: Duration,
    }

    impl ScriptedCarrier {
        fn new(busy_for: Duration) -> Self {
            Self {
                inner: LoopbackAudio::new(),
                start: Mutex::new(None),
                busy_for,
            }
        }
    }

    impl AudioDevice for ScriptedCarrier {
        fn read(&self, buf: &mut [f32]) -> usize {
            self.inner.read(buf)
        }
        fn write(&self, samples: &[f32]) {
            self.inner.write(samples);
        }
        fn drain(&self) {}
        fn measure_level(&self, window_ms: u64) -> f32 {
            let mut start = self.start.lock().unwrap();
            let t0 = *start.get_or_insert_with(Instant::now);
            std::thread::sleep(Duration::from_millis(window_ms));
            if t0.elapsed() < self.busy_for {
                -20.0
            } else {
                -50.0
            }
        }
    }

    #[test]
    fn csma_backs_off_then_transmits() {
        let mut config = TncConfig::default();
        config.callsign = "N0CALL".into();
        config.modulation = Modulation::Qpsk;
        config.code_rate = CodeRate::Half;
        config.short_frame = true;
        config.carrier_threshold_db = -30.0;
        config.p_persistence = 255;
        config.slot_time_ms = 100;
        config.carrier_sense_ms = 100;
        config.resolve().unwrap();

        let audio = Arc::new(ScriptedCarrier::new(Duration::from_millis(600)));
        let stats = Arc::new(TncStats::default());
        let mut mac = MacController::new(
            Arc::new(TxQueue::new()),
            audio,
            Arc::new(ConfigHandle::new(config.clone())),
            Arc::new(TxLockout::new()),
            stats.clone(),
            Arc::new(AtomicBool::new(true)),
            OfdmEncoder::new(48000).unwrap(),
            PttBackend::None,
        );
        let mut rng = rand::thread_rng();
        let start = Instant::now();
        mac.csma(&config, &mut rng);
        assert!(stats.csma_backoffs.load(Ordering::Relaxed) >= 1);
        // Busy window plus at least one slot, but well under the budget.
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn transmit_plays_framed_burst() {
        let mut config = TncConfig::default();
        config.callsign = "N0CALL".into();
        config.short_frame = true;
        config.csma_enabled = false;
        config.tx_delay_ms = 100;
        config.ptt_tail_ms = 20;
        config.resolve().unwrap();

        let audio = Arc::new(LoopbackAudio::new());
        let stats = Arc::new(TncStats::default());
        let mut mac = MacController::new(
            Arc::new(TxQueue::new()),
            audio.clone(),
            Arc::new(ConfigHandle::new(config.clone())),
            Arc::new(TxLockout::new()),
            stats.clone(),
            Arc::new(AtomicBool::new(true)),
            OfdmEncoder::new(48000).unwrap(),
            PttBackend::None,
        );
        mac.transmit(b"HELLO", &config);
        assert_eq!(stats.tx_frames.load(Ordering::Relaxed), 1);
        // Leading and trailing silence around the burst.
        let min_expected = 48000 / 10 + 48000 * 20 / 1000;
        assert!(audio.queued() > min_expected);
    }
}
