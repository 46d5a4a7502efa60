//! Composition root: configuration, shared state and the TNC lifecycle.

use crate::audio::AudioDevice;
use crate::decoder::OfdmDecoder;
use crate::encoder::OfdmEncoder;
use crate::error::{Result, TncError};
use crate::fragment::{Fragmenter, Reassembler};
use crate::kiss;
use crate::mac::{MacController, TxLockout};
use crate::modes::{encode_callsign, encode_mode, CodeRate, ModeParams, Modulation};
use crate::ptt::PttBackend;
use crate::queue::TxQueue;
use crate::rx::RxLoop;
use crate::server::{ClientRegistry, KissServer};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub struct TncConfig {
    pub bind_address: String,
    pub port: u16,
    pub sample_rate: usize,
    pub center_freq: i32,
    pub callsign: String,
    pub modulation: Modulation,
    pub code_rate: CodeRate,
    pub short_frame: bool,

    /// Derived by [`TncConfig::resolve`].
    pub call_sign: u64,
    pub oper_mode: u8,

    pub ptt_delay_ms: u64,
    pub ptt_tail_ms: u64,
    pub tx_delay_ms: u64,
    pub vox_tone_freq: u32,
    pub vox_lead_ms: u64,
    pub vox_tail_ms: u64,

    pub full_duplex: bool,
    pub slot_time_ms: u64,
    pub p_persistence: u8,
    pub csma_enabled: bool,
    pub carrier_threshold_db: f32,
    pub carrier_sense_ms: u64,
    pub max_backoff_slots: u32,

    pub fragmentation_enabled: bool,
}

impl Default for TncConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8001,
            sample_rate: 48000,
            center_freq: 1500,
            callsign: "N0CALL".to_string(),
            modulation: Modulation::Qpsk,
            code_rate: CodeRate::Half,
            short_frame: false,
            call_sign: 0,
            oper_mode: 0,
            ptt_delay_ms: 50,
            ptt_tail_ms: 50,
            tx_delay_ms: 500,
            vox_tone_freq: 1200,
            vox_lead_ms: 550,
            vox_tail_ms: 500,
            full_duplex: false,
            slot_time_ms: 500,
            p_persistence: 128,
            csma_enabled: true,
            carrier_threshold_db: -30.0,
            carrier_sense_ms: 100,
            max_backoff_slots: 10,
            fragmentation_enabled: false,
        }
    }
}

impl TncConfig {
    /// Validate and derive the packed callsign and mode byte. Fails fast
    /// on anything that would make the modem unusable.
    pub fn resolve(&mut self) -> Result<()> {
        if self.port == 0 {
            return Err(TncError::InvalidPort);
        }
        self.call_sign = encode_callsign(&self.callsign)?;
        self.oper_mode = encode_mode(self.modulation, self.code_rate, self.short_frame);
        ModeParams::from_mode(self.oper_mode)?;
        Ok(())
    }

    /// Modem payload capacity for the current mode, length prefix
    /// included.
    pub fn payload_size(&self) -> Result<usize> {
        Ok(ModeParams::from_mode(self.oper_mode)?.data_bytes)
    }
}

/// Copy-on-write configuration: readers take a cheap snapshot pointer,
/// writers publish a new one.
pub struct ConfigHandle {
    inner: RwLock<Arc<TncConfig>>,
}

impl ConfigHandle {
    pub fn new(config: TncConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<TncConfig> {
        self.inner.read().expect("config poisoned").clone()
    }

    pub fn update(&self, apply: impl FnOnce(&mut TncConfig)) {
        let mut guard = self.inner.write().expect("config poisoned");
        let mut next = (**guard).clone();
        apply(&mut next);
        *guard = Arc::new(next);
    }
}

/// Read-only counters for the UI and status surfaces.
#[derive(Default)]
pub struct TncStats {
    pub tx_frames: AtomicU64,
    pub rx_frames: AtomicU64,
    pub rx_errors: AtomicU64,
    pub reassembled: AtomicU64,
    pub csma_backoffs: AtomicU64,
    pub transmitting: AtomicBool,
    pub ptt_on: AtomicBool,
    pub clients: AtomicUsize,
}

/// The shared enqueue path: KISS DATA frames from the server and
/// payloads queued by the UI both go through here.
pub struct TxPath {
    queue: Arc<TxQueue>,
    fragmenter: Fragmenter,
    config: Arc<ConfigHandle>,
}

impl TxPath {
    pub fn new(queue: Arc<TxQueue>, config: Arc<ConfigHandle>) -> Self {
        Self {
            queue,
            fragmenter: Fragmenter::new(),
            config,
        }
    }

    pub fn queue_data(&self, data: &[u8]) {
        let cfg = self.config.snapshot();
        let Ok(capacity) = cfg.payload_size() else {
            log::warn!("cannot queue data, invalid mode {:#04x}", cfg.oper_mode);
            return;
        };
        let max_payload = capacity - 2;
        if cfg.fragmentation_enabled && self.fragmenter.needs_fragmentation(data.len(), max_payload)
        {
            let fragments = self.fragmenter.fragment(data, max_payload);
            log::info!(
                "tx fragmenting {} bytes into {} fragments",
                data.len(),
                fragments.len()
            );
            for fragment in fragments {
                self.queue.push(fragment);
            }
        } else if data.len() > max_payload {
            log::warn!(
                "frame too large ({} > {}), truncating",
                data.len(),
                max_payload
            );
            self.queue.push(data[..max_payload].to_vec());
        } else {
            self.queue.push(data.to_vec());
        }
    }

    /// Apply one decoded KISS frame: DATA goes to the queue, parameter
    /// commands update the running configuration.
    pub fn handle_frame(&self, _port: u8, cmd: u8, data: &[u8]) {
        match cmd {
            kiss::CMD_DATA => self.queue_data(data),
            kiss::CMD_TXDELAY => {
                if let Some(&value) = data.first() {
                    self.config.update(|c| c.tx_delay_ms = value as u64 * 10);
                    log::info!("txdelay set to {} ms", value as u64 * 10);
                }
            }
            kiss::CMD_P => {
                if let Some(&value) = data.first() {
                    self.config.update(|c| c.p_persistence = value);
                    log::info!("p-persistence set to {}", value);
                }
            }
            kiss::CMD_SLOTTIME => {
                if let Some(&value) = data.first() {
                    self.config.update(|c| c.slot_time_ms = value as u64 * 10);
                    log::info!("slot time set to {} ms", value as u64 * 10);
                }
            }
            kiss::CMD_TXTAIL => {
                if let Some(&value) = data.first() {
                    self.config.update(|c| c.ptt_tail_ms = value as u64 * 10);
                    log::info!("txtail set to {} ms", value as u64 * 10);
                }
            }
            kiss::CMD_FULLDUPLEX => {
                if let Some(&value) = data.first() {
                    // Accepted for KISS compliance; the radio path stays
                    // half duplex either way.
                    self.config.update(|c| c.full_duplex = value != 0);
                    log::info!(
                        "full duplex {} (half duplex enforced)",
                        if value != 0 { "requested" } else { "off" }
                    );
                }
            }
            kiss::CMD_SETHW | kiss::CMD_RETURN => {}
            other => {
                log::debug!("unknown kiss command {:#04x}, dropped", other);
            }
        }
    }
}

/// Owns every shared piece of the TNC and runs its three loops.
pub struct TncCore {
    config: Arc<ConfigHandle>,
    queue: Arc<TxQueue>,
    lockout: Arc<TxLockout>,
    stats: Arc<TncStats>,
    clients: Arc<ClientRegistry>,
    tx_path: Arc<TxPath>,
    reassembler: Arc<Reassembler>,
    audio: Arc<dyn AudioDevice>,
    running: Arc<AtomicBool>,
    ptt: Option<PttBackend>,
}

impl TncCore {
    pub fn new(mut config: TncConfig, audio: Arc<dyn AudioDevice>, ptt: PttBackend) -> Result<Self> {
        config.resolve()?;
        let capacity = config.payload_size()?;
        log::info!(
            "callsign {}, {} {} {}, payload {} bytes",
            config.callsign,
            config.modulation.name(),
            config.code_rate.name(),
            if config.short_frame { "short" } else { "normal" },
            capacity
        );
        let config = Arc::new(ConfigHandle::new(config));
        let queue = Arc::new(TxQueue::new());
        let tx_path = Arc::new(TxPath::new(queue.clone(), config.clone()));
        Ok(Self {
            config,
            queue,
            lockout: Arc::new(TxLockout::new()),
            stats: Arc::new(TncStats::default()),
            clients: Arc::new(ClientRegistry::new()),
            tx_path,
            reassembler: Arc::new(Reassembler::new()),
            audio,
            running: Arc::new(AtomicBool::new(true)),
            ptt: Some(ptt),
        })
    }

    pub fn stats(&self) -> Arc<TncStats> {
        self.stats.clone()
    }

    pub fn config(&self) -> Arc<ConfigHandle> {
        self.config.clone()
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Same fragmentation-and-enqueue path the KISS DATA command uses.
    pub fn queue_data(&self, data: &[u8]) {
        self.tx_path.queue_data(data);
    }

    pub fn audio_healthy(&self) -> bool {
        self.audio.is_healthy()
    }

    pub fn reconnect_audio(&self) -> bool {
        self.audio.reconnect()
    }

    /// Runtime reconfiguration from the UI or settings layer. CSMA knobs
    /// apply immediately; callsign, centre frequency and mode changes
    /// re-derive the packed forms, and an invalid change keeps the old
    /// value.
    pub fn update_config(&self, requested: &TncConfig) {
        let current = self.config.snapshot();
        let mut next = (*current).clone();
        next.csma_enabled = requested.csma_enabled;
        next.carrier_threshold_db = requested.carrier_threshold_db;
        next.p_persistence = requested.p_persistence;
        next.slot_time_ms = requested.slot_time_ms;
        next.fragmentation_enabled = requested.fragmentation_enabled;

        if requested.callsign != current.callsign {
            match encode_callsign(&requested.callsign) {
                Ok(packed) => {
                    next.callsign = requested.callsign.clone();
                    next.call_sign = packed;
                    log::info!("callsign changed to {}", next.callsign);
                }
                Err(_) => log::warn!("ignoring invalid callsign {:?}", requested.callsign),
            }
        }
        if requested.center_freq != current.center_freq {
            next.center_freq = requested.center_freq;
            log::info!("centre frequency changed to {} Hz", next.center_freq);
        }
        let mode_changed = requested.modulation != current.modulation
            || requested.code_rate != current.code_rate
            || requested.short_frame != current.short_frame;
        if mode_changed {
            let mode = encode_mode(
                requested.modulation,
                requested.code_rate,
                requested.short_frame,
            );
            match ModeParams::from_mode(mode) {
                Ok(params) => {
                    next.modulation = requested.modulation;
                    next.code_rate = requested.code_rate;
                    next.short_frame = requested.short_frame;
                    next.oper_mode = mode;
                    log::info!(
                        "mode changed to {} {} {} ({} bytes)",
                        params.modulation.name(),
                        params.rate.name(),
                        if params.short_frame { "short" } else { "normal" },
                        params.data_bytes
                    );
                }
                Err(_) => log::warn!("ignoring invalid mode change"),
            }
        }
        self.config.update(|c| *c = next);
    }

    /// Bind the server, spawn the TX and RX threads and serve until
    /// shutdown. The accept loop runs on the calling thread.
    pub fn run(&mut self) -> Result<()> {
        let cfg = self.config.snapshot();
        let server = KissServer::bind(
            &cfg.bind_address,
            cfg.port,
            self.clients.clone(),
            self.tx_path.clone(),
            self.stats.clone(),
            self.running.clone(),
        )?;

        let encoder = OfdmEncoder::new(cfg.sample_rate)?;
        let decoder = OfdmDecoder::new(cfg.sample_rate)?;
        let ptt = self.ptt.take().unwrap_or(PttBackend::None);

        let mut mac = MacController::new(
            self.queue.clone(),
            self.audio.clone(),
            self.config.clone(),
            self.lockout.clone(),
            self.stats.clone(),
            self.running.clone(),
            encoder,
            ptt,
        );
        let tx_thread = std::thread::Builder::new()
            .name("tx".into())
            .spawn(move || mac.run())?;

        let mut rx = RxLoop::new(
            self.audio.clone(),
            decoder,
            self.reassembler.clone(),
            self.clients.clone(),
            self.lockout.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.running.clone(),
        );
        let rx_thread = std::thread::Builder::new()
            .name("rx".into())
            .spawn(move || rx.run())?;

        server.run();

        self.running.store(false, Ordering::Relaxed);
        if tx_thread.join().is_err() {
            log::error!("tx thread panicked");
        }
        if rx_thread.join().is_err() {
            log::error!("rx thread panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_bad_callsign() {
        let mut config = TncConfig {
            callsign: "NO_GOOD!".into(),
            ..TncConfig::default()
        };
        assert!(matches!(config.resolve(), Err(TncError::InvalidCallsign)));
    }

    #[test]
    fn resolve_rejects_port_zero() {
        let mut config = TncConfig {
            port: 0,
            ..TncConfig::default()
        };
        assert!(matches!(config.resolve(), Err(TncError::InvalidPort)));
    }

    #[test]
    fn config_updates_publish_new_snapshots() {
        let mut config = TncConfig::default();
        config.resolve().unwrap();
        let handle = ConfigHandle::new(config);
        let before = handle.snapshot();
        handle.update(|c| c.slot_time_ms = 123);
        let after = handle.snapshot();
        assert_eq!(before.slot_time_ms, 500);
        assert_eq!(after.slot_time_ms, 123);
    }

    #[test]
    fn kiss_parameter_frames_update_config() {
        let mut config = TncConfig::default();
        config.resolve().unwrap();
        let handle = Arc::new(ConfigHandle::new(config));
        let queue = Arc::new(TxQueue::new());
        let path = TxPath::new(queue.clone(), handle.clone());

        // TXDELAY value 50 scales by ten.
        path.handle_frame(0, kiss::CMD_TXDELAY, &[0x32]);
        assert_eq!(handle.snapshot().tx_delay_ms, 500);

        path.handle_frame(0, kiss::CMD_P, &[64]);
        assert_eq!(handle.snapshot().p_persistence, 64);

        path.handle_frame(0, kiss::CMD_SLOTTIME, &[10]);
        assert_eq!(handle.snapshot().slot_time_ms, 100);

        path.handle_frame(0, kiss::CMD_FULLDUPLEX, &[1]);
        assert!(handle.snapshot().full_duplex);

        assert!(queue.is_empty());
    }

    #[test]
    fn data_frames_are_queued_in_order() {
        let mut config = TncConfig::default();
        config.short_frame = true;
        config.resolve().unwrap();
        let handle = Arc::new(ConfigHandle::new(config));
        let queue = Arc::new(TxQueue::new());
        let path = TxPath::new(queue.clone(), handle);
        path.handle_frame(0, kiss::CMD_DATA, b"first");
        path.handle_frame(0, kiss::CMD_DATA, b"second");
        assert_eq!(queue.pop(), Some(b"first".to_vec()));
        assert_eq!(queue.pop(), Some(b"second".to_vec()));
    }

    #[test]
    fn oversized_data_is_truncated_without_fragmentation() {
        let mut config = TncConfig::default();
        config.short_frame = true; // 128 byte capacity
        config.resolve().unwrap();
        let handle = Arc::new(ConfigHandle::new(config));
        let queue = Arc::new(TxQueue::new());
        let path = TxPath::new(queue.clone(), handle);
        path.queue_data(&vec![7u8; 1000]);
        let frame = queue.pop().unwrap();
        assert_eq!(frame.len(), 126);
    }

    #[test]
    fn oversized_data_fragments_when_enabled() {
        let mut config = TncConfig::default();
        config.short_frame = true;
        config.fragmentation_enabled = true;
        config.resolve().unwrap();
        let handle = Arc::new(ConfigHandle::new(config));
        let queue = Arc::new(TxQueue::new());
        let path = TxPath::new(queue.clone(), handle);
        path.queue_data(&vec![7u8; 1000]);
        // 126 byte payloads leave 121 bytes per fragment.
        assert_eq!(queue.len(), 9);
        let first = queue.pop().unwrap();
        assert_eq!(first[0], crate::fragment::FRAG_MAGIC);
    }
}
