//! Receive loop: audio capture through the decoder and out to clients.

use crate::audio::AudioDevice;
use crate::decoder::OfdmDecoder;
use crate::fragment::Reassembler;
use crate::framing::unframe_length;
use crate::kiss;
use crate::mac::TxLockout;
use crate::server::ClientRegistry;
use crate::tnc::{ConfigHandle, TncStats};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const RX_BLOCK: usize = 1024;
/// Horizon added to the TX lockout on every sync event and decode.
pub const RX_LOCKOUT: Duration = Duration::from_millis(500);

/// Sole reader of the audio capture device.
pub struct RxLoop {
    audio: Arc<dyn AudioDevice>,
    decoder: OfdmDecoder,
    reassembler: Arc<Reassembler>,
    clients: Arc<ClientRegistry>,
    lockout: Arc<TxLockout>,
    config: Arc<ConfigHandle>,
    stats: Arc<TncStats>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl RxLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audio: Arc<dyn AudioDevice>,
        decoder: OfdmDecoder,
        reassembler: Arc<Reassembler>,
        clients: Arc<ClientRegistry>,
        lockout: Arc<TxLockout>,
        config: Arc<ConfigHandle>,
        stats: Arc<TncStats>,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            audio,
            decoder,
            reassembler,
            clients,
            lockout,
            config,
            stats,
            running,
        }
    }

    pub fn run(&mut self) {
        let mut buf = vec![0.0f32; RX_BLOCK];
        let mut seen_syncs = self.decoder.sync_count();
        let mut seen_errors = self.decoder.rx_errors();
        while self.running.load(Ordering::Relaxed) {
            let n = self.audio.read(&mut buf);
            if n == 0 {
                continue;
            }
            let mut frames: Vec<Vec<u8>> = Vec::new();
            self.decoder.process(&buf[..n], |data| frames.push(data.to_vec()));

            // Any sync activity means a station is on the air; hold TX off
            // even before the frame completes.
            let syncs = self.decoder.sync_count();
            if syncs != seen_syncs {
                seen_syncs = syncs;
                self.lockout.extend(RX_LOCKOUT);
            }
            let errors = self.decoder.rx_errors();
            if errors != seen_errors {
                self.stats
                    .rx_errors
                    .fetch_add(errors - seen_errors, Ordering::Relaxed);
                seen_errors = errors;
            }
            for frame in frames {
                self.deliver(&frame);
            }
        }
    }

    fn deliver(&mut self, data: &[u8]) {
        self.lockout.extend(RX_LOCKOUT);
        let snr = self.decoder.last_snr();

        let payload = unframe_length(data);
        if payload.is_empty() {
            log::debug!("empty payload after unframing");
            self.stats.rx_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let cfg = self.config.snapshot();
        let payload = if cfg.fragmentation_enabled && self.reassembler.is_fragment(&payload) {
            match self.reassembler.process(&payload) {
                Some(whole) => {
                    self.stats.reassembled.fetch_add(1, Ordering::Relaxed);
                    log::info!("rx reassembled {} bytes", whole.len());
                    whole
                }
                None => return,
            }
        } else {
            payload
        };

        self.stats.rx_frames.fetch_add(1, Ordering::Relaxed);
        log::info!("rx {} bytes, snr {:.0} dB", payload.len(), snr);
        self.clients.broadcast(&kiss::wrap(&payload, 0));
    }
}
