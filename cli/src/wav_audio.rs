//! WAV-file audio device for offline runs: capture streams from a
//! recording, playback accumulates into a file written at drop.

use packetwave_core::AudioDevice;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct WavAudio {
    sample_rate: usize,
    capture: Mutex<std::vec::IntoIter<f32>>,
    playback: Mutex<Vec<f32>>,
    output_path: PathBuf,
    level_window: Mutex<Vec<f32>>,
}

impl WavAudio {
    pub fn open(input: &Path, output: &Path, sample_rate: usize) -> Result<Self, String> {
        let samples = read_wav(input, sample_rate)?;
        Ok(Self {
            sample_rate,
            capture: Mutex::new(samples.into_iter()),
            playback: Mutex::new(Vec::new()),
            output_path: output.to_path_buf(),
            level_window: Mutex::new(Vec::new()),
        })
    }
}

pub fn read_wav(path: &Path, expect_rate: usize) -> Result<Vec<f32>, String> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let spec = reader.spec();
    if spec.sample_rate as usize != expect_rate {
        return Err(format!(
            "{} is {} Hz, expected {} Hz",
            path.display(),
            spec.sample_rate,
            expect_rate
        ));
    }
    let mut samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()
            .map_err(|e| format!("read failed: {}", e))?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| format!("read failed: {}", e))?,
        (format, bits) => {
            return Err(format!("unsupported wav format: {:?} {} bit", format, bits))
        }
    };
    if spec.channels == 2 {
        samples = samples.chunks(2).map(|pair| (pair[0] + pair[1]) * 0.5).collect();
    } else if spec.channels != 1 {
        return Err(format!("unsupported channel count {}", spec.channels));
    }
    Ok(samples)
}

pub fn write_wav(path: &Path, samples: &[f32], sample_rate: usize) -> Result<(), String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer
            .write_sample(value)
            .map_err(|e| format!("write failed: {}", e))?;
    }
    writer.finalize().map_err(|e| format!("finalize failed: {}", e))
}

impl AudioDevice for WavAudio {
    fn read(&self, buf: &mut [f32]) -> usize {
        let mut capture = self.capture.lock().expect("capture poisoned");
        let mut n = 0;
        for slot in buf.iter_mut() {
            match capture.next() {
                Some(s) => {
                    *slot = s;
                    n += 1;
                }
                None => *slot = 0.0,
            }
        }
        let mut window = self.level_window.lock().expect("level poisoned");
        window.extend_from_slice(&buf[..n]);
        let keep = self.sample_rate / 10;
        if window.len() > keep {
            let excess = window.len() - keep;
            window.drain(..excess);
        }
        if n == 0 {
            // Recording exhausted; pace like a quiet channel.
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        buf.len()
    }

    fn write(&self, samples: &[f32]) {
        self.playback
            .lock()
            .expect("playback poisoned")
            .extend_from_slice(samples);
    }

    fn drain(&self) {}

    fn measure_level(&self, _window_ms: u64) -> f32 {
        let window = self.level_window.lock().expect("level poisoned");
        if window.is_empty() {
            return -120.0;
        }
        let power: f32 = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
        10.0 * power.max(1e-12).log10()
    }
}

impl Drop for WavAudio {
    fn drop(&mut self) {
        let playback = self.playback.lock().expect("playback poisoned");
        if playback.is_empty() {
            return;
        }
        if let Err(err) = write_wav(&self.output_path, &playback, self.sample_rate) {
            log::warn!("failed to write {}: {}", self.output_path.display(), err);
        } else {
            log::info!(
                "wrote {} samples to {}",
                playback.len(),
                self.output_path.display()
            );
        }
    }
}
