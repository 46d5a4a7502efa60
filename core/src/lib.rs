//! Software TNC core: an OFDM soundcard modem bridged to KISS over TCP.
//!
//! One side is a TCP server speaking KISS to any number of client
//! applications; the other produces and consumes audio carrying an
//! OFDM waveform over an amateur-radio voice channel, keying the
//! radio's PTT line around each transmission. In between sit the
//! half-duplex MAC (carrier sense, binary exponential backoff,
//! p-persistence, TX lockout) and an MTU-aware fragmentation layer.

pub mod audio;
pub mod constellation;
pub mod crc;
pub mod decoder;
pub mod dsp;
pub mod encoder;
pub mod error;
pub mod fragment;
pub mod framing;
pub mod hadamard;
pub mod kiss;
pub mod mac;
pub mod mls;
pub mod modes;
pub mod polar;
pub mod ptt;
pub mod queue;
pub mod rx;
pub mod server;
pub mod sync;
pub mod theil_sen;
pub mod tnc;

pub use audio::{AudioDevice, LoopbackAudio, NullAudio};
pub use decoder::OfdmDecoder;
pub use encoder::OfdmEncoder;
pub use error::{Result, TncError};
pub use fragment::{Fragmenter, Reassembler};
pub use modes::{encode_callsign, encode_mode, CodeRate, ModeParams, Modulation};
pub use ptt::{Cm108Ptt, PttBackend, RigctlPtt, SerialLine, SerialPtt};
pub use tnc::{ConfigHandle, TncConfig, TncCore, TncStats};

/// Nominal audio rate; other multiples of 300 Hz work too.
pub const DEFAULT_SAMPLE_RATE: usize = 48000;
pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_CENTER_FREQ: i32 = 1500;
