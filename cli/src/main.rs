mod settings;
mod wav_audio;

use clap::{Parser, Subcommand};
use packetwave_core::framing::{frame_with_length, unframe_length};
use packetwave_core::server::check_port_available;
use packetwave_core::{
    CodeRate, Cm108Ptt, LoopbackAudio, Modulation, NullAudio, OfdmDecoder, OfdmEncoder,
    PttBackend, RigctlPtt, SerialLine, SerialPtt, TncConfig, TncCore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "packetwave")]
#[command(about = "KISS-over-TCP TNC for OFDM over amateur radio voice channels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TCP port for the KISS server
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address for the KISS server
    #[arg(long)]
    bind: Option<String>,

    /// Audio device id: loopback, null, or wav:<input>,<output>
    #[arg(short, long)]
    device: Option<String>,

    /// List built-in audio device ids and exit
    #[arg(long)]
    list_audio: bool,

    /// Station callsign
    #[arg(short, long)]
    callsign: Option<String>,

    /// Modulation: BPSK, QPSK, 8PSK, QAM16, QAM64, QAM256, QAM1024, QAM4096
    #[arg(short, long)]
    modulation: Option<String>,

    /// Code rate: 1/2, 2/3, 3/4, 5/6, 1/4
    #[arg(short = 'r', long)]
    rate: Option<String>,

    /// Centre frequency in Hz
    #[arg(short, long)]
    freq: Option<i32>,

    /// Use short frames
    #[arg(long)]
    short: bool,

    /// Use normal frames
    #[arg(long)]
    normal: bool,

    /// Apply a named preset from the presets file
    #[arg(long)]
    preset: Option<String>,

    /// PTT backend: none, rigctl, vox, serial, cm108
    #[arg(long)]
    ptt: Option<String>,

    /// Rigctl address as HOST:PORT
    #[arg(long)]
    rigctl: Option<String>,

    /// Serial port for serial PTT
    #[arg(long, default_value = "/dev/ttyUSB0")]
    serial_port: String,

    /// Serial PTT line: dtr, rts, both
    #[arg(long, default_value = "rts")]
    serial_line: String,

    /// Invert the DTR line
    #[arg(long)]
    invert_dtr: bool,

    /// Invert the RTS line
    #[arg(long)]
    invert_rts: bool,

    /// VOX tone frequency in Hz
    #[arg(long)]
    vox_freq: Option<u32>,

    /// VOX lead tone duration in ms
    #[arg(long)]
    vox_lead: Option<u64>,

    /// VOX tail tone duration in ms
    #[arg(long)]
    vox_tail: Option<u64>,

    /// hidraw device node for CM108 PTT
    #[arg(long, default_value = "/dev/hidraw0")]
    cm108_device: String,

    /// CM108 GPIO pin (1-4)
    #[arg(long, default_value = "3")]
    cm108_gpio: u8,

    /// PTT delay before transmit in ms
    #[arg(long)]
    ptt_delay: Option<u64>,

    /// PTT tail after transmit in ms
    #[arg(long)]
    ptt_tail: Option<u64>,

    /// Disable CSMA carrier sensing
    #[arg(long)]
    no_csma: bool,

    /// Carrier sense threshold in dB
    #[arg(long)]
    csma_threshold: Option<f32>,

    /// CSMA slot time in ms
    #[arg(long)]
    csma_slot: Option<u64>,

    /// CSMA p-persistence, 0-255
    #[arg(long)]
    csma_persist: Option<u8>,

    /// Enable packet fragmentation and reassembly
    #[arg(long)]
    frag: bool,

    /// Disable fragmentation
    #[arg(long)]
    no_frag: bool,

    /// Verbose logging (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a binary file into an OFDM WAV burst
    Encode {
        /// Input binary file
        input: PathBuf,
        /// Output WAV file
        output: PathBuf,
    },
    /// Decode an OFDM WAV recording back into binary payloads
    Decode {
        /// Input WAV file
        input: PathBuf,
        /// Output binary file for the first decoded payload
        output: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

fn build_config(cli: &Cli) -> Result<TncConfig, String> {
    let mut config = TncConfig::default();
    if let Some(path) = settings::settings_path() {
        if settings::load(&path, &mut config) {
            log::info!("loaded settings from {}", path.display());
        }
    }
    if let Some(name) = &cli.preset {
        let Some(path) = settings::presets_path() else {
            return Err("no presets file available".into());
        };
        if !settings::apply_preset(&path, name, &mut config) {
            return Err(format!("preset {:?} not found in {}", name, path.display()));
        }
        log::info!("applied preset {}", name);
    }

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = &cli.bind {
        config.bind_address = bind.clone();
    }
    if let Some(callsign) = &cli.callsign {
        config.callsign = callsign.clone();
    }
    if let Some(name) = &cli.modulation {
        config.modulation =
            Modulation::from_name(name).ok_or_else(|| format!("unknown modulation {:?}", name))?;
    }
    if let Some(name) = &cli.rate {
        config.code_rate =
            CodeRate::from_name(name).ok_or_else(|| format!("unknown code rate {:?}", name))?;
    }
    if let Some(freq) = cli.freq {
        config.center_freq = freq;
    }
    if cli.short {
        config.short_frame = true;
    }
    if cli.normal {
        config.short_frame = false;
    }
    if let Some(freq) = cli.vox_freq {
        config.vox_tone_freq = freq;
    }
    if let Some(ms) = cli.vox_lead {
        config.vox_lead_ms = ms;
    }
    if let Some(ms) = cli.vox_tail {
        config.vox_tail_ms = ms;
    }
    if let Some(ms) = cli.ptt_delay {
        config.ptt_delay_ms = ms;
    }
    if let Some(ms) = cli.ptt_tail {
        config.ptt_tail_ms = ms;
    }
    if cli.no_csma {
        config.csma_enabled = false;
    }
    if let Some(db) = cli.csma_threshold {
        config.carrier_threshold_db = db;
    }
    if let Some(ms) = cli.csma_slot {
        config.slot_time_ms = ms;
    }
    if let Some(p) = cli.csma_persist {
        config.p_persistence = p;
    }
    if cli.frag {
        config.fragmentation_enabled = true;
    }
    if cli.no_frag {
        config.fragmentation_enabled = false;
    }
    Ok(config)
}

fn build_audio(device: &str, sample_rate: usize) -> Result<Arc<dyn packetwave_core::AudioDevice>, String> {
    if device == "loopback" {
        return Ok(Arc::new(LoopbackAudio::new()));
    }
    if device == "null" {
        return Ok(Arc::new(NullAudio::new(sample_rate)));
    }
    if let Some(spec) = device.strip_prefix("wav:") {
        let (input, output) = spec
            .split_once(',')
            .ok_or_else(|| "wav device needs wav:<input>,<output>".to_string())?;
        let audio = wav_audio::WavAudio::open(
            std::path::Path::new(input),
            std::path::Path::new(output),
            sample_rate,
        )?;
        return Ok(Arc::new(audio));
    }
    Err(format!(
        "unknown audio device {:?}; soundcard backends plug in via the AudioDevice interface",
        device
    ))
}

fn build_ptt(cli: &Cli) -> Result<PttBackend, String> {
    let kind = cli.ptt.as_deref().unwrap_or("none");
    Ok(match kind {
        "none" => PttBackend::None,
        "vox" => PttBackend::Vox,
        "rigctl" => {
            let spec = cli.rigctl.as_deref().unwrap_or("localhost:4532");
            let (host, port) = match spec.split_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    port.parse::<u16>()
                        .map_err(|_| format!("bad rigctl port in {:?}", spec))?,
                ),
                None => (spec.to_string(), 4532),
            };
            PttBackend::Rigctl(RigctlPtt::new(&host, port))
        }
        "serial" => {
            let line = SerialLine::from_name(&cli.serial_line)
                .ok_or_else(|| format!("unknown serial line {:?}", cli.serial_line))?;
            PttBackend::Serial(SerialPtt::new(
                &cli.serial_port,
                line,
                cli.invert_dtr,
                cli.invert_rts,
            ))
        }
        "cm108" => {
            if !(1..=4).contains(&cli.cm108_gpio) {
                return Err(format!("cm108 gpio {} out of range 1-4", cli.cm108_gpio));
            }
            PttBackend::Cm108(Cm108Ptt::new(&cli.cm108_device, cli.cm108_gpio))
        }
        other => return Err(format!("unknown ptt type {:?}", other)),
    })
}

fn encode_command(cli: &Cli, input: &PathBuf, output: &PathBuf) -> Result<(), String> {
    let mut config = build_config(cli)?;
    config
        .resolve()
        .map_err(|e| format!("configuration error: {}", e))?;
    let data = std::fs::read(input).map_err(|e| format!("cannot read {}: {}", input.display(), e))?;

    let mut encoder =
        OfdmEncoder::new(config.sample_rate).map_err(|e| format!("encoder: {}", e))?;
    let capacity = encoder
        .payload_size(config.oper_mode)
        .map_err(|e| format!("mode: {}", e))?;
    if data.len() + 2 > capacity {
        return Err(format!(
            "input is {} bytes but the mode carries at most {} (enable --frag in TNC mode for large transfers)",
            data.len(),
            capacity - 2
        ));
    }
    let framed = frame_with_length(&data);
    let samples = encoder
        .encode(&framed, config.center_freq, config.call_sign, config.oper_mode)
        .map_err(|e| format!("encode failed: {}", e))?;
    wav_audio::write_wav(output, &samples, config.sample_rate)?;
    log::info!(
        "encoded {} bytes into {} samples ({:.2} s) at {}",
        data.len(),
        samples.len(),
        samples.len() as f32 / config.sample_rate as f32,
        output.display()
    );
    Ok(())
}

fn decode_command(cli: &Cli, input: &PathBuf, output: &Option<PathBuf>) -> Result<(), String> {
    let config = build_config(cli)?;
    let samples = wav_audio::read_wav(input, config.sample_rate)?;
    let mut decoder =
        OfdmDecoder::new(config.sample_rate).map_err(|e| format!("decoder: {}", e))?;

    let mut payloads: Vec<Vec<u8>> = Vec::new();
    let mut stream = samples;
    // Trailing silence flushes a burst that ends at the file boundary.
    stream.extend_from_slice(&vec![0.0f32; config.sample_rate]);
    for block in stream.chunks(1024) {
        decoder.process(block, |data| payloads.push(unframe_length(data)));
    }

    if payloads.is_empty() {
        return Err("no frames decoded".into());
    }
    for (i, payload) in payloads.iter().enumerate() {
        log::info!(
            "frame {}: {} bytes, snr {:.1} dB",
            i,
            payload.len(),
            decoder.last_snr()
        );
        println!("{}", String::from_utf8_lossy(payload));
    }
    if let Some(path) = output {
        std::fs::write(path, &payloads[0])
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
    }
    Ok(())
}

fn run_tnc(cli: &Cli) -> Result<(), String> {
    let mut config = build_config(cli)?;
    config
        .resolve()
        .map_err(|e| format!("configuration error: {}", e))?;

    if !check_port_available(&config.bind_address, config.port) {
        return Err(format!(
            "port {} on {} is already in use; another TNC instance may be running (use --port)",
            config.port, config.bind_address
        ));
    }

    let device = cli.device.as_deref().unwrap_or("null");
    let audio = build_audio(device, config.sample_rate)?;
    let ptt = build_ptt(cli)?;

    log::info!("audio device: {}", device);
    let mut core =
        TncCore::new(config, audio, ptt).map_err(|e| format!("startup failed: {}", e))?;
    core.run().map_err(|e| format!("tnc failed: {}", e))?;

    if let Some(path) = settings::settings_path() {
        let snapshot = core.config().snapshot();
        if let Err(err) = settings::save(&path, &snapshot) {
            log::warn!("could not save settings to {}: {}", path.display(), err);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.list_audio {
        println!("Built-in audio devices:");
        println!("  loopback              in-memory playback-to-capture pair");
        println!("  null                  silent capture, discarded playback");
        println!("  wav:<input>,<output>  capture from a WAV recording, playback to a WAV file");
        return ExitCode::SUCCESS;
    }

    let result = match &cli.command {
        Some(Commands::Encode { input, output }) => encode_command(&cli, input, output),
        Some(Commands::Decode { input, output }) => decode_command(&cli, input, output),
        None => run_tnc(&cli),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            log::error!("{}", message);
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}
