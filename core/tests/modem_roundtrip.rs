use packetwave_core::framing::{frame_with_length, unframe_length};
use packetwave_core::{
    encode_callsign, encode_mode, CodeRate, Modulation, OfdmDecoder, OfdmEncoder,
};

fn round_trip(payload: &[u8], modulation: Modulation, rate: CodeRate, center_freq: i32) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mode = encode_mode(modulation, rate, true);
    let call = encode_callsign("N0CALL").expect("callsign");

    let mut encoder = OfdmEncoder::new(48000).expect("encoder");
    let capacity = encoder.payload_size(mode).expect("payload size");
    assert!(payload.len() + 2 <= capacity, "payload too large for mode");

    let framed = frame_with_length(payload);
    let samples = encoder.encode(&framed, center_freq, call, mode).expect("encode");
    assert!(!samples.is_empty());

    let mut decoder = OfdmDecoder::new(48000).expect("decoder");
    let mut frames: Vec<Vec<u8>> = Vec::new();
    // Leading and trailing silence around the burst, fed in audio-sized
    // blocks the way the receive loop would.
    let mut stream = vec![0.0f32; 24000];
    stream.extend_from_slice(&samples);
    stream.extend_from_slice(&vec![0.0f32; 48000]);
    for block in stream.chunks(1024) {
        decoder.process(block, |data| frames.push(data.to_vec()));
    }

    assert_eq!(frames.len(), 1, "expected exactly one decoded frame");
    assert_eq!(frames[0].len(), capacity);
    assert_eq!(unframe_length(&frames[0]), payload);
    assert!(decoder.last_snr() > 10.0, "snr {}", decoder.last_snr());
}

#[test]
fn qpsk_half_short_hello() {
    round_trip(b"HELLO", Modulation::Qpsk, CodeRate::Half, 1500);
}

#[test]
fn qpsk_at_low_center_frequency() {
    round_trip(b"offset test", Modulation::Qpsk, CodeRate::Half, 1000);
}

#[test]
fn qpsk_at_high_center_frequency() {
    round_trip(b"offset test", Modulation::Qpsk, CodeRate::Half, 2000);
}

#[test]
fn bpsk_half_short() {
    round_trip(b"robust mode", Modulation::Bpsk, CodeRate::Half, 1500);
}

#[test]
fn qam16_half_short() {
    let payload: Vec<u8> = (0u8..250).collect();
    round_trip(&payload, Modulation::Qam16, CodeRate::Half, 1500);
}

#[test]
fn qpsk_quarter_rate() {
    round_trip(b"low rate", Modulation::Qpsk, CodeRate::Quarter, 1500);
}

#[test]
fn full_capacity_payload() {
    let encoder = OfdmEncoder::new(48000).unwrap();
    let mode = encode_mode(Modulation::Qpsk, CodeRate::Half, true);
    let capacity = encoder.payload_size(mode).unwrap();
    let payload: Vec<u8> = (0..capacity - 2).map(|i| (i * 37) as u8).collect();
    round_trip(&payload, Modulation::Qpsk, CodeRate::Half, 1500);
}

#[test]
fn two_bursts_back_to_back() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mode = encode_mode(Modulation::Qpsk, CodeRate::Half, true);
    let call = encode_callsign("W1AW").unwrap();
    let mut encoder = OfdmEncoder::new(48000).unwrap();

    let mut stream = vec![0.0f32; 20000];
    for text in [b"first burst".as_slice(), b"second one".as_slice()] {
        let framed = frame_with_length(text);
        stream.extend_from_slice(&encoder.encode(&framed, 1500, call, mode).unwrap());
        stream.extend_from_slice(&vec![0.0f32; 30000]);
    }
    stream.extend_from_slice(&vec![0.0f32; 30000]);

    let mut decoder = OfdmDecoder::new(48000).unwrap();
    let mut frames: Vec<Vec<u8>> = Vec::new();
    for block in stream.chunks(1024) {
        decoder.process(block, |data| frames.push(data.to_vec()));
    }
    assert_eq!(frames.len(), 2);
    assert_eq!(unframe_length(&frames[0]), b"first burst");
    assert_eq!(unframe_length(&frames[1]), b"second one");
}

#[test]
fn noise_alone_decodes_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut decoder = OfdmDecoder::new(48000).unwrap();
    // Deterministic pseudo-noise, loud enough to exercise the correlator.
    let mut state = 0x12345678u32;
    let noise: Vec<f32> = (0..96000)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32 - 0.5) * 0.5
        })
        .collect();
    let mut count = 0usize;
    for block in noise.chunks(1024) {
        decoder.process(block, |_| count += 1);
    }
    assert_eq!(count, 0, "spurious frame from noise");
}
