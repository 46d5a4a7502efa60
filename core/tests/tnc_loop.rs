//! End-to-end TNC test: a KISS client frame travels through the queue,
//! the MAC, the modem, the loopback audio channel and back out to every
//! connected client.

use packetwave_core::kiss::{self, KissParser};
use packetwave_core::{CodeRate, LoopbackAudio, Modulation, PttBackend, TncConfig, TncCore};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("probe bind")
        .local_addr()
        .expect("probe addr")
        .port()
}

fn wait_for_connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50))
            }
            Err(err) => panic!("connect failed: {}", err),
        }
    }
}

fn read_one_frame(stream: &mut TcpStream, deadline: Instant) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("read timeout");
    let mut parser = KissParser::new();
    let mut frames: Vec<(u8, Vec<u8>)> = Vec::new();
    let mut buf = [0u8; 4096];
    while frames.is_empty() {
        assert!(Instant::now() < deadline, "timed out waiting for rx frame");
        match stream.read(&mut buf) {
            Ok(0) => panic!("server closed the connection"),
            Ok(n) => parser.process(&buf[..n], |_, cmd, payload| {
                if cmd == kiss::CMD_DATA {
                    frames.push((cmd, payload.to_vec()));
                }
            }),
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(err) => panic!("read failed: {}", err),
        }
    }
    frames.remove(0).1
}

#[test]
fn kiss_data_loops_back_to_clients() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = TncConfig::default();
    config.bind_address = "127.0.0.1".into();
    config.port = free_port();
    config.callsign = "N0CALL".into();
    config.modulation = Modulation::Qpsk;
    config.code_rate = CodeRate::Half;
    config.short_frame = true;
    config.csma_enabled = false;
    config.fragmentation_enabled = false;
    config.tx_delay_ms = 50;
    config.ptt_tail_ms = 10;

    let audio = Arc::new(LoopbackAudio::new());
    let mut core = TncCore::new(config.clone(), audio, PttBackend::None).expect("core");
    let running = core.running_flag();
    let stats = core.stats();

    let server = std::thread::spawn(move || core.run().expect("tnc run"));

    // Two clients: one sends, both must receive the decoded frame back.
    let mut sender = wait_for_connect(config.port);
    let mut listener = wait_for_connect(config.port);

    let payload = b"PING VIA RADIO";
    sender.write_all(&kiss::wrap(payload, 0)).expect("send");

    let deadline = Instant::now() + Duration::from_secs(60);
    let got_listener = read_one_frame(&mut listener, deadline);
    assert_eq!(got_listener, payload);
    let got_sender = read_one_frame(&mut sender, deadline);
    assert_eq!(got_sender, payload);

    assert_eq!(stats.tx_frames.load(Ordering::Relaxed), 1);
    assert_eq!(stats.rx_frames.load(Ordering::Relaxed), 1);

    running.store(false, Ordering::Relaxed);
    server.join().expect("server thread");
}

#[test]
fn fragmented_transfer_loops_back() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = TncConfig::default();
    config.bind_address = "127.0.0.1".into();
    config.port = free_port();
    config.callsign = "N0CALL".into();
    config.modulation = Modulation::Qpsk;
    config.code_rate = CodeRate::Half;
    config.short_frame = true;
    config.csma_enabled = false;
    config.fragmentation_enabled = true;
    config.tx_delay_ms = 20;
    config.ptt_tail_ms = 10;

    let audio = Arc::new(LoopbackAudio::new());
    let mut core = TncCore::new(config.clone(), audio, PttBackend::None).expect("core");
    let running = core.running_flag();
    let stats = core.stats();

    let server = std::thread::spawn(move || core.run().expect("tnc run"));
    let mut client = wait_for_connect(config.port);

    // Larger than one 126 byte frame, so it fragments into three bursts
    // and only the fully reassembled packet may come back.
    let payload: Vec<u8> = (0..300).map(|i| (i % 253) as u8).collect();
    client.write_all(&kiss::wrap(&payload, 0)).expect("send");

    let deadline = Instant::now() + Duration::from_secs(180);
    let got = read_one_frame(&mut client, deadline);
    assert_eq!(got, payload);
    assert_eq!(stats.reassembled.load(Ordering::Relaxed), 1);
    assert!(stats.tx_frames.load(Ordering::Relaxed) >= 3);

    running.store(false, Ordering::Relaxed);
    server.join().expect("server thread");
}
