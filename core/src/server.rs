//! KISS-over-TCP server: accept loop and per-client polling.

use crate::kiss::KissParser;
use crate::tnc::{TncStats, TxPath};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_BUF: usize = 4096;

/// Bind-probe used by the composition root before construction, so a
/// busy port fails fast instead of mid-startup.
pub fn check_port_available(bind_address: &str, port: u16) -> bool {
    TcpListener::bind((bind_address, port)).is_ok()
}

pub struct ClientConnection {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    parser: Mutex<KissParser>,
    write_buf: Mutex<Vec<u8>>,
}

impl ClientConnection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Mutex::new(stream),
            peer,
            parser: Mutex::new(KissParser::new()),
            write_buf: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Append outgoing bytes; the accept loop drains them.
    pub fn enqueue(&self, data: &[u8]) {
        self.write_buf
            .lock()
            .expect("write buffer poisoned")
            .extend_from_slice(data);
    }

    /// Push pending bytes out. Returns false on a dead socket.
    fn flush(&self) -> bool {
        let mut buf = self.write_buf.lock().expect("write buffer poisoned");
        if buf.is_empty() {
            return true;
        }
        let mut stream = self.stream.lock().expect("client stream poisoned");
        match stream.write(&buf) {
            Ok(sent) => {
                buf.drain(..sent);
                true
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

/// The connected client set, shared between the accept loop (mutation)
/// and the RX loop (broadcast).
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<ClientConnection>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast(&self, frame: &[u8]) {
        let clients = self.clients.lock().expect("client list poisoned");
        for client in clients.iter() {
            client.enqueue(frame);
        }
    }

    pub fn count(&self) -> usize {
        self.clients.lock().expect("client list poisoned").len()
    }

    fn add(&self, client: Arc<ClientConnection>) {
        self.clients.lock().expect("client list poisoned").push(client);
    }
}

pub struct KissServer {
    listener: TcpListener,
    clients: Arc<ClientRegistry>,
    tx_path: Arc<TxPath>,
    stats: Arc<TncStats>,
    running: Arc<AtomicBool>,
}

impl KissServer {
    pub fn bind(
        bind_address: &str,
        port: u16,
        clients: Arc<ClientRegistry>,
        tx_path: Arc<TxPath>,
        stats: Arc<TncStats>,
        running: Arc<AtomicBool>,
    ) -> crate::error::Result<Self> {
        let listener = TcpListener::bind((bind_address, port))?;
        listener.set_nonblocking(true)?;
        log::info!("kiss server listening on {}:{}", bind_address, port);
        Ok(Self {
            listener,
            clients,
            tx_path,
            stats,
            running,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Accept and poll until shutdown. Runs on the caller's thread.
    pub fn run(&self) {
        let mut buf = [0u8; READ_BUF];
        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        log::warn!("client {} setup failed: {}", peer, err);
                    } else {
                        let _ = stream.set_nodelay(true);
                        log::info!("client connected: {}", peer);
                        self.clients.add(Arc::new(ClientConnection::new(stream, peer)));
                        self.stats
                            .clients
                            .store(self.clients.count(), Ordering::Relaxed);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    if self.running.load(Ordering::Relaxed) {
                        log::warn!("accept failed: {}", err);
                    }
                }
            }
            self.poll_clients(&mut buf);
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn poll_clients(&self, buf: &mut [u8]) {
        let mut clients = self.clients.clients.lock().expect("client list poisoned");
        let before = clients.len();
        clients.retain(|client| {
            let read_ok = {
                let mut stream = client.stream.lock().expect("client stream poisoned");
                match stream.read(buf) {
                    Ok(0) => {
                        log::info!("client disconnected: {}", client.peer());
                        None
                    }
                    Ok(n) => Some(n),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => Some(0),
                    Err(err) => {
                        log::info!("client {} read error: {}", client.peer(), err);
                        None
                    }
                }
            };
            let Some(n) = read_ok else {
                return false;
            };
            if n > 0 {
                let mut parser = client.parser.lock().expect("parser poisoned");
                parser.process(&buf[..n], |port, cmd, payload| {
                    self.tx_path.handle_frame(port, cmd, payload);
                });
            }
            if !client.flush() {
                log::info!("client {} write error, disconnecting", client.peer());
                return false;
            }
            true
        });
        if clients.len() != before {
            self.stats.clients.store(clients.len(), Ordering::Relaxed);
        }
    }
}
