//! PTT backends behind one keying interface.
//!
//! The set of variants is fixed, so the MAC switches on an enum instead
//! of dispatching through a trait object. `Vox` has no control channel
//! at all; the MAC keys the radio by prepending and appending audio
//! tones, so its arm here only tracks state.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialLine {
    Dtr,
    Rts,
    Both,
}

impl SerialLine {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "dtr" => Self::Dtr,
            "rts" => Self::Rts,
            "both" => Self::Both,
            _ => return None,
        })
    }
}

/// Rigctl network PTT: `T 1` / `T 0` to a rigctld instance, which
/// answers `RPRT 0` on success.
pub struct RigctlPtt {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    ptt_on: bool,
}

impl RigctlPtt {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
            ptt_on: false,
        }
    }

    pub fn connect(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        match TcpStream::connect((self.host.as_str(), self.port)) {
            Ok(stream) => {
                let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
                log::info!("rigctl connected to {}:{}", self.host, self.port);
                self.stream = Some(stream);
                true
            }
            Err(err) => {
                log::warn!("rigctl connect to {}:{} failed: {}", self.host, self.port, err);
                false
            }
        }
    }

    pub fn set_ptt(&mut self, on: bool) -> bool {
        if self.stream.is_none() && !self.connect() {
            return false;
        }
        let command: &[u8] = if on { b"T 1\n" } else { b"T 0\n" };
        let stream = self.stream.as_mut().expect("stream just checked");
        if stream.write_all(command).is_err() {
            log::warn!("rigctl write failed, dropping connection");
            self.stream = None;
            return false;
        }
        let mut response = [0u8; 256];
        match stream.read(&mut response) {
            Ok(n) if n > 0 => {
                let text = String::from_utf8_lossy(&response[..n]);
                if text.contains("RPRT 0") {
                    self.ptt_on = on;
                    log::debug!("rigctl ptt {}", if on { "on" } else { "off" });
                    true
                } else {
                    log::warn!("rigctl ptt command failed: {}", text.trim());
                    false
                }
            }
            _ => {
                // No response within the timeout; assume it went through.
                self.ptt_on = on;
                true
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for RigctlPtt {
    fn drop(&mut self) {
        if self.ptt_on {
            self.set_ptt(false);
        }
    }
}

/// Serial PTT keys the radio with the RTS and/or DTR modem-control
/// lines, optionally inverted.
pub struct SerialPtt {
    path: String,
    line: SerialLine,
    invert_dtr: bool,
    invert_rts: bool,
    #[cfg(unix)]
    file: Option<std::fs::File>,
}

impl SerialPtt {
    pub fn new(path: &str, line: SerialLine, invert_dtr: bool, invert_rts: bool) -> Self {
        Self {
            path: path.to_string(),
            line,
            invert_dtr,
            invert_rts,
            #[cfg(unix)]
            file: None,
        }
    }

    #[cfg(unix)]
    pub fn connect(&mut self) -> bool {
        if self.file.is_some() {
            return true;
        }
        match std::fs::OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => {
                self.file = Some(file);
                self.apply(false);
                log::info!("serial ptt on {}", self.path);
                true
            }
            Err(err) => {
                log::warn!("serial ptt open {} failed: {}", self.path, err);
                false
            }
        }
    }

    #[cfg(not(unix))]
    pub fn connect(&mut self) -> bool {
        log::warn!("serial ptt is only supported on unix hosts");
        false
    }

    #[cfg(unix)]
    pub fn set_ptt(&mut self, on: bool) -> bool {
        if self.file.is_none() && !self.connect() {
            return false;
        }
        self.apply(on);
        true
    }

    #[cfg(not(unix))]
    pub fn set_ptt(&mut self, _on: bool) -> bool {
        false
    }

    pub fn is_connected(&self) -> bool {
        #[cfg(unix)]
        {
            self.file.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    #[cfg(unix)]
    fn apply(&mut self, on: bool) {
        use std::os::unix::io::AsRawFd;
        let Some(file) = &self.file else { return };
        let fd = file.as_raw_fd();
        let mut flags: libc::c_int = 0;
        unsafe {
            if libc::ioctl(fd, libc::TIOCMGET, &mut flags) != 0 {
                log::warn!("serial ptt TIOCMGET failed");
                return;
            }
        }
        let dtr_assert = on != self.invert_dtr;
        let rts_assert = on != self.invert_rts;
        if matches!(self.line, SerialLine::Dtr | SerialLine::Both) {
            if dtr_assert {
                flags |= libc::TIOCM_DTR;
            } else {
                flags &= !libc::TIOCM_DTR;
            }
        }
        if matches!(self.line, SerialLine::Rts | SerialLine::Both) {
            if rts_assert {
                flags |= libc::TIOCM_RTS;
            } else {
                flags &= !libc::TIOCM_RTS;
            }
        }
        unsafe {
            if libc::ioctl(fd, libc::TIOCMSET, &flags) != 0 {
                log::warn!("serial ptt TIOCMSET failed");
            }
        }
    }
}

/// Build the five byte CM108 GPIO report. `gpio` is 1-based; the same
/// mask lands in both the data and mask fields.
pub fn cm108_report(gpio: u8, on: bool) -> [u8; 5] {
    debug_assert!((1..=4).contains(&gpio));
    let mask = if on { 1u8 << (gpio - 1) } else { 0 };
    [0x00, 0x00, mask, mask, 0x00]
}

/// CM108-family USB soundcard PTT via its hidraw device node.
pub struct Cm108Ptt {
    path: String,
    gpio: u8,
    dev: Option<std::fs::File>,
}

impl Cm108Ptt {
    pub fn new(path: &str, gpio: u8) -> Self {
        Self {
            path: path.to_string(),
            gpio: gpio.clamp(1, 4),
            dev: None,
        }
    }

    pub fn connect(&mut self) -> bool {
        if self.dev.is_some() {
            return true;
        }
        match std::fs::OpenOptions::new().write(true).open(&self.path) {
            Ok(dev) => {
                log::info!("cm108 ptt on {} gpio {}", self.path, self.gpio);
                self.dev = Some(dev);
                true
            }
            Err(err) => {
                log::warn!("cm108 ptt open {} failed: {}", self.path, err);
                false
            }
        }
    }

    pub fn set_ptt(&mut self, on: bool) -> bool {
        if self.dev.is_none() && !self.connect() {
            return false;
        }
        let report = cm108_report(self.gpio, on);
        match self.dev.as_mut().expect("device just checked").write_all(&report) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("cm108 ptt write failed: {}", err);
                self.dev = None;
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.dev.is_some()
    }
}

/// The MAC's view of the radio keying line.
pub enum PttBackend {
    None,
    Rigctl(RigctlPtt),
    Vox,
    Serial(SerialPtt),
    Cm108(Cm108Ptt),
}

impl PttBackend {
    pub fn connect(&mut self) -> bool {
        match self {
            Self::None | Self::Vox => true,
            Self::Rigctl(ptt) => ptt.connect(),
            Self::Serial(ptt) => ptt.connect(),
            Self::Cm108(ptt) => ptt.connect(),
        }
    }

    pub fn set_ptt(&mut self, on: bool) -> bool {
        match self {
            Self::None | Self::Vox => true,
            Self::Rigctl(ptt) => ptt.set_ptt(on),
            Self::Serial(ptt) => ptt.set_ptt(on),
            Self::Cm108(ptt) => ptt.set_ptt(on),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::None | Self::Vox => true,
            Self::Rigctl(ptt) => ptt.is_connected(),
            Self::Serial(ptt) => ptt.is_connected(),
            Self::Cm108(ptt) => ptt.is_connected(),
        }
    }

    /// True for backends that key a control line around the transmission.
    pub fn keys_line(&self) -> bool {
        matches!(self, Self::Rigctl(_) | Self::Serial(_) | Self::Cm108(_))
    }

    pub fn is_vox(&self) -> bool {
        matches!(self, Self::Vox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cm108_report_bytes() {
        assert_eq!(cm108_report(3, true), [0x00, 0x00, 0x04, 0x04, 0x00]);
        assert_eq!(cm108_report(3, false), [0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(cm108_report(1, true), [0x00, 0x00, 0x01, 0x01, 0x00]);
        assert_eq!(cm108_report(4, true), [0x00, 0x00, 0x08, 0x08, 0x00]);
    }

    #[test]
    fn rigctl_speaks_the_wire_protocol() {
        use std::io::{BufRead, BufReader, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut commands = Vec::new();
            let mut stream = stream;
            for _ in 0..2 {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                commands.push(line.clone());
                stream.write_all(b"RPRT 0\n").unwrap();
            }
            commands
        });

        let mut ptt = RigctlPtt::new("127.0.0.1", addr.port());
        assert!(ptt.connect());
        assert!(ptt.set_ptt(true));
        assert!(ptt.set_ptt(false));
        let commands = server.join().unwrap();
        assert_eq!(commands, vec!["T 1\n".to_string(), "T 0\n".to_string()]);
    }

    #[test]
    fn vox_and_none_are_always_ready() {
        let mut none = PttBackend::None;
        let mut vox = PttBackend::Vox;
        assert!(none.connect() && none.set_ptt(true));
        assert!(vox.connect() && vox.set_ptt(true));
        assert!(!none.keys_line());
        assert!(vox.is_vox());
    }
}
