//! KISS framing: per-connection byte-stream parser and frame builder.

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

pub const CMD_DATA: u8 = 0x00;
pub const CMD_TXDELAY: u8 = 0x01;
pub const CMD_P: u8 = 0x02;
pub const CMD_SLOTTIME: u8 = 0x03;
pub const CMD_TXTAIL: u8 = 0x04;
pub const CMD_FULLDUPLEX: u8 = 0x05;
pub const CMD_SETHW: u8 = 0x06;
pub const CMD_RETURN: u8 = 0x0F;

/// Streaming KISS decoder. Bytes before the first FEND are discarded;
/// every complete frame is split into port, command and payload.
#[derive(Default)]
pub struct KissParser {
    in_frame: bool,
    escape: bool,
    buffer: Vec<u8>,
}

impl KissParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, data: &[u8], mut callback: impl FnMut(u8, u8, &[u8])) {
        for &byte in data {
            self.process_byte(byte, &mut callback);
        }
    }

    fn process_byte(&mut self, byte: u8, callback: &mut impl FnMut(u8, u8, &[u8])) {
        if byte == FEND {
            if self.in_frame && !self.buffer.is_empty() {
                let cmd_byte = self.buffer[0];
                let port = (cmd_byte >> 4) & 0x0F;
                let cmd = cmd_byte & 0x0F;
                callback(port, cmd, &self.buffer[1..]);
            }
            self.in_frame = true;
            self.buffer.clear();
            self.escape = false;
        } else if self.in_frame {
            if self.escape {
                match byte {
                    TFEND => self.buffer.push(FEND),
                    TFESC => self.buffer.push(FESC),
                    other => self.buffer.push(other),
                }
                self.escape = false;
            } else if byte == FESC {
                self.escape = true;
            } else {
                self.buffer.push(byte);
            }
        }
    }
}

/// Build a KISS DATA frame for `payload` on `port`.
pub fn wrap(payload: &[u8], port: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(FEND);
    frame.push((port << 4) | CMD_DATA);
    for &byte in payload {
        match byte {
            FEND => {
                frame.push(FESC);
                frame.push(TFEND);
            }
            FESC => {
                frame.push(FESC);
                frame.push(TFESC);
            }
            other => frame.push(other),
        }
    }
    frame.push(FEND);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(stream: &[u8]) -> Vec<(u8, u8, Vec<u8>)> {
        let mut parser = KissParser::new();
        let mut frames = Vec::new();
        parser.process(stream, |port, cmd, payload| {
            frames.push((port, cmd, payload.to_vec()));
        });
        frames
    }

    #[test]
    fn wrap_parse_round_trip() {
        let payload = vec![0x01, FEND, 0x02, FESC, 0x03, 0x00, 0xFF];
        let frames = parse_all(&wrap(&payload, 0));
        assert_eq!(frames.len(), 1);
        let (port, cmd, decoded) = &frames[0];
        assert_eq!(*port, 0);
        assert_eq!(*cmd, CMD_DATA);
        assert_eq!(*decoded, payload);
    }

    #[test]
    fn body_never_contains_fend() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = wrap(&payload, 0);
        assert!(frame[1..frame.len() - 1].iter().all(|&b| b != FEND));
    }

    #[test]
    fn txdelay_command_frame() {
        let frames = parse_all(&[FEND, CMD_TXDELAY, 0x32, FEND]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, CMD_TXDELAY);
        assert_eq!(frames[0].2, vec![0x32]);
    }

    #[test]
    fn garbage_before_first_fend_is_ignored() {
        let mut stream = vec![0xAA, 0xBB, 0xCC];
        stream.extend_from_slice(&wrap(b"ok", 0));
        let frames = parse_all(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].2, b"ok");
    }

    #[test]
    fn frames_split_across_reads() {
        let frame = wrap(b"split me", 2);
        let mut parser = KissParser::new();
        let mut got = Vec::new();
        for chunk in frame.chunks(3) {
            parser.process(chunk, |port, _, payload| {
                got.push((port, payload.to_vec()));
            });
        }
        assert_eq!(got, vec![(2, b"split me".to_vec())]);
    }

    #[test]
    fn back_to_back_frames_share_a_fend() {
        let mut stream = wrap(b"one", 0);
        stream.extend_from_slice(&wrap(b"two", 0));
        let frames = parse_all(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].2, b"one");
        assert_eq!(frames[1].2, b"two");
    }
}
