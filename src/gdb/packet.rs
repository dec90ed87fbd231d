//! RSP packet framing
//!
//! Inbound bytes go through [`PacketDecoder`], a small state machine that
//! recognises `$payload#hh` frames, acknowledgements and the out-of-band
//! interrupt byte. The checksum covers the payload bytes as sent; escapes
//! (`}` + byte ^ 0x20) and run-length sequences (`*` + count) are expanded
//! only after the checksum matched.

use thiserror::Error;
use tracing::trace;

pub const INTERRUPT_BYTE: u8 = 0x03;
const ESCAPE: u8 = b'}';
const RUN_LENGTH: u8 = b'*';
/// Run-length counts are encoded as `repeats + 29`
const RUN_LENGTH_BIAS: u8 = 29;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Checksum mismatch: packet says {expected:02x}, payload sums to {computed:02x}")]
    ChecksumMismatch { expected: u8, computed: u8 },

    #[error("Checksum is not two hex digits: {0:?}")]
    InvalidChecksum(String),

    #[error("Escape character at end of packet")]
    TruncatedEscape,

    #[error("Invalid run-length sequence")]
    InvalidRunLength,

    #[error("Packet exceeds {0} bytes")]
    PacketTooLarge(usize),
}

/// One unit of inbound traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    Interrupt,
    /// Verified, unescaped and expanded payload
    Packet(Vec<u8>),
    /// A complete frame that must be discarded and NACKed
    Invalid(ProtocolError),
}

enum State {
    Ready,
    Body,
    Checksum1,
    Checksum2,
}

pub struct PacketDecoder {
    state: State,
    body: Vec<u8>,
    checksum: [u8; 2],
    max_size: usize,
    overflowed: bool,
}

impl PacketDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: State::Ready,
            body: Vec::new(),
            checksum: [0; 2],
            max_size,
            overflowed: false,
        }
    }

    /// Feed bytes from the transport. Partial frames are kept for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for &byte in data {
            if let Some(frame) = self.pump(byte) {
                frames.push(frame);
            }
        }
        frames
    }

    fn pump(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            State::Ready => match byte {
                b'$' => {
                    self.start();
                    None
                }
                b'+' => Some(Frame::Ack),
                b'-' => Some(Frame::Nack),
                INTERRUPT_BYTE => Some(Frame::Interrupt),
                _ => {
                    trace!("Ignoring stray byte 0x{:02x}", byte);
                    None
                }
            },
            State::Body => {
                match byte {
                    b'#' => self.state = State::Checksum1,
                    // A new start marker abandons the partial packet
                    b'$' => self.start(),
                    _ if self.body.len() >= self.max_size => self.overflowed = true,
                    _ => self.body.push(byte),
                }
                None
            }
            State::Checksum1 => {
                self.checksum[0] = byte;
                self.state = State::Checksum2;
                None
            }
            State::Checksum2 => {
                self.checksum[1] = byte;
                self.state = State::Ready;
                Some(self.finish())
            }
        }
    }

    fn start(&mut self) {
        self.body.clear();
        self.overflowed = false;
        self.state = State::Body;
    }

    fn finish(&mut self) -> Frame {
        let body = std::mem::take(&mut self.body);
        trace!(
            "<-- ${}#{}",
            String::from_utf8_lossy(&body),
            String::from_utf8_lossy(&self.checksum)
        );

        if self.overflowed {
            return Frame::Invalid(ProtocolError::PacketTooLarge(self.max_size));
        }

        let Some(expected) = parse_checksum(self.checksum) else {
            return Frame::Invalid(ProtocolError::InvalidChecksum(
                String::from_utf8_lossy(&self.checksum).into_owned(),
            ));
        };
        let computed = checksum(&body);
        if computed != expected {
            return Frame::Invalid(ProtocolError::ChecksumMismatch { expected, computed });
        }

        match expand(&body) {
            Ok(payload) => Frame::Packet(payload),
            Err(e) => Frame::Invalid(e),
        }
    }
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn parse_checksum(digits: [u8; 2]) -> Option<u8> {
    Some(hex_digit(digits[0])? << 4 | hex_digit(digits[1])?)
}

/// Undo escaping and run-length encoding
fn expand(raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied();
    while let Some(byte) = bytes.next() {
        match byte {
            ESCAPE => {
                let escaped = bytes.next().ok_or(ProtocolError::TruncatedEscape)?;
                out.push(escaped ^ 0x20);
            }
            RUN_LENGTH => {
                let count = bytes.next().ok_or(ProtocolError::InvalidRunLength)?;
                let repeated = *out.last().ok_or(ProtocolError::InvalidRunLength)?;
                let repeats = count
                    .checked_sub(RUN_LENGTH_BIAS)
                    .ok_or(ProtocolError::InvalidRunLength)?;
                out.extend(std::iter::repeat(repeated).take(usize::from(repeats)));
            }
            _ => out.push(byte),
        }
    }
    Ok(out)
}

/// Frame a payload: escape reserved bytes and append the checksum
pub fn encode_packet(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    for &byte in payload {
        match byte {
            b'$' | b'#' | ESCAPE | RUN_LENGTH => {
                body.push(ESCAPE);
                body.push(byte ^ 0x20);
            }
            _ => body.push(byte),
        }
    }

    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(&body);
    packet.push(b'#');
    packet.extend_from_slice(format!("{:02x}", checksum(&body)).as_bytes());
    packet
}
