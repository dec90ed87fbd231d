//! Typed RSP replies

use std::fmt::Write as _;

use super::command::{Command, CommandParseError};
use crate::target::StopReason;

/// POSIX signal number reported in stop replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(pub u8);

impl Signal {
    pub const INTERRUPT: Signal = Signal(2);
    pub const TRAP: Signal = Signal(5);
}

impl From<StopReason> for Signal {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Interrupt => Signal::INTERRUPT,
            _ => Signal::TRAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    /// `E<hh>`, errno style
    Error(u8),
    /// The empty reply: command not supported
    Empty,
    SupportedFeatures {
        packet_size: usize,
        features: Vec<String>,
    },
    Registers(Vec<u8>),
    Memory(Vec<u8>),
    StopReply(Signal),
    /// `qRcmd` output, hex encoded on the wire
    MonitorOutput(String),
    /// Sent verbatim
    Text(String),
}

impl Response {
    pub fn to_payload(&self) -> String {
        match self {
            Response::Ok => "OK".to_string(),
            Response::Error(code) => format!("E{:02x}", code),
            Response::Empty => String::new(),
            Response::SupportedFeatures {
                packet_size,
                features,
            } => {
                let mut payload = format!("PacketSize={:x}", packet_size);
                for feature in features {
                    let _ = write!(payload, ";{}", feature);
                }
                payload
            }
            Response::Registers(data) | Response::Memory(data) => hex::encode(data),
            Response::StopReply(signal) => format!("S{:02x}", signal.0),
            Response::MonitorOutput(text) => hex::encode(text.as_bytes()),
            Response::Text(text) => text.clone(),
        }
    }

    /// Interpret a reply payload as the answer to `command`, the way a client would
    pub fn decode(command: &Command, payload: &str) -> Result<Response, CommandParseError> {
        let invalid = || CommandParseError::InvalidHex(payload.to_string());

        if payload.is_empty() {
            return Ok(Response::Empty);
        }
        if payload == "OK" {
            return Ok(Response::Ok);
        }
        if let Some(code) = payload.strip_prefix('E').filter(|code| code.len() == 2) {
            return u8::from_str_radix(code, 16)
                .map(Response::Error)
                .map_err(|_| invalid());
        }

        match command {
            Command::SupportedFeatures(_) => {
                let mut packet_size = None;
                let mut features = Vec::new();
                for entry in payload.split(';') {
                    match entry.strip_prefix("PacketSize=") {
                        Some(size) => {
                            packet_size =
                                Some(usize::from_str_radix(size, 16).map_err(|_| invalid())?)
                        }
                        None => features.push(entry.to_string()),
                    }
                }
                Ok(Response::SupportedFeatures {
                    packet_size: packet_size.unwrap_or_default(),
                    features,
                })
            }
            Command::ReadRegisters | Command::ReadRegister(_) => {
                hex::decode(payload).map(Response::Registers).map_err(|_| invalid())
            }
            Command::ReadMemory { .. } => {
                hex::decode(payload).map(Response::Memory).map_err(|_| invalid())
            }
            Command::HaltReason
            | Command::Continue { .. }
            | Command::Step { .. }
            | Command::Interrupt => {
                let number = payload
                    .strip_prefix('S')
                    .or_else(|| payload.strip_prefix('T').map(|rest| rest.get(..2).unwrap_or(rest)))
                    .ok_or_else(invalid)?;
                u8::from_str_radix(number, 16)
                    .map(|n| Response::StopReply(Signal(n)))
                    .map_err(|_| invalid())
            }
            Command::Monitor(_) => {
                let bytes = hex::decode(payload).map_err(|_| invalid())?;
                Ok(Response::MonitorOutput(String::from_utf8_lossy(&bytes).into_owned()))
            }
            _ => Ok(Response::Text(payload.to_string())),
        }
    }
}
