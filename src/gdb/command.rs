//! Typed RSP requests

use std::collections::BTreeSet;

use thiserror::Error;

use super::feature::Feature;
use crate::target::{Breakpoint, BreakpointKind};

/// A packet that was framed correctly but whose fields don't parse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("Missing field in '{0}' packet")]
    MissingField(char),

    #[error("Invalid hex field: {0:?}")]
    InvalidHex(String),

    #[error("Payload has {actual} bytes, header declares {declared}")]
    LengthMismatch { declared: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `qSupported[:features]`, the features the client advertised with `+`
    SupportedFeatures(BTreeSet<Feature>),
    /// `?`
    HaltReason,
    ReadRegisters,
    ReadRegister(u16),
    /// Register file in descriptor order, target byte order
    WriteRegisters(Vec<u8>),
    WriteRegister { number: u16, value: Vec<u8> },
    ReadMemory { address: u64, length: usize },
    /// `M` (hex) or `X` (binary)
    WriteMemory { address: u64, data: Vec<u8> },
    InsertBreakpoint(Breakpoint),
    RemoveBreakpoint(Breakpoint),
    Continue { address: Option<u64> },
    Step { address: Option<u64> },
    /// The out-of-band 0x03 byte
    Interrupt,
    Detach,
    Kill,
    /// `H<op><thread>`
    SetThread,
    /// `qC`
    CurrentThread,
    /// `qfThreadInfo`
    ThreadInfoFirst,
    /// `qsThreadInfo`
    ThreadInfoNext,
    /// `qAttached`
    Attached,
    StartNoAckMode,
    /// `qRcmd`, decoded from hex
    Monitor(String),
    /// Anything else; answered with the empty reply
    Unsupported(String),
}

type Result<T> = std::result::Result<T, CommandParseError>;

impl Command {
    pub fn parse(payload: &[u8]) -> Result<Command> {
        let Some((&letter, rest)) = payload.split_first() else {
            return Ok(Command::Unsupported(String::new()));
        };
        let unsupported = || Command::Unsupported(String::from_utf8_lossy(payload).into_owned());

        let command = match letter {
            b'?' => Command::HaltReason,
            b'g' => Command::ReadRegisters,
            b'G' => Command::WriteRegisters(decode_hex(rest)?),
            b'p' => Command::ReadRegister(parse_hex(rest)?),
            b'P' => {
                let (number, value) = split(rest, b'=', 'P')?;
                Command::WriteRegister {
                    number: parse_hex(number)?,
                    value: decode_hex(value)?,
                }
            }
            b'm' => {
                let (address, length) = split(rest, b',', 'm')?;
                Command::ReadMemory {
                    address: parse_hex(address)?,
                    length: parse_hex(length)?,
                }
            }
            b'M' | b'X' => {
                let (header, data) = split(rest, b':', letter as char)?;
                let (address, length) = split(header, b',', letter as char)?;
                let declared: usize = parse_hex(length)?;
                let data = if letter == b'M' {
                    decode_hex(data)?
                } else {
                    data.to_vec()
                };
                if data.len() != declared {
                    return Err(CommandParseError::LengthMismatch {
                        declared,
                        actual: data.len(),
                    });
                }
                Command::WriteMemory {
                    address: parse_hex(address)?,
                    data,
                }
            }
            b'Z' | b'z' => {
                // Conditions and commands after ';' are not supported and ignored
                let fields = rest.split(|b| *b == b';').next().unwrap_or_default();
                let mut fields = fields.split(|b| *b == b',');
                let kind = match fields.next() {
                    Some(b"0") => BreakpointKind::Software,
                    Some(b"1") => BreakpointKind::Hardware,
                    // Watchpoints
                    _ => return Ok(unsupported()),
                };
                let missing = CommandParseError::MissingField(letter as char);
                let address = parse_hex(fields.next().ok_or(missing.clone())?)?;
                let size = parse_hex(fields.next().ok_or(missing)?)?;
                let breakpoint = Breakpoint::new(address, kind, size);
                if letter == b'Z' {
                    Command::InsertBreakpoint(breakpoint)
                } else {
                    Command::RemoveBreakpoint(breakpoint)
                }
            }
            b'c' => Command::Continue {
                address: parse_optional_hex(rest)?,
            },
            b's' => Command::Step {
                address: parse_optional_hex(rest)?,
            },
            b'D' => Command::Detach,
            b'k' => Command::Kill,
            b'H' => Command::SetThread,
            b'q' | b'Q' => Self::parse_query(payload).unwrap_or_else(unsupported),
            _ => unsupported(),
        };
        Ok(command)
    }

    fn parse_query(payload: &[u8]) -> Option<Command> {
        let text = std::str::from_utf8(payload).ok()?;
        let (name, arguments) = match text.find([':', ',']) {
            Some(index) => (&text[..index], &text[index + 1..]),
            None => (text, ""),
        };

        let command = match name {
            "qSupported" => Command::SupportedFeatures(
                arguments
                    .split(';')
                    .filter_map(|entry| entry.strip_suffix('+'))
                    .filter_map(Feature::from_name)
                    .collect(),
            ),
            "qC" => Command::CurrentThread,
            "qfThreadInfo" => Command::ThreadInfoFirst,
            "qsThreadInfo" => Command::ThreadInfoNext,
            "qAttached" => Command::Attached,
            "QStartNoAckMode" => Command::StartNoAckMode,
            "qRcmd" => {
                let command = hex::decode(arguments).ok()?;
                Command::Monitor(String::from_utf8_lossy(&command).into_owned())
            }
            _ => return None,
        };
        Some(command)
    }
}

fn split(data: &[u8], separator: u8, letter: char) -> Result<(&[u8], &[u8])> {
    let index = data
        .iter()
        .position(|b| *b == separator)
        .ok_or(CommandParseError::MissingField(letter))?;
    Ok((&data[..index], &data[index + 1..]))
}

fn invalid_hex(data: &[u8]) -> CommandParseError {
    CommandParseError::InvalidHex(String::from_utf8_lossy(data).into_owned())
}

fn parse_hex<T: TryFrom<u64>>(data: &[u8]) -> Result<T> {
    let text = std::str::from_utf8(data).map_err(|_| invalid_hex(data))?;
    if text.is_empty() {
        return Err(invalid_hex(data));
    }
    let value = u64::from_str_radix(text, 16).map_err(|_| invalid_hex(data))?;
    T::try_from(value).map_err(|_| invalid_hex(data))
}

fn parse_optional_hex(data: &[u8]) -> Result<Option<u64>> {
    if data.is_empty() {
        Ok(None)
    } else {
        parse_hex(data).map(Some)
    }
}

fn decode_hex(data: &[u8]) -> Result<Vec<u8>> {
    hex::decode(data).map_err(|_| invalid_hex(data))
}
