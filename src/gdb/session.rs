//! Per-connection debug session
//!
//! Maps RSP commands onto controller service calls. Resuming commands don't
//! wait for the target to stop: they mark the session as awaiting a stop and
//! the stop reply is produced later from the controller's stopped event.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::Command;
use super::feature::Feature;
use super::response::{Response, Signal};
use crate::controller::{TargetControllerError, TargetControllerService};
use crate::events::Event;
use crate::target::{Breakpoint, BreakpointKind, TargetDescriptor, TargetRegister, TargetState};

/// errno values used in `E` replies
pub mod error_code {
    pub const GENERIC: u8 = 0x01;
    pub const BUSY: u8 = 0x10;
    pub const INVALID: u8 = 0x16;
    pub const NO_SPACE: u8 = 0x1c;
    pub const TIMEOUT: u8 = 0x6e;
}

const MONITOR_HELP: &str =
    "Monitor commands:\n  reset - reset the target and halt\n  help  - show this text\n";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Client supports neither software nor hardware breakpoints")]
    ClientNotSupported,

    #[error("Target controller is no longer available")]
    ControllerUnavailable,

    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Wire code for a recoverable controller error; fatal ones end the session
fn error_reply(error: TargetControllerError) -> SessionResult<Response> {
    let code = match error {
        TargetControllerError::ControllerUnavailable => {
            return Err(SessionError::ControllerUnavailable)
        }
        TargetControllerError::Timeout(_) => error_code::TIMEOUT,
        TargetControllerError::ResourceExhausted { .. } => error_code::NO_SPACE,
        TargetControllerError::Busy => error_code::BUSY,
        TargetControllerError::TargetNotHalted | TargetControllerError::InvalidRequest(_) => {
            error_code::INVALID
        }
        TargetControllerError::Target(_) | TargetControllerError::UnexpectedResponse => {
            error_code::GENERIC
        }
    };
    debug!("Replying E{:02x}: {}", code, error);
    Ok(Response::Error(code))
}

fn reply<T>(
    result: Result<T, TargetControllerError>,
    into: impl FnOnce(T) -> Response,
) -> SessionResult<Option<Response>> {
    match result {
        Ok(value) => Ok(Some(into(value))),
        Err(e) => error_reply(e).map(Some),
    }
}

pub struct DebugSession {
    id: Uuid,
    connected_at: DateTime<Utc>,
    descriptor: TargetDescriptor,
    packet_size: usize,
    /// Breakpoints this client set, removed again when it goes away
    breakpoints: BTreeMap<(u64, BreakpointKind), Breakpoint>,
    awaiting_stop: bool,
    /// Whether the resume belonging to the awaited stop has been observed
    resume_seen: bool,
    last_signal: Signal,
}

impl DebugSession {
    pub fn new(descriptor: TargetDescriptor, packet_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            descriptor,
            packet_size,
            breakpoints: BTreeMap::new(),
            awaiting_stop: false,
            resume_seen: false,
            last_signal: Signal::TRAP,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    pub fn awaiting_stop(&self) -> bool {
        self.awaiting_stop
    }

    /// Largest `m` request that fits a reply packet, two hex digits per byte
    fn max_memory_read(&self) -> usize {
        self.packet_size / 2
    }

    fn supported_features(&self) -> Vec<String> {
        [
            Feature::SoftwareBreakpoints,
            Feature::HardwareBreakpoints,
            Feature::NoAckMode,
        ]
        .iter()
        .map(|feature| format!("{}+", feature))
        .collect()
    }

    /// Handle one command. `None` means no immediate reply is due.
    pub async fn handle(
        &mut self,
        command: &Command,
        service: &TargetControllerService,
    ) -> SessionResult<Option<Response>> {
        match command {
            Command::SupportedFeatures(features) => {
                if !features.contains(&Feature::SoftwareBreakpoints)
                    && !features.contains(&Feature::HardwareBreakpoints)
                {
                    return Err(SessionError::ClientNotSupported);
                }
                debug!("Client features: {:?}", features);
                Ok(Some(Response::SupportedFeatures {
                    packet_size: self.packet_size,
                    features: self.supported_features(),
                }))
            }
            Command::HaltReason => Ok(Some(Response::StopReply(self.last_signal))),
            Command::ReadRegisters => reply(service.read_registers(None).await, |registers| {
                Response::Registers(registers.into_iter().flat_map(|r| r.value).collect())
            }),
            Command::ReadRegister(number) => {
                if self.descriptor.register(*number).is_none() {
                    return Ok(Some(Response::Error(error_code::INVALID)));
                }
                reply(
                    service.read_registers(Some(vec![*number])).await,
                    |registers| {
                        Response::Registers(registers.into_iter().flat_map(|r| r.value).collect())
                    },
                )
            }
            Command::WriteRegisters(data) => {
                if data.len() != self.descriptor.register_file_size() {
                    return Ok(Some(Response::Error(error_code::INVALID)));
                }
                let mut offset = 0;
                let mut registers = Vec::with_capacity(self.descriptor.registers.len());
                for register in &self.descriptor.registers {
                    let value = data[offset..offset + register.size].to_vec();
                    registers.push(TargetRegister::new(register.number, value));
                    offset += register.size;
                }
                reply(service.write_registers(registers).await, |_| Response::Ok)
            }
            Command::WriteRegister { number, value } => reply(
                service
                    .write_registers(vec![TargetRegister::new(*number, value.clone())])
                    .await,
                |_| Response::Ok,
            ),
            Command::ReadMemory { address, length } => {
                if *length > self.max_memory_read() {
                    return Ok(Some(Response::Error(error_code::INVALID)));
                }
                reply(
                    service.read_memory(*address, *length).await,
                    Response::Memory,
                )
            }
            Command::WriteMemory { address, data } => reply(
                service.write_memory(*address, data.clone()).await,
                |_| Response::Ok,
            ),
            Command::InsertBreakpoint(breakpoint) => {
                let result = service.insert_breakpoint(*breakpoint).await;
                if result.is_ok() {
                    self.breakpoints.insert(breakpoint.key(), *breakpoint);
                }
                reply(result, |_| Response::Ok)
            }
            Command::RemoveBreakpoint(breakpoint) => {
                let result = service.remove_breakpoint(*breakpoint).await;
                if result.is_ok() {
                    self.breakpoints.remove(&breakpoint.key());
                }
                reply(result, |_| Response::Ok)
            }
            Command::Continue { address } => {
                self.resume(service.continue_execution(*address).await)
            }
            Command::Step { address } => self.resume(service.step_execution(*address).await),
            Command::Interrupt => match service.stop_execution().await {
                Ok(()) => {
                    self.awaiting_stop = false;
                    self.last_signal = Signal::INTERRUPT;
                    Ok(Some(Response::StopReply(Signal::INTERRUPT)))
                }
                Err(e) => error_reply(e).map(Some),
            },
            Command::Detach => Ok(Some(Response::Ok)),
            Command::Kill => Ok(None),
            Command::SetThread => Ok(Some(Response::Ok)),
            Command::CurrentThread => Ok(Some(Response::Text("QC1".to_string()))),
            Command::ThreadInfoFirst => Ok(Some(Response::Text("m1".to_string()))),
            Command::ThreadInfoNext => Ok(Some(Response::Text("l".to_string()))),
            Command::Attached => Ok(Some(Response::Text("1".to_string()))),
            Command::StartNoAckMode => Ok(Some(Response::Ok)),
            Command::Monitor(text) => self.monitor(text, service).await,
            Command::Unsupported(text) => {
                debug!("Unsupported packet: {}", text);
                Ok(Some(Response::Empty))
            }
        }
    }

    fn resume(
        &mut self,
        result: Result<(), TargetControllerError>,
    ) -> SessionResult<Option<Response>> {
        match result {
            Ok(()) => {
                self.awaiting_stop = true;
                self.resume_seen = false;
                Ok(None)
            }
            Err(e) => error_reply(e).map(Some),
        }
    }

    async fn monitor(
        &mut self,
        text: &str,
        service: &TargetControllerService,
    ) -> SessionResult<Option<Response>> {
        let output = match text.trim() {
            "reset" => match service.reset_target().await {
                Ok(()) => {
                    self.last_signal = Signal::TRAP;
                    "Target reset\n".to_string()
                }
                Err(TargetControllerError::ControllerUnavailable) => {
                    return Err(SessionError::ControllerUnavailable)
                }
                Err(e) => format!("Reset failed: {}\n", e),
            },
            "help" => MONITOR_HELP.to_string(),
            other => {
                let mut output = String::new();
                let _ = write!(output, "Unknown monitor command '{}'\n{}", other, MONITOR_HELP);
                output
            }
        };
        Ok(Some(Response::MonitorOutput(output)))
    }

    /// React to a controller event; returns the stop reply when one is due
    pub fn on_event(&mut self, event: &Event) -> Option<Response> {
        match event {
            Event::TargetExecutionResumed { .. } if self.awaiting_stop => {
                self.resume_seen = true;
                None
            }
            Event::TargetExecutionStopped {
                reason,
                program_counter,
            } if self.awaiting_stop && self.resume_seen => {
                let signal = Signal::from(*reason);
                debug!(
                    "Target stopped ({:?}) at {:?}, sending S{:02x}",
                    reason, program_counter, signal.0
                );
                self.awaiting_stop = false;
                self.last_signal = signal;
                Some(Response::StopReply(signal))
            }
            _ => None,
        }
    }

    /// Remove this client's breakpoints and optionally let the target run again
    pub async fn terminate(&mut self, service: &TargetControllerService, resume: bool) {
        for breakpoint in std::mem::take(&mut self.breakpoints).into_values() {
            if let Err(e) = service.remove_breakpoint(breakpoint).await {
                warn!("Failed to remove {} on disconnect: {}", breakpoint, e);
            }
        }

        if resume {
            match service.get_target_state().await {
                Ok(TargetState::Stopped) => {
                    if let Err(e) = service.continue_execution(None).await {
                        warn!("Failed to resume target on disconnect: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to query target state on disconnect: {}", e),
            }
        }

        let duration = Utc::now() - self.connected_at;
        info!(
            "GDB session {} ended after {}s",
            self.id,
            duration.num_seconds()
        );
    }
}
