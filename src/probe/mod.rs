//! Debug probe abstraction
//!
//! The target controller talks to hardware exclusively through [`DebugProbe`].
//! Vendor protocols, USB transport and flash algorithms live behind the
//! backends in this module.

pub mod discovery;
pub mod probe_rs_backend;
pub mod simulator;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::target::{StopReason, TargetDescriptor};

pub use probe_rs_backend::{ProbeRsConfig, ProbeRsProbe};
pub use simulator::{SimulatedProbe, SimulatorConfig};

/// Errors reported by a probe backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The probe could not be reached: USB/transport failure, probe gone.
    #[error("Probe communication failure: {0}")]
    Communication(String),

    /// The probe answered but the operation failed on the target
    #[error("Target operation failed: {0}")]
    Operation(String),

    #[error("Probe initialisation failed: {0}")]
    Initialisation(String),
}

impl ProbeError {
    /// Communication failures leave the probe in an unknown state and end the controller
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::Communication(_))
    }
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// Execution status as reported by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Running,
    Halted(StopReason),
}

/// Which backend drives the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeBackend {
    /// Physical probe through probe-rs (J-Link, ST-Link, CMSIS-DAP, ...)
    ProbeRs,
    /// In-memory simulated target
    Simulator,
}

impl std::fmt::Display for ProbeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeBackend::ProbeRs => write!(f, "probe-rs"),
            ProbeBackend::Simulator => write!(f, "simulator"),
        }
    }
}

/// A single debug probe attached to a single target core.
///
/// Implementations are driven from one thread only and never see two
/// overlapping calls.
pub trait DebugProbe {
    /// Perform the probe/target handshake and describe the target.
    fn activate(&mut self) -> ProbeResult<TargetDescriptor>;

    /// Release the target, leaving it running.
    fn deactivate(&mut self) -> ProbeResult<()>;

    fn halt(&mut self) -> ProbeResult<()>;

    fn run(&mut self) -> ProbeResult<()>;

    /// Execute a single instruction. The halt is reported by the next [`DebugProbe::status`].
    fn step(&mut self) -> ProbeResult<()>;

    /// Reset the target and leave it halted
    fn reset(&mut self) -> ProbeResult<()>;

    fn status(&mut self) -> ProbeResult<ProbeStatus>;

    fn read_register(&mut self, number: u16) -> ProbeResult<Vec<u8>>;

    fn write_register(&mut self, number: u16, value: &[u8]) -> ProbeResult<()>;

    fn read_program_counter(&mut self) -> ProbeResult<u64>;

    fn write_program_counter(&mut self, value: u64) -> ProbeResult<()>;

    fn read_memory(&mut self, address: u64, length: usize) -> ProbeResult<Vec<u8>>;

    fn write_memory(&mut self, address: u64, data: &[u8]) -> ProbeResult<()>;

    fn set_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()>;

    fn clear_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()>;

    fn enable_programming_mode(&mut self) -> ProbeResult<()> {
        Ok(())
    }

    fn disable_programming_mode(&mut self) -> ProbeResult<()> {
        Ok(())
    }
}

impl<P: DebugProbe + ?Sized> DebugProbe for Box<P> {
    fn activate(&mut self) -> ProbeResult<TargetDescriptor> {
        (**self).activate()
    }

    fn deactivate(&mut self) -> ProbeResult<()> {
        (**self).deactivate()
    }

    fn halt(&mut self) -> ProbeResult<()> {
        (**self).halt()
    }

    fn run(&mut self) -> ProbeResult<()> {
        (**self).run()
    }

    fn step(&mut self) -> ProbeResult<()> {
        (**self).step()
    }

    fn reset(&mut self) -> ProbeResult<()> {
        (**self).reset()
    }

    fn status(&mut self) -> ProbeResult<ProbeStatus> {
        (**self).status()
    }

    fn read_register(&mut self, number: u16) -> ProbeResult<Vec<u8>> {
        (**self).read_register(number)
    }

    fn write_register(&mut self, number: u16, value: &[u8]) -> ProbeResult<()> {
        (**self).write_register(number, value)
    }

    fn read_program_counter(&mut self) -> ProbeResult<u64> {
        (**self).read_program_counter()
    }

    fn write_program_counter(&mut self, value: u64) -> ProbeResult<()> {
        (**self).write_program_counter(value)
    }

    fn read_memory(&mut self, address: u64, length: usize) -> ProbeResult<Vec<u8>> {
        (**self).read_memory(address, length)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> ProbeResult<()> {
        (**self).write_memory(address, data)
    }

    fn set_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        (**self).set_hw_breakpoint(address)
    }

    fn clear_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        (**self).clear_hw_breakpoint(address)
    }

    fn enable_programming_mode(&mut self) -> ProbeResult<()> {
        (**self).enable_programming_mode()
    }

    fn disable_programming_mode(&mut self) -> ProbeResult<()> {
        (**self).disable_programming_mode()
    }
}
