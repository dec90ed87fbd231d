//! Requests accepted by the target controller and their replies

use tokio::sync::oneshot;

use super::TargetControllerError;
use crate::target::{Breakpoint, TargetDescriptor, TargetRegister, TargetState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetControllerCommand {
    ReadMemory { address: u64, length: usize },
    WriteMemory { address: u64, data: Vec<u8> },
    /// `None` reads every register of the descriptor
    ReadRegisters { registers: Option<Vec<u16>> },
    WriteRegisters { registers: Vec<TargetRegister> },
    InsertBreakpoint(Breakpoint),
    RemoveBreakpoint(Breakpoint),
    ContinueExecution { from: Option<u64> },
    StepExecution { from: Option<u64> },
    StopExecution,
    GetTargetState,
    GetTargetDescriptor,
    EnableProgrammingMode,
    DisableProgrammingMode,
    ResetTarget,
    Shutdown,
}

impl TargetControllerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadMemory { .. } => "read-memory",
            Self::WriteMemory { .. } => "write-memory",
            Self::ReadRegisters { .. } => "read-registers",
            Self::WriteRegisters { .. } => "write-registers",
            Self::InsertBreakpoint(_) => "insert-breakpoint",
            Self::RemoveBreakpoint(_) => "remove-breakpoint",
            Self::ContinueExecution { .. } => "continue-execution",
            Self::StepExecution { .. } => "step-execution",
            Self::StopExecution => "stop-execution",
            Self::GetTargetState => "get-target-state",
            Self::GetTargetDescriptor => "get-target-descriptor",
            Self::EnableProgrammingMode => "enable-programming-mode",
            Self::DisableProgrammingMode => "disable-programming-mode",
            Self::ResetTarget => "reset-target",
            Self::Shutdown => "shutdown",
        }
    }

    /// Commands still served while the controller is suspended for programming.
    /// Everything else is rejected as busy.
    pub fn permitted_while_suspended(&self) -> bool {
        matches!(
            self,
            Self::ReadMemory { .. }
                | Self::WriteMemory { .. }
                | Self::GetTargetState
                | Self::GetTargetDescriptor
                | Self::EnableProgrammingMode
                | Self::DisableProgrammingMode
                | Self::Shutdown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetControllerResponse {
    Ok,
    Memory(Vec<u8>),
    Registers(Vec<TargetRegister>),
    TargetState(TargetState),
    Descriptor(TargetDescriptor),
}

pub type CommandResult = Result<TargetControllerResponse, TargetControllerError>;

/// A queued command with its reply channel
pub(crate) struct Envelope {
    pub id: u64,
    pub command: TargetControllerCommand,
    pub reply: oneshot::Sender<CommandResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::BreakpointKind;

    #[test]
    fn test_suspended_permissions() {
        assert!(TargetControllerCommand::WriteMemory { address: 0, data: vec![] }
            .permitted_while_suspended());
        assert!(TargetControllerCommand::DisableProgrammingMode.permitted_while_suspended());
        assert!(TargetControllerCommand::Shutdown.permitted_while_suspended());
        assert!(!TargetControllerCommand::ContinueExecution { from: None }
            .permitted_while_suspended());
        assert!(!TargetControllerCommand::InsertBreakpoint(Breakpoint::new(
            0x8000,
            BreakpointKind::Software,
            2
        ))
        .permitted_while_suspended());
        assert!(!TargetControllerCommand::ReadRegisters { registers: None }
            .permitted_while_suspended());
    }
}
