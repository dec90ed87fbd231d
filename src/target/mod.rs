//! Target model shared by the controller, the probe backends and the GDB server

use std::fmt;

/// Describes one register of the target, in GDB register numbering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub number: u16,
    pub name: String,
    /// Width in bytes
    pub size: usize,
}

/// A register value in target byte order (little-endian for every supported core)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRegister {
    pub number: u16,
    pub value: Vec<u8>,
}

impl TargetRegister {
    pub fn new(number: u16, value: Vec<u8>) -> Self {
        Self { number, value }
    }
}

/// Immutable snapshot of the connected target, taken once the probe handshake succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub name: String,
    /// Registers in the order GDB expects them in `g`/`G` packets
    pub registers: Vec<RegisterDescriptor>,
    /// GDB register number of the program counter
    pub program_counter: u16,
    /// Instruction patched into memory for software breakpoints
    pub break_instruction: Vec<u8>,
    pub hardware_breakpoint_slots: usize,
}

impl TargetDescriptor {
    pub fn register(&self, number: u16) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|r| r.number == number)
    }

    pub fn register_numbers(&self) -> Vec<u16> {
        self.registers.iter().map(|r| r.number).collect()
    }

    /// Size of a full `g` register dump in bytes
    pub fn register_file_size(&self) -> usize {
        self.registers.iter().map(|r| r.size).sum()
    }
}

/// Execution state of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Nothing reliable is known, e.g. after the probe was lost
    Unknown,
    Running,
    Stopped,
    Stepping,
}

impl TargetState {
    /// True while the target is executing and the controller must poll for a halt
    pub fn is_executing(self) -> bool {
        matches!(self, TargetState::Running | TargetState::Stepping)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Unknown => write!(f, "unknown"),
            TargetState::Running => write!(f, "running"),
            TargetState::Stopped => write!(f, "stopped"),
            TargetState::Stepping => write!(f, "stepping"),
        }
    }
}

/// Why the target halted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    /// Halt requested by a client
    Interrupt,
    Reset,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BreakpointKind {
    /// Break instruction patched into program memory
    Software,
    /// On-chip address comparator
    Hardware,
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointKind::Software => write!(f, "software"),
            BreakpointKind::Hardware => write!(f, "hardware"),
        }
    }
}

/// A breakpoint request. Two breakpoints with the same address and kind are
/// the same breakpoint, whatever their size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u64,
    pub kind: BreakpointKind,
    pub size: usize,
}

impl Breakpoint {
    pub fn new(address: u64, kind: BreakpointKind, size: usize) -> Self {
        Self { address, kind, size }
    }

    pub fn key(&self) -> (u64, BreakpointKind) {
        (self.address, self.kind)
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} breakpoint at 0x{:08X}", self.kind, self.address)
    }
}
