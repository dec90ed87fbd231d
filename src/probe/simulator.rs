//! In-memory simulated target
//!
//! A 32-bit core with sixteen registers (r15 is the program counter), flat
//! memory starting at address zero and a fixed number of hardware breakpoint
//! comparators. When running, every status poll executes a batch of 2-byte
//! "instructions"; execution halts on a hardware comparator match or on a
//! patched break instruction.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{DebugProbe, ProbeError, ProbeResult, ProbeStatus};
use crate::target::{RegisterDescriptor, StopReason, TargetDescriptor};

const REGISTER_COUNT: u16 = 16;
const PC_REGISTER: u16 = 15;
const INSTRUCTION_SIZE: u64 = 2;
/// Thumb `BKPT #0`
pub const BREAK_INSTRUCTION: [u8; 2] = [0x00, 0xBE];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SimulatorConfig {
    pub memory_size: usize,
    pub hw_breakpoint_slots: usize,
    /// Instructions executed per status poll while running
    pub instructions_per_poll: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            memory_size: 65536, // 64KB
            hw_breakpoint_slots: 4,
            instructions_per_poll: 64,
        }
    }
}

#[derive(Debug)]
pub struct SimulatedProbe {
    config: SimulatorConfig,
    memory: Vec<u8>,
    registers: [u32; REGISTER_COUNT as usize],
    hw_breakpoints: Vec<u64>,
    status: ProbeStatus,
    activated: bool,
    programming_mode: bool,
}

impl SimulatedProbe {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            memory: vec![0u8; config.memory_size],
            config,
            registers: [0; REGISTER_COUNT as usize],
            hw_breakpoints: Vec::new(),
            status: ProbeStatus::Halted(StopReason::Reset),
            activated: false,
            programming_mode: false,
        }
    }

    fn pc(&self) -> u64 {
        u64::from(self.registers[PC_REGISTER as usize])
    }

    fn set_pc(&mut self, value: u64) {
        self.registers[PC_REGISTER as usize] = value as u32;
    }

    fn ensure_active(&self) -> ProbeResult<()> {
        if self.activated {
            Ok(())
        } else {
            Err(ProbeError::Operation("Simulated target not activated".to_string()))
        }
    }

    fn range(&self, address: u64, length: usize) -> ProbeResult<std::ops::Range<usize>> {
        let start = usize::try_from(address)
            .map_err(|_| ProbeError::Operation(format!("Invalid address 0x{:08X}", address)))?;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= self.memory.len())
            .ok_or_else(|| {
                ProbeError::Operation(format!(
                    "Memory range 0x{:08X}+{} outside simulated memory",
                    address, length
                ))
            })?;
        Ok(start..end)
    }

    fn breakpoint_at(&self, pc: u64) -> bool {
        if self.hw_breakpoints.contains(&pc) {
            return true;
        }
        let start = pc as usize;
        self.memory.get(start..start + BREAK_INSTRUCTION.len()) == Some(&BREAK_INSTRUCTION[..])
    }

    fn advance(&mut self) {
        let memory_size = self.memory.len() as u64;
        for _ in 0..self.config.instructions_per_poll {
            let pc = self.pc();
            if self.breakpoint_at(pc) {
                trace!("Simulated core hit breakpoint at 0x{:08X}", pc);
                self.status = ProbeStatus::Halted(StopReason::Breakpoint);
                return;
            }
            self.set_pc((pc + INSTRUCTION_SIZE) % memory_size.max(INSTRUCTION_SIZE));
        }
    }

    fn descriptor(&self) -> TargetDescriptor {
        let registers = (0..REGISTER_COUNT)
            .map(|number| RegisterDescriptor {
                number,
                name: match number {
                    13 => "sp".to_string(),
                    14 => "lr".to_string(),
                    PC_REGISTER => "pc".to_string(),
                    n => format!("r{}", n),
                },
                size: 4,
            })
            .collect();

        TargetDescriptor {
            name: "simulated-cortex".to_string(),
            registers,
            program_counter: PC_REGISTER,
            break_instruction: BREAK_INSTRUCTION.to_vec(),
            hardware_breakpoint_slots: self.config.hw_breakpoint_slots,
        }
    }
}

impl DebugProbe for SimulatedProbe {
    fn activate(&mut self) -> ProbeResult<TargetDescriptor> {
        if self.config.memory_size < BREAK_INSTRUCTION.len() {
            return Err(ProbeError::Initialisation(
                "Simulated memory too small".to_string(),
            ));
        }
        self.activated = true;
        debug!(
            "Simulated target activated ({} bytes memory, {} hardware breakpoints)",
            self.memory.len(),
            self.config.hw_breakpoint_slots
        );
        Ok(self.descriptor())
    }

    fn deactivate(&mut self) -> ProbeResult<()> {
        self.ensure_active()?;
        self.hw_breakpoints.clear();
        self.status = ProbeStatus::Running;
        self.activated = false;
        Ok(())
    }

    fn halt(&mut self) -> ProbeResult<()> {
        self.ensure_active()?;
        if self.status == ProbeStatus::Running {
            self.status = ProbeStatus::Halted(StopReason::Interrupt);
        }
        Ok(())
    }

    fn run(&mut self) -> ProbeResult<()> {
        self.ensure_active()?;
        if self.programming_mode {
            return Err(ProbeError::Operation("Target is in programming mode".to_string()));
        }
        self.status = ProbeStatus::Running;
        Ok(())
    }

    fn step(&mut self) -> ProbeResult<()> {
        self.ensure_active()?;
        let next = (self.pc() + INSTRUCTION_SIZE) % self.memory.len() as u64;
        self.set_pc(next);
        self.status = ProbeStatus::Halted(StopReason::Step);
        Ok(())
    }

    fn reset(&mut self) -> ProbeResult<()> {
        self.ensure_active()?;
        self.registers = [0; REGISTER_COUNT as usize];
        self.status = ProbeStatus::Halted(StopReason::Reset);
        Ok(())
    }

    fn status(&mut self) -> ProbeResult<ProbeStatus> {
        self.ensure_active()?;
        if self.status == ProbeStatus::Running {
            self.advance();
        }
        Ok(self.status)
    }

    fn read_register(&mut self, number: u16) -> ProbeResult<Vec<u8>> {
        self.ensure_active()?;
        self.registers
            .get(usize::from(number))
            .map(|value| value.to_le_bytes().to_vec())
            .ok_or_else(|| ProbeError::Operation(format!("No register {}", number)))
    }

    fn write_register(&mut self, number: u16, value: &[u8]) -> ProbeResult<()> {
        self.ensure_active()?;
        let bytes: [u8; 4] = value
            .try_into()
            .map_err(|_| ProbeError::Operation(format!("Register {} expects 4 bytes", number)))?;
        let slot = self
            .registers
            .get_mut(usize::from(number))
            .ok_or_else(|| ProbeError::Operation(format!("No register {}", number)))?;
        *slot = u32::from_le_bytes(bytes);
        Ok(())
    }

    fn read_program_counter(&mut self) -> ProbeResult<u64> {
        self.ensure_active()?;
        Ok(self.pc())
    }

    fn write_program_counter(&mut self, value: u64) -> ProbeResult<()> {
        self.ensure_active()?;
        self.set_pc(value);
        Ok(())
    }

    fn read_memory(&mut self, address: u64, length: usize) -> ProbeResult<Vec<u8>> {
        self.ensure_active()?;
        let range = self.range(address, length)?;
        Ok(self.memory[range].to_vec())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> ProbeResult<()> {
        self.ensure_active()?;
        let range = self.range(address, data.len())?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn set_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        self.ensure_active()?;
        if self.hw_breakpoints.contains(&address) {
            return Ok(());
        }
        if self.hw_breakpoints.len() >= self.config.hw_breakpoint_slots {
            return Err(ProbeError::Operation("No free breakpoint comparator".to_string()));
        }
        self.hw_breakpoints.push(address);
        Ok(())
    }

    fn clear_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        self.ensure_active()?;
        self.hw_breakpoints.retain(|a| *a != address);
        Ok(())
    }

    fn enable_programming_mode(&mut self) -> ProbeResult<()> {
        self.ensure_active()?;
        self.status = ProbeStatus::Halted(StopReason::Other);
        self.programming_mode = true;
        Ok(())
    }

    fn disable_programming_mode(&mut self) -> ProbeResult<()> {
        self.ensure_active()?;
        self.programming_mode = false;
        Ok(())
    }
}
