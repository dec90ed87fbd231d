//! Hardware backend built on probe-rs

use std::time::Duration;

use probe_rs::{
    Architecture, Core, CoreStatus, HaltReason, MemoryInterface, Permissions, RegisterId,
    RegisterValue, Session,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::discovery::ProbeDiscovery;
use super::{DebugProbe, ProbeError, ProbeResult, ProbeStatus};
use crate::target::{RegisterDescriptor, StopReason, TargetDescriptor};

/// Thumb `BKPT #0`
const ARM_BREAK_INSTRUCTION: [u8; 2] = [0x00, 0xBE];
/// RISC-V `EBREAK`
const RISCV_BREAK_INSTRUCTION: [u8; 4] = [0x73, 0x00, 0x10, 0x00];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProbeRsConfig {
    /// Serial number, identifier fragment, or "auto"
    pub probe_selector: String,
    /// probe-rs target name, e.g. "STM32F407VGTx"
    pub target_chip: String,
    pub speed_khz: u32,
    pub connect_under_reset: bool,
    pub core_index: usize,
    pub halt_timeout_ms: u64,
}

impl Default for ProbeRsConfig {
    fn default() -> Self {
        Self {
            probe_selector: "auto".to_string(),
            target_chip: String::new(),
            speed_khz: 4000,
            connect_under_reset: false,
            core_index: 0,
            halt_timeout_ms: 1000,
        }
    }
}

/// One core of a target attached through a probe-rs session
pub struct ProbeRsProbe {
    config: ProbeRsConfig,
    session: Option<Session>,
    /// GDB register number -> (probe-rs id, width in bytes)
    registers: Vec<(RegisterId, usize)>,
    pc: Option<(RegisterId, usize)>,
}

impl ProbeRsProbe {
    pub fn new(config: ProbeRsConfig) -> Self {
        Self {
            config,
            session: None,
            registers: Vec::new(),
            pc: None,
        }
    }

    fn core(&mut self) -> ProbeResult<Core<'_>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ProbeError::Operation("Probe not attached".to_string()))?;
        session.core(self.config.core_index).map_err(classify)
    }

    fn halt_timeout(&self) -> Duration {
        Duration::from_millis(self.config.halt_timeout_ms)
    }

    fn register(&self, number: u16) -> ProbeResult<(RegisterId, usize)> {
        self.registers
            .get(usize::from(number))
            .copied()
            .ok_or_else(|| ProbeError::Operation(format!("No register {}", number)))
    }

    fn attach(&self) -> ProbeResult<Session> {
        if self.config.target_chip.is_empty() {
            return Err(ProbeError::Initialisation("No target chip configured".to_string()));
        }

        let probe_info = ProbeDiscovery::select(&self.config.probe_selector)
            .map_err(|e| ProbeError::Initialisation(e.to_string()))?;

        info!("Opening probe: {}", probe_info.identifier);
        let mut probe = probe_info
            .open()
            .map_err(|e| ProbeError::Initialisation(format!("Failed to open probe: {}", e)))?;

        if let Err(e) = probe.set_speed(self.config.speed_khz) {
            warn!("Failed to set probe speed to {} kHz: {}", self.config.speed_khz, e);
        }

        info!("Attaching to target: {}", self.config.target_chip);
        let target = self.config.target_chip.as_str();
        let session = if self.config.connect_under_reset {
            probe.attach_under_reset(target, Permissions::default())
        } else {
            probe.attach(target, Permissions::default())
        };
        session.map_err(|e| {
            ProbeError::Initialisation(format!(
                "Failed to attach to target '{}': {}",
                self.config.target_chip, e
            ))
        })
    }
}

/// Probe-level failures are fatal; everything else is a failed operation on the target
fn classify(error: probe_rs::Error) -> ProbeError {
    match error {
        probe_rs::Error::Probe(e) => ProbeError::Communication(e.to_string()),
        other => ProbeError::Operation(other.to_string()),
    }
}

fn value_to_bytes(value: RegisterValue, size: usize) -> Vec<u8> {
    let mut bytes = match value {
        RegisterValue::U32(v) => v.to_le_bytes().to_vec(),
        RegisterValue::U64(v) => v.to_le_bytes().to_vec(),
        RegisterValue::U128(v) => v.to_le_bytes().to_vec(),
    };
    bytes.resize(size, 0);
    bytes
}

fn bytes_to_value(bytes: &[u8]) -> ProbeResult<RegisterValue> {
    match bytes.len() {
        4 => Ok(RegisterValue::U32(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Ok(RegisterValue::U64(u64::from_le_bytes(raw)))
        }
        16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(bytes);
            Ok(RegisterValue::U128(u128::from_le_bytes(raw)))
        }
        n => Err(ProbeError::Operation(format!("Unsupported register width: {} bytes", n))),
    }
}

fn map_halt_reason(reason: HaltReason) -> StopReason {
    match reason {
        HaltReason::Breakpoint(_) => StopReason::Breakpoint,
        HaltReason::Step => StopReason::Step,
        HaltReason::Request => StopReason::Interrupt,
        _ => StopReason::Other,
    }
}

impl DebugProbe for ProbeRsProbe {
    fn activate(&mut self) -> ProbeResult<TargetDescriptor> {
        let session = self.attach()?;
        self.session = Some(session);

        let halt_timeout = self.halt_timeout();
        let target_name = self.config.target_chip.clone();
        let mut core = self.core()?;
        core.halt(halt_timeout).map_err(classify)?;

        let mut registers = Vec::new();
        let mut register_ids = Vec::new();
        for (number, register) in core.registers().core_registers().enumerate() {
            let size = register.size_in_bits() / 8;
            registers.push(RegisterDescriptor {
                number: number as u16,
                name: register.name().to_string(),
                size,
            });
            register_ids.push((RegisterId::from(register), size));
        }

        let pc_register = core.program_counter();
        let pc_id = RegisterId::from(pc_register);
        let pc_size = pc_register.size_in_bits() / 8;
        let program_counter = register_ids
            .iter()
            .position(|(id, _)| *id == pc_id)
            .unwrap_or(0) as u16;

        let break_instruction = match core.architecture() {
            Architecture::Arm => ARM_BREAK_INSTRUCTION.to_vec(),
            Architecture::Riscv => RISCV_BREAK_INSTRUCTION.to_vec(),
            _ => Vec::new(),
        };
        let hardware_breakpoint_slots =
            core.available_breakpoint_units().map_err(classify)? as usize;
        drop(core);

        self.registers = register_ids;
        self.pc = Some((pc_id, pc_size));

        debug!(
            "Target {} has {} registers, {} hardware breakpoint units",
            target_name,
            registers.len(),
            hardware_breakpoint_slots
        );

        Ok(TargetDescriptor {
            name: target_name,
            registers,
            program_counter,
            break_instruction,
            hardware_breakpoint_slots,
        })
    }

    fn deactivate(&mut self) -> ProbeResult<()> {
        if self.session.is_some() {
            let mut core = self.core()?;
            if matches!(core.status().map_err(classify)?, CoreStatus::Halted(_)) {
                core.run().map_err(classify)?;
            }
        }
        self.session = None;
        Ok(())
    }

    fn halt(&mut self) -> ProbeResult<()> {
        let timeout = self.halt_timeout();
        self.core()?.halt(timeout).map(|_| ()).map_err(classify)
    }

    fn run(&mut self) -> ProbeResult<()> {
        self.core()?.run().map_err(classify)
    }

    fn step(&mut self) -> ProbeResult<()> {
        self.core()?.step().map(|_| ()).map_err(classify)
    }

    fn reset(&mut self) -> ProbeResult<()> {
        let timeout = self.halt_timeout();
        self.core()?.reset_and_halt(timeout).map(|_| ()).map_err(classify)
    }

    fn status(&mut self) -> ProbeResult<ProbeStatus> {
        let status = self.core()?.status().map_err(classify)?;
        #[allow(unreachable_patterns)]
        let status = match status {
            CoreStatus::Halted(reason) => ProbeStatus::Halted(map_halt_reason(reason)),
            CoreStatus::LockedUp => ProbeStatus::Halted(StopReason::Other),
            CoreStatus::Running => ProbeStatus::Running,
            _ => ProbeStatus::Running,
        };
        Ok(status)
    }

    fn read_register(&mut self, number: u16) -> ProbeResult<Vec<u8>> {
        let (id, size) = self.register(number)?;
        let value: RegisterValue = self.core()?.read_core_reg(id).map_err(classify)?;
        Ok(value_to_bytes(value, size))
    }

    fn write_register(&mut self, number: u16, value: &[u8]) -> ProbeResult<()> {
        let (id, size) = self.register(number)?;
        if value.len() != size {
            return Err(ProbeError::Operation(format!(
                "Register {} expects {} bytes, got {}",
                number,
                size,
                value.len()
            )));
        }
        let value = bytes_to_value(value)?;
        self.core()?.write_core_reg(id, value).map_err(classify)
    }

    fn read_program_counter(&mut self) -> ProbeResult<u64> {
        let (id, _) = self
            .pc
            .ok_or_else(|| ProbeError::Operation("Probe not attached".to_string()))?;
        let value: RegisterValue = self.core()?.read_core_reg(id).map_err(classify)?;
        Ok(match value {
            RegisterValue::U32(v) => u64::from(v),
            RegisterValue::U64(v) => v,
            RegisterValue::U128(v) => v as u64,
        })
    }

    fn write_program_counter(&mut self, value: u64) -> ProbeResult<()> {
        let (id, size) = self
            .pc
            .ok_or_else(|| ProbeError::Operation("Probe not attached".to_string()))?;
        let value = if size == 8 {
            RegisterValue::U64(value)
        } else {
            RegisterValue::U32(value as u32)
        };
        self.core()?.write_core_reg(id, value).map_err(classify)
    }

    fn read_memory(&mut self, address: u64, length: usize) -> ProbeResult<Vec<u8>> {
        let mut data = vec![0u8; length];
        self.core()?.read(address, &mut data).map_err(classify)?;
        Ok(data)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> ProbeResult<()> {
        self.core()?.write(address, data).map_err(classify)
    }

    fn set_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        self.core()?.set_hw_breakpoint(address).map_err(classify)
    }

    fn clear_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        self.core()?.clear_hw_breakpoint(address).map_err(classify)
    }

    fn enable_programming_mode(&mut self) -> ProbeResult<()> {
        self.halt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_value_conversion() {
        assert_eq!(
            value_to_bytes(RegisterValue::U32(0x0800_0100), 4),
            vec![0x00, 0x01, 0x00, 0x08]
        );
        assert_eq!(value_to_bytes(RegisterValue::U32(0xAB), 1), vec![0xAB]);
        assert!(matches!(bytes_to_value(&[1, 0, 0, 0]), Ok(RegisterValue::U32(1))));
        assert!(matches!(bytes_to_value(&[0; 8]), Ok(RegisterValue::U64(0))));
        assert!(bytes_to_value(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_unattached_probe_rejects_operations() {
        let mut probe = ProbeRsProbe::new(ProbeRsConfig::default());
        assert!(matches!(probe.halt(), Err(ProbeError::Operation(_))));
        assert!(matches!(probe.read_program_counter(), Err(ProbeError::Operation(_))));
    }

    #[test]
    fn test_activation_requires_target_chip() {
        let mut probe = ProbeRsProbe::new(ProbeRsConfig::default());
        assert!(matches!(probe.activate(), Err(ProbeError::Initialisation(_))));
    }
}
