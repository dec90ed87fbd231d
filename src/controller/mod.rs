//! Target controller
//!
//! Owns the debug probe on a dedicated thread and executes commands against it
//! one at a time, in submission order. Halt requests travel on a separate
//! priority queue and are taken before queued ordinary commands, but never
//! preempt the command currently executing.
//!
//! State changes are published on the [`EventBus`]. A probe communication
//! failure stops the controller for good; callers only ever see
//! [`TargetControllerError::ControllerUnavailable`] for it, the cause travels
//! on the [`Event::ControllerStateChanged`] event.

pub mod breakpoints;
pub mod command;
pub mod service;

use std::fmt;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::events::{Event, EventBus};
use crate::probe::{DebugProbe, ProbeError, ProbeResult, ProbeStatus};
use crate::target::{
    Breakpoint, BreakpointKind, StopReason, TargetDescriptor, TargetRegister, TargetState,
};
use breakpoints::BreakpointRegistry;
use command::{Envelope, TargetControllerCommand, TargetControllerResponse};

pub use service::TargetControllerService;

const INTERRUPT_QUEUE_DEPTH: usize = 4;

/// Lifecycle of the controller thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetControllerState {
    Uninitialised,
    Starting,
    Active,
    /// Exclusive operation in progress; ordinary commands are rejected
    Suspended,
    /// Terminal
    Stopped,
}

impl fmt::Display for TargetControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialised => write!(f, "uninitialised"),
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors returned to callers of the controller service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetControllerError {
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("No free hardware breakpoint slot ({slots} in use)")]
    ResourceExhausted { slots: usize },

    #[error("Target controller is busy with an exclusive operation")]
    Busy,

    #[error("Target is not halted")]
    TargetNotHalted,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Target operation failed: {0}")]
    Target(String),

    #[error("Target controller is not available")]
    ControllerUnavailable,

    #[error("Unexpected response from target controller")]
    UnexpectedResponse,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Default deadline for service calls
    pub command_timeout: Duration,
    /// How often a running target is polled for a halt
    pub poll_interval: Duration,
    pub queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            queue_depth: 32,
        }
    }
}

/// Why a command did not produce a response
enum Failure {
    /// Probe is gone; ends the controller
    Device(ProbeError),
    Rejected(TargetControllerError),
}

impl From<ProbeError> for Failure {
    fn from(error: ProbeError) -> Self {
        match error {
            ProbeError::Communication(_) => Failure::Device(error),
            ProbeError::Operation(message) | ProbeError::Initialisation(message) => {
                Failure::Rejected(TargetControllerError::Target(message))
            }
        }
    }
}

impl From<TargetControllerError> for Failure {
    fn from(error: TargetControllerError) -> Self {
        Failure::Rejected(error)
    }
}

type Execution = Result<TargetControllerResponse, Failure>;

/// Publishes controller state transitions in the order they happen
struct StateReporter {
    state: TargetControllerState,
    sender: watch::Sender<TargetControllerState>,
    events: EventBus,
}

impl StateReporter {
    fn transition(&mut self, state: TargetControllerState, reason: Option<String>) {
        if self.state == state {
            return;
        }
        info!("Target controller: {} -> {}", self.state, state);
        self.state = state;
        self.sender.send_replace(state);
        self.events
            .publish(Event::ControllerStateChanged { state, reason });
    }
}

/// Handle to a running controller thread
pub struct TargetControllerHandle {
    service: TargetControllerService,
    join: Option<JoinHandle<()>>,
}

impl TargetControllerHandle {
    pub fn service(&self) -> TargetControllerService {
        self.service.clone()
    }

    /// Request a controlled shutdown, then join the controller thread.
    /// Both steps are bounded by `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) {
        match self.service.with_timeout(timeout).shutdown().await {
            Ok(()) | Err(TargetControllerError::ControllerUnavailable) => {}
            Err(e) => warn!("Target controller shutdown request failed: {}", e),
        }

        let Some(join) = self.join.take() else {
            return;
        };
        let joined =
            tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || join.join()));
        match joined.await {
            Ok(Ok(Ok(()))) => debug!("Target controller thread joined"),
            Ok(Ok(Err(_))) => error!("Target controller thread panicked"),
            Ok(Err(e)) => error!("Failed to join target controller thread: {}", e),
            Err(_) => warn!("Target controller thread did not exit within {:?}", timeout),
        }
    }
}

pub struct TargetController<P: DebugProbe> {
    probe: P,
    config: ControllerConfig,
    reporter: StateReporter,
    target_state: TargetState,
    descriptor: TargetDescriptor,
    breakpoints: BreakpointRegistry,
}

impl<P: DebugProbe + 'static> TargetController<P> {
    /// Start the controller thread. `factory` runs on that thread, so the
    /// probe itself never crosses threads.
    pub fn spawn<F>(
        config: ControllerConfig,
        events: EventBus,
        factory: F,
    ) -> std::io::Result<TargetControllerHandle>
    where
        F: FnOnce() -> ProbeResult<P> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(config.queue_depth.max(1));
        let (interrupt_tx, interrupt_rx) = mpsc::channel(INTERRUPT_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(TargetControllerState::Uninitialised);
        let service = TargetControllerService::new(
            command_tx,
            interrupt_tx,
            state_rx,
            config.command_timeout,
        );

        let join = std::thread::Builder::new()
            .name("target-controller".to_string())
            .spawn(move || {
                let mut reporter = StateReporter {
                    state: TargetControllerState::Uninitialised,
                    sender: state_tx,
                    events,
                };
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build target controller runtime: {}", e);
                        reporter.transition(TargetControllerState::Stopped, Some(e.to_string()));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let mut commands = command_rx;
                    let mut interrupts = interrupt_rx;
                    if let Some(controller) = Self::start(factory, config, reporter) {
                        controller.run(&mut commands, &mut interrupts).await;
                    }
                    reject_pending(&mut commands);
                    reject_pending(&mut interrupts);
                    debug!("Target controller thread exiting");
                });
            })?;

        Ok(TargetControllerHandle {
            service,
            join: Some(join),
        })
    }

    fn start<F>(factory: F, config: ControllerConfig, mut reporter: StateReporter) -> Option<Self>
    where
        F: FnOnce() -> ProbeResult<P>,
    {
        reporter.transition(TargetControllerState::Starting, None);

        let activated = factory().and_then(|mut probe| {
            let descriptor = probe.activate()?;
            let status = probe.status()?;
            Ok((probe, descriptor, status))
        });

        match activated {
            Ok((probe, descriptor, status)) => {
                info!(
                    "Target {} ready: {} registers, {} hardware breakpoint slots",
                    descriptor.name,
                    descriptor.registers.len(),
                    descriptor.hardware_breakpoint_slots
                );
                let target_state = match status {
                    ProbeStatus::Running => TargetState::Running,
                    ProbeStatus::Halted(_) => TargetState::Stopped,
                };
                let mut controller = Self {
                    probe,
                    breakpoints: BreakpointRegistry::new(descriptor.hardware_breakpoint_slots),
                    descriptor,
                    config,
                    reporter,
                    target_state,
                };
                controller
                    .reporter
                    .transition(TargetControllerState::Active, None);
                Some(controller)
            }
            Err(e) => {
                error!("Target controller startup failed: {}", e);
                reporter.transition(
                    TargetControllerState::Stopped,
                    Some(format!("Device initialisation failure: {}", e)),
                );
                None
            }
        }
    }

    async fn run(
        mut self,
        commands: &mut mpsc::Receiver<Envelope>,
        interrupts: &mut mpsc::Receiver<Envelope>,
    ) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.reporter.state != TargetControllerState::Stopped {
            tokio::select! {
                biased;

                Some(envelope) = interrupts.recv() => self.process(envelope),
                envelope = commands.recv() => match envelope {
                    Some(envelope) => self.process(envelope),
                    None => {
                        info!("All target controller services dropped");
                        self.shutdown();
                    }
                },
                _ = poll.tick(), if self.target_state.is_executing() => {
                    if let Err(e) = self.poll_target() {
                        self.handle_probe_error(e);
                    }
                }
            }
        }
    }

    fn process(&mut self, envelope: Envelope) {
        let Envelope { id, command, reply } = envelope;
        let name = command.name();

        if reply.is_closed() {
            debug!("Skipping command {} ({}): caller no longer waiting", id, name);
            return;
        }

        let result = if self.reporter.state == TargetControllerState::Suspended
            && !command.permitted_while_suspended()
        {
            Err(TargetControllerError::Busy)
        } else {
            trace!("Executing command {} ({})", id, name);
            match self.execute(command) {
                Ok(response) => Ok(response),
                Err(Failure::Rejected(e)) => {
                    debug!("Command {} ({}) failed: {}", id, name, e);
                    Err(e)
                }
                Err(Failure::Device(e)) => {
                    self.fail(e);
                    Err(TargetControllerError::ControllerUnavailable)
                }
            }
        };

        if reply.send(result).is_err() {
            debug!("Caller of command {} ({}) gave up before the reply", id, name);
        }
    }

    fn execute(&mut self, command: TargetControllerCommand) -> Execution {
        match command {
            TargetControllerCommand::ReadMemory { address, length } => {
                let mut data = self.probe.read_memory(address, length)?;
                self.breakpoints.mask_read(address, &mut data);
                Ok(TargetControllerResponse::Memory(data))
            }
            TargetControllerCommand::WriteMemory { address, data } => {
                let patched = self.breakpoints.patched_write(address, &data);
                self.probe.write_memory(address, &patched)?;
                self.breakpoints.record_write(address, &data);
                Ok(TargetControllerResponse::Ok)
            }
            TargetControllerCommand::ReadRegisters { registers } => self.read_registers(registers),
            TargetControllerCommand::WriteRegisters { registers } => {
                self.write_registers(registers)
            }
            TargetControllerCommand::InsertBreakpoint(breakpoint) => {
                self.insert_breakpoint(breakpoint)
            }
            TargetControllerCommand::RemoveBreakpoint(breakpoint) => {
                self.remove_breakpoint(breakpoint)
            }
            TargetControllerCommand::ContinueExecution { from } => self.resume(from, false),
            TargetControllerCommand::StepExecution { from } => self.resume(from, true),
            TargetControllerCommand::StopExecution => {
                self.halt(StopReason::Interrupt)?;
                Ok(TargetControllerResponse::Ok)
            }
            TargetControllerCommand::GetTargetState => {
                Ok(TargetControllerResponse::TargetState(self.target_state))
            }
            TargetControllerCommand::GetTargetDescriptor => {
                Ok(TargetControllerResponse::Descriptor(self.descriptor.clone()))
            }
            TargetControllerCommand::EnableProgrammingMode => self.enable_programming_mode(),
            TargetControllerCommand::DisableProgrammingMode => self.disable_programming_mode(),
            TargetControllerCommand::ResetTarget => {
                self.probe.reset()?;
                self.target_state = TargetState::Stopped;
                let program_counter = self.probe.read_program_counter()?;
                self.reporter.events.publish(Event::TargetExecutionStopped {
                    program_counter: Some(program_counter),
                    reason: StopReason::Reset,
                });
                Ok(TargetControllerResponse::Ok)
            }
            TargetControllerCommand::Shutdown => {
                self.shutdown();
                Ok(TargetControllerResponse::Ok)
            }
        }
    }

    fn require_halted(&self) -> Result<(), TargetControllerError> {
        if self.target_state.is_executing() {
            Err(TargetControllerError::TargetNotHalted)
        } else {
            Ok(())
        }
    }

    fn read_registers(&mut self, registers: Option<Vec<u16>>) -> Execution {
        self.require_halted()?;
        let numbers = registers.unwrap_or_else(|| self.descriptor.register_numbers());

        let mut values = Vec::with_capacity(numbers.len());
        for number in numbers {
            if self.descriptor.register(number).is_none() {
                return Err(TargetControllerError::InvalidRequest(format!(
                    "Unknown register {}",
                    number
                ))
                .into());
            }
            let value = self.probe.read_register(number)?;
            values.push(TargetRegister::new(number, value));
        }
        Ok(TargetControllerResponse::Registers(values))
    }

    fn write_registers(&mut self, registers: Vec<TargetRegister>) -> Execution {
        self.require_halted()?;

        for register in &registers {
            let expected = self
                .descriptor
                .register(register.number)
                .map(|descriptor| descriptor.size)
                .ok_or_else(|| {
                    TargetControllerError::InvalidRequest(format!(
                        "Unknown register {}",
                        register.number
                    ))
                })?;
            if register.value.len() != expected {
                return Err(TargetControllerError::InvalidRequest(format!(
                    "Register {} is {} bytes, got {}",
                    register.number,
                    expected,
                    register.value.len()
                ))
                .into());
            }
        }

        let mut written = Vec::with_capacity(registers.len());
        for register in registers {
            self.probe.write_register(register.number, &register.value)?;
            written.push(register.number);
        }
        self.reporter
            .events
            .publish(Event::RegistersWritten { registers: written });
        Ok(TargetControllerResponse::Ok)
    }

    fn insert_breakpoint(&mut self, breakpoint: Breakpoint) -> Execution {
        if self.breakpoints.contains(&breakpoint) {
            debug!("{} already set", breakpoint);
            return Ok(TargetControllerResponse::Ok);
        }

        match breakpoint.kind {
            BreakpointKind::Hardware => {
                if !self.breakpoints.hardware_slot_available() {
                    return Err(TargetControllerError::ResourceExhausted {
                        slots: self.breakpoints.hardware_slots(),
                    }
                    .into());
                }
                self.probe.set_hw_breakpoint(breakpoint.address)?;
                self.breakpoints.insert_hardware(breakpoint);
            }
            BreakpointKind::Software => {
                let patch = self.descriptor.break_instruction.clone();
                if patch.is_empty() {
                    return Err(TargetControllerError::InvalidRequest(
                        "Software breakpoints are not supported on this target".to_string(),
                    )
                    .into());
                }
                let mut original = self.probe.read_memory(breakpoint.address, patch.len())?;
                self.breakpoints.mask_read(breakpoint.address, &mut original);
                self.probe.write_memory(breakpoint.address, &patch)?;
                self.breakpoints.insert_software(breakpoint, original, patch);
            }
        }

        debug!("Set {}", breakpoint);
        Ok(TargetControllerResponse::Ok)
    }

    fn remove_breakpoint(&mut self, breakpoint: Breakpoint) -> Execution {
        let Some(entry) = self.breakpoints.remove(&breakpoint) else {
            debug!("{} not set, nothing to remove", breakpoint);
            return Ok(TargetControllerResponse::Ok);
        };

        let cleared = match breakpoint.kind {
            BreakpointKind::Hardware => self.probe.clear_hw_breakpoint(breakpoint.address),
            BreakpointKind::Software => {
                let restore = self
                    .breakpoints
                    .patched_write(breakpoint.address, &entry.original);
                self.probe.write_memory(breakpoint.address, &restore)
            }
        };

        if let Err(e) = cleared {
            self.breakpoints.restore(entry);
            return Err(e.into());
        }
        debug!("Cleared {}", breakpoint);
        Ok(TargetControllerResponse::Ok)
    }

    fn resume(&mut self, from: Option<u64>, stepping: bool) -> Execution {
        if self.target_state.is_executing() {
            if stepping {
                return Err(TargetControllerError::TargetNotHalted.into());
            }
            // Already running; report it so waiters see the resume
            self.reporter
                .events
                .publish(Event::TargetExecutionResumed { stepping: false });
            return Ok(TargetControllerResponse::Ok);
        }

        if let Some(address) = from {
            self.probe.write_program_counter(address)?;
        }

        // A breakpoint at the resume address would trap again before the first instruction
        let program_counter = self.probe.read_program_counter()?;
        let software = self
            .breakpoints
            .software_at(program_counter)
            .map(|entry| (entry.original.clone(), entry.patch.clone()));
        let hardware = self.breakpoints.hardware_at(program_counter);
        let stepped_over = software.is_some() || hardware;
        if stepped_over {
            trace!("Stepping off breakpoint at 0x{:08X}", program_counter);
            if hardware {
                self.probe.clear_hw_breakpoint(program_counter)?;
            }
            if let Some((original, _)) = &software {
                self.probe.write_memory(program_counter, original)?;
            }
            let stepped = self.probe.step();
            if let Some((_, patch)) = &software {
                self.probe.write_memory(program_counter, patch)?;
            }
            if hardware {
                self.probe.set_hw_breakpoint(program_counter)?;
            }
            stepped?;
        }

        if stepping {
            if !stepped_over {
                self.probe.step()?;
            }
            self.target_state = TargetState::Stepping;
        } else {
            self.probe.run()?;
            self.target_state = TargetState::Running;
        }

        self.reporter
            .events
            .publish(Event::TargetExecutionResumed { stepping });

        if stepping {
            self.poll_target()?;
        }
        Ok(TargetControllerResponse::Ok)
    }

    /// Halt an executing target and report the stop
    fn halt(&mut self, reason: StopReason) -> Result<(), Failure> {
        if !self.target_state.is_executing() {
            return Ok(());
        }
        self.probe.halt()?;
        self.target_state = TargetState::Stopped;
        let program_counter = self.probe.read_program_counter()?;
        self.reporter.events.publish(Event::TargetExecutionStopped {
            program_counter: Some(program_counter),
            reason,
        });
        Ok(())
    }

    fn poll_target(&mut self) -> ProbeResult<()> {
        match self.probe.status()? {
            ProbeStatus::Running => Ok(()),
            ProbeStatus::Halted(reason) => {
                let program_counter = self.probe.read_program_counter()?;
                debug!("Target halted at 0x{:08X} ({:?})", program_counter, reason);
                self.target_state = TargetState::Stopped;
                self.reporter.events.publish(Event::TargetExecutionStopped {
                    program_counter: Some(program_counter),
                    reason,
                });
                Ok(())
            }
        }
    }

    fn enable_programming_mode(&mut self) -> Execution {
        if self.reporter.state == TargetControllerState::Suspended {
            return Ok(TargetControllerResponse::Ok);
        }
        self.halt(StopReason::Other)?;
        self.probe.enable_programming_mode()?;
        self.reporter
            .transition(TargetControllerState::Suspended, None);
        self.reporter.events.publish(Event::ProgrammingModeEnabled);
        Ok(TargetControllerResponse::Ok)
    }

    fn disable_programming_mode(&mut self) -> Execution {
        if self.reporter.state != TargetControllerState::Suspended {
            return Ok(TargetControllerResponse::Ok);
        }
        self.probe.disable_programming_mode()?;
        self.reporter.transition(TargetControllerState::Active, None);
        self.reporter.events.publish(Event::ProgrammingModeDisabled);
        Ok(TargetControllerResponse::Ok)
    }

    fn handle_probe_error(&mut self, error: ProbeError) {
        if error.is_fatal() {
            self.fail(error);
        } else {
            warn!("Target status poll failed: {}", error);
        }
    }

    fn fail(&mut self, error: ProbeError) {
        error!("Device failure, stopping target controller: {}", error);
        self.target_state = TargetState::Unknown;
        self.reporter.transition(
            TargetControllerState::Stopped,
            Some(format!("Device failure: {}", error)),
        );
    }

    /// Remove every breakpoint and release the target
    fn shutdown(&mut self) {
        if self.reporter.state == TargetControllerState::Stopped {
            return;
        }
        info!("Shutting down target controller");

        if self.reporter.state == TargetControllerState::Suspended {
            if let Err(e) = self.probe.disable_programming_mode() {
                warn!("Failed to leave programming mode: {}", e);
            }
        }

        for entry in self.breakpoints.drain() {
            let breakpoint = entry.breakpoint;
            let cleared = match breakpoint.kind {
                BreakpointKind::Hardware => self.probe.clear_hw_breakpoint(breakpoint.address),
                BreakpointKind::Software => {
                    self.probe.write_memory(breakpoint.address, &entry.original)
                }
            };
            if let Err(e) = cleared {
                warn!("Failed to clear {}: {}", breakpoint, e);
            }
        }

        if let Err(e) = self.probe.deactivate() {
            warn!("Failed to deactivate probe: {}", e);
        }
        self.reporter.transition(TargetControllerState::Stopped, None);
    }
}

fn reject_pending(queue: &mut mpsc::Receiver<Envelope>) {
    queue.close();
    while let Ok(envelope) = queue.try_recv() {
        let _ = envelope
            .reply
            .send(Err(TargetControllerError::ControllerUnavailable));
    }
}
