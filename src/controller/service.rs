//! Client-side handle for submitting requests to the target controller
//!
//! Cheap to clone; every consumer (GDB server, application shutdown logic,
//! tests) holds its own copy. Each call enqueues one command and waits for its
//! reply with a bounded deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::command::{Envelope, TargetControllerCommand, TargetControllerResponse};
use super::{TargetControllerError, TargetControllerState};
use crate::target::{Breakpoint, TargetDescriptor, TargetRegister, TargetState};

type Result<T> = std::result::Result<T, TargetControllerError>;

#[derive(Clone)]
pub struct TargetControllerService {
    commands: mpsc::Sender<Envelope>,
    interrupts: mpsc::Sender<Envelope>,
    state: watch::Receiver<TargetControllerState>,
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl TargetControllerService {
    pub(crate) fn new(
        commands: mpsc::Sender<Envelope>,
        interrupts: mpsc::Sender<Envelope>,
        state: watch::Receiver<TargetControllerState>,
        timeout: Duration,
    ) -> Self {
        Self {
            commands,
            interrupts,
            state,
            timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A copy of this service whose calls use a different deadline
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn controller_state(&self) -> TargetControllerState {
        *self.state.borrow()
    }

    async fn submit(
        &self,
        command: TargetControllerCommand,
        priority: bool,
    ) -> Result<TargetControllerResponse> {
        let state = self.controller_state();
        match state {
            TargetControllerState::Stopped => {
                return Err(TargetControllerError::ControllerUnavailable)
            }
            TargetControllerState::Suspended if !command.permitted_while_suspended() => {
                return Err(TargetControllerError::Busy)
            }
            _ => {}
        }

        let deadline = Instant::now() + self.timeout;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = command.name();
        let (reply, response) = oneshot::channel();
        let envelope = Envelope { id, command, reply };

        trace!("Submitting command {} ({})", id, name);
        let queue = if priority { &self.interrupts } else { &self.commands };
        match timeout_at(deadline, queue.send(envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(TargetControllerError::ControllerUnavailable),
            Err(_) => {
                debug!("Command {} ({}) timed out waiting for queue space", id, name);
                return Err(TargetControllerError::Timeout(self.timeout));
            }
        }

        match timeout_at(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TargetControllerError::ControllerUnavailable),
            Err(_) => {
                debug!("Command {} ({}) timed out after {:?}", id, name, self.timeout);
                Err(TargetControllerError::Timeout(self.timeout))
            }
        }
    }

    async fn expect_ok(&self, command: TargetControllerCommand) -> Result<()> {
        match self.submit(command, false).await? {
            TargetControllerResponse::Ok => Ok(()),
            _ => Err(TargetControllerError::UnexpectedResponse),
        }
    }

    pub async fn read_memory(&self, address: u64, length: usize) -> Result<Vec<u8>> {
        match self
            .submit(TargetControllerCommand::ReadMemory { address, length }, false)
            .await?
        {
            TargetControllerResponse::Memory(data) => Ok(data),
            _ => Err(TargetControllerError::UnexpectedResponse),
        }
    }

    pub async fn write_memory(&self, address: u64, data: Vec<u8>) -> Result<()> {
        self.expect_ok(TargetControllerCommand::WriteMemory { address, data })
            .await
    }

    /// Read the given registers, or all of them for `None`
    pub async fn read_registers(&self, registers: Option<Vec<u16>>) -> Result<Vec<TargetRegister>> {
        match self
            .submit(TargetControllerCommand::ReadRegisters { registers }, false)
            .await?
        {
            TargetControllerResponse::Registers(registers) => Ok(registers),
            _ => Err(TargetControllerError::UnexpectedResponse),
        }
    }

    pub async fn write_registers(&self, registers: Vec<TargetRegister>) -> Result<()> {
        self.expect_ok(TargetControllerCommand::WriteRegisters { registers })
            .await
    }

    pub async fn insert_breakpoint(&self, breakpoint: Breakpoint) -> Result<()> {
        self.expect_ok(TargetControllerCommand::InsertBreakpoint(breakpoint))
            .await
    }

    pub async fn remove_breakpoint(&self, breakpoint: Breakpoint) -> Result<()> {
        self.expect_ok(TargetControllerCommand::RemoveBreakpoint(breakpoint))
            .await
    }

    /// Resume execution, optionally from `from`. Returns once the target is running.
    pub async fn continue_execution(&self, from: Option<u64>) -> Result<()> {
        self.expect_ok(TargetControllerCommand::ContinueExecution { from })
            .await
    }

    pub async fn step_execution(&self, from: Option<u64>) -> Result<()> {
        self.expect_ok(TargetControllerCommand::StepExecution { from })
            .await
    }

    /// Halt the target. Jumps ahead of queued ordinary commands.
    pub async fn stop_execution(&self) -> Result<()> {
        match self
            .submit(TargetControllerCommand::StopExecution, true)
            .await?
        {
            TargetControllerResponse::Ok => Ok(()),
            _ => Err(TargetControllerError::UnexpectedResponse),
        }
    }

    pub async fn get_target_state(&self) -> Result<TargetState> {
        match self
            .submit(TargetControllerCommand::GetTargetState, false)
            .await?
        {
            TargetControllerResponse::TargetState(state) => Ok(state),
            _ => Err(TargetControllerError::UnexpectedResponse),
        }
    }

    pub async fn get_target_descriptor(&self) -> Result<TargetDescriptor> {
        match self
            .submit(TargetControllerCommand::GetTargetDescriptor, false)
            .await?
        {
            TargetControllerResponse::Descriptor(descriptor) => Ok(descriptor),
            _ => Err(TargetControllerError::UnexpectedResponse),
        }
    }

    pub async fn enable_programming_mode(&self) -> Result<()> {
        self.expect_ok(TargetControllerCommand::EnableProgrammingMode)
            .await
    }

    pub async fn disable_programming_mode(&self) -> Result<()> {
        self.expect_ok(TargetControllerCommand::DisableProgrammingMode)
            .await
    }

    pub async fn reset_target(&self) -> Result<()> {
        self.expect_ok(TargetControllerCommand::ResetTarget).await
    }

    /// Ask the controller to clean up and stop
    pub async fn shutdown(&self) -> Result<()> {
        self.expect_ok(TargetControllerCommand::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn service(
        state: TargetControllerState,
    ) -> (
        TargetControllerService,
        mpsc::Receiver<Envelope>,
        watch::Sender<TargetControllerState>,
    ) {
        let (commands, command_rx) = mpsc::channel(4);
        let (interrupts, _interrupt_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(state);
        let service =
            TargetControllerService::new(commands, interrupts, state_rx, Duration::from_millis(50));
        (service, command_rx, state_tx)
    }

    #[tokio::test]
    async fn test_stopped_controller_rejects_without_queueing() {
        let (service, mut queue, _state) = service(TargetControllerState::Stopped);
        let result = service.read_memory(0, 4).await;
        assert_eq!(result, Err(TargetControllerError::ControllerUnavailable));
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_suspended_controller_reports_busy() {
        let (service, _queue, _state) = service(TargetControllerState::Suspended);
        assert_eq!(
            service.continue_execution(None).await,
            Err(TargetControllerError::Busy)
        );
    }

    #[tokio::test]
    async fn test_unanswered_command_times_out() {
        let (service, mut queue, _state) = service(TargetControllerState::Active);
        let result = service.get_target_state().await;
        assert_eq!(
            result,
            Err(TargetControllerError::Timeout(Duration::from_millis(50)))
        );
        // The command was queued; its reply channel is now closed
        let envelope = assert_ok!(queue.try_recv());
        assert!(envelope.reply.is_closed());
    }

    #[tokio::test]
    async fn test_reply_is_returned_to_caller() {
        let (service, mut queue, _state) = service(TargetControllerState::Active);
        let responder = tokio::spawn(async move {
            let envelope = queue.recv().await.unwrap();
            assert_eq!(envelope.command, TargetControllerCommand::GetTargetState);
            let _ = envelope
                .reply
                .send(Ok(TargetControllerResponse::TargetState(TargetState::Stopped)));
        });
        assert_eq!(service.get_target_state().await, Ok(TargetState::Stopped));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_response_is_an_error() {
        let (service, mut queue, _state) = service(TargetControllerState::Active);
        tokio::spawn(async move {
            let envelope = queue.recv().await.unwrap();
            let _ = envelope.reply.send(Ok(TargetControllerResponse::Ok));
        });
        assert_err!(service.read_memory(0, 4).await);
    }
}
