//! Target controller arbitration against an instrumented fake probe

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use probe_gdb_server::controller::{
    ControllerConfig, TargetController, TargetControllerError, TargetControllerHandle,
    TargetControllerState,
};
use probe_gdb_server::events::{Event, EventBus, EventListener};
use probe_gdb_server::probe::{DebugProbe, ProbeError, ProbeResult, ProbeStatus};
use probe_gdb_server::target::{
    Breakpoint, BreakpointKind, RegisterDescriptor, StopReason, TargetDescriptor,
};
use tokio_test::{assert_err, assert_ok};

/// Shared view of what the fake probe has been asked to do
#[derive(Clone)]
struct ProbeStats {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    operations: Arc<AtomicUsize>,
    disconnected: Arc<AtomicBool>,
    deactivated: Arc<AtomicBool>,
    comparators: Arc<Mutex<Vec<u64>>>,
    memory: Arc<Mutex<Vec<u8>>>,
}

impl ProbeStats {
    fn new() -> Self {
        Self {
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
            operations: Arc::default(),
            disconnected: Arc::default(),
            deactivated: Arc::default(),
            comparators: Arc::default(),
            memory: Arc::new(Mutex::new(vec![0; 0x1000])),
        }
    }

    fn memory(&self, address: usize, length: usize) -> Vec<u8> {
        self.memory.lock().unwrap()[address..address + length].to_vec()
    }
}

struct FakeProbe {
    stats: ProbeStats,
    delay: Duration,
    running: bool,
}

impl FakeProbe {
    fn new(stats: ProbeStats, delay: Duration) -> Self {
        Self {
            stats,
            delay,
            running: false,
        }
    }

    /// Run `op` as one probe transaction, recording overlap with any other
    fn transaction<T>(&mut self, op: impl FnOnce(&mut Self) -> ProbeResult<T>) -> ProbeResult<T> {
        let stats = self.stats.clone();
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        stats.operations.fetch_add(1, Ordering::SeqCst);

        let result = if stats.disconnected.load(Ordering::SeqCst) {
            Err(ProbeError::Communication("USB device disconnected".to_string()))
        } else {
            std::thread::sleep(self.delay);
            op(self)
        };

        stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn range(&self, address: u64, length: usize) -> ProbeResult<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start + length;
        if end > self.stats.memory.lock().unwrap().len() {
            return Err(ProbeError::Operation("out of range".to_string()));
        }
        Ok(start..end)
    }
}

impl DebugProbe for FakeProbe {
    fn activate(&mut self) -> ProbeResult<TargetDescriptor> {
        Ok(TargetDescriptor {
            name: "fake".to_string(),
            registers: (0..16)
                .map(|number| RegisterDescriptor {
                    number,
                    name: format!("r{}", number),
                    size: 4,
                })
                .collect(),
            program_counter: 15,
            break_instruction: vec![0x00, 0xBE],
            hardware_breakpoint_slots: 2,
        })
    }

    fn deactivate(&mut self) -> ProbeResult<()> {
        self.stats.deactivated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn halt(&mut self) -> ProbeResult<()> {
        self.transaction(|probe| {
            probe.running = false;
            Ok(())
        })
    }

    fn run(&mut self) -> ProbeResult<()> {
        self.transaction(|probe| {
            probe.running = true;
            Ok(())
        })
    }

    fn step(&mut self) -> ProbeResult<()> {
        self.transaction(|_| Ok(()))
    }

    fn reset(&mut self) -> ProbeResult<()> {
        self.transaction(|probe| {
            probe.running = false;
            Ok(())
        })
    }

    fn status(&mut self) -> ProbeResult<ProbeStatus> {
        self.transaction(|probe| {
            Ok(if probe.running {
                ProbeStatus::Running
            } else {
                ProbeStatus::Halted(StopReason::Other)
            })
        })
    }

    fn read_register(&mut self, _number: u16) -> ProbeResult<Vec<u8>> {
        self.transaction(|_| Ok(vec![0; 4]))
    }

    fn write_register(&mut self, _number: u16, _value: &[u8]) -> ProbeResult<()> {
        self.transaction(|_| Ok(()))
    }

    fn read_program_counter(&mut self) -> ProbeResult<u64> {
        self.transaction(|_| Ok(0))
    }

    fn write_program_counter(&mut self, _value: u64) -> ProbeResult<()> {
        self.transaction(|_| Ok(()))
    }

    fn read_memory(&mut self, address: u64, length: usize) -> ProbeResult<Vec<u8>> {
        self.transaction(|probe| {
            let range = probe.range(address, length)?;
            Ok(probe.stats.memory.lock().unwrap()[range].to_vec())
        })
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> ProbeResult<()> {
        self.transaction(|probe| {
            let range = probe.range(address, data.len())?;
            probe.stats.memory.lock().unwrap()[range].copy_from_slice(data);
            Ok(())
        })
    }

    fn set_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        self.transaction(|probe| {
            probe.stats.comparators.lock().unwrap().push(address);
            Ok(())
        })
    }

    fn clear_hw_breakpoint(&mut self, address: u64) -> ProbeResult<()> {
        self.transaction(|probe| {
            probe.stats.comparators.lock().unwrap().retain(|a| *a != address);
            Ok(())
        })
    }
}

async fn start(delay: Duration) -> (TargetControllerHandle, EventListener, ProbeStats) {
    let stats = ProbeStats::new();
    let bus = EventBus::new();
    let mut listener = bus.subscribe("test");
    let probe = FakeProbe::new(stats.clone(), delay);

    let handle =
        TargetController::spawn(ControllerConfig::default(), bus, move || Ok(probe)).unwrap();
    let active = listener
        .wait_for(
            |e| {
                matches!(
                    e,
                    Event::ControllerStateChanged {
                        state: TargetControllerState::Active,
                        ..
                    }
                )
            },
            Duration::from_secs(2),
        )
        .await;
    assert!(active.is_some(), "controller did not become active");
    (handle, listener, stats)
}

fn hardware(address: u64) -> Breakpoint {
    Breakpoint::new(address, BreakpointKind::Hardware, 2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_overlap_on_the_probe() {
    let (handle, _listener, stats) = start(Duration::from_millis(1)).await;
    let before = stats.operations.load(Ordering::SeqCst);

    let mut callers = Vec::new();
    for caller in 0..8u64 {
        let service = handle.service();
        callers.push(tokio::spawn(async move {
            let address = caller * 0x10;
            for round in 0..5u8 {
                service
                    .write_memory(address, vec![round; 4])
                    .await
                    .unwrap();
                assert_eq!(service.read_memory(address, 4).await.unwrap(), vec![round; 4]);
            }
        }));
    }
    for caller in callers {
        caller.await.unwrap();
    }

    assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(stats.operations.load(Ordering::SeqCst) - before, 8 * 5 * 2);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_hardware_slot_accounting() {
    let (handle, _listener, stats) = start(Duration::ZERO).await;
    let service = handle.service();

    assert_ok!(service.insert_breakpoint(hardware(0x100)).await);
    assert_ok!(service.insert_breakpoint(hardware(0x100)).await);
    assert_ok!(service.insert_breakpoint(hardware(0x200)).await);
    assert_eq!(*stats.comparators.lock().unwrap(), vec![0x100, 0x200]);

    assert_eq!(
        service.insert_breakpoint(hardware(0x300)).await,
        Err(TargetControllerError::ResourceExhausted { slots: 2 })
    );
    // Nothing was programmed for the rejected request
    assert_eq!(stats.comparators.lock().unwrap().len(), 2);

    assert_ok!(service.remove_breakpoint(hardware(0x100)).await);
    assert_ok!(service.insert_breakpoint(hardware(0x300)).await);
    assert_eq!(*stats.comparators.lock().unwrap(), vec![0x200, 0x300]);

    handle.shutdown(Duration::from_secs(2)).await;
    // Controlled shutdown clears every comparator
    assert!(stats.comparators.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_removing_absent_breakpoint_succeeds() {
    let (handle, _listener, stats) = start(Duration::ZERO).await;
    let service = handle.service();

    assert_ok!(service.remove_breakpoint(hardware(0x9999)).await);
    assert_ok!(
        service
            .remove_breakpoint(Breakpoint::new(0x9999, BreakpointKind::Software, 2))
            .await
    );
    assert!(stats.comparators.lock().unwrap().is_empty());

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_suspended_controller_rejects_ordinary_commands() {
    let (handle, mut listener, _stats) = start(Duration::ZERO).await;
    let service = handle.service();

    assert_ok!(service.enable_programming_mode().await);
    let event = listener
        .wait_for(
            |e| matches!(e, Event::ProgrammingModeEnabled),
            Duration::from_secs(1),
        )
        .await;
    assert!(event.is_some());

    assert_eq!(
        service.insert_breakpoint(hardware(0x100)).await,
        Err(TargetControllerError::Busy)
    );
    assert_eq!(
        service.continue_execution(None).await,
        Err(TargetControllerError::Busy)
    );
    assert_ok!(service.get_target_state().await);

    assert_ok!(service.disable_programming_mode().await);
    assert_ok!(service.insert_breakpoint(hardware(0x100)).await);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_device_failure_stops_controller() {
    let (handle, mut listener, stats) = start(Duration::ZERO).await;
    let service = handle.service();

    stats.disconnected.store(true, Ordering::SeqCst);
    assert_eq!(
        service.read_memory(0, 4).await,
        Err(TargetControllerError::ControllerUnavailable)
    );

    let event = listener
        .wait_for(|e| e.is_controller_stopped(), Duration::from_secs(1))
        .await
        .unwrap();
    match event.as_ref() {
        Event::ControllerStateChanged { reason, .. } => {
            assert!(reason.as_deref().unwrap_or_default().contains("disconnected"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(service.controller_state(), TargetControllerState::Stopped);
    assert_eq!(
        service.get_target_state().await,
        Err(TargetControllerError::ControllerUnavailable)
    );

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_timeout_is_local_to_the_caller() {
    let (handle, _listener, _stats) = start(Duration::from_millis(200)).await;
    let service = handle.service();

    let result = service
        .with_timeout(Duration::from_millis(20))
        .read_memory(0, 4)
        .await;
    assert!(matches!(result, Err(TargetControllerError::Timeout(_))));
    assert_err!(result);

    // The controller carries on serving everyone else
    assert_ok!(service.get_target_state().await);
    assert_eq!(service.controller_state(), TargetControllerState::Active);
    assert_eq!(service.read_memory(0, 4).await, Ok(vec![0; 4]));

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_abandoned_request_is_skipped() {
    let (handle, _listener, stats) = start(Duration::from_millis(200)).await;
    let service = handle.service();
    let before = stats.operations.load(Ordering::SeqCst);

    // Occupies the controller while the second caller gives up in the queue
    let busy = {
        let service = handle.service();
        tokio::spawn(async move { service.read_memory(0, 4).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let abandoned = service
        .with_timeout(Duration::from_millis(50))
        .read_memory(0x10, 4)
        .await;
    assert!(matches!(abandoned, Err(TargetControllerError::Timeout(_))));

    assert_eq!(busy.await.unwrap(), Ok(vec![0; 4]));
    // Queued behind the abandoned request, so it has been dealt with by now
    assert_ok!(service.get_target_state().await);
    assert_eq!(stats.operations.load(Ordering::SeqCst) - before, 1);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_shutdown_restores_target() {
    let (handle, _listener, stats) = start(Duration::ZERO).await;
    let service = handle.service();

    assert_ok!(service.write_memory(0x100, vec![0x11, 0x22]).await);
    assert_ok!(
        service
            .insert_breakpoint(Breakpoint::new(0x100, BreakpointKind::Software, 2))
            .await
    );
    assert_ok!(service.insert_breakpoint(hardware(0x200)).await);
    assert_eq!(stats.memory(0x100, 2), vec![0x00, 0xBE]);
    assert_eq!(*stats.comparators.lock().unwrap(), vec![0x200]);
    assert!(!stats.deactivated.load(Ordering::SeqCst));

    handle.shutdown(Duration::from_secs(2)).await;

    assert_eq!(stats.memory(0x100, 2), vec![0x11, 0x22]);
    assert!(stats.comparators.lock().unwrap().is_empty());
    assert!(stats.deactivated.load(Ordering::SeqCst));
}
