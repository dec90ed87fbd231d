//! Typed publish/subscribe bus for state change notifications
//!
//! Every subscriber owns its own unbounded queue and drains it on its own
//! schedule. Publishing never blocks and never runs subscriber code.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::controller::TargetControllerState;
use crate::target::StopReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ControllerStateChanged {
        state: TargetControllerState,
        /// Set when the transition was caused by a failure
        reason: Option<String>,
    },
    TargetExecutionStopped {
        program_counter: Option<u64>,
        reason: StopReason,
    },
    TargetExecutionResumed {
        stepping: bool,
    },
    RegistersWritten {
        registers: Vec<u16>,
    },
    ProgrammingModeEnabled,
    ProgrammingModeDisabled,
}

impl Event {
    /// True for a controller transition into the terminal state
    pub fn is_controller_stopped(&self) -> bool {
        matches!(
            self,
            Event::ControllerStateChanged {
                state: TargetControllerState::Stopped,
                ..
            }
        )
    }
}

struct Subscriber {
    id: u64,
    name: String,
    sender: mpsc::UnboundedSender<Arc<Event>>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<Subscriber>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, name: &str) -> EventListener {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.push(Subscriber {
            id,
            name: name.to_string(),
            sender,
        });
        debug!("Event listener '{}' subscribed (id {})", name, id);
        EventListener { receiver }
    }

    /// Deliver an event to every live subscriber. Listeners that were dropped are pruned.
    pub fn publish(&self, event: Event) {
        trace!("Publishing event: {:?}", event);
        let event = Arc::new(event);
        let mut subscribers = self.lock();
        subscribers.entries.retain(|subscriber| {
            let delivered = subscriber.sender.send(Arc::clone(&event)).is_ok();
            if !delivered {
                debug!(
                    "Dropping closed event listener '{}' (id {})",
                    subscriber.name, subscriber.id
                );
            }
            delivered
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Receiving end of one subscription
pub struct EventListener {
    receiver: mpsc::UnboundedReceiver<Arc<Event>>,
}

impl EventListener {
    /// Next event in publication order. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for an event matching `predicate`, discarding the
    /// events that don't match.
    pub async fn wait_for<F>(&mut self, mut predicate: F, timeout: Duration) -> Option<Arc<Event>>
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(event)) if predicate(event.as_ref()) => return Some(event),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }
}
