//! Per-client outbound queues and fan-out delivery.
//!
//! Each connected client owns one bounded queue. When a queue is full the
//! oldest *non-critical* instruction is dropped first (a stale text cue is
//! worthless at a live event); only when nothing droppable remains does the
//! push report overflow so the caller can demote the connection.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use stagesync_proto::{ClientId, ScheduledInstruction};
use tokio::sync::Notify;
use tracing::debug;

/// Scheduler-originated traffic bound for one client. Heartbeats and clock
/// probes bypass the queue; they belong to the connection actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Instruction(ScheduledInstruction),
    Cancel { command_id: u64 },
}

/// What happened to a pushed instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, at the cost of the oldest non-critical instruction.
    DroppedOldest { dropped_command_id: u64 },
    /// Buffer full of critical traffic; the item was not queued and the
    /// connection should be demoted to Degraded.
    Overflow,
}

/// Bounded FIFO of outbound items for a single client connection.
pub struct OutboundQueue {
    items: Mutex<VecDeque<Outbound>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Push an item, applying the drop-oldest-non-critical policy on
    /// overflow. Cancels always enqueue (they shrink client state).
    pub fn push(&self, item: Outbound) -> PushOutcome {
        let mut items = self.items.lock();

        if items.len() >= self.capacity && !matches!(item, Outbound::Cancel { .. }) {
            let droppable = items.iter().position(|queued| {
                matches!(queued, Outbound::Instruction(instruction) if !instruction.is_critical())
            });
            match droppable {
                Some(pos) => {
                    let dropped = items.remove(pos);
                    items.push_back(item);
                    drop(items);
                    self.notify.notify_one();
                    let dropped_command_id = match dropped {
                        Some(Outbound::Instruction(instruction)) => instruction.command_id,
                        _ => 0,
                    };
                    PushOutcome::DroppedOldest { dropped_command_id }
                }
                None => PushOutcome::Overflow,
            }
        } else {
            items.push_back(item);
            drop(items);
            self.notify.notify_one();
            PushOutcome::Queued
        }
    }

    /// Remove a still-queued instruction for a superseded command.
    /// Returns whether anything was removed.
    pub fn remove_instruction(&self, command_id: u64) -> bool {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|queued| {
            !matches!(queued, Outbound::Instruction(instruction)
                if instruction.command_id == command_id)
        });
        items.len() != before
    }

    /// Pop without waiting. `None` when empty.
    #[must_use]
    pub fn try_pop(&self) -> Option<Outbound> {
        self.items.lock().pop_front()
    }

    /// Await the next outbound item.
    pub async fn recv(&self) -> Outbound {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Directory of attached client queues, shared by the dispatcher and the
/// per-connection tasks.
pub struct ClientHub {
    queues: DashMap<ClientId, Arc<OutboundQueue>>,
    queue_capacity: usize,
}

impl ClientHub {
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            queue_capacity,
        }
    }

    /// Attach a fresh queue for a client connection, replacing any stale
    /// one left by a prior connection.
    pub fn attach(&self, client_id: ClientId) -> Arc<OutboundQueue> {
        let queue = Arc::new(OutboundQueue::new(self.queue_capacity));
        self.queues.insert(client_id, Arc::clone(&queue));
        queue
    }

    pub fn detach(&self, client_id: &ClientId) {
        self.queues.remove(client_id);
    }

    /// Queue an instruction for its target client. `None` means the client
    /// has no attached connection.
    #[must_use]
    pub fn send_instruction(&self, instruction: ScheduledInstruction) -> Option<PushOutcome> {
        let queue = self.queues.get(&instruction.client_id)?;
        Some(queue.push(Outbound::Instruction(instruction)))
    }

    /// Cancel a superseded command on one client: purge it if still queued
    /// and forward the cancel so the client can purge its own buffer too.
    pub fn cancel(&self, client_id: &ClientId, command_id: u64) {
        if let Some(queue) = self.queues.get(client_id) {
            let removed = queue.remove_instruction(command_id);
            queue.push(Outbound::Cancel { command_id });
            debug!(
                client_id = %client_id,
                command_id = command_id,
                removed_queued = removed,
                "Superseded command cancelled"
            );
        }
    }

    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.queues.len()
    }
}
