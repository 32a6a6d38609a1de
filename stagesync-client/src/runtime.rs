//! Scheduled execution loop on the client.
//!
//! Buffered instructions wait in a timestamp-ordered queue; a single loop
//! sleeps until the earliest one is due, wakes early when a closer deadline
//! arrives, and republishes due instructions on the local consumer bus.
//! While the gate is closed (between a disconnect and the first clock probe
//! of the next session) inbound instructions are refused, so nothing fires
//! off a dead estimate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use stagesync_core::ReferenceClock;
use stagesync_proto::{CommandKind, ScheduledInstruction};
use tokio::sync::{broadcast, Notify};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::InstructionQueue;

/// Local consumer boundary: one broadcast channel per command kind, so a
/// light renderer can follow colors without seeing text cues.
pub struct LocalBus {
    color: broadcast::Sender<ScheduledInstruction>,
    sound: broadcast::Sender<ScheduledInstruction>,
    text: broadcast::Sender<ScheduledInstruction>,
}

impl LocalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (color, _) = broadcast::channel(capacity);
        let (sound, _) = broadcast::channel(capacity);
        let (text, _) = broadcast::channel(capacity);
        Self { color, sound, text }
    }

    #[must_use]
    pub fn subscribe(&self, kind: CommandKind) -> broadcast::Receiver<ScheduledInstruction> {
        match kind {
            CommandKind::SendColor => self.color.subscribe(),
            CommandKind::SendAudioCue => self.sound.subscribe(),
            CommandKind::BroadcastText => self.text.subscribe(),
        }
    }

    /// Number of consumers the instruction reached.
    fn publish(&self, instruction: ScheduledInstruction) -> usize {
        let sender = match instruction.kind() {
            CommandKind::SendColor => &self.color,
            CommandKind::SendAudioCue => &self.sound,
            CommandKind::BroadcastText => &self.text,
        };
        sender.send(instruction).map_or(0, |count| count)
    }
}

pub struct SubscriberRuntime {
    queue: Mutex<InstructionQueue>,
    wakeup: Notify,
    bus: LocalBus,
    clock: Arc<ReferenceClock>,
    accepting: AtomicBool,
}

impl SubscriberRuntime {
    #[must_use]
    pub fn new(clock: Arc<ReferenceClock>, bus_capacity: usize) -> Self {
        Self {
            queue: Mutex::new(InstructionQueue::new()),
            wakeup: Notify::new(),
            bus: LocalBus::new(bus_capacity),
            clock,
            accepting: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<ReferenceClock> {
        &self.clock
    }

    /// Queue an instruction for execution at its local timestamp.
    pub fn submit(&self, instruction: ScheduledInstruction) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!(
                command_id = instruction.command_id,
                "Instruction refused, clock sync not re-established yet"
            );
            return;
        }

        let now_ms = self.clock.now_ms();
        let command_id = instruction.command_id;
        let execute_at_ms = instruction.execute_at_ms;
        if self.queue.lock().insert(instruction, now_ms) {
            self.wakeup.notify_one();
        } else {
            warn!(
                command_id = command_id,
                execute_at_ms = execute_at_ms,
                now_ms = now_ms,
                "Stale or cancelled instruction discarded"
            );
        }
    }

    pub fn cancel(&self, command_id: u64) {
        debug!(command_id = command_id, "Instruction cancelled");
        self.queue.lock().cancel(command_id);
        self.wakeup.notify_one();
    }

    /// Start accepting instructions again after a (re)connect. Anything
    /// buffered whose moment passed during the outage is dropped first.
    pub fn open_gate(&self) {
        let now_ms = self.clock.now_ms();
        let dropped = self.queue.lock().discard_stale(now_ms);
        if dropped > 0 {
            info!(dropped = dropped, "Discarded stale instructions from before reconnect");
        }
        self.accepting.store(true, Ordering::Release);
    }

    /// Stop accepting instructions; called when the transport drops.
    pub fn close_gate(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Wait loop: sleep until the earliest deadline, wake early when a
    /// closer one arrives, fire everything due in timestamp order.
    pub async fn run(&self, cancel_token: CancellationToken) {
        loop {
            let next_deadline = self.queue.lock().next_deadline_ms();

            match next_deadline {
                None => {
                    tokio::select! {
                        _ = cancel_token.cancelled() => return,
                        _ = self.wakeup.notified() => {}
                    }
                }
                Some(deadline_ms) => {
                    let now_ms = self.clock.now_ms();
                    if deadline_ms > now_ms {
                        #[allow(clippy::cast_sign_loss)]
                        let wait = Duration::from_millis((deadline_ms - now_ms) as u64);
                        tokio::select! {
                            _ = cancel_token.cancelled() => return,
                            _ = self.wakeup.notified() => continue,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    self.fire_due();
                }
            }
        }
    }

    fn fire_due(&self) {
        let now_ms = self.clock.now_ms();
        let due = self.queue.lock().pop_due(now_ms);
        for instruction in due {
            let command_id = instruction.command_id;
            let consumers = self.bus.publish(instruction);
            debug!(
                command_id = command_id,
                consumers = consumers,
                "Instruction executed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagesync_proto::{ClientId, ColorValue, CommandPayload};

    fn instruction(command_id: u64, execute_at_ms: i64) -> ScheduledInstruction {
        ScheduledInstruction {
            command_id,
            client_id: ClientId::from_string("runtime-test".to_string()),
            payload: CommandPayload::SendColor {
                color: ColorValue::Black,
                zone: None,
            },
            execute_at_ms,
        }
    }

    fn runtime() -> Arc<SubscriberRuntime> {
        let runtime = Arc::new(SubscriberRuntime::new(Arc::new(ReferenceClock::new()), 16));
        runtime.open_gate();
        runtime
    }

    #[tokio::test]
    async fn test_executes_at_deadline_in_order() {
        let runtime = runtime();
        let mut rx = runtime.bus().subscribe(CommandKind::SendColor);

        let cancel = CancellationToken::new();
        let loop_runtime = Arc::clone(&runtime);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { loop_runtime.run(loop_cancel).await });

        let now = runtime.clock().now_ms();
        runtime.submit(instruction(2, now + 60));
        runtime.submit(instruction(1, now + 30));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.command_id, 1);
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.command_id, 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_instruction_never_fires() {
        let runtime = runtime();
        let mut rx = runtime.bus().subscribe(CommandKind::SendColor);

        let cancel = CancellationToken::new();
        let loop_runtime = Arc::clone(&runtime);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { loop_runtime.run(loop_cancel).await });

        let now = runtime.clock().now_ms();
        runtime.submit(instruction(5, now + 40));
        runtime.cancel(5);
        runtime.submit(instruction(6, now + 40));

        let fired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.command_id, 6);
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_refuses_until_reopened() {
        let runtime = Arc::new(SubscriberRuntime::new(Arc::new(ReferenceClock::new()), 16));
        let now = runtime.clock().now_ms();

        runtime.submit(instruction(1, now + 1_000));
        assert!(!runtime.is_accepting());

        runtime.open_gate();
        runtime.submit(instruction(2, now + 1_000));

        // Only the post-gate instruction is buffered.
        assert_eq!(runtime.queue.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_discards_stale_buffer() {
        let runtime = runtime();
        let now = runtime.clock().now_ms();
        runtime.submit(instruction(1, now + 20));
        runtime.submit(instruction(2, now + 5_000));

        runtime.close_gate();
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.open_gate();

        let mut queue = runtime.queue.lock();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline_ms(), Some(now + 5_000));
    }
}
