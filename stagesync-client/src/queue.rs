//! Instruction buffer ordered by client-local execution time.
//!
//! A min-heap on `execute_at_ms` with lazy cancellation: cancelled command
//! IDs are remembered in a set and their entries discarded when they reach
//! the head. Stale instructions are refused at insert; firing a missed cue
//! late is worse than skipping it.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet, VecDeque};

use stagesync_proto::ScheduledInstruction;

/// Cancellation marks kept at most, oldest evicted first. A mark only
/// matters while its command could still arrive or sit buffered; anything
/// older is covered by the stale-insert refusal.
const CANCELLED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
struct Entry(ScheduledInstruction);

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .execute_at_ms
            .cmp(&other.0.execute_at_ms)
            .then(self.0.command_id.cmp(&other.0.command_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct InstructionQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<u64>,
    // Insertion order of `cancelled`, so the oldest mark can be evicted.
    cancelled_order: VecDeque<u64>,
}

impl InstructionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an instruction. Returns `false` when it was refused as stale
    /// or already cancelled.
    pub fn insert(&mut self, instruction: ScheduledInstruction, now_ms: i64) -> bool {
        if instruction.execute_at_ms < now_ms {
            return false;
        }
        if self.cancelled.contains(&instruction.command_id) {
            return false;
        }
        self.heap.push(Reverse(Entry(instruction)));
        true
    }

    /// Mark a command cancelled. Its entries are dropped lazily as they
    /// surface at the head of the heap. The mark set is bounded: past
    /// `CANCELLED_CAPACITY` live marks the oldest is forgotten.
    pub fn cancel(&mut self, command_id: u64) {
        if self.cancelled.insert(command_id) {
            self.cancelled_order.push_back(command_id);
            if self.cancelled_order.len() > CANCELLED_CAPACITY {
                if let Some(oldest) = self.cancelled_order.pop_front() {
                    self.cancelled.remove(&oldest);
                }
            }
        }
    }

    /// Earliest pending execution time, skipping cancelled entries.
    pub fn next_deadline_ms(&mut self) -> Option<i64> {
        self.drop_cancelled_head();
        self.heap.peek().map(|Reverse(entry)| entry.0.execute_at_ms)
    }

    /// Remove and return every instruction due at `now_ms`, in timestamp
    /// order.
    pub fn pop_due(&mut self, now_ms: i64) -> Vec<ScheduledInstruction> {
        let mut due = Vec::new();
        loop {
            self.drop_cancelled_head();
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.0.execute_at_ms <= now_ms => {
                    if let Some(Reverse(entry)) = self.heap.pop() {
                        due.push(entry.0);
                    }
                }
                _ => break,
            }
        }
        due
    }

    /// Drop everything whose execution time has already passed, along with
    /// any still-buffered cancelled entries, and reset the cancellation
    /// marks. Used after a reconnect, where buffered cues may predate the
    /// outage and cancellations belong to the session that issued them.
    pub fn discard_stale(&mut self, now_ms: i64) -> usize {
        let before = self.heap.len();
        let cancelled = std::mem::take(&mut self.cancelled);
        self.cancelled_order.clear();
        let retained: Vec<Reverse<Entry>> = self
            .heap
            .drain()
            .filter(|Reverse(entry)| {
                entry.0.execute_at_ms >= now_ms && !cancelled.contains(&entry.0.command_id)
            })
            .collect();
        self.heap = retained.into_iter().collect();
        before - self.heap.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    // The mark stays after the entry drops, so a late duplicate frame for
    // the same command is still refused at insert.
    fn drop_cancelled_head(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.contains(&entry.0.command_id) {
                self.heap.pop();
            } else {
                break;
            }
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
            client_id: ClientId::from_string("client-under-test".to_string()),
            payload: CommandPayload::SendColor {
                color: ColorValue::Red,
                zone: None,
            },
            execute_at_ms,
        }
    }

    #[test]
    fn test_pop_due_in_timestamp_order() {
        let mut queue = InstructionQueue::new();
        assert!(queue.insert(instruction(3, 300), 0));
        assert!(queue.insert(instruction(1, 100), 0));
        assert!(queue.insert(instruction(2, 200), 0));

        let due = queue.pop_due(250);
        let ids: Vec<u64> = due.iter().map(|i| i.command_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(queue.next_deadline_ms(), Some(300));
    }

    #[test]
    fn test_stale_insert_refused() {
        let mut queue = InstructionQueue::new();
        assert!(!queue.insert(instruction(1, 50), 100));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancelled_never_executes() {
        let mut queue = InstructionQueue::new();
        queue.insert(instruction(1, 100), 0);
        queue.insert(instruction(2, 150), 0);
        queue.cancel(1);

        assert_eq!(queue.next_deadline_ms(), Some(150));
        let due = queue.pop_due(200);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].command_id, 2);
    }

    #[test]
    fn test_cancel_before_insert_refuses_it() {
        let mut queue = InstructionQueue::new();
        queue.cancel(9);
        assert!(!queue.insert(instruction(9, 100), 0));
    }

    #[test]
    fn test_cancellation_marks_are_bounded() {
        let mut queue = InstructionQueue::new();
        for command_id in 0..(CANCELLED_CAPACITY as u64 + 44) {
            queue.cancel(command_id);
        }

        // The oldest mark fell off; recent ones still refuse inserts.
        assert!(queue.insert(instruction(0, 100), 0));
        assert!(!queue.insert(instruction(CANCELLED_CAPACITY as u64 + 43, 100), 0));
    }

    #[test]
    fn test_gate_reopen_purges_cancelled_and_resets_marks() {
        let mut queue = InstructionQueue::new();
        queue.insert(instruction(1, 100), 0);
        queue.insert(instruction(2, 900), 0);
        queue.cancel(2);

        // Drops 1 (stale) and 2 (cancelled but not yet at the head).
        let dropped = queue.discard_stale(500);
        assert_eq!(dropped, 2);
        assert!(queue.is_empty());

        // Marks belong to the prior session and do not carry over.
        assert!(queue.insert(instruction(2, 900), 500));
    }

    #[test]
    fn test_discard_stale_after_reconnect() {
        let mut queue = InstructionQueue::new();
        queue.insert(instruction(1, 100), 0);
        queue.insert(instruction(2, 200), 0);
        queue.insert(instruction(3, 900), 0);

        let dropped = queue.discard_stale(500);
        assert_eq!(dropped, 2);
        assert_eq!(queue.next_deadline_ms(), Some(900));
    }
}
