//! Pending command list
//!
//! Holds commands that could not be sent yet, the open repeat blocks that
//! capture commands at enqueue time, and the device buffer telemetry used as
//! secondary back-pressure.

use super::command::CommandRecord;
use std::collections::VecDeque;

/// An open `M808 L<n>` block
#[derive(Debug, Clone, Default)]
pub struct LoopBlock {
    /// Repeat count; the body is emitted `count + 1` times
    pub count: usize,
    /// Captured commands
    pub body: Vec<CommandRecord>,
}

/// Pending commands with priority insertion
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<CommandRecord>,
    loops: Vec<LoopBlock>,
    high_water: usize,
}

impl OutboundQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Priority records go after the leading run of
    /// priority records, everything else goes to the tail.
    pub fn push(&mut self, record: CommandRecord) {
        if record.flags.priority {
            let idx = self
                .pending
                .iter()
                .position(|r| !r.flags.priority)
                .unwrap_or(self.pending.len());
            self.pending.insert(idx, record);
        } else {
            self.pending.push_back(record);
        }
        self.high_water = self.high_water.max(self.pending.len());
    }

    /// Remove the head
    pub fn pop(&mut self) -> Option<CommandRecord> {
        self.pending.pop_front()
    }

    /// Peek at the head
    pub fn front(&self) -> Option<&CommandRecord> {
        self.pending.front()
    }

    /// Pending count
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a record of the given priority could be sent ahead of what is
    /// already pending without breaking order.
    pub fn nothing_ahead(&self, priority: bool) -> bool {
        match self.pending.front() {
            None => true,
            Some(head) => priority && !head.flags.priority,
        }
    }

    /// Drop every pending record and open loop
    pub fn clear(&mut self) {
        self.pending.clear();
        self.loops.clear();
    }

    /// Any pending line containing `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.pending.iter().any(|r| r.line.contains(needle))
    }

    /// Pending lines, head first
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|r| r.line.as_str())
    }

    /// High-water mark of the pending list for the current run
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Reset the high-water mark
    pub fn reset_high_water(&mut self) {
        self.high_water = 0;
    }

    /// Open a repeat block
    pub fn open_loop(&mut self, count: usize) {
        self.loops.push(LoopBlock {
            count,
            body: Vec::new(),
        });
    }

    /// Close the innermost repeat block
    pub fn close_loop(&mut self) -> Option<LoopBlock> {
        self.loops.pop()
    }

    /// Capture `record` into the innermost open block. Hands the record back
    /// when no block is open.
    pub fn capture(&mut self, record: CommandRecord) -> Option<CommandRecord> {
        match self.loops.last_mut() {
            Some(block) => {
                block.body.push(record);
                None
            }
            None => Some(record),
        }
    }
}

/// Device buffer telemetry used to throttle draining.
///
/// `None` means unknown, which never throttles.
#[derive(Debug, Default, Clone)]
pub struct FlowGate {
    /// Input buffer slots free
    pub buf_free: Option<u32>,
    /// Largest input buffer value seen
    pub buf_max: u32,
    /// Planner slots free
    pub pln_free: Option<u32>,
    /// Largest planner value seen
    pub pln_max: u32,
    /// Acknowledgments seen
    pub acks: u64,
    /// Ack count when the planner retry was armed
    pub pln_mark: u64,
    /// Ack count when the buffer retry was armed
    pub buf_mark: u64,
}

impl FlowGate {
    /// Record an input buffer report
    pub fn record_buffer(&mut self, free: u32) {
        self.buf_free = Some(free);
        self.buf_max = self.buf_max.max(free);
    }

    /// Record a planner report
    pub fn record_planner(&mut self, free: u32) {
        self.pln_free = Some(free);
        self.pln_max = self.pln_max.max(free);
    }

    /// Planner at or below 20% of its observed maximum
    pub fn planner_blocked(&self) -> bool {
        low(self.pln_free, self.pln_max)
    }

    /// Input buffer at or below 20% of its observed maximum
    pub fn buffer_blocked(&self) -> bool {
        low(self.buf_free, self.buf_max)
    }

    /// Forget all telemetry, e.g. on a new connection
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn low(free: Option<u32>, max: u32) -> bool {
    match free {
        Some(free) if max > 0 => u64::from(free) * 5 <= u64::from(max),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::command::CommandFlags;
    use proptest::prelude::*;

    fn rec(line: &str, priority: bool) -> CommandRecord {
        CommandRecord::new(
            line,
            CommandFlags {
                priority,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_priority_clusters_at_head() {
        let mut q = OutboundQueue::new();
        q.push(rec("A", false));
        q.push(rec("B", false));
        q.push(rec("P1", true));
        q.push(rec("C", false));
        q.push(rec("P2", true));
        assert_eq!(q.lines().collect::<Vec<_>>(), vec!["P1", "P2", "A", "B", "C"]);
        assert_eq!(q.high_water(), 5);
        q.pop();
        assert_eq!(q.high_water(), 5);
    }

    #[test]
    fn test_nothing_ahead() {
        let mut q = OutboundQueue::new();
        assert!(q.nothing_ahead(false));
        q.push(rec("A", false));
        assert!(!q.nothing_ahead(false));
        assert!(q.nothing_ahead(true));
        q.push(rec("P", true));
        assert!(!q.nothing_ahead(true));
    }

    #[test]
    fn test_loop_capture() {
        let mut q = OutboundQueue::new();
        assert!(q.capture(rec("A", false)).is_some());
        q.open_loop(2);
        assert!(q.capture(rec("A", false)).is_none());
        let block = q.close_loop().unwrap();
        assert_eq!(block.count, 2);
        assert_eq!(block.body.len(), 1);
        assert!(q.close_loop().is_none());
    }

    #[test]
    fn test_flow_gate_thresholds() {
        let mut gate = FlowGate::default();
        assert!(!gate.planner_blocked());
        gate.record_planner(15);
        gate.record_planner(3);
        assert!(gate.planner_blocked());
        gate.record_planner(4);
        assert!(!gate.planner_blocked());
        gate.record_buffer(127);
        gate.record_buffer(25);
        assert!(gate.buffer_blocked());
    }

    proptest! {
        #[test]
        fn prop_priority_ordering(ops in proptest::collection::vec(any::<bool>(), 0..40)) {
            let mut q = OutboundQueue::new();
            for (i, priority) in ops.iter().enumerate() {
                q.push(rec(&i.to_string(), *priority));
            }
            let out: Vec<usize> = q.lines().map(|l| l.parse().unwrap()).collect();
            let expected: Vec<usize> = ops.iter().enumerate().filter(|(_, p)| **p).map(|(i, _)| i)
                .chain(ops.iter().enumerate().filter(|(_, p)| !**p).map(|(i, _)| i))
                .collect();
            prop_assert_eq!(out, expected);
        }
    }
}
