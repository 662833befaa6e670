use std::collections::VecDeque;

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Free,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open,
    /// Only immediate commands may dispatch, and only while the gate is open.
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateGate {
    Open,
    Closed,
}

/// Arbitration flags saved and restored around event callouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterState {
    pub bus: BusState,
    pub queue: QueueState,
    pub immediate_gate: ImmediateGate,
}

impl ArbiterState {
    pub const IDLE: ArbiterState = ArbiterState {
        bus: BusState::Free,
        queue: QueueState::Open,
        immediate_gate: ImmediateGate::Closed,
    };

    /// State while drivers are being told about a bus event.
    pub const CALLOUT: ArbiterState = ArbiterState {
        bus: BusState::Free,
        queue: QueueState::Locked,
        immediate_gate: ImmediateGate::Open,
    };

    /// Whether the command at the head of the queue may start now.
    pub fn admits(&self, head_is_immediate: bool) -> bool {
        if self.bus != BusState::Free {
            return false;
        }
        match self.queue {
            QueueState::Open => true,
            QueueState::Locked => self.immediate_gate == ImmediateGate::Open && head_is_immediate,
        }
    }

    /// Immediate commands started during a callout must run polled.
    pub fn forces_polled(&self, immediate: bool) -> bool {
        self.queue == QueueState::Locked && self.immediate_gate == ImmediateGate::Open && immediate
    }
}

impl Default for ArbiterState {
    fn default() -> Self {
        Self::IDLE
    }
}

/// Pending commands. Immediate commands go ahead of every normal command
/// but stay FIFO among themselves.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<Command>,
    immediates: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enqueue(&mut self, command: Command) {
        if command.is_immediate() {
            self.entries.insert(self.immediates, command);
            self.immediates += 1;
        } else {
            self.entries.push_back(command);
        }
    }

    pub fn dequeue_first(&mut self) -> Option<Command> {
        let command = self.entries.pop_front()?;
        if command.is_immediate() {
            self.immediates -= 1;
        }
        Some(command)
    }

    pub fn head_is_immediate(&self) -> bool {
        self.immediates > 0
    }

    /// Removes every queued command, oldest first.
    pub fn drain(&mut self) -> Vec<Command> {
        self.immediates = 0;
        self.entries.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Opcode, TaskFile, Unit};

    fn cmd(tag: u8, immediate: bool) -> Command {
        Command::builder(Opcode::ExecIo, Unit::Device0)
            .task_file(TaskFile {
                features: tag,
                ..TaskFile::default()
            })
            .immediate(immediate)
            .build()
            .unwrap()
    }

    fn tags(queue: &CommandQueue) -> Vec<u8> {
        queue.iter().map(|c| c.task_file().features).collect()
    }

    #[test]
    fn immediates_jump_normals_but_keep_their_order() {
        let mut queue = CommandQueue::new();
        queue.enqueue(cmd(1, false));
        queue.enqueue(cmd(2, true));
        queue.enqueue(cmd(3, false));
        queue.enqueue(cmd(4, true));
        assert_eq!(tags(&queue), vec![2, 4, 1, 3]);
        assert!(queue.head_is_immediate());

        assert_eq!(queue.dequeue_first().unwrap().task_file().features, 2);
        assert_eq!(queue.dequeue_first().unwrap().task_file().features, 4);
        assert!(!queue.head_is_immediate());
        queue.enqueue(cmd(5, true));
        assert_eq!(tags(&queue), vec![5, 1, 3]);
    }

    #[test]
    fn drain_resets_immediate_count() {
        let mut queue = CommandQueue::new();
        queue.enqueue(cmd(1, true));
        queue.enqueue(cmd(2, false));
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
        assert!(!queue.head_is_immediate());
        assert!(queue.dequeue_first().is_none());
    }

    #[test]
    fn locked_queue_admits_only_immediates_through_open_gate() {
        let mut state = ArbiterState::CALLOUT;
        assert!(state.admits(true));
        assert!(!state.admits(false));
        assert!(state.forces_polled(true));

        state.immediate_gate = ImmediateGate::Closed;
        assert!(!state.admits(true));

        assert!(ArbiterState::IDLE.admits(false));
        let busy = ArbiterState {
            bus: BusState::Busy,
            ..ArbiterState::IDLE
        };
        assert!(!busy.admits(true));
        assert!(!ArbiterState::IDLE.forces_polled(true));
    }
}
