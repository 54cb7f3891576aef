//! Task lifecycle notifications.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. Publishing never
//! blocks and is fire-and-forget: with no subscribers the event is dropped, and
//! a subscriber that falls behind sees `RecvError::Lagged` and skips ahead.

use tokio::sync::broadcast;

use crate::state_machine::{StageType, TaskId, TaskStatus};

pub const DEFAULT_EVENTS_CAPACITY: usize = 64;

/// Something that happened to a task, as seen by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Dequeued {
        task_id: TaskId,
        stage_type: StageType,
        attempts: u32,
    },
    QueueEmpty {
        stage_type: StageType,
    },
    StatusUpdated {
        task_id: TaskId,
        status: TaskStatus,
    },
    /// A transition refused locally; nothing was sent.
    TransitionRejected {
        task_id: TaskId,
        found: TaskStatus,
        target: TaskStatus,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Capacity is shared by all receivers and clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_CAPACITY)
    }
}
