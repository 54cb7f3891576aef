use crate::error::ConsumerError;

use super::task::{Task, TaskStatus};

impl TaskStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// PENDING → IN_PROGRESS → {COMPLETED, FAILED}. Terminal states have no exits.
    pub const fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }
}

/// Guards client-initiated status changes.
pub struct StateMachine;

impl StateMachine {
    /// Checks that `task` may move to `target` before anything is sent to the service.
    ///
    /// A worker only ever finishes tasks, so the expected current status is the
    /// one that leads into `target` (IN_PROGRESS for both terminal targets).
    pub fn validate(task: &Task, target: TaskStatus) -> Result<(), ConsumerError> {
        let expected = Self::required_status(target);
        if task.status == expected && task.status.can_transition_to(target) {
            Ok(())
        } else {
            Err(ConsumerError::InvalidStateTransition {
                task_id: task.id.clone(),
                found: task.status,
                expected,
            })
        }
    }

    /// The only status from which `target` can be reached.
    pub const fn required_status(target: TaskStatus) -> TaskStatus {
        match target {
            TaskStatus::Pending | TaskStatus::InProgress => TaskStatus::Pending,
            TaskStatus::Completed | TaskStatus::Failed => TaskStatus::InProgress,
        }
    }
}
