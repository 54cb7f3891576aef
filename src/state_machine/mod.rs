mod task;
mod transition;

pub use task::{JobId, StageId, StageType, Task, TaskId, TaskStatus, TraceCarrier};
pub use transition::StateMachine;
