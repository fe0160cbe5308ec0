//! 审批闸门：Task / Step 状态机与审批服务

pub mod service;
pub mod task;

pub use service::{ApprovalService, PendingTask, ProposeRequest, TaskView};
pub use task::{Decision, Step, Task, TaskEvent, TaskId, TaskStatus};
