//! Task / Step 状态机
//!
//! ```text
//! waiting_approval --approve--> approved --begin--> running --succeed--> succeeded
//! waiting_approval --reject---> rejected            running --fail-----> failed
//! waiting_approval --abandon--> canceled   approved/running --abandon--> canceled
//! ```
//! 终态（succeeded / failed / rejected / canceled）不再接受任何事件。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CopilotError;

/// 任务 ID
pub type TaskId = String;

/// Task 与 Step 共用的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    WaitingApproval,
    Approved,
    Running,
    Succeeded,
    Failed,
    Rejected,
    Canceled,
}

/// 状态机事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Approve,
    Reject,
    Begin,
    Succeed,
    Fail,
    Abandon,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskEvent::Approve => "approve",
            TaskEvent::Reject => "reject",
            TaskEvent::Begin => "begin",
            TaskEvent::Succeed => "succeed",
            TaskEvent::Fail => "fail",
            TaskEvent::Abandon => "abandon",
        };
        f.write_str(s)
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting_approval" => Some(TaskStatus::WaitingApproval),
            "approved" => Some(TaskStatus::Approved),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "rejected" => Some(TaskStatus::Rejected),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Rejected | TaskStatus::Canceled
        )
    }

    /// 状态转移函数；非法边返回 InvalidTransition
    pub fn apply(self, event: TaskEvent) -> Result<TaskStatus, CopilotError> {
        use TaskEvent::*;
        use TaskStatus::*;
        let next = match (self, event) {
            (WaitingApproval, Approve) => Approved,
            (WaitingApproval, Reject) => Rejected,
            (WaitingApproval, Abandon) => Canceled,
            (Approved, Begin) => Running,
            (Approved, Abandon) => Canceled,
            (Running, Succeed) => Succeeded,
            (Running, Fail) => Failed,
            (Running, Abandon) => Canceled,
            _ => {
                return Err(CopilotError::InvalidTransition {
                    from: self.to_string(),
                    event: event.to_string(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 外部审批方给出的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Decision::Approve),
            "reject" => Some(Decision::Reject),
            _ => None,
        }
    }

    /// 该决定已生效时任务可能处于的状态；落在其中的重复决定按幂等处理
    pub fn is_settled_by(&self, status: TaskStatus) -> bool {
        match self {
            Decision::Approve => matches!(
                status,
                TaskStatus::Approved | TaskStatus::Running | TaskStatus::Succeeded | TaskStatus::Failed
            ),
            Decision::Reject => status == TaskStatus::Rejected,
        }
    }
}

/// 一个等待或正在经历审批执行的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: String,
    pub created_by: String,
    pub tenant_id: Option<String>,
    pub title: String,
    pub goal: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 任务中的一步；input 创建后不可变，审批确认的正是这份参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub task_id: TaskId,
    /// 从 1 开始
    pub step_order: u32,
    pub tool_name: String,
    pub input: Value,
    pub requires_approval: bool,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
