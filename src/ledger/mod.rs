//! 工具调用台账
//!
//! 每次工具调用一条 ToolRun：pending → running → succeeded | failed，pending/running 可取消。
//! 不变式：error 仅在 failed 时存在；completed_at 仅在终态时设置。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CopilotError;
use crate::store::ToolRunStore;

/// ToolRun 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ToolRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolRunStatus::Pending => "pending",
            ToolRunStatus::Running => "running",
            ToolRunStatus::Succeeded => "succeeded",
            ToolRunStatus::Failed => "failed",
            ToolRunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ToolRunStatus::Pending),
            "running" => Some(ToolRunStatus::Running),
            "succeeded" => Some(ToolRunStatus::Succeeded),
            "failed" => Some(ToolRunStatus::Failed),
            "canceled" => Some(ToolRunStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolRunStatus::Succeeded | ToolRunStatus::Failed | ToolRunStatus::Canceled
        )
    }

    /// 校验并返回目标状态
    pub fn transition(self, to: ToolRunStatus) -> Result<ToolRunStatus, CopilotError> {
        use ToolRunStatus::*;
        match (self, to) {
            (Pending, Running)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Pending, Canceled)
            | (Running, Canceled) => Ok(to),
            _ => Err(CopilotError::InvalidTransition {
                from: self.to_string(),
                event: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for ToolRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次工具调用的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRun {
    pub id: String,
    pub session_id: String,
    /// 触发本次调用的用户消息（审批执行时为空）
    pub message_id: Option<String>,
    pub task_id: Option<String>,
    pub step_id: Option<String>,
    pub tool_name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub status: ToolRunStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
}

/// 新建 ToolRun 的参数
#[derive(Debug, Clone)]
pub struct NewToolRun {
    pub session_id: String,
    pub message_id: Option<String>,
    pub task_id: Option<String>,
    pub step_id: Option<String>,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Clone)]
pub struct ToolRunLedger {
    store: Arc<dyn ToolRunStore>,
}

impl ToolRunLedger {
    pub fn new(store: Arc<dyn ToolRunStore>) -> Self {
        Self { store }
    }

    /// 写入 pending 记录
    pub async fn open(&self, new: NewToolRun) -> Result<ToolRun, CopilotError> {
        let run = ToolRun {
            id: format!("run_{}", uuid::Uuid::new_v4()),
            session_id: new.session_id,
            message_id: new.message_id,
            task_id: new.task_id,
            step_id: new.step_id,
            tool_name: new.tool_name,
            input: new.input,
            output: None,
            status: ToolRunStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            latency_ms: None,
        };
        self.store.insert_tool_run(&run).await?;
        Ok(run)
    }

    /// 以下状态推进都以存储中的状态为准：若记录已被并发改变（如任务被放弃时取消），
    /// 不覆盖，直接返回存储中的记录，调用方据返回的 status 判断
    pub async fn start(&self, mut run: ToolRun) -> Result<ToolRun, CopilotError> {
        let expected = run.status;
        run.status = run.status.transition(ToolRunStatus::Running)?;
        run.started_at = Some(Utc::now());
        self.commit(run, expected).await
    }

    pub async fn succeed(&self, mut run: ToolRun, output: Value) -> Result<ToolRun, CopilotError> {
        let expected = run.status;
        run.status = run.status.transition(ToolRunStatus::Succeeded)?;
        run.output = Some(output);
        self.complete(run, expected).await
    }

    pub async fn fail(&self, mut run: ToolRun, error: String) -> Result<ToolRun, CopilotError> {
        let expected = run.status;
        run.status = run.status.transition(ToolRunStatus::Failed)?;
        run.error = Some(error);
        self.complete(run, expected).await
    }

    pub async fn cancel(&self, mut run: ToolRun) -> Result<ToolRun, CopilotError> {
        let expected = run.status;
        run.status = run.status.transition(ToolRunStatus::Canceled)?;
        self.complete(run, expected).await
    }

    async fn complete(
        &self,
        mut run: ToolRun,
        expected: ToolRunStatus,
    ) -> Result<ToolRun, CopilotError> {
        let now = Utc::now();
        let since = run.started_at.unwrap_or(run.created_at);
        run.completed_at = Some(now);
        run.latency_ms = Some((now - since).num_milliseconds().max(0));
        let run = self.commit(run, expected).await?;
        tracing::info!(
            run_id = %run.id,
            tool = %run.tool_name,
            status = %run.status,
            latency_ms = run.latency_ms.unwrap_or_default(),
            "Tool run completed"
        );
        Ok(run)
    }

    async fn commit(&self, run: ToolRun, expected: ToolRunStatus) -> Result<ToolRun, CopilotError> {
        if self.store.transition_tool_run(&run, expected).await? {
            return Ok(run);
        }
        let stored = self.get(&run.id).await?;
        tracing::warn!(
            run_id = %run.id,
            wanted = %run.status,
            stored = %stored.status,
            "Tool run changed concurrently, keeping stored record"
        );
        Ok(stored)
    }

    pub async fn get(&self, run_id: &str) -> Result<ToolRun, CopilotError> {
        self.store
            .get_tool_run(run_id)
            .await?
            .ok_or_else(|| CopilotError::NotFound(format!("tool run {run_id}")))
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<ToolRun>, CopilotError> {
        Ok(self.store.list_tool_runs_for_session(session_id).await?)
    }

    pub async fn list_for_task(&self, task_id: &str) -> Result<Vec<ToolRun>, CopilotError> {
        Ok(self.store.list_tool_runs_for_task(task_id).await?)
    }
}
