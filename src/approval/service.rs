//! 审批服务
//!
//! propose 为需审批的工具调用建一个 Task + 一个 Step（waiting_approval），不建 ToolRun；
//! decide 在外部确认到达后推进状态机，批准时按 Step 中保存的原参数执行并补记 ToolRun。
//! 审批可能在另一个请求 / 进程中到达，是否仍在等待只以存储中的记录为准。

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use super::task::{Decision, Step, Task, TaskEvent, TaskId, TaskStatus};
use crate::core::CopilotError;
use crate::ledger::{NewToolRun, ToolRun, ToolRunLedger, ToolRunStatus};
use crate::memory::{MessageLog, NewMessage};
use crate::session::SessionManager;
use crate::store::TaskStore;
use crate::tools::{ToolContext, ToolExecutor, ValidatedCall};

/// 新建待审批任务的参数
#[derive(Debug, Clone)]
pub struct ProposeRequest {
    pub session_id: String,
    pub created_by: String,
    pub tenant_id: Option<String>,
    pub title: String,
    pub goal: Option<String>,
    pub call: ValidatedCall,
}

/// 返回给调用方展示的待审批动作
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub step_id: String,
    pub title: String,
    pub tool_name: String,
    pub input: Value,
    pub status: TaskStatus,
}

/// 任务当前状态（含步骤与关联的 ToolRun）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub task: Task,
    pub steps: Vec<Step>,
    pub tool_runs: Vec<ToolRun>,
}

pub struct ApprovalService {
    tasks: Arc<dyn TaskStore>,
    ledger: ToolRunLedger,
    messages: MessageLog,
    sessions: SessionManager,
    executor: Arc<ToolExecutor>,
}

impl ApprovalService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        ledger: ToolRunLedger,
        messages: MessageLog,
        sessions: SessionManager,
        executor: Arc<ToolExecutor>,
    ) -> Self {
        Self {
            tasks,
            ledger,
            messages,
            sessions,
            executor,
        }
    }

    /// 创建一个 Task 与唯一的 Step，均处于 waiting_approval
    pub async fn propose(&self, request: ProposeRequest) -> Result<PendingTask, CopilotError> {
        let now = Utc::now();
        let task = Task {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            session_id: request.session_id,
            created_by: request.created_by,
            tenant_id: request.tenant_id,
            title: request.title,
            goal: request.goal,
            status: TaskStatus::WaitingApproval,
            created_at: now,
            updated_at: now,
        };
        let step = Step {
            id: format!("step_{}", uuid::Uuid::new_v4()),
            task_id: task.id.clone(),
            step_order: 1,
            tool_name: request.call.tool_name,
            input: request.call.arguments,
            requires_approval: true,
            status: TaskStatus::WaitingApproval,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert_task(&task, std::slice::from_ref(&step)).await?;
        tracing::info!(
            task_id = %task.id,
            session_id = %task.session_id,
            tool = %step.tool_name,
            "Task waiting for approval"
        );

        Ok(PendingTask {
            task_id: task.id,
            step_id: step.id,
            title: task.title,
            tool_name: step.tool_name,
            input: step.input,
            status: task.status,
        })
    }

    /// 应用外部审批决定
    ///
    /// 重复的决定（批准后再次批准、拒绝后再次拒绝）是无操作；其余非等待状态返回 StateConflict。
    pub async fn decide(
        &self,
        caller_id: &str,
        task_id: &str,
        decision: Decision,
    ) -> Result<TaskView, CopilotError> {
        let task = self.load_owned(caller_id, task_id).await?;

        if task.status != TaskStatus::WaitingApproval {
            return self.settle(task, decision).await;
        }

        match decision {
            Decision::Reject => {
                let next = task.status.apply(TaskEvent::Reject)?;
                if !self
                    .tasks
                    .transition_task(task_id, TaskStatus::WaitingApproval, next, Utc::now())
                    .await?
                {
                    let current = self.load_owned(caller_id, task_id).await?;
                    return self.settle(current, decision).await;
                }
                tracing::info!(task_id = %task_id, "Task rejected");
                self.messages
                    .append(NewMessage::assistant(
                        &task.session_id,
                        format!("Okay, I won't proceed with \"{}\".", task.title),
                    ))
                    .await?;
                self.sessions.touch(&task.session_id).await?;
            }
            Decision::Approve => {
                let next = task.status.apply(TaskEvent::Approve)?;
                if !self
                    .tasks
                    .transition_task(task_id, TaskStatus::WaitingApproval, next, Utc::now())
                    .await?
                {
                    let current = self.load_owned(caller_id, task_id).await?;
                    return self.settle(current, decision).await;
                }
                tracing::info!(task_id = %task_id, "Task approved");
                self.run_approved(task).await?;
            }
        }

        self.view(task_id).await
    }

    /// 放弃任务：waiting_approval / approved / running → canceled，未完成的 ToolRun 一并取消
    pub async fn abandon(&self, caller_id: &str, task_id: &str) -> Result<TaskView, CopilotError> {
        let task = self.load_owned(caller_id, task_id).await?;
        let next = task.status.apply(TaskEvent::Abandon)?;
        if !self
            .tasks
            .transition_task(task_id, task.status, next, Utc::now())
            .await?
        {
            let current = self.load_owned(caller_id, task_id).await?;
            return Err(CopilotError::StateConflict {
                task_id: task_id.to_string(),
                status: current.status.to_string(),
            });
        }
        for run in self.ledger.list_for_task(task_id).await? {
            if !run.status.is_terminal() {
                self.ledger.cancel(run).await?;
            }
        }
        tracing::info!(task_id = %task_id, from = %task.status, "Task abandoned");
        self.view(task_id).await
    }

    /// 当前状态（仅创建者可见）
    pub async fn get(&self, caller_id: &str, task_id: &str) -> Result<TaskView, CopilotError> {
        self.load_owned(caller_id, task_id).await?;
        self.view(task_id).await
    }

    pub async fn list_for_session(
        &self,
        caller_id: &str,
        session_id: &str,
    ) -> Result<Vec<Task>, CopilotError> {
        let mut tasks = self.tasks.list_tasks_for_session(session_id).await?;
        tasks.retain(|t| t.created_by == caller_id);
        Ok(tasks)
    }

    async fn load_owned(&self, caller_id: &str, task_id: &str) -> Result<Task, CopilotError> {
        self.tasks
            .get_task(task_id)
            .await?
            .filter(|t| t.created_by == caller_id)
            .ok_or_else(|| CopilotError::NotFound(format!("task {task_id}")))
    }

    async fn view(&self, task_id: &str) -> Result<TaskView, CopilotError> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| CopilotError::NotFound(format!("task {task_id}")))?;
        let steps = self.tasks.get_steps(task_id).await?;
        let tool_runs = self.ledger.list_for_task(task_id).await?;
        Ok(TaskView {
            task,
            steps,
            tool_runs,
        })
    }

    /// 任务已离开 waiting_approval：决定已生效则幂等返回，否则冲突
    async fn settle(&self, task: Task, decision: Decision) -> Result<TaskView, CopilotError> {
        if decision.is_settled_by(task.status) {
            tracing::debug!(task_id = %task.id, status = %task.status, "Duplicate decision ignored");
            return self.view(&task.id).await;
        }
        Err(CopilotError::StateConflict {
            task_id: task.id,
            status: task.status.to_string(),
        })
    }

    /// approved → running → succeeded | failed，并补记一条 ToolRun
    async fn run_approved(&self, task: Task) -> Result<(), CopilotError> {
        let step = self
            .tasks
            .get_steps(&task.id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CopilotError::NotFound(format!("step of task {}", task.id)))?;

        let running = TaskStatus::Approved.apply(TaskEvent::Begin)?;
        if !self
            .tasks
            .transition_task(&task.id, TaskStatus::Approved, running, Utc::now())
            .await?
        {
            // 审批与开始执行之间被放弃
            tracing::info!(task_id = %task.id, "Task no longer approved, skipping execution");
            return Ok(());
        }

        let run = self
            .ledger
            .open(NewToolRun {
                session_id: task.session_id.clone(),
                message_id: None,
                task_id: Some(task.id.clone()),
                step_id: Some(step.id.clone()),
                tool_name: step.tool_name.clone(),
                input: step.input.clone(),
            })
            .await?;
        // abandon 可能发生在 open 之前（看不到这条 run）或之后（已将其取消）
        if !self.still_running(&task.id).await? {
            if !run.status.is_terminal() {
                self.ledger.cancel(run).await?;
            }
            tracing::info!(task_id = %task.id, "Task abandoned before execution");
            return Ok(());
        }
        let run = self.ledger.start(run).await?;
        if run.status != ToolRunStatus::Running {
            tracing::info!(task_id = %task.id, "Task abandoned before execution");
            return Ok(());
        }

        let ctx = ToolContext {
            caller_id: task.created_by.clone(),
            tenant_id: task.tenant_id.clone(),
            session_id: task.session_id.clone(),
        };
        let call = ValidatedCall {
            tool_name: step.tool_name.clone(),
            arguments: step.input.clone(),
        };

        let (event, run, output) = match self.executor.execute(&ctx, &call).await {
            Ok(output) => {
                let run = self.ledger.succeed(run, output.clone()).await?;
                (TaskEvent::Succeed, run, output)
            }
            Err(failure) => {
                let error = CopilotError::from(failure).to_string();
                let run = self.ledger.fail(run, error.clone()).await?;
                (TaskEvent::Fail, run, json!({ "error": error }))
            }
        };

        let finished = running.apply(event)?;
        let settled = run.status != ToolRunStatus::Canceled
            && self
                .tasks
                .transition_task(&task.id, running, finished, Utc::now())
                .await?;

        self.messages
            .append(NewMessage::tool(
                &task.session_id,
                &step.tool_name,
                step.input.clone(),
                output,
            ))
            .await?;
        let summary = if !settled {
            tracing::warn!(task_id = %task.id, run_status = %run.status, "Task abandoned while running");
            format!("\"{}\" was canceled before it finished.", task.title)
        } else if let Some(error) = &run.error {
            tracing::info!(task_id = %task.id, status = %finished, "Task finished");
            format!("\"{}\" failed: {error}", task.title)
        } else {
            tracing::info!(task_id = %task.id, status = %finished, "Task finished");
            format!("Done: \"{}\" completed successfully.", task.title)
        };
        self.messages
            .append(NewMessage::assistant(&task.session_id, summary))
            .await?;
        self.sessions.touch(&task.session_id).await?;
        Ok(())
    }

    async fn still_running(&self, task_id: &str) -> Result<bool, CopilotError> {
        Ok(self
            .tasks
            .get_task(task_id)
            .await?
            .is_some_and(|t| t.status == TaskStatus::Running))
    }
}
