//! 内存存储：实现全部 Store trait，供测试与单进程运行

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{MessageStore, SessionStore, StoreError, TaskStore, ToolRunStore};
use crate::approval::{Step, Task, TaskStatus};
use crate::ledger::{ToolRun, ToolRunStatus};
use crate::memory::Message;
use crate::session::Session;

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    /// session_id -> 按 created_at 正序
    messages: HashMap<String, Vec<Message>>,
    tool_runs: HashMap<String, ToolRun>,
    tasks: HashMap<String, Task>,
    /// task_id -> 按 step_order 正序
    steps: HashMap<String, Vec<Step>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::Missing(format!("session {}", session.id)))?;
        *slot = session.clone();
        Ok(())
    }

    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .tables
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(sessions)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let messages = tables
            .messages
            .entry(message.session_id.clone())
            .or_default();
        // 保持按时间有序，即使调用方传入了较早的时间戳
        let pos = messages.partition_point(|m| m.created_at <= message.created_at);
        messages.insert(pos, message.clone());
        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .get(session_id)
            .map(|messages| messages.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn all_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_created_at(
        &self,
        session_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .get(session_id)
            .and_then(|messages| messages.last())
            .map(|m| m.created_at))
    }
}

#[async_trait]
impl ToolRunStore for MemoryStore {
    async fn insert_tool_run(&self, run: &ToolRun) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .tool_runs
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn transition_tool_run(
        &self,
        run: &ToolRun,
        expected: ToolRunStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .tool_runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::Missing(format!("tool run {}", run.id)))?;
        if slot.status != expected {
            return Ok(false);
        }
        *slot = run.clone();
        Ok(true)
    }

    async fn get_tool_run(&self, id: &str) -> Result<Option<ToolRun>, StoreError> {
        Ok(self.tables.read().await.tool_runs.get(id).cloned())
    }

    async fn list_tool_runs_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolRun>, StoreError> {
        let mut runs: Vec<ToolRun> = self
            .tables
            .read()
            .await
            .tool_runs
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn list_tool_runs_for_task(&self, task_id: &str) -> Result<Vec<ToolRun>, StoreError> {
        let mut runs: Vec<ToolRun> = self
            .tables
            .read()
            .await
            .tool_runs
            .values()
            .filter(|r| r.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task, steps: &[Step]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.tasks.insert(task.id.clone(), task.clone());
        let mut steps = steps.to_vec();
        steps.sort_by_key(|s| s.step_order);
        tables.steps.insert(task.id.clone(), steps);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tables.read().await.tasks.get(id).cloned())
    }

    async fn get_steps(&self, task_id: &str) -> Result<Vec<Step>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .steps
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: TaskStatus,
        next: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::Missing(format!("task {task_id}")))?;
        if task.status != expected {
            return Ok(false);
        }
        task.status = next;
        task.updated_at = at;
        if let Some(steps) = tables.steps.get_mut(task_id) {
            for step in steps.iter_mut() {
                step.status = next;
                step.updated_at = at;
            }
        }
        Ok(true)
    }
}
