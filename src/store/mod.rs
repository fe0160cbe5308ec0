//! 持久化边界：sessions / messages / tool_runs / tasks / task_steps 五个逻辑集合
//!
//! 每个组件只注入自己需要的 Store trait；MemoryStore 供测试与本地运行，
//! SqliteStore（feature = "async-sqlite"）用于跨进程持久化。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::approval::{Step, Task, TaskStatus};
use crate::ledger::{ToolRun, ToolRunStatus};
use crate::memory::Message;
use crate::session::Session;

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    Missing(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[cfg(feature = "async-sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// 整行覆盖更新；记录不存在时返回 Missing
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    /// 按 last_message_at 倒序
    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// 最近 limit 条，按 created_at 倒序（newest first）
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// 全部消息，按 created_at 正序
    async fn all_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn latest_created_at(
        &self,
        session_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[async_trait]
pub trait ToolRunStore: Send + Sync {
    async fn insert_tool_run(&self, run: &ToolRun) -> Result<(), StoreError>;

    /// 仅当存储中的状态仍为 expected 时写入整条记录；状态已变返回 Ok(false)
    async fn transition_tool_run(
        &self,
        run: &ToolRun,
        expected: ToolRunStatus,
    ) -> Result<bool, StoreError>;

    async fn get_tool_run(&self, id: &str) -> Result<Option<ToolRun>, StoreError>;

    async fn list_tool_runs_for_session(&self, session_id: &str)
        -> Result<Vec<ToolRun>, StoreError>;

    async fn list_tool_runs_for_task(&self, task_id: &str) -> Result<Vec<ToolRun>, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 任务与其全部步骤一起写入（原子）
    async fn insert_task(&self, task: &Task, steps: &[Step]) -> Result<(), StoreError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// 按 step_order 升序
    async fn get_steps(&self, task_id: &str) -> Result<Vec<Step>, StoreError>;

    async fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>, StoreError>;

    /// 条件更新：仅当任务当前状态为 expected 时改为 next（步骤状态同步），返回是否生效。
    /// 并发的重复审批依赖此操作保证只执行一次。
    async fn transition_task(
        &self,
        task_id: &str,
        expected: TaskStatus,
        next: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
