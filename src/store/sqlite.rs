//! SQLite 存储（feature = "async-sqlite"）
//!
//! 五张表：copilot_sessions / copilot_messages / copilot_tool_runs / copilot_tasks / copilot_task_steps。
//! 时间戳存为微秒整数，JSON 字段存为 TEXT。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{MessageStore, SessionStore, StoreError, TaskStore, ToolRunStore};
use crate::approval::{Step, Task, TaskStatus};
use crate::ledger::{ToolRun, ToolRunStatus};
use crate::memory::{Message, Role};
use crate::session::{Session, SessionStatus};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS copilot_sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        tenant_id TEXT,
        locale TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_message_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user ON copilot_sessions(user_id)",
    "CREATE TABLE IF NOT EXISTS copilot_messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT,
        tool_name TEXT,
        tool_input TEXT,
        tool_output TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON copilot_messages(session_id, created_at)",
    "CREATE TABLE IF NOT EXISTS copilot_tool_runs (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        message_id TEXT,
        task_id TEXT,
        step_id TEXT,
        tool_name TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        status TEXT NOT NULL,
        error TEXT,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        latency_ms INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_tool_runs_session ON copilot_tool_runs(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_tool_runs_task ON copilot_tool_runs(task_id)",
    "CREATE TABLE IF NOT EXISTS copilot_tasks (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        created_by TEXT NOT NULL,
        tenant_id TEXT,
        title TEXT NOT NULL,
        goal TEXT,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_session ON copilot_tasks(session_id)",
    "CREATE TABLE IF NOT EXISTS copilot_task_steps (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        step_order INTEGER NOT NULL,
        tool_name TEXT NOT NULL,
        input TEXT NOT NULL,
        requires_approval INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_steps_task ON copilot_task_steps(task_id, step_order)",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（不存在则创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::info!(path = %db_path.as_ref().display(), "SQLite store ready");
        Ok(Self { pool })
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(v: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(v)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {v}")))
}

fn opt_from_micros(v: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    v.map(from_micros).transpose()
}

fn to_json(value: &Value) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn opt_to_json(value: &Option<Value>) -> Result<Option<String>, StoreError> {
    value.as_ref().map(to_json).transpose()
}

fn opt_from_json(text: Option<String>) -> Result<Option<Value>, StoreError> {
    Ok(text.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn corrupt<T>(field: &str, value: &str) -> Result<T, StoreError> {
    Err(StoreError::Corrupt(format!("{field}: {value}")))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    let status: String = row.try_get("status")?;
    let Some(status) = SessionStatus::parse(&status) else {
        return corrupt("session status", &status);
    };
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tenant_id: row.try_get("tenant_id")?,
        locale: row.try_get("locale")?,
        status,
        created_at: from_micros(row.try_get("created_at")?)?,
        last_message_at: from_micros(row.try_get("last_message_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, StoreError> {
    let role: String = row.try_get("role")?;
    let Some(role) = Role::parse(&role) else {
        return corrupt("message role", &role);
    };
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role,
        content: row.try_get("content")?,
        tool_name: row.try_get("tool_name")?,
        tool_input: opt_from_json(row.try_get("tool_input")?)?,
        tool_output: opt_from_json(row.try_get("tool_output")?)?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

fn tool_run_from_row(row: &SqliteRow) -> Result<ToolRun, StoreError> {
    let status: String = row.try_get("status")?;
    let Some(status) = ToolRunStatus::parse(&status) else {
        return corrupt("tool run status", &status);
    };
    let input: String = row.try_get("input")?;
    Ok(ToolRun {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        message_id: row.try_get("message_id")?,
        task_id: row.try_get("task_id")?,
        step_id: row.try_get("step_id")?,
        tool_name: row.try_get("tool_name")?,
        input: serde_json::from_str(&input)?,
        output: opt_from_json(row.try_get("output")?)?,
        status,
        error: row.try_get("error")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        started_at: opt_from_micros(row.try_get("started_at")?)?,
        completed_at: opt_from_micros(row.try_get("completed_at")?)?,
        latency_ms: row.try_get("latency_ms")?,
    })
}

fn task_status(row: &SqliteRow) -> Result<TaskStatus, StoreError> {
    let status: String = row.try_get("status")?;
    match TaskStatus::parse(&status) {
        Some(status) => Ok(status),
        None => corrupt("task status", &status),
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        created_by: row.try_get("created_by")?,
        tenant_id: row.try_get("tenant_id")?,
        title: row.try_get("title")?,
        goal: row.try_get("goal")?,
        status: task_status(row)?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<Step, StoreError> {
    let input: String = row.try_get("input")?;
    let step_order: i64 = row.try_get("step_order")?;
    Ok(Step {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        step_order: u32::try_from(step_order)
            .or_else(|_| corrupt("step order", &step_order.to_string()))?,
        tool_name: row.try_get("tool_name")?,
        input: serde_json::from_str(&input)?,
        requires_approval: row.try_get("requires_approval")?,
        status: task_status(row)?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO copilot_sessions (id, user_id, tenant_id, locale, status, created_at, last_message_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.tenant_id)
        .bind(&session.locale)
        .bind(session.status.as_str())
        .bind(micros(session.created_at))
        .bind(micros(session.last_message_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        sqlx::query("SELECT * FROM copilot_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE copilot_sessions SET locale = ?, status = ?, last_message_at = ? WHERE id = ?",
        )
        .bind(&session.locale)
        .bind(session.status.as_str())
        .bind(micros(session.last_message_at))
        .bind(&session.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(format!("session {}", session.id)));
        }
        Ok(())
    }

    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        sqlx::query(
            "SELECT * FROM copilot_sessions WHERE user_id = ? ORDER BY last_message_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(session_from_row)
        .collect()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO copilot_messages (id, session_id, role, content, tool_name, tool_input, tool_output, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.tool_name)
        .bind(opt_to_json(&message.tool_input)?)
        .bind(opt_to_json(&message.tool_output)?)
        .bind(micros(message.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        sqlx::query(
            "SELECT * FROM copilot_messages WHERE session_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(message_from_row)
        .collect()
    }

    async fn all_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        sqlx::query("SELECT * FROM copilot_messages WHERE session_id = ? ORDER BY created_at ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(message_from_row)
            .collect()
    }

    async fn latest_created_at(
        &self,
        session_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM copilot_messages WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        opt_from_micros(latest)
    }
}

#[async_trait]
impl ToolRunStore for SqliteStore {
    async fn insert_tool_run(&self, run: &ToolRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO copilot_tool_runs (id, session_id, message_id, task_id, step_id, tool_name, input, output,
                                            status, error, created_at, started_at, completed_at, latency_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.session_id)
        .bind(&run.message_id)
        .bind(&run.task_id)
        .bind(&run.step_id)
        .bind(&run.tool_name)
        .bind(to_json(&run.input)?)
        .bind(opt_to_json(&run.output)?)
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(micros(run.created_at))
        .bind(run.started_at.map(micros))
        .bind(run.completed_at.map(micros))
        .bind(run.latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition_tool_run(
        &self,
        run: &ToolRun,
        expected: ToolRunStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE copilot_tool_runs
             SET output = ?, status = ?, error = ?, started_at = ?, completed_at = ?, latency_ms = ?
             WHERE id = ? AND status = ?",
        )
        .bind(opt_to_json(&run.output)?)
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(run.started_at.map(micros))
        .bind(run.completed_at.map(micros))
        .bind(run.latency_ms)
        .bind(&run.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return match self.get_tool_run(&run.id).await? {
                Some(_) => Ok(false),
                None => Err(StoreError::Missing(format!("tool run {}", run.id))),
            };
        }
        Ok(true)
    }

    async fn get_tool_run(&self, id: &str) -> Result<Option<ToolRun>, StoreError> {
        sqlx::query("SELECT * FROM copilot_tool_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(tool_run_from_row)
            .transpose()
    }

    async fn list_tool_runs_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolRun>, StoreError> {
        sqlx::query("SELECT * FROM copilot_tool_runs WHERE session_id = ? ORDER BY created_at ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(tool_run_from_row)
            .collect()
    }

    async fn list_tool_runs_for_task(&self, task_id: &str) -> Result<Vec<ToolRun>, StoreError> {
        sqlx::query("SELECT * FROM copilot_tool_runs WHERE task_id = ? ORDER BY created_at ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(tool_run_from_row)
            .collect()
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task, steps: &[Step]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO copilot_tasks (id, session_id, created_by, tenant_id, title, goal, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.session_id)
        .bind(&task.created_by)
        .bind(&task.tenant_id)
        .bind(&task.title)
        .bind(&task.goal)
        .bind(task.status.as_str())
        .bind(micros(task.created_at))
        .bind(micros(task.updated_at))
        .execute(&mut *tx)
        .await?;

        for step in steps {
            sqlx::query(
                "INSERT INTO copilot_task_steps (id, task_id, step_order, tool_name, input, requires_approval,
                                                 status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id)
            .bind(&step.task_id)
            .bind(i64::from(step.step_order))
            .bind(&step.tool_name)
            .bind(to_json(&step.input)?)
            .bind(step.requires_approval)
            .bind(step.status.as_str())
            .bind(micros(step.created_at))
            .bind(micros(step.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        sqlx::query("SELECT * FROM copilot_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }

    async fn get_steps(&self, task_id: &str) -> Result<Vec<Step>, StoreError> {
        sqlx::query("SELECT * FROM copilot_task_steps WHERE task_id = ? ORDER BY step_order ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(step_from_row)
            .collect()
    }

    async fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>, StoreError> {
        sqlx::query("SELECT * FROM copilot_tasks WHERE session_id = ? ORDER BY created_at ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: TaskStatus,
        next: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE copilot_tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(micros(at))
        .bind(task_id)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM copilot_tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::Missing(format!("task {task_id}"))),
            };
        }

        sqlx::query("UPDATE copilot_task_steps SET status = ?, updated_at = ? WHERE task_id = ?")
            .bind(next.as_str())
            .bind(micros(at))
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}
