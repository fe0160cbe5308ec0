//! 消息日志：按会话追加写入的对话记录
//!
//! created_at 在会话内构成全序（同一时刻写入时顺延 1µs）；recent_window 先倒序取最近 limit 条再反转，
//! 保证有界窗口内的最大新近度。工具轮次只用于审计，不回放给推理引擎。

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CopilotError;
use crate::store::MessageStore;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// 单条已持久化消息（不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_output: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// 待写入的消息
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub session_id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_output: Option<Value>,
}

impl NewMessage {
    pub fn user(session_id: &str, content: impl Into<String>) -> Self {
        Self::text(session_id, Role::User, content.into())
    }

    pub fn assistant(session_id: &str, content: impl Into<String>) -> Self {
        Self::text(session_id, Role::Assistant, content.into())
    }

    pub fn tool(session_id: &str, tool_name: &str, input: Value, output: Value) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: Role::Tool,
            content: None,
            tool_name: Some(tool_name.to_string()),
            tool_input: Some(input),
            tool_output: Some(output),
        }
    }

    fn text(session_id: &str, role: Role, content: String) -> Self {
        Self {
            session_id: session_id.to_string(),
            role,
            content: Some(content),
            tool_name: None,
            tool_input: None,
            tool_output: None,
        }
    }
}

#[derive(Clone)]
pub struct MessageLog {
    store: Arc<dyn MessageStore>,
}

impl MessageLog {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// 追加一条消息，返回带 ID 与时间戳的记录
    pub async fn append(&self, new: NewMessage) -> Result<Message, CopilotError> {
        // 存储精度为微秒
        let mut created_at = Utc::now().trunc_subsecs(6);
        if let Some(last) = self.store.latest_created_at(&new.session_id).await? {
            if created_at <= last {
                created_at = last + Duration::microseconds(1);
            }
        }

        let message = Message {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            session_id: new.session_id,
            role: new.role,
            content: new.content,
            tool_name: new.tool_name,
            tool_input: new.tool_input,
            tool_output: new.tool_output,
            created_at,
        };
        self.store.insert_message(&message).await?;
        Ok(message)
    }

    /// 最近 limit 条消息，按时间正序（oldest → newest）
    pub async fn recent_window(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, CopilotError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut window = self.store.recent_messages(session_id, limit).await?;
        window.truncate(limit);
        window.reverse();
        Ok(window)
    }

    /// 回放给推理引擎的窗口：去掉 tool 角色
    pub async fn context_window(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, CopilotError> {
        let mut window = self.recent_window(session_id, limit).await?;
        window.retain(|m| m.role != Role::Tool);
        Ok(window)
    }

    /// 完整记录（含工具轮次），供展示
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, CopilotError> {
        Ok(self.store.all_messages(session_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn log() -> MessageLog {
        MessageLog::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_recent_window_keeps_newest_in_order() {
        let log = log();
        for i in 0..10 {
            log.append(NewMessage::user("s1", format!("m{i}")))
                .await
                .unwrap();
        }

        let window = log.recent_window("s1", 4).await.unwrap();
        let contents: Vec<_> = window
            .iter()
            .map(|m| m.content.clone().unwrap())
            .collect();
        assert_eq!(contents, vec!["m6", "m7", "m8", "m9"]);
        assert!(window.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[tokio::test]
    async fn test_recent_window_bounds() {
        let log = log();
        assert!(log.recent_window("s1", 5).await.unwrap().is_empty());

        log.append(NewMessage::user("s1", "hello")).await.unwrap();
        log.append(NewMessage::assistant("s1", "hi")).await.unwrap();
        assert_eq!(log.recent_window("s1", 5).await.unwrap().len(), 2);
        assert!(log.recent_window("s1", 0).await.unwrap().is_empty());
        assert!(log.recent_window("other", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_created_at_strictly_increases() {
        let log = log();
        let mut last = None;
        for _ in 0..50 {
            let m = log.append(NewMessage::user("s1", "x")).await.unwrap();
            if let Some(prev) = last {
                assert!(m.created_at > prev);
            }
            last = Some(m.created_at);
        }
    }

    #[tokio::test]
    async fn test_context_window_excludes_tool_turns() {
        let log = log();
        log.append(NewMessage::user("s1", "list surveys"))
            .await
            .unwrap();
        log.append(NewMessage::tool(
            "s1",
            "list_surveys",
            json!({}),
            json!({"surveys": []}),
        ))
        .await
        .unwrap();
        log.append(NewMessage::assistant("s1", "There are none."))
            .await
            .unwrap();

        let context = log.context_window("s1", 10).await.unwrap();
        assert_eq!(context.len(), 2);
        assert!(context.iter().all(|m| m.role != Role::Tool));

        let history = log.history("s1").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].tool_name.as_deref(), Some("list_surveys"));
    }
}
