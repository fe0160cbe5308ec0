//! 会话：按调用者 / 租户隔离、可恢复的多轮对话

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod manager;

pub use manager::SessionManager;

/// 会话 ID
pub type SessionId = String;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

/// 持久化的会话元数据；仅对 user_id 本人可见
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    /// 公司范围；跨租户调用者为 None
    pub tenant_id: Option<String>,
    pub locale: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: &str, tenant_id: Option<&str>, locale: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sess_{}", uuid::Uuid::new_v4()),
            user_id: user_id.to_string(),
            tenant_id: tenant_id.map(String::from),
            locale: locale.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_message_at: now,
        }
    }

    pub fn is_owned_by(&self, caller_id: &str) -> bool {
        self.user_id == caller_id
    }
}
