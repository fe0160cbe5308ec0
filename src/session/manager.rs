//! 会话管理器
//!
//! resume_or_create：请求的会话存在、归属调用者且仍为 active 时恢复，否则静默新建。
//! 归属不符会记录一条 warn 级安全事件，但不会让本轮失败。

use std::sync::Arc;

use chrono::Utc;

use super::{Session, SessionId, SessionStatus};
use crate::core::CopilotError;
use crate::store::SessionStore;

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    default_locale: String,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, default_locale: impl Into<String>) -> Self {
        Self {
            store,
            default_locale: default_locale.into(),
        }
    }

    /// 恢复或新建会话，返回最终使用的会话 ID
    pub async fn resume_or_create(
        &self,
        caller_id: &str,
        tenant_id: Option<&str>,
        locale: Option<&str>,
        requested: Option<&str>,
    ) -> Result<SessionId, CopilotError> {
        if let Some(requested) = requested {
            match self.store.get_session(requested).await? {
                Some(mut session)
                    if session.is_owned_by(caller_id) && session.status == SessionStatus::Active =>
                {
                    if let Some(locale) = locale {
                        if session.locale != locale {
                            session.locale = locale.to_string();
                            self.store.update_session(&session).await?;
                        }
                    }
                    tracing::debug!(session_id = %session.id, "Resumed session");
                    return Ok(session.id);
                }
                Some(session) if !session.is_owned_by(caller_id) => {
                    tracing::warn!(
                        event = "session_ownership_mismatch",
                        requested_session = %requested,
                        caller_id = %caller_id,
                        "Requested session belongs to another user, starting a new one"
                    );
                }
                Some(_) => {
                    tracing::info!(requested_session = %requested, "Requested session is closed, starting a new one");
                }
                None => {
                    tracing::info!(requested_session = %requested, "Requested session not found, starting a new one");
                }
            }
        }

        let session = Session::new(
            caller_id,
            tenant_id,
            locale.unwrap_or(&self.default_locale),
        );
        self.store.insert_session(&session).await?;
        tracing::info!(session_id = %session.id, caller_id = %caller_id, "Created session");
        Ok(session.id)
    }

    /// 推进 last_message_at（单调不减）
    pub async fn touch(&self, session_id: &str) -> Result<(), CopilotError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CopilotError::NotFound(format!("session {session_id}")))?;
        let now = Utc::now();
        if now > session.last_message_at {
            session.last_message_at = now;
        }
        self.store.update_session(&session).await?;
        Ok(())
    }

    /// 仅返回调用者本人的会话；他人的会话视同不存在
    pub async fn get_for_caller(
        &self,
        caller_id: &str,
        session_id: &str,
    ) -> Result<Session, CopilotError> {
        self.store
            .get_session(session_id)
            .await?
            .filter(|s| s.is_owned_by(caller_id))
            .ok_or_else(|| CopilotError::NotFound(format!("session {session_id}")))
    }

    pub async fn list_for_caller(&self, caller_id: &str) -> Result<Vec<Session>, CopilotError> {
        Ok(self.store.list_sessions_for_user(caller_id).await?)
    }

    /// 关闭会话；之后以该 ID 恢复会得到新会话
    pub async fn close(&self, caller_id: &str, session_id: &str) -> Result<Session, CopilotError> {
        let mut session = self.get_for_caller(caller_id, session_id).await?;
        if session.status != SessionStatus::Closed {
            session.status = SessionStatus::Closed;
            self.store.update_session(&session).await?;
            tracing::info!(session_id = %session_id, "Closed session");
        }
        Ok(session)
    }
}
