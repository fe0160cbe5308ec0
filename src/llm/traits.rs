//! 推理引擎抽象
//!
//! 请求 = 有序的 {role, text} 历史 + 当前轮已执行工具的结果 + 工具声明；
//! 回复 = 纯文本，或一次未经校验的工具调用（arguments 为任意 JSON）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Message, Role};
use crate::tools::ToolDeclaration;

/// 推理引擎错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// 历史中可回放的角色（tool 轮次不回放）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTurn {
    pub role: TurnRole,
    pub text: String,
}

impl EngineTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
        }
    }

    /// 从日志消息转换；tool 角色或无文本的消息返回 None
    pub fn from_message(message: &Message) -> Option<Self> {
        let text = message.content.clone()?;
        match message.role {
            Role::User => Some(Self::user(text)),
            Role::Assistant => Some(Self::assistant(text)),
            Role::Tool => None,
        }
    }
}

/// 当前轮内已执行的工具调用及结果（引擎自己的轮内协议状态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultTurn {
    pub tool_name: String,
    pub arguments: Value,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineRequest {
    pub system: Option<String>,
    pub locale: Option<String>,
    pub history: Vec<EngineTurn>,
    pub tool_results: Vec<ToolResultTurn>,
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineReply {
    Text { content: String },
    ToolCall { name: String, arguments: Value },
}

impl EngineReply {
    pub fn text(content: impl Into<String>) -> Self {
        EngineReply::Text {
            content: content.into(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        EngineReply::ToolCall {
            name: name.into(),
            arguments,
        }
    }
}

/// 推理引擎 trait：无状态，每轮都由调用方重建上下文
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn respond(&self, request: &EngineRequest) -> Result<EngineReply, LlmError>;
}
