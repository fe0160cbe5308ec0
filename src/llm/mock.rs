//! 无需 API 的推理引擎
//!
//! MockEngine：本地试跑用，`/tool <name> <json>` 转为工具调用，其余原样回显；
//! 若本轮已有工具结果，则把最后一个结果总结为文本。
//! ScriptedEngine：测试用，按队列依次返回预设回复并记录收到的请求。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::llm::{EngineReply, EngineRequest, LlmError, ReasoningEngine, TurnRole};

#[derive(Debug, Default)]
pub struct MockEngine;

#[async_trait]
impl ReasoningEngine for MockEngine {
    async fn respond(&self, request: &EngineRequest) -> Result<EngineReply, LlmError> {
        if let Some(result) = request.tool_results.last() {
            return Ok(EngineReply::text(format!(
                "{} returned: {}",
                result.tool_name, result.output
            )));
        }

        let last_user = request
            .history
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.text.trim())
            .unwrap_or("(no input)");

        if let Some(rest) = last_user.strip_prefix("/tool ") {
            let (name, args) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            let arguments = if args.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(args.trim())
                    .map_err(|e| LlmError::MalformedResponse(e.to_string()))?
            };
            return Ok(EngineReply::tool_call(name, arguments));
        }

        Ok(EngineReply::text(format!("Echo from Mock: {last_user}")))
    }
}

/// 预设回复队列；耗尽后返回 Api 错误
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    replies: Mutex<VecDeque<Result<EngineReply, LlmError>>>,
    requests: Mutex<Vec<EngineRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedEngine {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<EngineReply, LlmError>>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    /// 每次回复前等待一段时间（用于超时测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Mutex::new(Some(delay));
        self
    }

    /// 运行中调整延迟，None 为立即回复
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().await = delay;
    }

    /// 追加一条回复到队尾
    pub async fn push(&self, reply: Result<EngineReply, LlmError>) {
        self.replies.lock().await.push_back(reply);
    }

    /// 迄今收到的全部请求
    pub async fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    async fn respond(&self, request: &EngineRequest) -> Result<EngineReply, LlmError> {
        self.requests.lock().await.push(request.clone());
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Api("script exhausted".to_string())))
    }
}
