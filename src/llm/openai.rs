//! OpenAI 兼容推理引擎
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。工具声明以 JSON 拼入 system prompt，
//! 当前轮已执行的工具结果以 system 消息追加在历史之后，模型输出交给 parse_engine_output 解析。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::parse::{parse_engine_output, tool_call_schema_json};
use crate::llm::{EngineReply, EngineRequest, LlmError, ReasoningEngine, TurnRole};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct OpenAiEngine {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiEngine {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    fn system_prompt(request: &EngineRequest) -> String {
        let mut prompt = request.system.clone().unwrap_or_default();
        if let Some(locale) = &request.locale {
            prompt.push_str(&format!("\n\nReply in the user's locale: {locale}."));
        }
        let tools = serde_json::to_string_pretty(&request.tools).unwrap_or_else(|_| "[]".to_string());
        prompt.push_str("\n\nAvailable tools:\n");
        prompt.push_str(&tools);
        prompt.push_str(
            "\n\nTo call a tool, reply with exactly one JSON object and nothing else, matching this schema:\n",
        );
        prompt.push_str(&tool_call_schema_json());
        prompt.push_str("\nOtherwise reply with plain text.");
        prompt
    }

    fn to_openai_messages(
        request: &EngineRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let api = |e: async_openai::error::OpenAIError| LlmError::Api(e.to_string());
        let mut messages = Vec::with_capacity(request.history.len() + request.tool_results.len() + 1);

        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(Self::system_prompt(request))
                .build()
                .map_err(api)?,
        ));

        for turn in &request.history {
            let message = match turn.role {
                TurnRole::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(turn.text.clone())
                        .build()
                        .map_err(api)?,
                ),
                TurnRole::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.text.clone())
                        .build()
                        .map_err(api)?,
                ),
            };
            messages.push(message);
        }

        for result in &request.tool_results {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(format!(
                        "Result of tool {} with args {}: {}",
                        result.tool_name, result.arguments, result.output
                    ))
                    .build()
                    .map_err(api)?,
            ));
        }

        Ok(messages)
    }
}

#[async_trait]
impl ReasoningEngine for OpenAiEngine {
    async fn respond(&self, request: &EngineRequest) -> Result<EngineReply, LlmError> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_openai_messages(request)?)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::MalformedResponse("empty choices".to_string()))?;

        parse_engine_output(&content)
    }
}
