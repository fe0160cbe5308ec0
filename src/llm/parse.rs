//! 解析文本型引擎输出
//!
//! 纯聊天端点没有原生 tool call 时，约定模型输出 `{"tool": "...", "args": {...}}`（可包在 ```json 代码块里）；
//! 不含 JSON 的输出视为直接回复；以 `{` 开头或提到 `"tool"` 却解析失败的输出视为 MalformedResponse。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::llm::{EngineReply, LlmError};

/// 工具调用格式（仅用于 Schema 生成与解析）
#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 list_surveys、close_survey
    tool: String,
    /// 工具参数，按工具声明的 schema 填写
    #[serde(default)]
    args: HashMap<String, Value>,
}

/// 工具调用格式的 JSON Schema，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 解析模型输出：含合法 JSON 且 tool 非空则为工具调用，否则为文本回复
pub fn parse_engine_output(output: &str) -> Result<EngineReply, LlmError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let Some(start) = trimmed
        .find('{')
        .filter(|&i| i == 0 || trimmed.contains("\"tool\""))
    {
        // 截断的输出可能没有结尾的 }
        let end = trimmed[start..]
            .rfind('}')
            .map_or(trimmed.len(), |e| start + e + 1);
        &trimmed[start..end]
    } else {
        return Ok(EngineReply::text(trimmed));
    };

    let parsed: Value = serde_json::from_str(json_str)
        .map_err(|e| LlmError::MalformedResponse(format!("{e}: {json_str}")))?;
    let Some(tool) = parsed.get("tool").and_then(Value::as_str) else {
        return Ok(EngineReply::text(trimmed));
    };
    if tool.is_empty() {
        return Ok(EngineReply::text(trimmed));
    }
    let arguments = parsed.get("args").cloned().unwrap_or(Value::Null);
    Ok(EngineReply::tool_call(tool, arguments))
}
