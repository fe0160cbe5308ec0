//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute 在超时内调用已校验的工具；每次调用输出结构化审计日志（JSON）。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{ToolContext, ToolRegistry, ValidatedCall};

/// 工具执行失败：工具自身返回的领域错误，或超时
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    Failed(String),
    TimedOut { tool: String, after: Duration },
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolFailure::Failed(e) => f.write_str(e),
            ToolFailure::TimedOut { tool, after } => {
                write!(f, "tool {tool} timed out after {}s", after.as_secs())
            }
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行已校验的调用；超时返回 TimedOut，工具返回 Err 则为 Failed
    pub async fn execute(&self, ctx: &ToolContext, call: &ValidatedCall) -> Result<Value, ToolFailure> {
        let start = Instant::now();
        let result = timeout(self.timeout, self.registry.invoke(ctx, call)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool_name,
            "session_id": ctx.session_id,
            "caller_id": ctx.caller_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ToolFailure::Failed(e)),
            Err(_) => Err(ToolFailure::TimedOut {
                tool: call.tool_name.clone(),
                after: self.timeout,
            }),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
