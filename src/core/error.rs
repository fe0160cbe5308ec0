//! 核心错误类型
//!
//! 与对话轮次 / 审批流程配合：SchemaViolation 与 UnknownTool 被编排器转为助手可见的错误回复，
//! UpstreamUnavailable 转为「请重试」回复；Persistence 必须向上抛出，绝不吞掉。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;
use crate::tools::ToolFailure;

/// 单个字段的校验失败（path 为 `$` 开头的 JSON 路径）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 编排核心可能出现的错误（校验、注册、上游、状态机、持久化）
#[derive(Error, Debug)]
pub enum CopilotError {
    /// 工具参数未通过 schema 校验，列出所有违规字段
    #[error("Schema violation for tool '{tool}': {}", join_violations(.violations))]
    SchemaViolation {
        tool: String,
        violations: Vec<FieldViolation>,
    },

    /// 推理引擎请求了未注册的工具
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 重复注册同名工具（启动期致命）
    #[error("Tool already registered: {0}")]
    RegistryConflict(String),

    /// 推理引擎或工具后端超时 / 不可达
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// 工具自身返回的领域错误（如调研已关闭）
    #[error("Tool failed: {0}")]
    ToolFailed(String),

    #[error("Invalid transition: {from} --{event}-->")]
    InvalidTransition { from: String, event: String },

    /// 审批动作与任务当前状态冲突
    #[error("State conflict: task {task_id} is {status}")]
    StateConflict { task_id: String, status: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),
}

impl CopilotError {
    /// 是否应以助手回复的形式反馈给调用方（而不是让整轮失败）
    pub fn is_conversational(&self) -> bool {
        matches!(
            self,
            CopilotError::SchemaViolation { .. } | CopilotError::UnknownTool(_)
        )
    }
}

impl From<ToolFailure> for CopilotError {
    fn from(failure: ToolFailure) -> Self {
        match failure {
            ToolFailure::Failed(e) => CopilotError::ToolFailed(e),
            timed_out @ ToolFailure::TimedOut { .. } => {
                CopilotError::UpstreamUnavailable(timed_out.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_violation_lists_every_field() {
        let err = CopilotError::SchemaViolation {
            tool: "close_survey".to_string(),
            violations: vec![
                FieldViolation {
                    path: "$".to_string(),
                    message: "\"surveyId\" is a required property".to_string(),
                },
                FieldViolation {
                    path: "$.reason".to_string(),
                    message: "42 is not of type \"string\"".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("surveyId"));
        assert!(text.contains("$.reason"));
        assert!(err.is_conversational());
    }

    #[test]
    fn test_persistence_is_not_conversational() {
        let err = CopilotError::from(StoreError::Backend("disk full".to_string()));
        assert!(!err.is_conversational());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_tool_timeout_is_upstream_unavailable() {
        let err = CopilotError::from(ToolFailure::TimedOut {
            tool: "list_surveys".to_string(),
            after: std::time::Duration::from_secs(30),
        });
        assert!(matches!(err, CopilotError::UpstreamUnavailable(_)));
        assert_eq!(
            err.to_string(),
            "Upstream unavailable: tool list_surveys timed out after 30s"
        );

        let err = CopilotError::from(ToolFailure::Failed("survey srv_q1 is already closed".to_string()));
        assert!(matches!(err, CopilotError::ToolFailed(_)));
        assert!(!err.is_conversational());
    }
}
