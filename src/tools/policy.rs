//! 审批策略：静态表决定工具是直接执行还是需要人工审批
//!
//! 凡是改变其他用户 / 租户可见的共享状态、对外发送通知、或触发不可逆外部流程的工具都走审批。

use std::collections::HashSet;

/// 会被审批闸门拦截的默认工具
pub const DEFAULT_GATED_TOOLS: &[&str] = &[
    "send_invitations",
    "send_reminders",
    "close_survey",
    "change_survey_stage",
    "trigger_report_generation",
    "assign_survey_to_company",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// 只读或低风险，本轮内同步执行
    Direct,
    /// 先建 Task/Step，等外部确认后再执行
    Gated,
}

#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    gated: HashSet<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_GATED_TOOLS.iter().copied())
    }
}

impl ApprovalPolicy {
    pub fn new<I, S>(gated: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            gated: gated.into_iter().map(Into::into).collect(),
        }
    }

    /// 在现有表上追加需要审批的工具名
    pub fn with_gated<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gated.extend(extra.into_iter().map(Into::into));
        self
    }

    pub fn mode(&self, tool_name: &str) -> ExecutionMode {
        if self.gated.contains(tool_name) {
            ExecutionMode::Gated
        } else {
            ExecutionMode::Direct
        }
    }

    pub fn requires_approval(&self, tool_name: &str) -> bool {
        self.mode(tool_name) == ExecutionMode::Gated
    }
}
