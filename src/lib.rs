//! Survey Copilot - HR 调研平台的对话式工具编排核心
//!
//! 模块划分：
//! - **approval**: Task / Step 审批状态机与审批服务
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、轮次编排器、组件组装
//! - **ledger**: 工具调用台账（ToolRun）
//! - **llm**: 推理引擎抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 按会话追加的消息日志与上下文窗口
//! - **session**: 会话的恢复与新建
//! - **store**: 持久化边界（内存 / SQLite）
//! - **tools**: 工具注册表、参数校验、审批策略、执行器与调研工具

pub mod approval;
pub mod config;
pub mod core;
pub mod ledger;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod session;
pub mod store;
pub mod tools;

pub use crate::core::{Copilot, CopilotBuilder, CopilotError, TurnOutcome, TurnReply, TurnRequest};
