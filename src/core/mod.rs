//! 核心编排层：错误类型、轮次编排器与组装

pub mod builder;
pub mod error;
pub mod orchestrator;

pub use builder::{create_engine_from_config, Copilot, CopilotBuilder, Stores};
pub use error::{CopilotError, FieldViolation};
pub use orchestrator::{
    OrchestratorSettings, TurnOrchestrator, TurnOutcome, TurnReply, TurnRequest,
};
