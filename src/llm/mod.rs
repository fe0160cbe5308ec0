//! 推理引擎层：引擎抽象与实现（OpenAI 兼容 / Mock / Scripted）

pub mod mock;
pub mod openai;
pub mod parse;
pub mod traits;

pub use mock::{MockEngine, ScriptedEngine};
pub use openai::{OpenAiEngine, TokenUsage};
pub use parse::{parse_engine_output, tool_call_schema_json};
pub use traits::{
    EngineReply, EngineRequest, EngineTurn, LlmError, ReasoningEngine, ToolResultTurn, TurnRole,
};
