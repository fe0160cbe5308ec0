pub mod executor;
pub mod policy;
pub mod registry;
pub mod schema;
pub mod survey;

pub use executor::{ToolExecutor, ToolFailure};
pub use policy::{ApprovalPolicy, ExecutionMode, DEFAULT_GATED_TOOLS};
pub use registry::{Tool, ToolContext, ToolDeclaration, ToolRegistry, ValidatedCall};
pub use schema::{input_schema_for, InputValidator};
pub use survey::{register_survey_tools, InMemorySurveyBackend, SurveyBackend, SurveyStage, SurveySummary};
