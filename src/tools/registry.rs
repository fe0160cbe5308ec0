//! 工具注册表
//!
//! 所有工具（只读查询与变更操作）实现同一个 Tool trait：name / description / Input 类型 / execute。
//! 注册时由 Input 生成 schema 并编译校验器；按名查找 + 全量校验后才会执行，同名重复注册返回 RegistryConflict。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::{CopilotError, FieldViolation};
use crate::tools::schema::{input_schema_for, InputValidator};

/// 调用方身份，供工具后端按调用者 / 租户限定数据范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub caller_id: String,
    pub tenant_id: Option<String>,
    pub session_id: String,
}

/// 工具 trait：Input 即入参 schema 的来源，execute 只会收到校验通过的强类型入参
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Input: DeserializeOwned + Serialize + JsonSchema + Send + Sync + 'static;

    /// 工具名称（推理引擎调用时使用）
    fn name(&self) -> &str;

    /// 工具描述（供推理引擎理解功能）
    fn description(&self) -> &str;

    async fn execute(&self, ctx: &ToolContext, input: Self::Input) -> Result<Value, String>;
}

/// 发给推理引擎的工具声明
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 校验通过的调用；arguments 为强类型入参重新序列化后的规范形式
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall {
    pub tool_name: String,
    pub arguments: Value,
}

#[async_trait]
trait RegisteredTool: Send + Sync {
    fn declaration(&self) -> &ToolDeclaration;

    fn validate(&self, raw: &Value) -> Result<Value, Vec<FieldViolation>>;

    async fn invoke(&self, ctx: &ToolContext, arguments: Value) -> Result<Value, String>;
}

struct SchemaBound<T: Tool> {
    tool: T,
    declaration: ToolDeclaration,
    validator: InputValidator,
}

impl<T: Tool> SchemaBound<T> {
    fn parse(&self, raw: &Value) -> Result<T::Input, Vec<FieldViolation>> {
        // 无参工具常收到 null
        let normalized = if raw.is_null() {
            Value::Object(Default::default())
        } else {
            raw.clone()
        };
        let violations = self.validator.violations(&normalized);
        if !violations.is_empty() {
            return Err(violations);
        }
        serde_json::from_value(normalized).map_err(|e| {
            vec![FieldViolation {
                path: "$".to_string(),
                message: e.to_string(),
            }]
        })
    }
}

#[async_trait]
impl<T: Tool> RegisteredTool for SchemaBound<T> {
    fn declaration(&self) -> &ToolDeclaration {
        &self.declaration
    }

    fn validate(&self, raw: &Value) -> Result<Value, Vec<FieldViolation>> {
        let input = self.parse(raw)?;
        serde_json::to_value(&input).map_err(|e| {
            vec![FieldViolation {
                path: "$".to_string(),
                message: e.to_string(),
            }]
        })
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: Value) -> Result<Value, String> {
        let input = self.parse(&arguments).map_err(|violations| {
            violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        })?;
        self.tool.execute(ctx, input).await
    }
}

/// 工具注册表：按名称存储已绑定 schema 的工具
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool>(&mut self, tool: T) -> Result<(), CopilotError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(CopilotError::RegistryConflict(name));
        }
        let input_schema = input_schema_for::<T::Input>();
        let validator = InputValidator::new(&input_schema)
            .map_err(|e| CopilotError::Config(format!("invalid input schema for {name}: {e}")))?;
        let declaration = ToolDeclaration {
            name: name.clone(),
            description: tool.description().to_string(),
            input_schema,
        };
        self.tools.insert(
            name,
            Arc::new(SchemaBound {
                tool,
                declaration,
                validator,
            }),
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn declaration(&self, name: &str) -> Option<ToolDeclaration> {
        self.tools.get(name).map(|t| t.declaration().clone())
    }

    /// 全部工具声明，按名称排序
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> = self
            .tools
            .values()
            .map(|t| t.declaration().clone())
            .collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    /// 按声明的 schema 校验推理引擎给出的原始参数
    pub fn validate(&self, name: &str, raw: &Value) -> Result<ValidatedCall, CopilotError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| CopilotError::UnknownTool(name.to_string()))?;
        let arguments = tool
            .validate(raw)
            .map_err(|violations| CopilotError::SchemaViolation {
                tool: name.to_string(),
                violations,
            })?;
        Ok(ValidatedCall {
            tool_name: name.to_string(),
            arguments,
        })
    }

    pub async fn invoke(&self, ctx: &ToolContext, call: &ValidatedCall) -> Result<Value, String> {
        let tool = self
            .tools
            .get(&call.tool_name)
            .ok_or_else(|| format!("Unknown tool: {}", call.tool_name))?;
        tool.invoke(ctx, call.arguments.clone()).await
    }

    /// 工具声明的 JSON 文本，用于拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.declarations()).unwrap_or_else(|_| "[]".to_string())
    }
}
