//! 工具入参 JSON Schema：schemars 生成，jsonschema 校验
//!
//! 校验一次收集全部错误（而不是首个错误），每条错误带 `$` 开头的实例路径。

use jsonschema::Validator;
use schemars::{schema_for, JsonSchema};
use serde_json::Value;

use crate::core::FieldViolation;

/// 由 Rust 类型生成入参 schema（draft-07）
pub fn input_schema_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

/// 编译后的入参校验器
pub struct InputValidator {
    validator: Validator,
}

impl InputValidator {
    pub fn new(schema: &Value) -> Result<Self, String> {
        let validator = jsonschema::options()
            .build(schema)
            .map_err(|e| e.to_string())?;
        Ok(Self { validator })
    }

    /// 返回全部违规项；为空表示通过
    pub fn violations(&self, value: &Value) -> Vec<FieldViolation> {
        self.validator
            .iter_errors(value)
            .map(|error| FieldViolation {
                path: format_path(&error.instance_path.to_string()),
                message: error.to_string(),
            })
            .collect()
    }
}

/// JSON Pointer（`/ids/0`）转为 `$.ids[0]`
fn format_path(pointer: &str) -> String {
    let mut path = String::from("$");
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
            path.push('[');
            path.push_str(&segment);
            path.push(']');
        } else {
            path.push('.');
            path.push_str(&segment);
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    struct ReminderInput {
        survey_id: String,
        participant_ids: Option<Vec<String>>,
    }

    #[test]
    fn test_format_path() {
        assert_eq!(format_path(""), "$");
        assert_eq!(format_path("/surveyId"), "$.surveyId");
        assert_eq!(format_path("/participantIds/2"), "$.participantIds[2]");
        assert_eq!(format_path("/a~1b"), "$.a/b");
    }

    #[test]
    fn test_generated_schema_is_strict_object() {
        let schema = input_schema_for::<ReminderInput>();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"], json!(["surveyId"]));
    }

    #[test]
    fn test_collects_all_violations() {
        let validator = InputValidator::new(&input_schema_for::<ReminderInput>()).unwrap();
        assert!(validator.violations(&json!({"surveyId": "srv_1"})).is_empty());

        let violations = validator.violations(&json!({
            "participantIds": ["p1", 7],
            "extra": true
        }));
        assert_eq!(violations.len(), 3, "{violations:?}");
        assert!(violations.iter().any(|v| v.message.contains("surveyId")));
        assert!(violations.iter().any(|v| v.path == "$.participantIds[1]"));
        assert!(violations.iter().any(|v| v.message.contains("extra")));
    }
}
