//! 工具参数 Schema：schemars 生成，jsonschema 编译与校验
//!
//! 每个工具的 schema 在注册时编译一次；编译失败的工具不会进入注册表。

use jsonschema::Validator;
use schemars::JsonSchema;
use serde_json::Value;

/// 由 Rust 类型生成参数 JSON Schema
pub fn schema_of<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| Value::Object(Default::default()));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
    }
    value
}

/// 已编译的参数校验器
pub struct ArgumentSchema {
    validator: Validator,
}

impl ArgumentSchema {
    /// 编译 schema；不是合法 JSON Schema 时返回原因
    pub fn compile(schema: &Value) -> Result<Self, String> {
        jsonschema::validator_for(schema)
            .map(|validator| Self { validator })
            .map_err(|e| e.to_string())
    }

    /// 校验参数；失败时返回所有不符合项，以 "; " 连接
    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(arguments)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_schema() -> ArgumentSchema {
        ArgumentSchema::compile(&json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"},
                "mode": {"type": "string", "enum": ["fast", "exact"]}
            },
            "required": ["a", "b"],
            "additionalProperties": false
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_arguments_pass() {
        assert!(add_schema().validate(&json!({"a": 1, "b": 2.5})).is_ok());
        assert!(add_schema().validate(&json!({"a": 1, "b": 2, "mode": "fast"})).is_ok());
    }

    #[test]
    fn test_invalid_arguments_are_reported() {
        let schema = add_schema();
        let err = schema.validate(&json!({"a": 1})).unwrap_err();
        assert!(err.contains("\"b\""));
        assert!(schema.validate(&json!({"a": "1", "b": 2})).is_err());
        assert!(schema.validate(&json!({"a": 1, "b": 2, "c": 3})).is_err());
        assert!(schema.validate(&json!({"a": 1, "b": 2, "mode": "slow"})).is_err());
        assert!(schema.validate(&json!("not an object")).is_err());
    }

    #[test]
    fn test_bounds_and_patterns_are_enforced() {
        let range = ArgumentSchema::compile(&json!({"type": "integer", "minimum": 1, "maximum": 10}))
            .unwrap();
        assert!(range.validate(&json!(5)).is_ok());
        assert!(range.validate(&json!(999)).is_err());

        let name = ArgumentSchema::compile(&json!({
            "type": "string",
            "maxLength": 3,
            "pattern": "^[a-z]+$"
        }))
        .unwrap();
        assert!(name.validate(&json!("abc")).is_ok());
        assert!(name.validate(&json!("RM -RF /")).is_err());
    }

    #[test]
    fn test_nested_definitions_are_resolved() {
        #[derive(schemars::JsonSchema)]
        #[allow(dead_code)]
        struct Inner {
            count: u32,
        }

        #[derive(schemars::JsonSchema)]
        #[allow(dead_code)]
        struct Outer {
            inner: Inner,
        }

        let raw = schema_of::<Outer>();
        assert!(raw.to_string().contains("$ref"));
        let schema = ArgumentSchema::compile(&raw).unwrap();
        assert!(schema.validate(&json!({"inner": {"count": 2}})).is_ok());
        assert!(schema.validate(&json!({"inner": 12345})).is_err());
        assert!(schema.validate(&json!({"inner": {"count": -1}})).is_err());
    }

    #[test]
    fn test_invalid_schema_does_not_compile() {
        assert!(ArgumentSchema::compile(&json!({"type": "no-such-type"})).is_err());
        assert!(ArgumentSchema::compile(&json!({"minimum": "one"})).is_err());
    }

    #[test]
    fn test_schema_of_derives_required_fields() {
        #[derive(schemars::JsonSchema)]
        #[allow(dead_code)]
        struct Args {
            text: String,
        }
        let raw = schema_of::<Args>();
        assert_eq!(raw["type"], "object");
        assert_eq!(raw["required"], json!(["text"]));
        assert!(raw.get("$schema").is_none());
        let schema = ArgumentSchema::compile(&raw).unwrap();
        assert!(schema.validate(&json!({"text": "hi"})).is_ok());
        assert!(schema.validate(&json!({})).is_err());
    }
}
