//! Think 工具：让模型在行动前写下计划，不产生外部副作用

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::Tool;

/// think 的参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ThinkInput {
    /// 当前的推理与计划
    pub thoughts: String,
    /// 打算接下来调用的工具（可选）
    #[serde(default)]
    pub next_step: Vec<String>,
}

pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Use when you want to think through a problem, clarify your assumptions, or plan the next steps before acting."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(ThinkInput)).unwrap_or_else(|_| serde_json::json!({}))
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let input: ThinkInput =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidInput(e.to_string()))?;
        if input.thoughts.trim().is_empty() {
            return Err(ToolError::InvalidInput("thoughts must not be empty".to_string()));
        }
        Ok("OK".to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_think_requires_thoughts() {
        let err = ThinkTool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
        let err = ThinkTool.execute(json!({"thoughts": "  "})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_think_acknowledges() {
        let out = ThinkTool
            .execute(json!({"thoughts": "ask PolicyAgent first", "next_step": ["PolicyAgent"]}))
            .await
            .unwrap();
        assert_eq!(out, "OK");
    }

    #[test]
    fn test_think_schema_lists_thoughts() {
        let schema = ThinkTool.parameters_schema().to_string();
        assert!(schema.contains("thoughts"));
    }
}
