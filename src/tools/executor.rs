//! 工具执行器
//!
//! 持有 ToolRegistry 与单步超时，execute(tool_name, args) 在超时内调用 registry.execute；
//! 超时转为 ToolError::Timeout。每次调用输出结构化审计日志（JSON）。
//! 调用开始后不会被取消：Run 被取消时由执行循环丢弃结果。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::ToolError;
use crate::tools::{Tool, ToolRegistry};

/// args 预览最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// 工具执行器：对每次调用施加超时
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具；超时返回 ToolError::Timeout；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> Result<String, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(e)) => (false, e.kind()),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout(tool_name.to_string())),
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::tools::ThinkTool;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn executor(timeout_ms: u64) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(ThinkTool);
        registry.register(SlowTool);
        ToolExecutor::new(registry, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let out = executor(1000)
            .execute("think", json!({"thoughts": "plan first"}))
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let err = executor(1000).execute("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let err = executor(20).execute("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(name) if name == "slow"));
    }

    #[test]
    fn test_registry_keeps_order() {
        let names = executor(10).tool_names();
        assert_eq!(names, vec!["think".to_string(), "slow".to_string()]);
    }
}
