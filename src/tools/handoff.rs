//! Handoff 工具：把子任务交给远程专家 Agent
//!
//! 输入 `{"task": "..."}`，将文本发往 RemoteAgent 并返回其文本回复。
//! 失败以 RemoteAgentError 返回（区分不可达/超时与对方报告的错误），由执行循环记录在 Step 上，
//! 模型可在下一轮决定重试、改写输入或改派其他 Agent。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::core::{RemoteAgentError, ToolError};
use crate::integrations::RemoteAgent;
use crate::tools::Tool;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HandoffInput {
    /// 交给专家 Agent 的完整任务描述（对方看不到本会话的历史）
    pub task: String,
}

/// 远程 Agent 的包装：名称即 Requirement 中引用的 step target
pub struct HandoffTool {
    name: String,
    description: String,
    agent: Arc<dyn RemoteAgent>,
    timeout: Duration,
}

impl HandoffTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        agent: Arc<dyn RemoteAgent>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            agent,
            timeout,
        }
    }

    /// 发送文本并等待回复，超时返回 RemoteAgentError::Timeout
    pub async fn invoke(&self, input_text: &str) -> Result<String, RemoteAgentError> {
        tracing::debug!(agent = %self.name, chars = input_text.chars().count(), "handoff");
        match tokio::time::timeout(self.timeout, self.agent.send(input_text)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteAgentError::Timeout {
                agent: self.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl Tool for HandoffTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(HandoffInput)).unwrap_or_else(|_| serde_json::json!({}))
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let task = match args {
            Value::String(s) => s,
            other => {
                serde_json::from_value::<HandoffInput>(other)
                    .map_err(|e| ToolError::InvalidInput(e.to_string()))?
                    .task
            }
        };
        if task.trim().is_empty() {
            return Err(ToolError::InvalidInput("task must not be empty".to_string()));
        }
        Ok(self.invoke(&task).await?)
    }
}
