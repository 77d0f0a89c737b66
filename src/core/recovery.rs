//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供执行循环决定是重新提示模型还是终止 Run。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（纠正提示 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        if err.is_fatal() {
            return RecoveryAction::Abort;
        }
        match err {
            AgentError::RequirementViolation(rule) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous proposal was rejected because a requirement was not met: {rule}. \
                 Choose a different next action that satisfies every requirement."
            )),
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output was not a valid tool call ({raw}). \
                 To call a tool, output exactly one JSON object: {{\"tool\": \"name\", \"args\": {{...}}}}. \
                 To answer the user, output plain text only."
            )),
            AgentError::Timeout(what) => RecoveryAction::RetryWithPrompt(format!(
                "The previous attempt timed out ({what}). Try again."
            )),
            AgentError::LlmError(msg) => RecoveryAction::RetryWithPrompt(format!(
                "The previous attempt failed ({msg}). Try again."
            )),
            _ => RecoveryAction::Abort,
        }
    }
}
