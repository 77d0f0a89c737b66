//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：单步内的错误（需求不满足、模型输出无法解析、模型超时）通过 RetryWithPrompt 重新提示；
//! 预算耗尽、缺失配置与取消则终止本轮 Run。

use thiserror::Error;

/// Run 过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 模型提议违反了某条 Requirement（可恢复：重新提示）
    #[error("Requirement violated: {0}")]
    RequirementViolation(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Retry budget exceeded at step {ordinal} after {retries} rejected attempts: {last}")]
    RetryBudgetExceeded {
        ordinal: usize,
        retries: u32,
        last: String,
    },

    #[error("Iteration budget exceeded: {0} steps committed without a final answer")]
    IterationBudgetExceeded(usize),

    #[error("Missing required configuration: {0}")]
    MissingConfiguration(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 是否终止整个 Run（其余错误在单步内通过重新提示或作为 Observation 交给模型处理）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::RetryBudgetExceeded { .. }
                | AgentError::IterationBudgetExceeded(_)
                | AgentError::MissingConfiguration(_)
                | AgentError::Cancelled
                | AgentError::ConfigError(_)
        )
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}

/// 远程专家 Agent 调用失败：区分「不可达 / 超时」与「对方报告的错误」
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteAgentError {
    #[error("agent '{agent}' unreachable: {reason}")]
    Unreachable { agent: String, reason: String },

    #[error("agent '{agent}' timed out after {timeout_ms}ms")]
    Timeout { agent: String, timeout_ms: u64 },

    #[error("agent '{agent}' reported an error: {reason}")]
    RemoteFailure { agent: String, reason: String },

    #[error("agent '{agent}' returned an unreadable response: {reason}")]
    InvalidResponse { agent: String, reason: String },
}

impl RemoteAgentError {
    /// 传输层失败（连接失败或超时），而非对方 Agent 自己报告的错误
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            RemoteAgentError::Unreachable { .. } | RemoteAgentError::Timeout { .. }
        )
    }

    pub fn agent(&self) -> &str {
        match self {
            RemoteAgentError::Unreachable { agent, .. }
            | RemoteAgentError::Timeout { agent, .. }
            | RemoteAgentError::RemoteFailure { agent, .. }
            | RemoteAgentError::InvalidResponse { agent, .. } => agent,
        }
    }
}

/// 工具执行错误：记录在 Step 上并作为 Observation 交给模型，不向调用方抛出
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Remote(#[from] RemoteAgentError),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool '{0}' timed out")]
    Timeout(String),
}

impl ToolError {
    /// 审计日志与轨迹事件中使用的简短分类
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidInput(_) => "invalid_input",
            ToolError::Remote(e) if e.is_unreachable() => "remote_unreachable",
            ToolError::Remote(_) => "remote_failure",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Timeout(_) => "timeout",
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让模型重新决策（计入当前步的重试次数）
    RetryWithPrompt(String),
    /// 终止当前 Run
    Abort,
}
