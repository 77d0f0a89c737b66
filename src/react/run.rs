//! Run 与 Step：单轮执行的记录
//!
//! Step 只追加、不修改，ordinal 从 1 开始连续递增；被拒绝的提议不算 Step，只增加当前步的重试计数。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::memory::Message;

/// 提议或已执行的目标：某个工具，或最终回答
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum StepTarget {
    Tool(String),
    FinalAnswer,
}

impl StepTarget {
    pub fn name(&self) -> &str {
        match self {
            StepTarget::Tool(name) => name,
            StepTarget::FinalAnswer => "final_answer",
        }
    }

    pub fn is_tool(&self, name: &str) -> bool {
        matches!(self, StepTarget::Tool(n) if n == name)
    }
}

/// 记录在 Step 上的工具错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
}

impl From<&ToolError> for StepError {
    fn from(e: &ToolError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Output(String),
    Error(StepError),
}

impl StepOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, StepOutcome::Error(_))
    }
}

/// 一次被接受的决策
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub ordinal: usize,
    pub target: StepTarget,
    pub input: Value,
    pub outcome: StepOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Run 状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    AwaitingModelDecision,
    ValidatingRequirement,
    Executing,
    /// 提议最终回答但仍有未满足的 min_invocations
    Blocked,
    /// 提议的步骤违反了需求
    Rejected,
    FinalAnswer,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::FinalAnswer | RunState::Aborted)
    }
}

/// 一次用户消息对应的执行；只存在于本轮，结束后丢弃
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub session_key: String,
    steps: Vec<Step>,
    /// 发给模型的上下文：会话历史 + 本轮用户消息 + 纠正提示
    messages: Vec<Message>,
    /// 当前步已被拒绝的次数，Step 提交后清零
    retries: u32,
    /// 本轮累计被拒绝的次数
    rejections: u32,
    state: RunState,
}

impl Run {
    pub fn new(session_key: impl Into<String>, history: Vec<Message>, user_text: &str) -> Self {
        let mut messages = history;
        messages.push(Message::user(user_text));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.into(),
            steps: Vec::new(),
            messages,
            retries: 0,
            rejections: 0,
            state: RunState::AwaitingModelDecision,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn rejections(&self) -> u32 {
        self.rejections
    }

    pub fn next_ordinal(&self) -> usize {
        self.steps.len() + 1
    }

    pub fn transition(&mut self, state: RunState) {
        if self.state.is_terminal() {
            tracing::warn!(run = %self.id, from = ?self.state, to = ?state, "run already terminal");
            return;
        }
        tracing::trace!(run = %self.id, from = ?self.state, to = ?state, "run transition");
        self.state = state;
    }

    /// 追加一个 Step 并清零重试计数
    pub fn commit(&mut self, target: StepTarget, input: Value, outcome: StepOutcome) -> &Step {
        let step = Step {
            ordinal: self.next_ordinal(),
            target,
            input,
            outcome,
            timestamp: Utc::now(),
        };
        self.steps.push(step);
        self.retries = 0;
        &self.steps[self.steps.len() - 1]
    }

    /// 记录一次被拒绝的提议，把纠正提示追加到上下文；返回当前步的重试次数
    pub fn reject(&mut self, corrective: String) -> u32 {
        self.retries += 1;
        self.rejections += 1;
        self.messages.push(Message::user(corrective));
        self.retries
    }
}
