//! Planner：决策与 Tool Call 解析
//!
//! 执行循环只依赖 `Decider`：给定上下文、Step 日志与需求提示，返回"调用某个工具"或"最终回答（流式）"。
//! `Planner` 是基于 LLM 的实现：流式读取模型输出，前瞻窗口内出现 `{` 或 `` ` `` 时收集全文按 JSON Tool Call 解析
//! （允许 `Sure. {"tool": ...}` 这类带前言的调用），否则直接把流交给执行循环作为最终回答。parse_llm_output 从文本中提取 JSON 并解析为 ToolCall 或直接回复。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::run::{Step, StepOutcome, StepTarget};
use crate::core::AgentError;
use crate::llm::{LlmClient, TokenStream};
use crate::memory::Message;
use crate::tools::{tool_call_schema_json, ToolRegistry};

/// 判定 Tool Call 的前瞻字符数；超过后仍无 `{` 或 `` ` `` 即开始流式输出最终回答
const TOOL_CALL_LOOKAHEAD: usize = 160;

/// 模型用来表示最终回答的保留工具名（`{"tool": "final_answer", "args": {"text": "..."}}`）
pub const FINAL_ANSWER_TOOL: &str = "final_answer";

/// LLM 返回的 Tool Call（简化 JSON：{"tool": "PolicyAgent", "args": {"task": "..."}}）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Planner 输出
#[derive(Debug, Clone)]
pub enum PlannerOutput {
    /// 直接回复用户
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

/// 解析 LLM 输出：若含有效 JSON 且 tool 非空则为 ToolCall，否则为 Response
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();

    // 尝试提取 JSON 块（```json ... ``` 或纯 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let parsed: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    if parsed.tool.is_empty() {
        Ok(PlannerOutput::Response(trimmed.to_string()))
    } else {
        Ok(PlannerOutput::ToolCall(parsed))
    }
}

/// 一次决策所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    /// 会话历史 + 本轮用户消息 + 纠正提示
    pub messages: &'a [Message],
    pub steps: &'a [Step],
    pub hints: &'a [String],
    /// 当前可被接受的工具
    pub allowed: &'a [String],
    pub final_answer_allowed: bool,
}

/// 模型的决策
pub enum Decision {
    Invoke { target: String, input: Value },
    /// 最终回答的文本流（可能含引用标记）
    FinalAnswer(TokenStream),
}

impl Decision {
    /// 单块的最终回答
    pub fn final_text(text: impl Into<String>) -> Self {
        Decision::FinalAnswer(Box::pin(stream::iter(vec![Ok(text.into())])))
    }

    pub fn target(&self) -> StepTarget {
        match self {
            Decision::Invoke { target, .. } => StepTarget::Tool(target.clone()),
            Decision::FinalAnswer(_) => StepTarget::FinalAnswer,
        }
    }
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Invoke { target, input } => f
                .debug_struct("Invoke")
                .field("target", target)
                .field("input", input)
                .finish(),
            Decision::FinalAnswer(_) => f.write_str("FinalAnswer(..)"),
        }
    }
}

/// 模型决策的抽象，执行循环只通过它与模型交互
#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, AgentError>;
}

/// Planner：持有 LLM、基础指令与工具说明
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    instructions: String,
    tools_json: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, instructions: impl Into<String>, registry: &ToolRegistry) -> Self {
        Self {
            llm,
            instructions: instructions.into(),
            tools_json: registry.to_schema_json(),
        }
    }

    /// 拼接 system prompt：指令、工具、输出格式、需求与已执行的 Step
    pub fn system_prompt(&self, request: &DecisionRequest<'_>) -> String {
        let mut prompt = format!(
            "{}\n\n## Tools\n{}\n\n## How to respond\n\
             To call a tool, output exactly one JSON object and nothing else: {{\"tool\": \"<name>\", \"args\": {{...}}}}\n\
             Tool call schema:\n{}\n\
             To answer the user, output the answer as plain text, not JSON. \
             Cite sources inline as [n] or [title](url).\n",
            self.instructions,
            self.tools_json,
            tool_call_schema_json()
        );

        if !request.hints.is_empty() {
            prompt.push_str("\n## Requirements\n");
            for hint in request.hints {
                prompt.push_str("- ");
                prompt.push_str(hint);
                prompt.push('\n');
            }
        }
        prompt.push_str(&format!(
            "\nAllowed next tools: {}\nFinal answer allowed now: {}\n",
            if request.allowed.is_empty() {
                "(none)".to_string()
            } else {
                request.allowed.join(", ")
            },
            if request.final_answer_allowed { "yes" } else { "no" }
        ));

        if !request.steps.is_empty() {
            prompt.push_str("\n## Steps so far\n");
            for step in request.steps {
                let outcome = match &step.outcome {
                    StepOutcome::Output(out) => out.clone(),
                    StepOutcome::Error(e) => format!("error ({}): {}", e.kind, e.message),
                };
                prompt.push_str(&format!(
                    "{}. {} {} -> {}\n",
                    step.ordinal,
                    step.target.name(),
                    step.input,
                    outcome
                ));
            }
        }
        prompt
    }
}

fn tool_call_to_decision(call: ToolCall) -> Decision {
    if call.tool == FINAL_ANSWER_TOOL {
        let text = match &call.args {
            Value::String(s) => s.clone(),
            other => other
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        };
        return Decision::final_text(text);
    }
    Decision::Invoke {
        target: call.tool,
        input: call.args,
    }
}

#[async_trait]
impl Decider for Planner {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, AgentError> {
        let mut full_messages = vec![Message::system(self.system_prompt(&request))];
        full_messages.extend(request.messages.iter().cloned());

        let mut tokens = self
            .llm
            .complete_stream(&full_messages)
            .await
            .map_err(AgentError::LlmError)?;

        // 在前瞻窗口内出现 `{` 或 `` ` `` 时整段收集按 Tool Call 解析，否则作为最终回答流式交出
        let mut head = String::new();
        let structured = loop {
            match tokens.next().await {
                Some(Ok(chunk)) => {
                    head.push_str(&chunk);
                    if head.contains(|c: char| c == '{' || c == '`') {
                        break true;
                    }
                    if head.trim_start().chars().count() >= TOOL_CALL_LOOKAHEAD {
                        break false;
                    }
                }
                Some(Err(e)) => return Err(AgentError::LlmError(e)),
                None => break false,
            }
        };

        if !structured {
            let head = head.trim_start().to_string();
            if head.is_empty() {
                return Err(AgentError::LlmError("model returned an empty response".to_string()));
            }
            return Ok(Decision::FinalAnswer(Box::pin(stream::iter(vec![Ok(head)]).chain(tokens))));
        }

        let mut raw = head;
        while let Some(chunk) = tokens.next().await {
            raw.push_str(&chunk.map_err(AgentError::LlmError)?);
        }
        let leading = raw.trim_start().starts_with(|c: char| c == '{' || c == '`');
        match parse_llm_output(&raw) {
            Ok(PlannerOutput::ToolCall(call)) => Ok(tool_call_to_decision(call)),
            Ok(PlannerOutput::Response(text)) => Ok(Decision::final_text(text)),
            Err(e) if leading => Err(e),
            // 正文中夹带的花括号不是 Tool Call
            Err(_) => Ok(Decision::final_text(raw.trim())),
        }
    }
}
