//! Trajectory：把 Step 日志翻译成用户可读的进度事件
//!
//! 事件按 Step 顺序发出；发送失败（接收端已关闭）直接忽略，不影响执行。

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::events::{TrajectoryEvent, TurnEvent, TurnStatus};
use super::run::{Step, StepOutcome, StepTarget};
use crate::citation::Citation;

pub const TRUNCATION_MARKER: &str = "... [truncated]";
pub const DEFAULT_CONTENT_CAP: usize = 400;
pub const DEFAULT_THINKING_CAP: usize = 200;

/// 超过 cap 个字符时截断并追加标记
pub fn truncate_chars(text: &str, cap: usize) -> String {
    match text.char_indices().nth(cap) {
        Some((idx, _)) => format!("{}{}", &text[..idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// 将工具输入 / 输出压缩为展示用文本：字符串原样，其他值序列化为 JSON
pub fn summarize_for_trajectory(value: &Value, cap: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    truncate_chars(&text, cap)
}

pub struct TrajectoryEmitter {
    tx: UnboundedSender<TurnEvent>,
    content_cap: usize,
    thinking_cap: usize,
    last_step: AtomicUsize,
}

impl TrajectoryEmitter {
    pub fn new(tx: UnboundedSender<TurnEvent>) -> Self {
        Self {
            tx,
            content_cap: DEFAULT_CONTENT_CAP,
            thinking_cap: DEFAULT_THINKING_CAP,
            last_step: AtomicUsize::new(0),
        }
    }

    pub fn with_caps(mut self, content_cap: usize, thinking_cap: usize) -> Self {
        self.content_cap = content_cap;
        self.thinking_cap = thinking_cap;
        self
    }

    /// 接收端已断开（视为取消）
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, ev: TurnEvent) {
        let _ = self.tx.send(ev);
    }

    fn trajectory(&self, title: impl Into<String>, content: impl Into<String>, step: Option<usize>) {
        self.send(TurnEvent::Trajectory(TrajectoryEvent {
            title: title.into(),
            content: content.into(),
            step,
        }));
    }

    pub fn started(&self, agent_name: &str) {
        self.trajectory("Initializing Agent...", format!("Setting up {agent_name}."), None);
    }

    /// 已提交 Step 的事件；think 显示为 Thinking（失败时另加 error），其他工具显示 request 与 response / error
    pub fn step(&self, step: &Step) {
        let prev = self.last_step.swap(step.ordinal, Ordering::SeqCst);
        if step.ordinal <= prev {
            tracing::warn!(ordinal = step.ordinal, prev, "trajectory step emitted out of order");
        }
        let StepTarget::Tool(name) = &step.target else {
            return;
        };
        let ordinal = Some(step.ordinal);

        if name == "think" {
            let thoughts = step.input.get("thoughts").cloned().unwrap_or_else(|| step.input.clone());
            self.trajectory("Thinking", summarize_for_trajectory(&thoughts, self.thinking_cap), ordinal);
            if let StepOutcome::Error(e) = &step.outcome {
                self.trajectory("think (error)", truncate_chars(&e.message, self.content_cap), ordinal);
            }
            return;
        }

        self.trajectory(
            format!("{name} (request)"),
            summarize_for_trajectory(&step.input, self.content_cap),
            ordinal,
        );
        match &step.outcome {
            StepOutcome::Output(out) => self.trajectory(
                format!("{name} (response)"),
                truncate_chars(out, self.content_cap),
                ordinal,
            ),
            StepOutcome::Error(e) => self.trajectory(
                format!("{name} (error)"),
                truncate_chars(&e.message, self.content_cap),
                ordinal,
            ),
        }
    }

    pub fn rejection(&self, ordinal: usize, reason: &str) {
        self.trajectory(
            "Requirement not met",
            truncate_chars(&format!("Proposal for step {ordinal} rejected: {reason}"), self.content_cap),
            Some(ordinal),
        );
    }

    pub fn retry(&self, ordinal: usize, reason: &str) {
        self.trajectory(
            "LLM Error",
            truncate_chars(&format!("Retrying step {ordinal}: {reason}"), self.content_cap),
            Some(ordinal),
        );
    }

    pub fn text(&self, text: String) {
        if !text.is_empty() {
            self.send(TurnEvent::TextDelta { text });
        }
    }

    pub fn citations(&self, citations: Vec<Citation>) {
        if !citations.is_empty() {
            self.send(TurnEvent::Citations { citations });
        }
    }

    pub fn complete(&self, steps: usize, citations: usize) {
        self.trajectory(
            "Complete",
            format!("Finished after {steps} step(s) with {citations} citation(s)."),
            None,
        );
        self.send(TurnEvent::Status {
            status: TurnStatus::Success { steps, citations },
        });
    }

    pub fn aborted(&self, reason: &str) {
        self.trajectory("Error", truncate_chars(reason, self.content_cap), None);
        self.send(TurnEvent::Status {
            status: TurnStatus::Aborted {
                reason: reason.to_string(),
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::react::run::StepError;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TurnEvent>) -> Vec<TrajectoryEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let TurnEvent::Trajectory(t) = ev {
                out.push(t);
            }
        }
        out
    }

    #[test]
    fn test_truncate_appends_marker_only_when_needed() {
        assert_eq!(truncate_chars("short", 400), "short");
        let long = "x".repeat(450);
        let out = truncate_chars(&long, 400);
        assert_eq!(out.chars().count(), 400 + TRUNCATION_MARKER.chars().count());
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(truncate_chars("héllo", 2), format!("hé{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_summarize_non_string_as_json() {
        assert_eq!(summarize_for_trajectory(&json!({"task": "a"}), 400), r#"{"task":"a"}"#);
        assert_eq!(summarize_for_trajectory(&json!("plain"), 400), "plain");
    }

    #[test]
    fn test_tool_step_emits_request_and_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx);
        emitter.step(&Step {
            ordinal: 1,
            target: StepTarget::Tool("PolicyAgent".to_string()),
            input: json!({"task": "coverage?"}),
            outcome: StepOutcome::Error(StepError {
                kind: "remote_unreachable".to_string(),
                message: "PolicyAgent unreachable".to_string(),
            }),
            timestamp: Utc::now(),
        });
        let events = drain(&mut rx);
        let titles: Vec<&str> = events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["PolicyAgent (request)", "PolicyAgent (error)"]);
        assert_eq!(events[1].step, Some(1));
    }

    #[test]
    fn test_think_step_uses_thinking_cap() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx).with_caps(400, 10);
        emitter.step(&Step {
            ordinal: 1,
            target: StepTarget::Tool("think".to_string()),
            input: json!({"thoughts": "a very long line of reasoning"}),
            outcome: StepOutcome::Output("OK".to_string()),
            timestamp: Utc::now(),
        });
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Thinking");
        assert_eq!(events[0].content, format!("a very lon{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_failed_think_step_emits_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx).with_caps(12, 200);
        emitter.step(&Step {
            ordinal: 2,
            target: StepTarget::Tool("think".to_string()),
            input: json!({"thoughts": ""}),
            outcome: StepOutcome::Error(StepError {
                kind: "invalid_input".to_string(),
                message: "invalid input: thoughts must not be empty".to_string(),
            }),
            timestamp: Utc::now(),
        });
        let events = drain(&mut rx);
        let titles: Vec<&str> = events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Thinking", "think (error)"]);
        assert_eq!(events[1].content, format!("invalid inpu{TRUNCATION_MARKER}"));
        assert_eq!(events[1].step, Some(2));
    }

    #[test]
    fn test_rejection_and_retry_carry_ordinal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx);
        emitter.rejection(3, "step 3 must be 'think'");
        emitter.retry(4, "model timed out");
        let events = drain(&mut rx);
        assert_eq!(events[0].title, "Requirement not met");
        assert_eq!(events[0].step, Some(3));
        assert_eq!(events[1].title, "LLM Error");
        assert_eq!(events[1].step, Some(4));
    }

    #[test]
    fn test_send_after_receiver_dropped_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx);
        drop(rx);
        assert!(emitter.is_closed());
        emitter.text("ignored".to_string());
        emitter.aborted("gone");
    }
}
