//! 需求约束下的执行循环
//!
//! Decide -> Validate (RequirementSet) -> Execute (Tool) -> Commit Step -> 下一轮 Decide；
//! 提议被拒绝或模型出错时通过 RecoveryEngine 追加纠正提示重试，单步重试与总步数都有上限。
//! 最终回答以流的形式经过引用解析后推送给调用方。

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::citation::{Citation, CitationParser};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::TokenStream;
use crate::react::{
    Decider, Decision, DecisionRequest, RequirementSet, Run, RunState, Step, StepError, StepOutcome, StepTarget,
    TrajectoryEmitter, Violation,
};
use crate::tools::ToolExecutor;

/// 单轮的步数、重试与超时上限
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// 最多提交的 Step 数（含最终回答）
    pub max_iterations: usize,
    /// 同一步内最多被拒绝的次数，超过则中止
    pub max_retries_per_step: u32,
    /// 单次模型决策 / 单个工具调用 / 两个回答分块之间的最长等待
    pub step_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_retries_per_step: 2,
            step_timeout: Duration::from_secs(60),
        }
    }
}

/// 一轮成功结束的结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// 去除引用标记后的回答
    pub answer: String,
    pub citations: Vec<Citation>,
    pub steps: Vec<Step>,
    /// 本轮累计被拒绝的提议数
    pub rejections: u32,
}

/// 执行循环所需的协作者
pub struct TurnSession<'a> {
    pub decider: &'a dyn Decider,
    pub executor: &'a ToolExecutor,
    pub requirements: &'a RequirementSet,
    pub recovery: &'a RecoveryEngine,
    pub emitter: &'a TrajectoryEmitter,
    pub limits: ExecutionLimits,
    pub cancel_token: CancellationToken,
}

impl<'a> TurnSession<'a> {
    pub fn new(
        decider: &'a dyn Decider,
        executor: &'a ToolExecutor,
        requirements: &'a RequirementSet,
        recovery: &'a RecoveryEngine,
        emitter: &'a TrajectoryEmitter,
    ) -> Self {
        Self {
            decider,
            executor,
            requirements,
            recovery,
            emitter,
            limits: ExecutionLimits::default(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// 取消令牌被触发或事件接收端已断开
    fn cancelled(&self) -> bool {
        self.cancel_token.is_cancelled() || self.emitter.is_closed()
    }

    /// 交给 RecoveryEngine；重试则把纠正提示写入 Run，超过单步重试上限时中止
    fn recover(&self, run: &mut Run, err: AgentError) -> Result<(), AgentError> {
        match self.recovery.handle(&err) {
            RecoveryAction::Abort => Err(err),
            RecoveryAction::RetryWithPrompt(prompt) => {
                let ordinal = run.next_ordinal();
                let retries = run.reject(prompt);
                if retries > self.limits.max_retries_per_step {
                    return Err(AgentError::RetryBudgetExceeded {
                        ordinal,
                        retries,
                        last: err.to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// 最终回答流的失败：是否已经有内容推送给调用方
struct StreamFailure {
    error: AgentError,
    partial: bool,
}

/// 运行一轮直到最终回答或中止；出错时 Run 处于 Aborted
pub async fn run_turn_loop(session: &TurnSession<'_>, run: &mut Run) -> Result<TurnOutcome, AgentError> {
    match turn_loop_impl(session, run).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            run.transition(RunState::Aborted);
            Err(e)
        }
    }
}

async fn turn_loop_impl(session: &TurnSession<'_>, run: &mut Run) -> Result<TurnOutcome, AgentError> {
    let tool_names = session.executor.tool_names();
    let limits = &session.limits;
    let run_id = run.id.clone();

    loop {
        if session.cancelled() {
            return Err(AgentError::Cancelled);
        }
        if run.steps().len() >= limits.max_iterations {
            return Err(AgentError::IterationBudgetExceeded(run.steps().len()));
        }

        run.transition(RunState::AwaitingModelDecision);
        let ordinal = run.next_ordinal();
        let hints = session.requirements.hints(run.steps());
        let allowed = session.requirements.allowed_targets(run.steps(), &tool_names);
        let final_answer_allowed = session.requirements.final_answer_allowed(run.steps());
        let request = DecisionRequest {
            messages: run.messages(),
            steps: run.steps(),
            hints: &hints,
            allowed: &allowed,
            final_answer_allowed,
        };

        let decided = match tokio::time::timeout(limits.step_timeout, session.decider.decide(request)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(format!(
                "model decision exceeded {}s",
                limits.step_timeout.as_secs()
            ))),
        };
        let decision = match decided {
            Ok(d) => d,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(run = %run_id, ordinal, error = %e, "model decision failed");
                session.emitter.retry(ordinal, &e.to_string());
                session.recover(run, e)?;
                continue;
            }
        };

        if session.cancelled() {
            return Err(AgentError::Cancelled);
        }

        run.transition(RunState::ValidatingRequirement);
        let target = decision.target();
        let mut violations = session.requirements.validate(&target, run.steps());
        if let StepTarget::Tool(name) = &target {
            if !session.executor.contains(name) {
                violations.push(Violation::UnknownTarget { target: name.clone() });
            }
        }

        if !violations.is_empty() {
            let blocked = violations.iter().any(|v| v.blocks_final_answer());
            if blocked {
                run.transition(RunState::Blocked);
                // 剩余步数已不足以补齐下限并给出回答
                let needed = session.requirements.missing_invocations(run.steps()) + 1;
                if run.steps().len() + needed > limits.max_iterations {
                    return Err(AgentError::IterationBudgetExceeded(run.steps().len()));
                }
            } else {
                run.transition(RunState::Rejected);
            }
            let reason = violations.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; ");
            tracing::debug!(run = %run_id, ordinal, target = target.name(), %reason, "proposal rejected");
            session.emitter.rejection(ordinal, &reason);
            session.recover(run, AgentError::RequirementViolation(reason))?;
            continue;
        }

        match decision {
            Decision::Invoke { target, input } => {
                run.transition(RunState::Executing);
                let result = session.executor.execute(&target, input.clone()).await;
                if session.cancelled() {
                    // 调用已完成，但结果不再进入 Step 日志
                    return Err(AgentError::Cancelled);
                }
                let outcome = match result {
                    Ok(out) => StepOutcome::Output(out),
                    Err(e) => StepOutcome::Error(StepError::from(&e)),
                };
                let step = run.commit(StepTarget::Tool(target), input, outcome);
                tracing::info!(
                    run = %run_id,
                    ordinal = step.ordinal,
                    target = step.target.name(),
                    errored = step.outcome.is_error(),
                    "step committed"
                );
                session.emitter.step(step);
                if run.steps().len() >= limits.max_iterations {
                    return Err(AgentError::IterationBudgetExceeded(run.steps().len()));
                }
            }
            Decision::FinalAnswer(tokens) => match stream_final_answer(session, tokens).await {
                Ok((answer, citations)) => {
                    run.commit(StepTarget::FinalAnswer, Value::Null, StepOutcome::Output(answer.clone()));
                    run.transition(RunState::FinalAnswer);
                    tracing::info!(run = %run_id, steps = run.steps().len(), citations = citations.len(), "final answer");
                    return Ok(TurnOutcome {
                        answer,
                        citations,
                        steps: run.steps().to_vec(),
                        rejections: run.rejections(),
                    });
                }
                Err(StreamFailure { error, partial }) => {
                    if partial || error.is_fatal() {
                        return Err(error);
                    }
                    session.emitter.retry(ordinal, &error.to_string());
                    session.recover(run, error)?;
                }
            },
        }
    }
}

/// 将回答流经过引用解析后逐段推送；返回干净文本与全部引用
async fn stream_final_answer(
    session: &TurnSession<'_>,
    mut tokens: TokenStream,
) -> Result<(String, Vec<Citation>), StreamFailure> {
    let mut parser = CitationParser::new();
    let mut answer = String::new();

    loop {
        let partial = !answer.is_empty() || !parser.citations().is_empty();
        if session.cancelled() {
            return Err(StreamFailure {
                error: AgentError::Cancelled,
                partial,
            });
        }
        let chunk = match tokio::time::timeout(session.limits.step_timeout, tokens.next()).await {
            Err(_) => {
                return Err(StreamFailure {
                    error: AgentError::Timeout("final answer stream stalled".to_string()),
                    partial,
                })
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                return Err(StreamFailure {
                    error: AgentError::LlmError(e),
                    partial,
                })
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        let (text, citations) = parser.process_chunk(&chunk);
        answer.push_str(&text);
        session.emitter.text(text);
        session.emitter.citations(citations);
    }

    let tail = parser.finalize();
    answer.push_str(&tail);
    session.emitter.text(tail);

    if answer.trim().is_empty() {
        return Err(StreamFailure {
            error: AgentError::LlmError("model returned an empty answer".to_string()),
            partial: false,
        });
    }
    Ok((answer, parser.into_citations()))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::react::{Requirement, TurnEvent};
    use crate::tools::{ThinkTool, ToolRegistry};

    /// 直接按脚本返回决策，并记录每次收到的 allowed / final_answer_allowed
    struct ScriptedDecider {
        script: Mutex<VecDeque<Result<Decision, AgentError>>>,
        seen_allowed: Mutex<Vec<(Vec<String>, bool)>>,
    }

    impl ScriptedDecider {
        fn new(script: Vec<Result<Decision, AgentError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen_allowed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Decider for ScriptedDecider {
        async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, AgentError> {
            self.seen_allowed
                .lock()
                .unwrap()
                .push((request.allowed.to_vec(), request.final_answer_allowed));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Decision::final_text("fallback")))
        }
    }

    fn think() -> Result<Decision, AgentError> {
        Ok(Decision::Invoke {
            target: "think".to_string(),
            input: json!({"thoughts": "plan"}),
        })
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(ThinkTool);
        ToolExecutor::new(registry, Duration::from_secs(5))
    }

    async fn run_with(
        decider: &ScriptedDecider,
        requirements: RequirementSet,
        limits: ExecutionLimits,
    ) -> (Result<TurnOutcome, AgentError>, Run, Vec<TurnEvent>) {
        let executor = executor();
        let recovery = RecoveryEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx);
        let session =
            TurnSession::new(decider, &executor, &requirements, &recovery, &emitter).with_limits(limits);
        let mut run = Run::new("s", Vec::new(), "hello");
        let result = run_turn_loop(&session, &mut run).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (result, run, events)
    }

    #[tokio::test]
    async fn test_forced_step_rejects_then_accepts() {
        let decider = ScriptedDecider::new(vec![Ok(Decision::final_text("too early")), think(), Ok(Decision::final_text("Done."))]);
        let set = RequirementSet::new(vec![Requirement::new("think").at_step(1)]);
        let (result, run, _) = run_with(&decider, set, ExecutionLimits::default()).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.answer, "Done.");
        assert_eq!(outcome.rejections, 1);
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps[0].target.is_tool("think"));
        assert_eq!(run.state(), RunState::FinalAnswer);

        let seen = decider.seen_allowed.lock().unwrap();
        assert_eq!(seen[0], (vec!["think".to_string()], false));
    }

    #[tokio::test]
    async fn test_search_at_first_position_is_rejected_for_think() {
        struct SearchStub;

        #[async_trait]
        impl crate::tools::Tool for SearchStub {
            fn name(&self) -> &str {
                "search"
            }
            fn description(&self) -> &str {
                "Search the web"
            }
            async fn execute(&self, _args: Value) -> Result<String, crate::core::ToolError> {
                Ok("results".to_string())
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(ThinkTool);
        registry.register(SearchStub);
        let executor = ToolExecutor::new(registry, Duration::from_secs(5));
        let decider = ScriptedDecider::new(vec![
            Ok(Decision::Invoke {
                target: "search".to_string(),
                input: json!({"query": "pt coverage"}),
            }),
            think(),
            Ok(Decision::final_text("ok")),
        ]);
        let requirements = RequirementSet::new(vec![Requirement::new("think").at_step(1)]);
        let recovery = RecoveryEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx);
        let session = TurnSession::new(&decider, &executor, &requirements, &recovery, &emitter);
        let mut run = Run::new("s", Vec::new(), "hello");

        let outcome = run_turn_loop(&session, &mut run).await.unwrap();
        assert_eq!(outcome.rejections, 1);
        assert_eq!(outcome.steps[0].ordinal, 1);
        assert!(outcome.steps[0].target.is_tool("think"));
        let seen = decider.seen_allowed.lock().unwrap();
        assert_eq!(seen[0].0, vec!["think".to_string()]);
        assert_eq!(seen[2].0, vec!["search".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_budget_aborts() {
        let decider = ScriptedDecider::new(vec![
            Ok(Decision::final_text("a")),
            Ok(Decision::final_text("b")),
            Ok(Decision::final_text("c")),
        ]);
        let set = RequirementSet::new(vec![Requirement::new("think").at_step(1)]);
        let (result, run, _) = run_with(&decider, set, ExecutionLimits::default()).await;

        match result.unwrap_err() {
            AgentError::RetryBudgetExceeded { ordinal, retries, .. } => {
                assert_eq!(ordinal, 1);
                assert_eq!(retries, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(run.state(), RunState::Aborted);
        assert!(run.steps().is_empty());
    }

    #[tokio::test]
    async fn test_iteration_budget_counts_committed_steps() {
        let decider = ScriptedDecider::new(vec![think(), think(), think(), think()]);
        let limits = ExecutionLimits {
            max_iterations: 3,
            ..ExecutionLimits::default()
        };
        let (result, run, _) = run_with(&decider, RequirementSet::default(), limits).await;
        assert!(matches!(result, Err(AgentError::IterationBudgetExceeded(3))));
        assert_eq!(run.steps().len(), 3);
    }

    #[tokio::test]
    async fn test_budget_wins_when_min_cannot_be_met() {
        let decider = ScriptedDecider::new(vec![think(), Ok(Decision::final_text("done"))]);
        let set = RequirementSet::new(vec![Requirement::new("think").at_least(2)]);
        let limits = ExecutionLimits {
            max_iterations: 2,
            ..ExecutionLimits::default()
        };
        let (result, _, _) = run_with(&decider, set, limits).await;
        assert!(matches!(result, Err(AgentError::IterationBudgetExceeded(1))));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let decider = ScriptedDecider::new(vec![
            Ok(Decision::Invoke {
                target: "nope".to_string(),
                input: Value::Null,
            }),
            Ok(Decision::final_text("ok")),
        ]);
        let (result, _, events) = run_with(&decider, RequirementSet::default(), ExecutionLimits::default()).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.rejections, 1);
        assert_eq!(outcome.steps.len(), 1);
        assert!(events.iter().any(|e| matches!(e,
            TurnEvent::Trajectory(t) if t.title == "Requirement not met"
                && t.content.contains("'nope'")
                && t.step == Some(1))));
    }

    #[tokio::test]
    async fn test_tool_error_is_recorded_on_step() {
        let decider = ScriptedDecider::new(vec![
            Ok(Decision::Invoke {
                target: "think".to_string(),
                input: json!({"thoughts": ""}),
            }),
            Ok(Decision::final_text("recovered")),
        ]);
        let (result, _, events) = run_with(&decider, RequirementSet::default(), ExecutionLimits::default()).await;
        let outcome = result.unwrap();
        assert!(outcome.steps[0].outcome.is_error());
        assert_eq!(outcome.rejections, 0);
        assert!(events.iter().any(|e| matches!(e,
            TurnEvent::Trajectory(t) if t.title == "think (error)" && t.step == Some(1))));
    }

    #[tokio::test]
    async fn test_model_error_is_retried() {
        let decider = ScriptedDecider::new(vec![
            Err(AgentError::LlmError("503".to_string())),
            Err(AgentError::JsonParseError("{".to_string())),
            Ok(Decision::final_text("fine")),
        ]);
        let (result, run, _) = run_with(&decider, RequirementSet::default(), ExecutionLimits::default()).await;
        assert_eq!(result.unwrap().answer, "fine");
        assert_eq!(run.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_partial_stream_failure_aborts() {
        let stream: TokenStream = Box::pin(futures_util::stream::iter(vec![
            Ok("Half an ans".to_string()),
            Err("connection reset".to_string()),
        ]));
        let decider = ScriptedDecider::new(vec![Ok(Decision::FinalAnswer(stream))]);
        let (result, _, events) = run_with(&decider, RequirementSet::default(), ExecutionLimits::default()).await;
        assert!(matches!(result, Err(AgentError::LlmError(_))));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::TextDelta { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let decider = ScriptedDecider::new(vec![think()]);
        let executor = executor();
        let recovery = RecoveryEngine::new();
        let requirements = RequirementSet::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let emitter = TrajectoryEmitter::new(tx);
        let token = CancellationToken::new();
        token.cancel();
        let session =
            TurnSession::new(&decider, &executor, &requirements, &recovery, &emitter).with_cancel_token(token);
        let mut run = Run::new("s", Vec::new(), "hello");
        assert!(matches!(run_turn_loop(&session, &mut run).await, Err(AgentError::Cancelled)));
        assert!(decider.seen_allowed.lock().unwrap().is_empty());
    }
}
