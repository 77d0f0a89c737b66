//! Headless Concierge 运行时
//!
//! `Concierge` 持有共享组件（决策者、工具执行器、需求集合、会话存储），每次 `run_turn` 对单条用户输入
//! 跑一轮需求约束下的执行循环，并通过事件通道推送流式文本、Trajectory、引用与终态。
//! 同一会话的多轮串行执行；不同会话互不阻塞。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine};
use crate::integrations::A2aClient;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{LruSessionStore, Message, SessionStore};
use crate::react::trajectory::{DEFAULT_CONTENT_CAP, DEFAULT_THINKING_CAP};
use crate::react::{
    run_turn_loop, Decider, ExecutionLimits, Planner, RequirementSet, Run, TrajectoryEmitter, TurnEvent, TurnOutcome,
    TurnSession,
};
use crate::tools::{HandoffTool, ThinkTool, ToolExecutor, ToolRegistry};

/// 按 [llm] 段创建客户端；未配置或缺少 API Key 时返回 None
pub fn create_llm_from_config(cfg: &AppConfig) -> Option<Arc<dyn LlmClient>> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "openai" => {
            let api_key = cfg
                .llm
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
            if api_key.is_none() && cfg.llm.base_url.is_none() {
                tracing::warn!("No OPENAI_API_KEY and no base_url set, model is not configured");
                return None;
            }
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            let mut client = OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, api_key.as_deref());
            if let Some(t) = cfg.llm.temperature {
                client = client.with_temperature(t);
            }
            Some(Arc::new(client))
        }
        "mock" => {
            tracing::info!("Using Mock LLM");
            Some(Arc::new(MockLlmClient::default()))
        }
        other => {
            if !other.is_empty() && other != "none" {
                tracing::warn!(provider = other, "Unknown LLM provider, model is not configured");
            }
            None
        }
    }
}

/// 根据 [tools] 与 [[handoffs]] 注册 think 与各远程 Agent
pub fn build_tool_registry(cfg: &AppConfig) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    if cfg.tools.think {
        tools.register(ThinkTool);
    }
    for h in &cfg.handoffs {
        let timeout = Duration::from_secs(h.timeout_secs);
        let client = A2aClient::new(h.name.clone(), h.url.clone(), timeout);
        tools.register(HandoffTool::new(h.name.clone(), h.description.clone(), Arc::new(client), timeout));
    }
    tools
}

/// 一轮的句柄：事件接收端与取消令牌
pub struct TurnHandle {
    pub events: mpsc::UnboundedReceiver<TurnEvent>,
    pub cancel: CancellationToken,
}

impl TurnHandle {
    /// 读取全部事件直到本轮结束
    pub async fn collect(mut self) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.events.recv().await {
            out.push(ev);
        }
        out
    }
}

pub struct Concierge {
    name: String,
    decider: Option<Arc<dyn Decider>>,
    executor: ToolExecutor,
    requirements: RequirementSet,
    recovery: RecoveryEngine,
    store: Arc<dyn SessionStore>,
    limits: ExecutionLimits,
    content_cap: usize,
    thinking_cap: usize,
}

impl Concierge {
    pub fn builder() -> ConciergeBuilder {
        ConciergeBuilder::default()
    }

    /// 从配置构建：校验配置、注册工具、创建 LLM 与会话存储
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        cfg.validate()?;
        let mut builder = Concierge::builder()
            .name(cfg.app.name.clone())
            .tools(build_tool_registry(cfg))
            .requirements(cfg.requirement_set())
            .limits(cfg.execution.limits())
            .session_store(Arc::new(LruSessionStore::new(cfg.session.capacity)))
            .trajectory_caps(cfg.trajectory.content_cap, cfg.trajectory.thinking_cap);
        if let Some(llm) = create_llm_from_config(cfg) {
            builder = builder.llm(llm, cfg.app.instructions.clone());
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    /// 在后台任务中执行一轮，立即返回事件接收端
    pub fn run_turn(self: &Arc<Self>, session_key: impl Into<String>, user_text: impl Into<String>) -> TurnHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let key = session_key.into();
        let text = user_text.into();
        tokio::spawn(async move {
            let _ = this.handle_turn(&key, &text, tx, token).await;
        });
        TurnHandle { events: rx, cancel }
    }

    /// 在当前任务中执行一轮；事件写入 tx，终态事件之后返回
    pub async fn handle_turn(
        &self,
        session_key: &str,
        user_text: &str,
        tx: mpsc::UnboundedSender<TurnEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let emitter = TrajectoryEmitter::new(tx).with_caps(self.content_cap, self.thinking_cap);
        emitter.started(&self.name);

        let Some(decider) = self.decider.as_deref() else {
            let err = AgentError::MissingConfiguration("no language model is configured".to_string());
            tracing::warn!(session = session_key, error = %err, "turn aborted");
            emitter.aborted(&err.to_string());
            return Err(err);
        };

        // 同一会话的轮次串行，直到本轮写回历史
        let _lock = self.store.lock(session_key).await;
        let history = self.store.get(session_key).await;
        let mut run = Run::new(session_key, history, user_text);
        tracing::info!(session = session_key, run = %run.id, history = run.messages().len() - 1, "turn started");

        let session = TurnSession::new(decider, &self.executor, &self.requirements, &self.recovery, &emitter)
            .with_limits(self.limits.clone())
            .with_cancel_token(cancel);

        match run_turn_loop(&session, &mut run).await {
            Ok(outcome) => {
                self.store
                    .append_turn(
                        session_key,
                        vec![
                            Message::user(user_text),
                            Message::assistant(outcome.answer.clone()).with_citations(outcome.citations.clone()),
                        ],
                    )
                    .await;
                emitter.complete(outcome.steps.len(), outcome.citations.len());
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(session = session_key, run = %run.id, error = %e, "turn aborted");
                emitter.aborted(&e.to_string());
                Err(e)
            }
        }
    }
}

/// Concierge 构建器；未提供 decider 时若有 llm 则用 Planner
pub struct ConciergeBuilder {
    name: String,
    decider: Option<Arc<dyn Decider>>,
    llm: Option<(Arc<dyn LlmClient>, String)>,
    tools: ToolRegistry,
    requirements: RequirementSet,
    store: Option<Arc<dyn SessionStore>>,
    limits: ExecutionLimits,
    content_cap: usize,
    thinking_cap: usize,
}

impl Default for ConciergeBuilder {
    fn default() -> Self {
        Self {
            name: "Concierge".to_string(),
            decider: None,
            llm: None,
            tools: ToolRegistry::new(),
            requirements: RequirementSet::default(),
            store: None,
            limits: ExecutionLimits::default(),
            content_cap: DEFAULT_CONTENT_CAP,
            thinking_cap: DEFAULT_THINKING_CAP,
        }
    }
}

impl ConciergeBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>, instructions: impl Into<String>) -> Self {
        self.llm = Some((llm, instructions.into()));
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn requirements(mut self, requirements: RequirementSet) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn trajectory_caps(mut self, content_cap: usize, thinking_cap: usize) -> Self {
        self.content_cap = content_cap;
        self.thinking_cap = thinking_cap;
        self
    }

    /// 需求引用的目标必须已注册，预算必须为正
    pub fn build(self) -> Result<Concierge, AgentError> {
        if self.limits.max_iterations == 0 {
            return Err(AgentError::MissingConfiguration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        self.requirements
            .check(&self.tools.tool_names())
            .map_err(AgentError::MissingConfiguration)?;

        let decider = match (self.decider, self.llm) {
            (Some(d), _) => Some(d),
            (None, Some((llm, instructions))) => {
                Some(Arc::new(Planner::new(llm, instructions, &self.tools)) as Arc<dyn Decider>)
            }
            (None, None) => None,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(LruSessionStore::new(256)) as Arc<dyn SessionStore>);

        Ok(Concierge {
            name: self.name,
            decider,
            executor: ToolExecutor::new(self.tools, self.limits.step_timeout),
            requirements: self.requirements,
            recovery: RecoveryEngine::new(),
            store,
            limits: self.limits,
            content_cap: self.content_cap,
            thinking_cap: self.thinking_cap,
        })
    }
}
