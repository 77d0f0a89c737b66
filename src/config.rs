//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONCIERGE__*` 覆盖（双下划线表示嵌套，如 `CONCIERGE__LLM__PROVIDER=openai`）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::AgentError;
use crate::react::{ExecutionLimits, Requirement, RequirementSet};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub session: SessionSection,
    pub execution: ExecutionSection,
    pub trajectory: TrajectorySection,
    pub tools: ToolsSection,
    /// [[requirements]]：对 Step 的约束
    pub requirements: Vec<Requirement>,
    /// [[handoffs]]：可转交的远程 Agent
    pub handoffs: Vec<HandoffSection>,
}

/// [app] 段：名称与基础指令
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub instructions: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "Concierge".to_string(),
            instructions: "You are a helpful concierge. Use the available tools when they help, \
                           then answer the user."
                .to_string(),
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（含兼容接口）/ mock；为空或 none 时不配置模型，每轮直接以缺失配置中止
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: None,
        }
    }
}

/// [session] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 同时保留的会话数上限，超出时淘汰最久未使用的会话
    pub capacity: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// [execution] 段：单轮的预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub max_iterations: usize,
    pub max_retries_per_step: u32,
    pub step_timeout_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        let limits = ExecutionLimits::default();
        Self {
            max_iterations: limits.max_iterations,
            max_retries_per_step: limits.max_retries_per_step,
            step_timeout_secs: limits.step_timeout.as_secs(),
        }
    }
}

impl ExecutionSection {
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_iterations: self.max_iterations,
            max_retries_per_step: self.max_retries_per_step,
            step_timeout: Duration::from_secs(self.step_timeout_secs),
        }
    }
}

/// [trajectory] 段：展示内容的字符上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrajectorySection {
    pub content_cap: usize,
    pub thinking_cap: usize,
}

impl Default for TrajectorySection {
    fn default() -> Self {
        Self {
            content_cap: crate::react::trajectory::DEFAULT_CONTENT_CAP,
            thinking_cap: crate::react::trajectory::DEFAULT_THINKING_CAP,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 是否注册 think 工具
    pub think: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { think: true }
    }
}

/// [[handoffs]] 项：A2A 远程 Agent
#[derive(Debug, Clone, Deserialize)]
pub struct HandoffSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    #[serde(default = "default_handoff_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_handoff_timeout_secs() -> u64 {
    60
}

impl AppConfig {
    /// 配置中可用的 Step 目标名（think 与各 handoff）
    pub fn step_targets(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.tools.think {
            names.push("think".to_string());
        }
        names.extend(self.handoffs.iter().map(|h| h.name.clone()));
        names
    }

    pub fn requirement_set(&self) -> RequirementSet {
        RequirementSet::new(self.requirements.clone())
    }

    /// 检查配置是否自洽；不满足时返回 MissingConfiguration
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.session.capacity == 0 {
            return Err(AgentError::MissingConfiguration(
                "session.capacity must be at least 1".to_string(),
            ));
        }
        if self.execution.max_iterations == 0 {
            return Err(AgentError::MissingConfiguration(
                "execution.max_iterations must be at least 1".to_string(),
            ));
        }
        let targets = self.step_targets();
        for (i, name) in targets.iter().enumerate() {
            if targets[..i].contains(name) {
                return Err(AgentError::MissingConfiguration(format!(
                    "step target '{name}' is defined more than once"
                )));
            }
        }
        for h in &self.handoffs {
            if h.url.trim().is_empty() {
                return Err(AgentError::MissingConfiguration(format!(
                    "handoff '{}' has no url",
                    h.name
                )));
            }
        }
        self.requirement_set()
            .check(&targets)
            .map_err(AgentError::MissingConfiguration)
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix("CONCIERGE")
        .separator("__")
        .try_parsing(true)
}

/// 从 config 目录加载配置，环境变量 CONCIERGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONCIERGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder.add_source(env_source()).build()?.try_deserialize()
}

/// 只读取指定文件（与环境变量），不叠加默认配置
pub fn load_config_file(path: &Path) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .add_source(env_source())
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::react::StepPredicate;

    fn write_toml(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.capacity, 256);
        assert_eq!(cfg.execution.max_iterations, 20);
        assert_eq!(cfg.execution.max_retries_per_step, 2);
        assert_eq!(cfg.trajectory.content_cap, 400);
        assert_eq!(cfg.trajectory.thinking_cap, 200);
        assert_eq!(cfg.step_targets(), vec!["think"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_requirements_and_handoffs() {
        let f = write_toml(
            r#"
[app]
name = "Healthcare Concierge"

[execution]
max_iterations = 8

[[handoffs]]
name = "PolicyAgent"
description = "Insurance policy questions"
url = "http://localhost:9999/"

[[requirements]]
target = "think"
force_at_step = 1

[[requirements]]
target = "PolicyAgent"
min_invocations = 1
max_invocations = 1

[[requirements]]
target = "think"
force_after = "errored"
"#,
        );
        let cfg = load_config_file(f.path()).unwrap();
        assert_eq!(cfg.app.name, "Healthcare Concierge");
        assert_eq!(cfg.execution.max_iterations, 8);
        assert_eq!(cfg.execution.max_retries_per_step, 2);
        assert_eq!(cfg.handoffs[0].timeout_secs, 60);
        assert_eq!(cfg.requirements.len(), 3);
        assert_eq!(cfg.requirements[0].force_at_step, Some(1));
        assert!(cfg.requirements[1].consecutive_allowed);
        assert_eq!(cfg.requirements[2].force_after, Some(StepPredicate::Errored));
        assert_eq!(cfg.step_targets(), vec!["think", "PolicyAgent"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_target() {
        let f = write_toml(
            r#"
[[requirements]]
target = "ResearchAgent"
min_invocations = 1
"#,
        );
        let cfg = load_config_file(f.path()).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, AgentError::MissingConfiguration(msg) if msg.contains("ResearchAgent")));
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        let mut cfg = AppConfig::default();
        cfg.session.capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.execution.max_iterations = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_targets() {
        let mut cfg = AppConfig::default();
        cfg.handoffs.push(HandoffSection {
            name: "think".to_string(),
            description: String::new(),
            url: "http://localhost".to_string(),
            timeout_secs: 5,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_limits_from_section() {
        let section = ExecutionSection {
            max_iterations: 3,
            max_retries_per_step: 1,
            step_timeout_secs: 7,
        };
        let limits = section.limits();
        assert_eq!(limits.max_iterations, 3);
        assert_eq!(limits.step_timeout, Duration::from_secs(7));
    }
}
