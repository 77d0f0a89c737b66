//! Requirement：对模型每一次提议的结构化约束
//!
//! 每条 Requirement 针对一个目标（工具名），组合以下规则：
//! - `force_at_step`：第 N 步必须是该目标；且当该目标没有其他约束时，它只能出现在第 N 步
//! - `force_after`：首个满足谓词的 Step 之后紧接着的一步必须是该目标
//! - `min_invocations` / `max_invocations`：本轮调用次数下限（在提议最终回答时检查）与上限（在执行前检查）
//! - `consecutive_allowed = false`：不能连续两步调用同一目标
//!
//! 多条 Requirement 之间是"与"的关系；任何一条不满足，提议即被拒绝。

use std::fmt;

use serde::{Deserialize, Serialize};

use super::run::{Step, StepTarget};

fn default_true() -> bool {
    true
}

/// 对已提交 Step 的谓词，用于 `force_after`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPredicate {
    /// 调用了指定目标
    Target(String),
    /// 调用了其中任一目标
    AnyOf(Vec<String>),
    /// 该步以错误结束
    Errored,
}

impl StepPredicate {
    pub fn matches(&self, step: &Step) -> bool {
        match self {
            StepPredicate::Target(name) => step.target.is_tool(name),
            StepPredicate::AnyOf(names) => names.iter().any(|n| step.target.is_tool(n)),
            StepPredicate::Errored => step.outcome.is_error(),
        }
    }

    fn referenced_targets(&self) -> Vec<&str> {
        match self {
            StepPredicate::Target(name) => vec![name.as_str()],
            StepPredicate::AnyOf(names) => names.iter().map(String::as_str).collect(),
            StepPredicate::Errored => Vec::new(),
        }
    }
}

impl fmt::Display for StepPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPredicate::Target(name) => write!(f, "the first '{name}' step"),
            StepPredicate::AnyOf(names) => write!(f, "the first step using any of [{}]", names.join(", ")),
            StepPredicate::Errored => write!(f, "the first failed step"),
        }
    }
}

/// 单条约束，可由配置文件 `[[requirements]]` 反序列化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub target: String,
    #[serde(default)]
    pub force_at_step: Option<usize>,
    #[serde(default)]
    pub force_after: Option<StepPredicate>,
    #[serde(default)]
    pub min_invocations: Option<usize>,
    #[serde(default)]
    pub max_invocations: Option<usize>,
    #[serde(default = "default_true")]
    pub consecutive_allowed: bool,
}

impl Requirement {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            force_at_step: None,
            force_after: None,
            min_invocations: None,
            max_invocations: None,
            consecutive_allowed: true,
        }
    }

    pub fn at_step(mut self, position: usize) -> Self {
        self.force_at_step = Some(position);
        self
    }

    pub fn after(mut self, predicate: StepPredicate) -> Self {
        self.force_after = Some(predicate);
        self
    }

    pub fn at_least(mut self, min: usize) -> Self {
        self.min_invocations = Some(min);
        self
    }

    pub fn at_most(mut self, max: usize) -> Self {
        self.max_invocations = Some(max);
        self
    }

    pub fn no_consecutive(mut self) -> Self {
        self.consecutive_allowed = false;
        self
    }

    /// 除位置外是否还有其他约束（min / max / force_after）
    fn has_non_positional_rules(&self) -> bool {
        self.min_invocations.is_some() || self.max_invocations.is_some() || self.force_after.is_some()
    }

    /// 规则的自然语言描述，写入提示
    pub fn describe(&self) -> Vec<String> {
        let t = &self.target;
        let mut out = Vec::new();
        if let Some(p) = self.force_at_step {
            out.push(format!("Step {p} must be '{t}'."));
        }
        if let Some(pred) = &self.force_after {
            out.push(format!("'{t}' must be the step immediately after {pred}."));
        }
        match (self.min_invocations, self.max_invocations) {
            (Some(min), Some(max)) if min == max => {
                out.push(format!("'{t}' must be used exactly {min} time(s) before the final answer."))
            }
            (min, max) => {
                if let Some(min) = min {
                    out.push(format!("'{t}' must be used at least {min} time(s) before the final answer."));
                }
                if let Some(max) = max {
                    out.push(format!("'{t}' may be used at most {max} time(s)."));
                }
            }
        }
        if !self.consecutive_allowed {
            out.push(format!("'{t}' may not be used twice in a row."));
        }
        out
    }
}

/// 拒绝原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// 该位置必须是 target
    ForcedAtStep { target: String, position: usize },
    /// target 只允许出现在固定位置
    OutsidePosition { target: String, position: usize },
    ForcedAfter { target: String, after: String },
    MaxInvocations { target: String, max: usize },
    MinInvocations { target: String, min: usize, actual: usize },
    Consecutive { target: String },
    UnknownTarget { target: String },
}

impl Violation {
    /// 最终回答因下限未满足而被挡住
    pub fn blocks_final_answer(&self) -> bool {
        matches!(self, Violation::MinInvocations { .. })
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::ForcedAtStep { target, position } => write!(f, "step {position} must be '{target}'"),
            Violation::OutsidePosition { target, position } => {
                write!(f, "'{target}' may only be used as step {position}")
            }
            Violation::ForcedAfter { target, after } => {
                write!(f, "'{target}' must come immediately after {after}")
            }
            Violation::MaxInvocations { target, max } => {
                write!(f, "'{target}' has already been used {max} time(s), the maximum allowed")
            }
            Violation::MinInvocations { target, min, actual } => write!(
                f,
                "'{target}' must be used at least {min} time(s) before the final answer (used {actual})"
            ),
            Violation::Consecutive { target } => write!(f, "'{target}' may not be used twice in a row"),
            Violation::UnknownTarget { target } => write!(f, "'{target}' is not an available tool"),
        }
    }
}

/// 一组 Requirement，按"与"组合
#[derive(Debug, Clone, Default)]
pub struct RequirementSet {
    requirements: Vec<Requirement>,
}

impl RequirementSet {
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter()
    }

    /// 所有被引用的目标名（包括 force_after 谓词中引用的）
    pub fn referenced_targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for r in &self.requirements {
            out.push(&r.target);
            if let Some(pred) = &r.force_after {
                out.extend(pred.referenced_targets());
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// 检查每条规则是否引用了可用的目标，且自身一致
    pub fn check(&self, available: &[String]) -> Result<(), String> {
        for name in self.referenced_targets() {
            if !available.iter().any(|a| a == name) {
                return Err(format!("requirement references unknown step target '{name}'"));
            }
        }
        for r in &self.requirements {
            if r.force_at_step == Some(0) {
                return Err(format!("requirement on '{}' has force_at_step = 0; positions start at 1", r.target));
            }
            if let (Some(min), Some(max)) = (r.min_invocations, r.max_invocations) {
                if min > max {
                    return Err(format!(
                        "requirement on '{}' has min_invocations {min} > max_invocations {max}",
                        r.target
                    ));
                }
            }
        }
        Ok(())
    }

    /// target 被固定在某个位置时返回该位置：存在 force_at_step，且该目标没有任何其他约束
    fn pinned_position(&self, target: &str) -> Option<usize> {
        let mut position = None;
        for r in self.requirements.iter().filter(|r| r.target == target) {
            if r.has_non_positional_rules() {
                return None;
            }
            if r.force_at_step.is_some() {
                position = r.force_at_step;
            }
        }
        position
    }

    /// 校验一次提议；返回全部违反项，空表示接受
    pub fn validate(&self, proposed: &StepTarget, steps: &[Step]) -> Vec<Violation> {
        let ordinal = steps.len() + 1;
        let mut violations = Vec::new();

        for r in &self.requirements {
            let is_target = proposed.is_tool(&r.target);

            if let Some(position) = r.force_at_step {
                if ordinal == position && !is_target {
                    violations.push(Violation::ForcedAtStep {
                        target: r.target.clone(),
                        position,
                    });
                }
            }

            if let Some(pred) = &r.force_after {
                let first = steps.iter().position(|s| pred.matches(s));
                if first.map(|i| i + 1 == steps.len()).unwrap_or(false) && !is_target {
                    violations.push(Violation::ForcedAfter {
                        target: r.target.clone(),
                        after: pred.to_string(),
                    });
                }
            }

            let used = steps.iter().filter(|s| s.target.is_tool(&r.target)).count();
            if is_target {
                if let Some(max) = r.max_invocations {
                    if used >= max {
                        violations.push(Violation::MaxInvocations {
                            target: r.target.clone(),
                            max,
                        });
                    }
                }
                if !r.consecutive_allowed && steps.last().map(|s| s.target.is_tool(&r.target)).unwrap_or(false) {
                    violations.push(Violation::Consecutive {
                        target: r.target.clone(),
                    });
                }
            }

            if *proposed == StepTarget::FinalAnswer {
                if let Some(min) = r.min_invocations {
                    if used < min {
                        violations.push(Violation::MinInvocations {
                            target: r.target.clone(),
                            min,
                            actual: used,
                        });
                    }
                }
            }
        }

        if let StepTarget::Tool(name) = proposed {
            if let Some(position) = self.pinned_position(name) {
                if ordinal != position {
                    violations.push(Violation::OutsidePosition {
                        target: name.clone(),
                        position,
                    });
                }
            }
        }

        violations.dedup();
        violations
    }

    /// 还需至少多少次调用才能满足所有 min_invocations
    pub fn missing_invocations(&self, steps: &[Step]) -> usize {
        self.requirements
            .iter()
            .filter_map(|r| {
                let min = r.min_invocations?;
                let used = steps.iter().filter(|s| s.target.is_tool(&r.target)).count();
                Some(min.saturating_sub(used))
            })
            .sum()
    }

    pub fn final_answer_allowed(&self, steps: &[Step]) -> bool {
        self.validate(&StepTarget::FinalAnswer, steps).is_empty()
    }

    /// 在当前 Step 日志下可以接受的工具
    pub fn allowed_targets(&self, steps: &[Step], available: &[String]) -> Vec<String> {
        available
            .iter()
            .filter(|name| self.validate(&StepTarget::Tool((*name).clone()), steps).is_empty())
            .cloned()
            .collect()
    }

    /// 写入提示的规则描述与当前进度：下一步被强制的目标、已用尽的目标、回答前仍需调用的目标
    pub fn hints(&self, steps: &[Step]) -> Vec<String> {
        let mut hints: Vec<String> = self.requirements.iter().flat_map(|r| r.describe()).collect();
        let ordinal = steps.len() + 1;

        for r in &self.requirements {
            let used = steps.iter().filter(|s| s.target.is_tool(&r.target)).count();
            let forced_here = r.force_at_step == Some(ordinal);
            let forced_after = r.force_after.as_ref().is_some_and(|pred| {
                steps.iter().position(|s| pred.matches(s)).map(|i| i + 1 == steps.len()).unwrap_or(false)
            });
            if forced_here || forced_after {
                hints.push(format!("The next step (step {ordinal}) must be '{}'.", r.target));
            }
            if r.max_invocations.is_some_and(|max| used >= max) {
                hints.push(format!("'{}' is exhausted for this turn; do not use it again.", r.target));
            }
            if let Some(min) = r.min_invocations {
                if used < min {
                    hints.push(format!(
                        "'{}' is still required {} more time(s) before the final answer.",
                        r.target,
                        min - used
                    ));
                }
            }
        }
        hints.dedup();
        hints
    }
}
