//! 认知层：需求约束、Run / Step 日志、Planner、执行循环与 Trajectory

pub mod events;
pub mod loop_;
pub mod planner;
pub mod requirement;
pub mod run;
pub mod trajectory;

pub use events::{TrajectoryEvent, TurnEvent, TurnStatus};
pub use loop_::{run_turn_loop, ExecutionLimits, TurnOutcome, TurnSession};
pub use planner::{parse_llm_output, Decider, Decision, DecisionRequest, Planner, PlannerOutput, ToolCall};
pub use requirement::{Requirement, RequirementSet, StepPredicate, Violation};
pub use run::{Run, RunState, Step, StepError, StepOutcome, StepTarget};
pub use trajectory::{summarize_for_trajectory, truncate_chars, TrajectoryEmitter, TRUNCATION_MARKER};
