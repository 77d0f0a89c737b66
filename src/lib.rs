//! Concierge - 需求约束下的会话编排智能体
//!
//! 模块划分：
//! - **agent**: Concierge 运行时（按会话执行一轮并推送事件）
//! - **citation**: 流式回答中的引用标记提取
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复策略
//! - **integrations**: 远程 Agent（A2A JSON-RPC）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息与 LRU 会话存储
//! - **observability**: tracing 初始化
//! - **react**: Requirement、Run / Step、Planner、执行循环与 Trajectory
//! - **tools**: 工具注册、执行器、think 与 handoff

pub mod agent;
pub mod citation;
pub mod config;
pub mod core;
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{Concierge, ConciergeBuilder, TurnHandle};
