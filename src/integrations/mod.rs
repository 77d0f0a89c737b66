//! 外部集成：远程专家 Agent 传输层
//!
//! RemoteAgent 是 Handoff 依赖的协作方接口：文本进、文本出，失败时给出带类型的 RemoteAgentError。
//! A2aClient 为基于 HTTP JSON-RPC（A2A `message/send`）的实现。

pub mod a2a;

use async_trait::async_trait;

use crate::core::RemoteAgentError;

pub use a2a::A2aClient;

/// 远程 Agent 传输接口
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Agent 名称（用于错误信息与日志）
    fn name(&self) -> &str;

    /// 发送一段文本并等待文本回复
    async fn send(&self, input: &str) -> Result<String, RemoteAgentError>;
}
