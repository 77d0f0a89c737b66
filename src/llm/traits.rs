//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete_stream 返回流式 Token。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::memory::Message;

/// 流式 Token
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// LLM 客户端 trait：流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String>;
}
