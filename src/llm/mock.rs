//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 按顺序返回预置的输出；脚本耗尽后回复固定的最终答案。流式输出按 chunk_chars 切片，便于覆盖引用解析的分块边界。
//! 每次调用收到的消息都会被记录，供测试断言（如纠正提示是否注入）。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, TokenStream};
use crate::memory::Message;

/// 脚本中的一项：正常输出或模拟失败
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(String),
}

/// Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<Vec<Message>>>,
    chunk_chars: usize,
    fallback: String,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::scripted(Vec::<String>::new())
    }
}

impl MockLlmClient {
    /// 依次返回 outputs 中的文本
    pub fn scripted<S: Into<String>>(outputs: impl IntoIterator<Item = S>) -> Self {
        Self::with_replies(outputs.into_iter().map(|s| MockReply::Text(s.into())))
    }

    pub fn with_replies(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            chunk_chars: 3,
            fallback: "I don't know.".to_string(),
        }
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// 每次调用收到的完整消息列表
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_reply(&self, messages: &[Message]) -> MockReply {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| MockReply::Text(self.fallback.clone()))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = match self.next_reply(messages) {
            MockReply::Text(t) => t,
            MockReply::Error(e) => return Err(e),
        };
        let chars: Vec<char> = content.chars().collect();
        let chunks: Vec<Result<String, String>> = chars
            .chunks(self.chunk_chars)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}
