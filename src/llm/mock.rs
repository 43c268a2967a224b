//! 脚本化 Mock LLM 客户端（用于测试与演示，无需 API）
//!
//! 按顺序弹出预设响应；脚本耗尽后返回 fallback 响应（默认空文本）。每次请求都会被记录，便于断言。

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::memory::Message;

/// 记录下来的一次请求
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
    pub had_json_schema: bool,
}

#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    fallback: Option<ChatResponse>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: impl IntoIterator<Item = ChatResponse>) -> Self {
        Self::from_results(responses.into_iter().map(Ok))
    }

    /// 脚本中可混入错误，用于模拟厂商故障
    pub fn from_results(results: impl IntoIterator<Item = Result<ChatResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 脚本耗尽后反复返回该响应
    pub fn with_fallback(mut self, response: ChatResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
        self.requests.lock().await.push(RecordedRequest {
            messages: request.messages.to_vec(),
            tool_names: request
                .tools
                .map(|tools| tools.iter().map(|t| t.name.clone()).collect())
                .unwrap_or_default(),
            had_json_schema: request.json_schema.is_some(),
        });

        match self.script.lock().await.pop_front() {
            Some(next) => next,
            None => Ok(self.fallback.clone().unwrap_or_default()),
        }
    }
}
