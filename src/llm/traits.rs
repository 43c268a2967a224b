//! LLM 客户端抽象
//!
//! 具体厂商（OpenAI / Ollama / 本地模型）都在本 crate 之外实现 LlmClient；
//! 这里只定义请求 / 响应与错误类型。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Message, ToolCall};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider error: {0}")]
    Provider(String),
}

/// 暴露给 LLM 的工具描述（由 ToolRegistry 生成）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 一次对话请求；tools 与 json_schema 均为可选
#[derive(Clone, Copy, Debug)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    pub tools: Option<&'a [ToolSpec]>,
    /// 提供时，实现方应尽量输出严格 JSON
    pub json_schema: Option<&'a Value>,
    pub max_tokens: Option<u32>,
    /// 实现方可忽略
    pub temperature: Option<f32>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(messages: &'a [Message]) -> Self {
        Self {
            messages,
            tools: None,
            json_schema: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: &'a [ToolSpec]) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_json_schema(mut self, schema: &'a Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn with_sampling(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }

    /// 转为 assistant 消息追加到回合消息序列
    pub fn into_message(self) -> Message {
        Message::assistant_with_tools(self.content, self.tool_calls)
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, LlmError>;
}
