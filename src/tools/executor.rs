//! 工具执行器
//!
//! 一批工具调用并发执行（每个调用一个 tokio task），结果按调用顺序重新组装为 tool 消息。
//! 声明为 sequential 的工具共用一个 task，按调用顺序依次执行；任务放在 JoinSet 中，批次 future 被丢弃（回合取消）时全部中止。
//! 单个调用的失败（未知工具、工具返回 Err、panic、超时）只变成一条 "Error: ..." 消息，不影响同批其它调用；
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::timeout;
use uuid::Uuid;

use crate::core::TurnError;
use crate::llm::ToolSpec;
use crate::memory::{Message, ToolCall};
use crate::tools::{Tool, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并把所有失败映射为带 "Error:" 前缀的文本
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    /// 执行一批调用，返回与 calls 等长、同序的 tool 消息；
    /// 调度机制本身失败时只返回一条合成的错误消息
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Vec<Message> {
        match self.dispatch(calls).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(error = %e, calls = calls.len(), "tool batch dispatch failed");
                vec![dispatch_failure_message(&e)]
            }
        }
    }

    async fn dispatch(&self, calls: &[ToolCall]) -> Result<Vec<Message>, TurnError> {
        let limit = self.timeout;
        let mut set: JoinSet<Vec<(usize, String)>> = JoinSet::new();
        let mut ordered = Vec::new();
        for (i, call) in calls.iter().enumerate() {
            let tool = self.registry.get(&call.name);
            let name = call.name.clone();
            let args = call.args.clone();
            if tool.as_ref().is_some_and(|t| t.sequential()) {
                ordered.push((i, tool, name, args));
            } else {
                set.spawn(async move { vec![(i, run_call(tool, name, args, limit).await)] });
            }
        }
        if !ordered.is_empty() {
            set.spawn(async move {
                let mut out = Vec::with_capacity(ordered.len());
                for (i, tool, name, args) in ordered {
                    out.push((i, run_call(tool, name, args, limit).await));
                }
                out
            });
        }

        let mut contents: Vec<Option<String>> = vec![None; calls.len()];
        while let Some(joined) = set.join_next().await {
            // 提前返回时 set 被丢弃，其余任务随之中止
            let results = joined.map_err(|e| TurnError::ToolDispatch(e.to_string()))?;
            for (i, content) in results {
                contents[i] = Some(content);
            }
        }

        calls
            .iter()
            .zip(contents)
            .map(|(call, content)| {
                content
                    .map(|c| Message::tool(call.id.clone(), c))
                    .ok_or_else(|| TurnError::ToolDispatch(format!("no result for call '{}'", call.id)))
            })
            .collect()
    }
}

/// 调度失败时的合成消息，tool_call_id 为新生成的 uuid
pub fn dispatch_failure_message(err: &TurnError) -> Message {
    Message::tool(
        format!("call_{}", Uuid::new_v4()),
        format!("Error: tool execution failed: {err}"),
    )
}

async fn run_call(tool: Option<Arc<dyn Tool>>, name: String, args: Value, limit: Duration) -> String {
    let start = Instant::now();
    let args_preview = args_preview(&args);

    let (ok, outcome, content) = match tool {
        None => (false, "unknown_tool", format!("Error: tool '{name}' not found")),
        Some(tool) => {
            let call = AssertUnwindSafe(async move { tool.execute(args).await }).catch_unwind();
            match timeout(limit, call).await {
                Ok(Ok(Ok(text))) => (true, "ok", text),
                Ok(Ok(Err(e))) => (false, "error", format!("Error: {e}")),
                Ok(Err(_)) => (false, "panic", format!("Error: tool '{name}' panicked")),
                Err(_) => (
                    false,
                    "timeout",
                    format!("Error: tool '{name}' timeout after {}ms", limit.as_millis()),
                ),
            }
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": name,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");

    content
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
