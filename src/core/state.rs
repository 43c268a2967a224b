//! 回合内状态：AgentState、阶段枚举、工具批次摘要、错误上下文
//!
//! AgentState 只存活于一个回合；持久化由 SessionStore 负责。

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::core::recovery::ErrorAnalysis;
use crate::core::RecoveryAction;
use crate::memory::{Message, Role, ToolCall};

/// 状态机的七个阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnPhase {
    Agent,
    Tools,
    ProcessTools,
    HandleErrors,
    Outcome,
    Reflection,
    Done,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnPhase::Agent => "AGENT",
            TurnPhase::Tools => "TOOLS",
            TurnPhase::ProcessTools => "PROCESS_TOOLS",
            TurnPhase::HandleErrors => "HANDLE_ERRORS",
            TurnPhase::Outcome => "OUTCOME",
            TurnPhase::Reflection => "REFLECTION",
            TurnPhase::Done => "DONE",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effectiveness {
    High,
    Medium,
    Low,
}

impl Effectiveness {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.8 {
            Effectiveness::High
        } else if rate >= 0.5 {
            Effectiveness::Medium
        } else {
            Effectiveness::Low
        }
    }
}

/// 一轮工具执行的摘要
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolResultBatch {
    pub round: usize,
    pub tools_in_batch: usize,
    pub tool_names: Vec<String>,
    pub success_rate: f64,
    pub effectiveness: Effectiveness,
}

impl ToolResultBatch {
    pub fn summarize(round: usize, calls: &[ToolCall], results: &[Message]) -> Self {
        let succeeded = results.iter().filter(|m| !m.is_error_tagged()).count();
        let success_rate = if results.is_empty() {
            0.0
        } else {
            succeeded as f64 / results.len() as f64
        };
        Self {
            round,
            tools_in_batch: calls.len(),
            tool_names: calls.iter().map(|c| c.name.clone()).collect(),
            success_rate,
            effectiveness: Effectiveness::from_success_rate(success_rate),
        }
    }
}

/// 错误恢复期间挂在 AgentState 上的上下文
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorContext {
    pub analysis: ErrorAnalysis,
    /// 出错 tool 消息的原文
    pub details: Vec<String>,
    pub recovery_strategy: RecoveryAction,
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentState {
    pub messages: Vec<Message>,
    pub game_state: Value,
    /// 每个实体至少含 `id`
    pub entities: Vec<Value>,
    pub session_id: String,
    pub turn_count: u64,
    pub tool_result_batches: Vec<ToolResultBatch>,
    pub user_input: Option<String>,
    pub error_recovery_active: bool,
    pub error_context: Option<ErrorContext>,
}

impl AgentState {
    pub fn new(
        session_id: impl Into<String>,
        game_state: Value,
        entities: Vec<Value>,
        turn_count: u64,
        user_input: Option<String>,
    ) -> Self {
        Self {
            messages: Vec::new(),
            game_state,
            entities,
            session_id: session_id.into(),
            turn_count,
            tool_result_batches: Vec::new(),
            user_input,
            error_recovery_active: false,
            error_context: None,
        }
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    pub fn rounds(&self) -> usize {
        self.tool_result_batches.len()
    }

    /// 本回合所有 assistant 请求过的不同工具名
    pub fn distinct_tool_names(&self) -> BTreeSet<&str> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter().map(|c| c.name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_effectiveness_thresholds() {
        assert_eq!(Effectiveness::from_success_rate(1.0), Effectiveness::High);
        assert_eq!(Effectiveness::from_success_rate(0.8), Effectiveness::High);
        assert_eq!(Effectiveness::from_success_rate(0.5), Effectiveness::Medium);
        assert_eq!(Effectiveness::from_success_rate(0.49), Effectiveness::Low);
    }

    #[test]
    fn test_batch_summary() {
        let calls = vec![
            ToolCall::new("1", "read_state", json!({})),
            ToolCall::new("2", "update_state", json!({})),
        ];
        let results = vec![Message::tool("1", "State at hp: 3"), Message::tool("2", "Error: bad op")];
        let batch = ToolResultBatch::summarize(1, &calls, &results);
        assert_eq!(batch.tools_in_batch, 2);
        assert_eq!(batch.success_rate, 0.5);
        assert_eq!(batch.effectiveness, Effectiveness::Medium);
        assert_eq!(batch.tool_names, vec!["read_state", "update_state"]);
    }

    #[test]
    fn test_distinct_tool_names() {
        let mut state = AgentState::new("s", json!({}), vec![], 0, None);
        state.messages.push(Message::assistant_with_tools(
            "",
            vec![
                ToolCall::new("1", "read_state", json!({})),
                ToolCall::new("2", "read_state", json!({})),
            ],
        ));
        state.messages.push(Message::assistant_with_tools(
            "",
            vec![ToolCall::new("3", "add_memory", json!({}))],
        ));
        assert_eq!(state.distinct_tool_names().len(), 2);
        assert_eq!(state.last_assistant().map(|m| m.tool_calls.len()), Some(1));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(TurnPhase::HandleErrors.to_string(), "HANDLE_ERRORS");
    }
}
