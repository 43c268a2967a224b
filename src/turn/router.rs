//! 路由：纯函数，每个 AGENT 周期评估一次，决定进入 TOOLS、OUTCOME 或 END
//!
//! 规则按优先级依次判断；轮数上限优先于待执行的工具调用，保证回合必然终止。

use std::fmt;

use serde::Serialize;

use crate::core::AgentState;

/// 默认每回合最多 5 批工具执行
pub const DEFAULT_MAX_ROUNDS: usize = 5;

/// 出现即视为 Agent 准备收尾的关键词
pub const FINISH_KEYWORDS: [&str; 6] = ["narrative", "story", "outcome", "conclude", "finally", "in summary"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    Tools,
    Outcome,
    /// 没有任何 assistant 消息，无可收尾内容
    End,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Route::Tools => "TOOLS",
            Route::Outcome => "OUTCOME",
            Route::End => "END",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub route: Route,
    pub reason: &'static str,
}

impl RouteDecision {
    fn new(route: Route, reason: &'static str) -> Self {
        Self { route, reason }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    max_rounds: usize,
    /// 「工具用得够多」判定：不同工具数下限
    min_distinct_tools: usize,
    /// 「工具用得够多」判定：消息数须超过此值
    message_threshold: usize,
    simple_scene_max_entities: usize,
    simple_scene_max_state_chars: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROUNDS)
    }
}

impl Router {
    pub fn new(max_rounds: usize) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
            min_distinct_tools: 3,
            message_threshold: 10,
            simple_scene_max_entities: 2,
            simple_scene_max_state_chars: 500,
        }
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    pub fn route(&self, state: &AgentState) -> Route {
        self.decide(state).route
    }

    pub fn decide(&self, state: &AgentState) -> RouteDecision {
        let Some(last) = state.last_assistant() else {
            return RouteDecision::new(Route::End, "no assistant message");
        };
        let rounds_exhausted = state.rounds() >= self.max_rounds;

        if last.has_tool_calls() {
            return if rounds_exhausted {
                RouteDecision::new(Route::Outcome, "round limit reached with pending tool calls")
            } else {
                RouteDecision::new(Route::Tools, "assistant requested tools")
            };
        }
        if rounds_exhausted {
            return RouteDecision::new(Route::Outcome, "round limit reached");
        }
        if state.distinct_tool_names().len() >= self.min_distinct_tools
            && state.messages.len() > self.message_threshold
        {
            return RouteDecision::new(Route::Outcome, "enough tools used");
        }
        let content = last.content.to_lowercase();
        if FINISH_KEYWORDS.iter().any(|k| content.contains(k)) {
            return RouteDecision::new(Route::Outcome, "finish keyword");
        }
        if self.is_simple_scene(state) {
            return RouteDecision::new(Route::Outcome, "simple scene");
        }
        RouteDecision::new(Route::Outcome, "default")
    }

    fn is_simple_scene(&self, state: &AgentState) -> bool {
        state.entities.len() <= self.simple_scene_max_entities
            && serde_json::to_string(&state.game_state)
                .map(|s| s.chars().count() < self.simple_scene_max_state_chars)
                .unwrap_or(false)
    }
}
