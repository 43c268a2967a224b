//! 回合过程事件：用于流式展示阶段切换、工具调用、恢复引导与最终结果

use serde::Serialize;

use crate::core::{Severity, TurnPhase};

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 进入新阶段
    Phase { phase: TurnPhase, round: usize },
    /// 路由决策及原因
    Route { route: String, reason: String },
    ToolCall {
        id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        id: String,
        preview: String,
        is_error: bool,
    },
    /// 注入的恢复引导
    Recovery {
        severity: Severity,
        strategy: String,
        guidance: String,
    },
    /// 最终叙事
    Outcome {
        narrative: String,
        state_changes: usize,
        fallback: bool,
    },
    /// 驱动器故障（已降级为默认 Outcome）
    Error { text: String },
}
