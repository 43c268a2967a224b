//! 回合驱动器错误类型与恢复策略
//!
//! TurnError 只表示逃逸出状态机的驱动器故障；工具失败、解析失败都在各自层内恢复，不会变成 TurnError。

use serde::Serialize;
use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::MemoryError;
use crate::session::SessionError;

/// 驱动器故障：由 process_turn 顶层统一捕获并转为默认 Outcome
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session store error: {0}")]
    SessionStore(#[from] SessionError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Tool dispatch failed: {0}")]
    ToolDispatch(String),
}

/// 错误分析后选定的恢复策略，决定注入给 Agent 的引导文本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 不可恢复：停止用工具，直接基于当前状态收尾
    FinalizeNarrative,
    /// 资源缺失：换参数或先创建资源
    CreateMissingResource,
    /// 参数语法问题：检查参数后重试
    FixParameters,
    /// 错误过多：简化思路或直接进入叙事
    Simplify,
    RetryOrProceed,
}

impl RecoveryAction {
    pub fn guidance(&self) -> &'static str {
        match self {
            RecoveryAction::FinalizeNarrative => {
                "The previous tool calls failed with unrecoverable errors. Do not call any more tools. \
                 Finalize the narrative from the current game state."
            }
            RecoveryAction::CreateMissingResource => {
                "Some tool calls referenced resources that do not exist. Try different parameters, \
                 or create the missing character or state entry first."
            }
            RecoveryAction::FixParameters => {
                "Some tool calls had invalid parameters. Check the parameter names, types and paths, \
                 then retry."
            }
            RecoveryAction::Simplify => {
                "Several tool calls failed. Simplify the approach or proceed directly to the narrative."
            }
            RecoveryAction::RetryOrProceed => {
                "A tool call failed. Retry it with adjusted arguments, or proceed with the story using \
                 what you already know."
            }
        }
    }
}
