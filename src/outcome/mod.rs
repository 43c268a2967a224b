//! 回合结果（Outcome）
//!
//! LLM 在 OUTCOME 阶段产出的结构化结果：叙事文本 + 有序状态变更 + 可选的对白、掷骰、记忆与情绪更新。
//! 顶层字段为封闭 schema，未知字段整体拒绝（见 parser）。

pub mod parser;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::world::StateChangeOp;

pub use parser::OutcomeParser;

/// 解析彻底失败或驱动器故障时使用的默认叙事
pub const FALLBACK_NARRATIVE: &str = "The story continues...";

/// 场景中可见的一句对白
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VisibleDialogue {
    pub entity_id: String,
    pub utterance: String,
}

/// 需要玩家掷骰的检定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RollRequest {
    /// 检定类型，如 skill_check / saving_throw
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub difficulty: i64,
}

/// 隐藏记忆更新；visibility 为 private / public
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HiddenMemoryUpdate {
    #[serde(default = "default_scope")]
    pub scope: String,
    pub target_id: String,
    pub content: String,
    #[serde(default = "default_visibility")]
    pub visibility: String,
}

fn default_scope() -> String {
    "general".to_string()
}

fn default_visibility() -> String {
    "private".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EmotionalStateUpdate {
    pub entity_id: String,
    pub emotion: String,
    /// -1.0 ~ 1.0
    pub intensity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity: Option<String>,
}

/// 一个回合的最终结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Outcome {
    /// 非空叙事
    pub narrative: String,
    /// 有序状态变更，可为空
    pub state_changes: Vec<StateChangeOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_dialogue: Option<Vec<VisibleDialogue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll_requests: Option<Vec<RollRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_memory_updates: Option<Vec<HiddenMemoryUpdate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state_updates: Option<Vec<EmotionalStateUpdate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_actions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_changes_summary: Option<Vec<String>>,
}

impl Outcome {
    pub fn new(narrative: impl Into<String>, state_changes: Vec<StateChangeOp>) -> Self {
        Self {
            narrative: narrative.into(),
            state_changes,
            visible_dialogue: None,
            roll_requests: None,
            hidden_memory_updates: None,
            emotional_state_updates: None,
            suggested_actions: None,
            state_changes_summary: None,
        }
    }

    /// 安全默认值：通用叙事，无状态变更
    pub fn fallback() -> Self {
        Self::new(FALLBACK_NARRATIVE, Vec::new())
    }

    pub fn is_fallback(&self) -> bool {
        self.narrative == FALLBACK_NARRATIVE && self.state_changes.is_empty()
    }
}

/// Outcome 的 JSON Schema，OUTCOME 阶段作为 json_schema 传给 LLM
pub fn outcome_json_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(Outcome)).unwrap_or(Value::Null)
}
