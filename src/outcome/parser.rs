//! Outcome 解析器
//!
//! 多级恢复：去空白 / 剥一层双花括号 → 直接解析 → 截取首个 `{` 到最后一个 `}` 再解析 → 默认 Outcome。
//! 解析器永不向调用方返回错误。

use serde::Deserialize;
use serde_json::Value;

use crate::outcome::{
    EmotionalStateUpdate, HiddenMemoryUpdate, Outcome, RollRequest, VisibleDialogue,
};
use crate::world::StateChangeOp;

/// 与 Outcome 同形，但 state_changes 逐条校验，非法条目单独丢弃
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutcome {
    narrative: String,
    state_changes: Vec<Value>,
    #[serde(default)]
    visible_dialogue: Option<Vec<VisibleDialogue>>,
    #[serde(default)]
    roll_requests: Option<Vec<RollRequest>>,
    #[serde(default)]
    hidden_memory_updates: Option<Vec<HiddenMemoryUpdate>>,
    #[serde(default)]
    emotional_state_updates: Option<Vec<EmotionalStateUpdate>>,
    #[serde(default)]
    suggested_actions: Option<Vec<String>>,
    #[serde(default)]
    state_changes_summary: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OutcomeParser;

impl OutcomeParser {
    pub fn new() -> Self {
        Self
    }

    /// 解析 LLM 原始输出，失败时返回 Outcome::fallback()
    pub fn parse(&self, raw: &str) -> Outcome {
        let text = strip_doubled_braces(raw.trim());
        if text.is_empty() {
            tracing::warn!("empty outcome text, using fallback");
            return Outcome::fallback();
        }

        if let Some(outcome) = try_parse(text) {
            return outcome;
        }

        if let Some(span) = extract_object_span(text) {
            if let Some(outcome) = try_parse(span) {
                tracing::debug!("outcome recovered from embedded JSON span");
                return outcome;
            }
        }

        tracing::warn!(preview = %preview(text), "outcome unparseable, using fallback");
        Outcome::fallback()
    }
}

fn strip_doubled_braces(text: &str) -> &str {
    if text.len() >= 4 && text.starts_with("{{") && text.ends_with("}}") {
        text[1..text.len() - 1].trim()
    } else {
        text
    }
}

/// 贪婪截取：首个 `{` 到最后一个 `}`
fn extract_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn try_parse(text: &str) -> Option<Outcome> {
    let raw: RawOutcome = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "outcome parse attempt failed");
            return None;
        }
    };
    if raw.narrative.trim().is_empty() {
        tracing::debug!("outcome rejected: empty narrative");
        return None;
    }

    let state_changes = raw
        .state_changes
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value::<StateChangeOp>(value.clone()) {
            Ok(op) => Some(op),
            Err(e) => {
                tracing::warn!(index, change = %value, error = %e, "dropping invalid state change");
                None
            }
        })
        .collect();

    Some(Outcome {
        narrative: raw.narrative,
        state_changes,
        visible_dialogue: raw.visible_dialogue,
        roll_requests: raw.roll_requests,
        hidden_memory_updates: raw.hidden_memory_updates,
        emotional_state_updates: raw.emotional_state_updates,
        suggested_actions: raw.suggested_actions,
        state_changes_summary: raw.state_changes_summary,
    })
}

fn preview(text: &str) -> String {
    if text.chars().count() > 120 {
        format!("{}...", text.chars().take(120).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FALLBACK_NARRATIVE;
    use crate::world::StateOp;
    use serde_json::json;

    #[test]
    fn test_not_json_falls_back() {
        let outcome = OutcomeParser::new().parse("not json at all");
        assert_eq!(outcome.narrative, FALLBACK_NARRATIVE);
        assert!(outcome.state_changes.is_empty());
    }

    #[test]
    fn test_empty_input_falls_back() {
        assert!(OutcomeParser::new().parse("   \n").is_fallback());
    }

    #[test]
    fn test_serialized_outcome_parses_back_equal() {
        let mut outcome = Outcome::new(
            "The gate creaks open.",
            vec![
                StateChangeOp::new(StateOp::Dec, "health", json!(30)),
                StateChangeOp::new(StateOp::Addlog, "", json!("gate opened")),
            ],
        );
        outcome.visible_dialogue = Some(vec![VisibleDialogue {
            entity_id: "guard".into(),
            utterance: "Halt!".into(),
        }]);
        outcome.emotional_state_updates = Some(vec![EmotionalStateUpdate {
            entity_id: "guard".into(),
            emotion: "suspicion".into(),
            intensity: 0.4,
            cause: Some("stranger at night".into()),
            target_entity: None,
        }]);
        outcome.suggested_actions = Some(vec!["Bribe the guard".into()]);

        let text = serde_json::to_string(&outcome).unwrap();
        assert_eq!(OutcomeParser::new().parse(&text), outcome);
    }

    #[test]
    fn test_unknown_field_rejects_whole_object() {
        let text = r#"{"narrative": "x", "state_changes": [], "mood": "grim"}"#;
        assert!(OutcomeParser::new().parse(text).is_fallback());
    }

    #[test]
    fn test_missing_state_changes_rejected() {
        assert!(OutcomeParser::new().parse(r#"{"narrative": "x"}"#).is_fallback());
    }

    #[test]
    fn test_empty_narrative_rejected() {
        let text = r#"{"narrative": "  ", "state_changes": []}"#;
        assert!(OutcomeParser::new().parse(text).is_fallback());
    }

    #[test]
    fn test_invalid_op_dropped_rest_kept() {
        let text = r#"{
            "narrative": "A storm rolls in.",
            "state_changes": [
                {"op": "set", "path": "weather", "value": "storm"},
                {"op": "explode", "path": "castle", "value": 1},
                {"op": "inc", "path": "turns", "value": 1}
            ],
            "suggested_actions": ["Seek shelter"]
        }"#;
        let outcome = OutcomeParser::new().parse(text);
        assert_eq!(outcome.narrative, "A storm rolls in.");
        let ops: Vec<StateOp> = outcome.state_changes.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![StateOp::Set, StateOp::Inc]);
        assert_eq!(outcome.suggested_actions, Some(vec!["Seek shelter".to_string()]));
    }

    #[test]
    fn test_doubled_braces_stripped() {
        let text = r#"{{"narrative": "Night falls.", "state_changes": []}}"#;
        let outcome = OutcomeParser::new().parse(text);
        assert_eq!(outcome.narrative, "Night falls.");
    }

    #[test]
    fn test_extracts_json_from_prose() {
        let text = "Here is the outcome:\n```json\n{\"narrative\": \"The bridge holds.\", \"state_changes\": [{\"op\": \"set\", \"path\": \"bridge.intact\", \"value\": true}]}\n```\nHope that helps!";
        let outcome = OutcomeParser::new().parse(text);
        assert_eq!(outcome.narrative, "The bridge holds.");
        assert_eq!(outcome.state_changes.len(), 1);
        assert_eq!(outcome.state_changes[0].path, "bridge.intact");
    }

    #[test]
    fn test_roll_request_without_target_kept() {
        let text = r#"{
            "narrative": "You try to climb.",
            "state_changes": [{"op": "set", "path": "position", "value": "wall"}],
            "roll_requests": [{"kind": "d20", "difficulty": 12}]
        }"#;
        let outcome = OutcomeParser::new().parse(text);
        assert_eq!(outcome.narrative, "You try to climb.");
        assert_eq!(outcome.state_changes.len(), 1);
        assert_eq!(
            outcome.roll_requests,
            Some(vec![RollRequest {
                kind: "d20".into(),
                target: None,
                difficulty: 12,
            }])
        );
    }
}
