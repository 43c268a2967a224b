//! 回合开场上下文组装
//!
//! 状态摘要 + 世界背景 + 最近 3 回合原文 + 更早回合摘要 + 实体列表 + POV 记忆 + 玩家行动。

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Value;

use crate::memory::MemoryEntry;
use crate::session::TurnRecord;

pub const NARRATOR_SYSTEM: &str = "\
ROLE: Narrator and referee for an interactive story.

Tools:
- read_state(path): read the current game state at a path such as 'party[0].hp'
- update_state(op, path, value): stage a change; op is set, inc, dec, mul, patch, push, pop or addlog
- create_character(id, type, name, background): add a character that does not exist yet
- update_world(changes): merge key-value pairs into the world (time, weather, locations)
- add_memory(entity_id, content, visibility, scope) / add_memories(memories): record what characters think

Guidelines:
- Check state before deciding; never invent values you can read.
- Characters keep their own beliefs and history; they may disagree with the player.
- Never reveal the private thoughts of non-POV characters.
- When uncertain whether an action succeeds, request a roll.";

/// OUTCOME 阶段追加的请求
pub const OUTCOME_REQUEST: &str =
    "Now provide the final narrative outcome as structured JSON with the Outcome schema.";

/// REFLECTION 阶段追加的请求
pub const REFLECTION_REQUEST: &str = "Before the turn closes, record anything the characters should remember \
     with add_memory or add_memories. Reply without tool calls if nothing needs recording.";

pub const DEFAULT_ACTION: &str = "Continue the story";

const RECENT_TURNS: usize = 3;
const SUMMARY_BATCH: usize = 5;
const SUMMARY_PER_BATCH: usize = 2;
const SUMMARY_MAX_POINTS: usize = 10;
const MAX_ENTITIES: usize = 10;
const WORLD_BACKGROUND_CHARS: usize = 500;
const NARRATIVE_PREVIEW_CHARS: usize = 200;

/// 组装开场 prompt 所需的全部输入
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub game_state: &'a Value,
    pub entities: &'a [Value],
    pub turn_history: &'a [TurnRecord],
    pub world_background: &'a str,
    pub pov_entity: &'a str,
    pub private_memory: &'a [MemoryEntry],
    pub public_memory: &'a BTreeMap<String, Vec<MemoryEntry>>,
    pub turn: u64,
    pub user_input: Option<&'a str>,
}

/// POV 实体：game_state.pov_entity → 类型或 id 为 player 的首个实体 → "player"
pub fn pov_entity(game_state: &Value, entities: &[Value]) -> String {
    if let Some(pov) = game_state.get("pov_entity").and_then(Value::as_str) {
        if !pov.is_empty() {
            return pov.to_string();
        }
    }
    entities
        .iter()
        .find(|e| {
            e.get("type").and_then(Value::as_str) == Some("player")
                || e.get("id").and_then(Value::as_str) == Some("player")
        })
        .and_then(|e| e.get("id").and_then(Value::as_str))
        .unwrap_or("player")
        .to_string()
}

pub fn recent_turns(history: &[TurnRecord]) -> &[TurnRecord] {
    &history[history.len().saturating_sub(RECENT_TURNS)..]
}

/// 更早回合的摘要：每 5 回合取前 2 条，最多 10 条
pub fn history_summary(history: &[TurnRecord]) -> Option<String> {
    if history.len() <= RECENT_TURNS {
        return None;
    }
    let older = &history[..history.len() - RECENT_TURNS];
    let points: Vec<String> = older
        .chunks(SUMMARY_BATCH)
        .flat_map(|batch| batch.iter().take(SUMMARY_PER_BATCH))
        .take(SUMMARY_MAX_POINTS)
        .map(|t| format!("Turn {}: {}", t.turn, t.user_action))
        .collect();
    (!points.is_empty()).then(|| format!("Earlier events: {}", points.join("; ")))
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn format_memories(out: &mut String, entries: &[MemoryEntry]) {
    for m in entries {
        let _ = writeln!(out, "- [{}] {}", m.scope, m.content);
    }
}

pub fn build_user_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    let state = serde_json::to_string_pretty(ctx.game_state).unwrap_or_else(|_| "{}".to_string());
    let _ = writeln!(out, "TURN {}\n\nCURRENT STATE:\n{state}\n", ctx.turn);

    let background = if ctx.world_background.trim().is_empty() {
        "Unknown".to_string()
    } else {
        truncate(ctx.world_background, WORLD_BACKGROUND_CHARS)
    };
    let _ = writeln!(out, "WORLD BACKGROUND:\n{background}\n");

    out.push_str("RECENT TURNS:\n");
    let recent = recent_turns(ctx.turn_history);
    if recent.is_empty() {
        out.push_str("No previous turns\n");
    }
    for t in recent {
        let _ = writeln!(out, "Turn {}: {}", t.turn, t.user_action);
        let _ = writeln!(
            out,
            "  Narrative: {}...",
            truncate(&t.narrative, NARRATIVE_PREVIEW_CHARS)
        );
    }

    let summary = history_summary(ctx.turn_history)
        .unwrap_or_else(|| "This is the beginning of the story".to_string());
    let _ = writeln!(out, "\nHISTORY:\n{summary}\n");

    out.push_str("ENTITIES:\n");
    if ctx.entities.is_empty() {
        out.push_str("No entities yet\n");
    }
    for e in ctx.entities.iter().take(MAX_ENTITIES) {
        let id = e.get("id").and_then(Value::as_str).unwrap_or("unknown");
        let kind = e.get("type").and_then(Value::as_str).unwrap_or("entity");
        let _ = writeln!(out, "- {id}: {kind}");
    }

    let _ = writeln!(out, "\nMEMORIES OF {}:", ctx.pov_entity);
    if ctx.private_memory.is_empty() {
        out.push_str("(none)\n");
    }
    format_memories(&mut out, ctx.private_memory);

    out.push_str("\nPUBLIC KNOWLEDGE:\n");
    if ctx.public_memory.values().all(Vec::is_empty) {
        out.push_str("(none)\n");
    }
    for (entity, entries) in ctx.public_memory {
        if entries.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{entity}:");
        format_memories(&mut out, entries);
    }

    let action = ctx
        .user_input
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_ACTION);
    let _ = write!(out, "\nPLAYER ACTION: {action}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turns(n: u64) -> Vec<TurnRecord> {
        (1..=n)
            .map(|i| TurnRecord::new(i, format!("action {i}"), format!("narrative {i}")))
            .collect()
    }

    #[test]
    fn test_pov_entity_resolution() {
        assert_eq!(pov_entity(&json!({"pov_entity": "elena"}), &[]), "elena");
        let entities = vec![json!({"id": "gob", "type": "npc"}), json!({"id": "hero", "type": "player"})];
        assert_eq!(pov_entity(&json!({}), &entities), "hero");
        assert_eq!(pov_entity(&json!({}), &[json!({"id": "gob"})]), "player");
    }

    #[test]
    fn test_history_summary_batches() {
        assert!(history_summary(&turns(3)).is_none());
        // 13 回合：较早 10 回合分两批，每批取前 2
        let summary = history_summary(&turns(13)).unwrap();
        assert_eq!(
            summary,
            "Earlier events: Turn 1: action 1; Turn 2: action 2; Turn 6: action 6; Turn 7: action 7"
        );
        assert_eq!(recent_turns(&turns(13)).len(), 3);
        assert_eq!(recent_turns(&turns(13))[0].turn, 11);
    }

    #[test]
    fn test_summary_caps_points() {
        let summary = history_summary(&turns(60)).unwrap();
        assert_eq!(summary.matches("Turn ").count(), 10);
    }

    #[test]
    fn test_prompt_includes_sections() {
        let state = json!({"hp": 10});
        let entities = vec![json!({"id": "hero", "type": "player"})];
        let history = turns(1);
        let private = vec![MemoryEntry {
            content: "fears wolves".into(),
            scope: "belief".into(),
            turn: 0,
            importance: 5,
        }];
        let public = BTreeMap::new();
        let prompt = build_user_prompt(&PromptContext {
            game_state: &state,
            entities: &entities,
            turn_history: &history,
            world_background: "",
            pov_entity: "hero",
            private_memory: &private,
            public_memory: &public,
            turn: 1,
            user_input: None,
        });
        assert!(prompt.contains("\"hp\": 10"));
        assert!(prompt.contains("WORLD BACKGROUND:\nUnknown"));
        assert!(prompt.contains("Turn 1: action 1"));
        assert!(prompt.contains("- hero: player"));
        assert!(prompt.contains("- [belief] fears wolves"));
        assert!(prompt.ends_with("PLAYER ACTION: Continue the story"));
    }
}
