//! Storyloom 演示入口
//!
//! 加载配置、初始化日志，用内存会话 / 内存记忆 / 脚本化 LLM 跑一个完整回合，并以 JSON 打印 Outcome。
//! 用法：`storyloom [玩家行动]`

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use storyloom::config::load_config;
use storyloom::llm::{ChatResponse, ScriptedLlmClient};
use storyloom::memory::{InMemoryMemoryStore, ToolCall};
use storyloom::session::{InMemorySessionStore, SessionRecord};
use storyloom::{observability, TurnDriver};

const DEMO_SESSION: &str = "demo";

fn demo_script() -> Vec<ChatResponse> {
    vec![
        ChatResponse::with_tool_calls(
            "Checking the party before the ambush.",
            vec![
                ToolCall::new("call_1", "read_state", json!({"path": "party[0].hp"})),
                ToolCall::new("call_2", "update_world", json!({"changes": {"time_of_day": "dusk"}})),
            ],
        ),
        ChatResponse::text("The scene is set; time to write the narrative."),
        ChatResponse::text(
            json!({
                "narrative": "Wolves burst from the treeline as dusk falls. Ayla takes a glancing bite but holds the line.",
                "state_changes": [
                    {"op": "dec", "path": "party[0].hp", "value": 3},
                    {"op": "addlog", "path": "", "value": "wolf ambush at dusk"}
                ],
                "hidden_memory_updates": [
                    {"target_id": "ayla", "content": "Wolves hunt this road at dusk", "visibility": "private", "scope": "event"}
                ],
                "suggested_actions": ["Light a torch", "Retreat to the wagon"]
            })
            .to_string(),
        ),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(None).context("Failed to load config")?;
    observability::init();
    tracing::info!(app = config.app_name(), "starting demo turn");

    let action = std::env::args().nth(1);

    let sessions = Arc::new(InMemorySessionStore::new());
    sessions
        .insert(
            SessionRecord::new(
                DEMO_SESSION,
                json!({
                    "party": [{"id": "ayla", "hp": 12}],
                    "world": {"location": "forest road"},
                    "pov_entity": "ayla"
                }),
            )
            .with_entities(vec![json!({"id": "ayla", "type": "player", "name": "Ayla"})])
            .with_world_background("A frontier kingdom where roads are only safe by daylight."),
        )
        .await;

    let mut memory = InMemoryMemoryStore::new();
    if let Some(path) = &config.memory.snapshot_path {
        memory = memory.with_snapshot_path(path);
    }

    let driver = TurnDriver::new(
        Arc::new(ScriptedLlmClient::new(demo_script())),
        Arc::new(memory),
        sessions.clone(),
        config.turn_config(),
    );
    let outcome = driver.process_turn(DEMO_SESSION, action.as_deref()).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?
    );
    Ok(())
}
