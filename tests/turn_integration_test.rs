//! 回合驱动器集成测试：用脚本化 LLM + 内存会话 / 记忆跑完整回合

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use storyloom::core::{RecoveryAction, TurnPhase};
use storyloom::llm::{ChatResponse, LlmError, ScriptedLlmClient};
use storyloom::memory::{InMemoryMemoryStore, MemoryStore, Role, ToolCall};
use storyloom::session::{InMemorySessionStore, SessionRecord, SessionStore};
use storyloom::tools::Tool;
use storyloom::turn::{TurnConfig, TurnDriver, TurnEvent};
use storyloom::FALLBACK_NARRATIVE;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SESSION: &str = "s1";

struct Harness {
    sessions: Arc<InMemorySessionStore>,
    memory: Arc<InMemoryMemoryStore>,
    llm: Arc<ScriptedLlmClient>,
}

impl Harness {
    async fn new(game_state: Value, llm: ScriptedLlmClient) -> Self {
        Self::with_memory(game_state, llm, InMemoryMemoryStore::new()).await
    }

    async fn with_memory(game_state: Value, llm: ScriptedLlmClient, memory: InMemoryMemoryStore) -> Self {
        let sessions = Arc::new(InMemorySessionStore::new());
        sessions.insert(SessionRecord::new(SESSION, game_state)).await;
        Self {
            sessions,
            memory: Arc::new(memory),
            llm: Arc::new(llm),
        }
    }

    fn driver(&self, config: TurnConfig) -> TurnDriver {
        TurnDriver::new(self.llm.clone(), self.memory.clone(), self.sessions.clone(), config)
    }

    async fn record(&self) -> SessionRecord {
        self.sessions.get(SESSION).await.unwrap().unwrap()
    }
}

fn no_reflection() -> TurnConfig {
    TurnConfig {
        reflection: false,
        ..TurnConfig::default()
    }
}

fn outcome_response(outcome: Value) -> ChatResponse {
    ChatResponse::text(outcome.to_string())
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

fn phase_count(events: &[TurnEvent], target: TurnPhase) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TurnEvent::Phase { phase, .. } if *phase == target))
        .count()
}

struct Explode;

#[async_trait]
impl Tool for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Fails internally"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        panic!("internal failure")
    }
}

struct Slow;

#[async_trait]
impl Tool for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Takes a long time"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok("finally done".to_string())
    }
}

struct Beacon {
    lit: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for Beacon {
    fn name(&self) -> &str {
        "beacon"
    }

    fn description(&self) -> &str {
        "Lights a beacon after a short delay"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.lit.store(true, Ordering::SeqCst);
        Ok("beacon lit".to_string())
    }
}

#[tokio::test]
async fn test_dec_health_end_to_end() {
    let llm = ScriptedLlmClient::new(vec![
        ChatResponse::text("Ready to write the outcome."),
        outcome_response(json!({
            "narrative": "An arrow strikes you.",
            "state_changes": [{"op": "dec", "path": "health", "value": 30}]
        })),
    ]);
    let h = Harness::new(json!({"health": 100}), llm).await;

    let outcome = h.driver(no_reflection()).process_turn(SESSION, Some("Charge")).await;

    assert_eq!(outcome.narrative, "An arrow strikes you.");
    let record = h.record().await;
    assert_eq!(record.game_state, json!({"health": 70}));
    assert_eq!(record.turn, 1);
    assert_eq!(record.turn_history.len(), 1);
    assert_eq!(record.turn_history[0].user_action, "Charge");
    assert_eq!(h.memory.get_turn_count().await, 1);
}

#[tokio::test]
async fn test_failed_call_in_batch_keeps_order() {
    let llm = ScriptedLlmClient::new(vec![
        ChatResponse::with_tool_calls(
            "",
            vec![
                ToolCall::new("c1", "read_state", json!({"path": "health"})),
                ToolCall::new("c2", "explode", json!({})),
                ToolCall::new("c3", "read_state", json!({"path": "gold"})),
            ],
        ),
        ChatResponse::text("Let me conclude."),
        outcome_response(json!({"narrative": "Smoke clears.", "state_changes": []})),
    ]);
    let h = Harness::new(json!({"health": 10, "gold": 3}), llm).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let driver = h.driver(no_reflection()).with_tool(Explode).with_event_tx(tx);
    let outcome = driver.process_turn(SESSION, None).await;
    assert_eq!(outcome.narrative, "Smoke clears.");

    // 第二次请求（回到 AGENT）里能看到完整的工具结果与恢复引导
    let requests = h.llm.requests().await;
    let second = &requests[1].messages;
    let tool_msgs: Vec<_> = second.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_msgs.len(), 3);
    let ids: Vec<_> = tool_msgs.iter().map(|m| m.tool_call_id.as_deref().unwrap()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
    assert_eq!(tool_msgs[0].content, "State at health: 10");
    assert!(tool_msgs[1].content.starts_with("Error:"));
    assert_eq!(tool_msgs[2].content, "State at gold: 3");

    let last = second.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, RecoveryAction::RetryOrProceed.guidance());

    let events = drain(&mut rx);
    assert_eq!(phase_count(&events, TurnPhase::HandleErrors), 1);
    assert_eq!(phase_count(&events, TurnPhase::ProcessTools), 0);
}

#[tokio::test]
async fn test_endless_tool_calls_stop_at_round_limit() {
    let llm = ScriptedLlmClient::new(Vec::new()).with_fallback(ChatResponse::with_tool_calls(
        "Checking again...",
        vec![ToolCall::new("c", "read_state", json!({"path": "hp"}))],
    ));
    let h = Harness::new(json!({"hp": 5}), llm).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = h
        .driver(no_reflection())
        .with_event_tx(tx)
        .process_turn(SESSION, None)
        .await;

    // 6 次 AGENT + 1 次 OUTCOME
    assert_eq!(h.llm.request_count().await, 7);
    let events = drain(&mut rx);
    assert_eq!(phase_count(&events, TurnPhase::Agent), 6);
    assert_eq!(phase_count(&events, TurnPhase::Tools), 5);
    assert_eq!(phase_count(&events, TurnPhase::Outcome), 1);
    let last_route = events
        .iter()
        .rev()
        .find_map(|e| match e {
            TurnEvent::Route { route, reason } => Some((route.clone(), reason.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_route.0, "OUTCOME");
    assert!(last_route.1.contains("round limit"));

    assert_eq!(outcome.narrative, FALLBACK_NARRATIVE);
    assert_eq!(h.record().await.game_state, json!({"hp": 5}));
}

#[tokio::test]
async fn test_staged_tool_edits_apply_before_outcome_edits() {
    let llm = ScriptedLlmClient::new(vec![
        ChatResponse::with_tool_calls(
            "",
            vec![
                ToolCall::new("c1", "update_state", json!({"op": "set", "path": "health", "value": 50})),
                ToolCall::new(
                    "c2",
                    "create_character",
                    json!({"id": "marcus", "type": "npc", "name": "Marcus"}),
                ),
            ],
        ),
        ChatResponse::text("In summary, the smith arrives."),
        outcome_response(json!({
            "narrative": "Marcus patches your wounds, badly.",
            "state_changes": [{"op": "dec", "path": "health", "value": 10}]
        })),
    ]);
    let h = Harness::new(json!({"health": 100, "entities": []}), llm).await;

    h.driver(no_reflection()).process_turn(SESSION, None).await;

    let record = h.record().await;
    assert_eq!(record.game_state["health"], json!(40));
    assert_eq!(record.game_state["entities"][0]["id"], "marcus");
    assert_eq!(record.entities.len(), 1);
    assert_eq!(record.entities[0]["name"], "Marcus");
}

#[tokio::test]
async fn test_memory_updates_forwarded() {
    let llm = ScriptedLlmClient::new(vec![
        ChatResponse::text("Outcome time."),
        outcome_response(json!({
            "narrative": "Elena glares at the stranger.",
            "state_changes": [],
            "hidden_memory_updates": [
                {"target_id": "elena", "content": "The stranger lied", "visibility": "private", "scope": "belief"},
                {"target_id": "town", "content": "A stranger arrived", "visibility": "public"},
                {"target_id": "elena", "content": "Odd visibility", "visibility": "secret"},
                {"target_id": "", "content": "Nobody", "visibility": "private"}
            ],
            "emotional_state_updates": [
                {"entity_id": "elena", "emotion": "anger", "intensity": 0.7, "target_entity": "player"}
            ]
        })),
    ]);
    let h = Harness::new(json!({}), llm).await;

    h.driver(no_reflection()).process_turn(SESSION, None).await;

    let private = h.memory.get_private_memory("elena").await;
    assert_eq!(private.len(), 2);
    assert_eq!(private[0].scope, "belief");
    assert_eq!(private[1].content, "Odd visibility");
    assert_eq!(h.memory.get_public_memory().await["town"][0].content, "A stranger arrived");
    let emotions = h.memory.emotional_history("elena").await;
    assert_eq!(emotions[0].emotion, "anger");
    assert_eq!(emotions[0].target.as_deref(), Some("player"));
    assert_eq!(h.memory.memory_volume().await, 3);
}

async fn seeded_memory(turn: u64) -> InMemoryMemoryStore {
    let memory = InMemoryMemoryStore::with_turn_count(turn);
    for i in 0..5 {
        memory.update_private_memory("elena", &format!("memory {i}"), "event").await;
    }
    memory
}

fn consolidating_config() -> TurnConfig {
    TurnConfig {
        consolidate_max_per_entity: 2,
        ..no_reflection()
    }
}

#[tokio::test]
async fn test_consolidation_runs_every_tenth_turn() {
    let script = || {
        ScriptedLlmClient::new(vec![
            ChatResponse::text("outcome"),
            outcome_response(json!({"narrative": "Time passes.", "state_changes": []})),
        ])
    };

    let h = Harness::with_memory(json!({}), script(), seeded_memory(9).await).await;
    h.driver(consolidating_config()).process_turn(SESSION, None).await;
    assert_eq!(h.memory.get_turn_count().await, 10);
    assert_eq!(h.memory.get_private_memory("elena").await.len(), 2);

    let h = Harness::with_memory(json!({}), script(), seeded_memory(3).await).await;
    h.driver(consolidating_config()).process_turn(SESSION, None).await;
    assert_eq!(h.memory.get_turn_count().await, 4);
    assert_eq!(h.memory.get_private_memory("elena").await.len(), 5);
}

#[tokio::test]
async fn test_cancelled_turn_leaves_state_unchanged() {
    let llm = ScriptedLlmClient::new(vec![ChatResponse::with_tool_calls(
        "",
        vec![
            ToolCall::new("c1", "update_state", json!({"op": "set", "path": "health", "value": 1})),
            ToolCall::new("c2", "slow", json!({})),
        ],
    )]);
    let h = Harness::new(json!({"health": 100}), llm).await;
    let token = CancellationToken::new();
    let driver = h.driver(no_reflection()).with_tool(Slow).with_cancel_token(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let outcome = driver.process_turn(SESSION, None).await;
    canceller.await.unwrap();

    assert!(outcome.is_fallback());
    let record = h.record().await;
    assert_eq!(record.game_state, json!({"health": 100}));
    assert!(record.turn_history.is_empty());
    assert_eq!(h.memory.get_turn_count().await, 0);
}

#[tokio::test]
async fn test_cancelled_turn_stops_running_tools() {
    let llm = ScriptedLlmClient::new(vec![ChatResponse::with_tool_calls(
        "",
        vec![ToolCall::new("b1", "beacon", json!({}))],
    )]);
    let h = Harness::new(json!({}), llm).await;
    let lit = Arc::new(AtomicBool::new(false));
    let token = CancellationToken::new();
    let driver = h
        .driver(no_reflection())
        .with_tool(Beacon { lit: Arc::clone(&lit) })
        .with_cancel_token(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let outcome = driver.process_turn(SESSION, None).await;
    canceller.await.unwrap();
    assert!(outcome.is_fallback());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!lit.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_snapshot_failure_keeps_turn_committed() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let memory = InMemoryMemoryStore::new().with_snapshot_path(blocker.join("memory.json"));

    let llm = ScriptedLlmClient::new(vec![
        ChatResponse::text("Writing it up."),
        outcome_response(json!({
            "narrative": "The bell tolls twice.",
            "state_changes": [{"op": "inc", "path": "bells", "value": 2}]
        })),
    ]);
    let h = Harness::with_memory(json!({"bells": 0}), llm, memory).await;

    let outcome = h.driver(no_reflection()).process_turn(SESSION, None).await;

    assert_eq!(outcome.narrative, "The bell tolls twice.");
    let record = h.record().await;
    assert_eq!(record.game_state, json!({"bells": 2}));
    assert_eq!(record.turn, 1);
    assert_eq!(h.memory.get_turn_count().await, record.turn);
}

#[tokio::test]
async fn test_driver_faults_have_no_side_effects() {
    // 会话不存在
    let h = Harness::new(json!({"hp": 1}), ScriptedLlmClient::new(Vec::new())).await;
    let outcome = h.driver(no_reflection()).process_turn("missing", None).await;
    assert!(outcome.is_fallback());
    assert_eq!(h.llm.request_count().await, 0);
    assert_eq!(h.memory.get_turn_count().await, 0);

    // LLM 故障
    let llm = ScriptedLlmClient::from_results(vec![Err(LlmError::Network("connection reset".into()))]);
    let h = Harness::new(json!({"hp": 1}), llm).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = h
        .driver(no_reflection())
        .with_event_tx(tx)
        .process_turn(SESSION, None)
        .await;
    assert_eq!(outcome.narrative, FALLBACK_NARRATIVE);
    assert_eq!(h.record().await.game_state, json!({"hp": 1}));
    assert_eq!(h.memory.get_turn_count().await, 0);
    assert!(drain(&mut rx).iter().any(|e| matches!(e, TurnEvent::Error { .. })));
}

#[tokio::test]
async fn test_reflection_records_memories() {
    let llm = ScriptedLlmClient::new(vec![
        ChatResponse::text("Story beat done."),
        outcome_response(json!({"narrative": "The lantern gutters out.", "state_changes": []})),
        ChatResponse::with_tool_calls(
            "",
            vec![ToolCall::new(
                "r1",
                "add_memory",
                json!({"entity_id": "player", "content": "The lantern is out of oil", "scope": "event"}),
            )],
        ),
    ]);
    let h = Harness::new(json!({}), llm).await;

    let outcome = h.driver(TurnConfig::default()).process_turn(SESSION, None).await;

    assert_eq!(outcome.narrative, "The lantern gutters out.");
    assert_eq!(h.llm.request_count().await, 3);
    let private = h.memory.get_private_memory("player").await;
    assert_eq!(private.len(), 1);
    assert_eq!(private[0].content, "The lantern is out of oil");
    // 反思阶段只开放记忆类工具
    let reflection_tools = &h.llm.requests().await[2].tool_names;
    assert_eq!(reflection_tools, &vec!["add_memories".to_string(), "add_memory".to_string()]);
}
