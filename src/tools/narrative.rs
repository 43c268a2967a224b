//! 叙事内置工具
//!
//! 写状态类工具（update_state / create_character / update_world）不直接改 game_state，
//! 只把编辑暂存到本回合的 TurnScratch；DONE 阶段由驱动器把暂存编辑排在 Outcome 编辑之前一次性应用。
//! 记忆类工具（add_memory / add_memories）直接写入 MemoryStore（其内部自行串行化）。
//! 以上工具均声明为 sequential：同一批内按调用顺序依次执行，暂存编辑的顺序与调用顺序一致。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::memory::MemoryStore;
use crate::tools::{Tool, ToolRegistry};
use crate::world::path::lookup;
use crate::world::{parse_path, StateChangeOp, StateMutator, StateOp};

/// 本回合暂存的编辑
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StagedEdits {
    pub ops: Vec<StateChangeOp>,
    pub entities: Vec<Value>,
}

#[derive(Debug)]
struct ScratchInner {
    /// 回合开始时的状态叠加已暂存编辑后的视图，仅供工具读取
    view: Value,
    entity_ids: BTreeSet<String>,
    staged: StagedEdits,
}

/// 每回合一份的暂存区
#[derive(Debug)]
pub struct TurnScratch {
    inner: Mutex<ScratchInner>,
    mutator: StateMutator,
}

fn entity_id(entity: &Value) -> Option<&str> {
    entity.get("id").and_then(Value::as_str)
}

impl TurnScratch {
    pub fn new(game_state: &Value, entities: &[Value]) -> Self {
        Self {
            inner: Mutex::new(ScratchInner {
                view: game_state.clone(),
                entity_ids: entities.iter().filter_map(entity_id).map(str::to_string).collect(),
                staged: StagedEdits::default(),
            }),
            mutator: StateMutator::new(),
        }
    }

    /// 读取视图中的值；路径不存在时返回 None
    pub async fn read(&self, path: &str) -> Result<Option<Value>, String> {
        let segments = parse_path(path).map_err(|e| e.to_string())?;
        let inner = self.inner.lock().await;
        Ok(lookup(&inner.view, &segments).cloned())
    }

    /// 先在视图上试应用，成功才暂存
    pub async fn stage_op(&self, op: StateChangeOp) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        self.mutator
            .apply_one(&mut inner.view, &op)
            .map_err(|e| format!("cannot stage {} at '{}': {e}", op.op, op.path))?;
        inner.staged.ops.push(op);
        Ok(())
    }

    /// 暂存新实体；id 重复时拒绝。视图中存在 entities 列表时同步暂存一条 push
    pub async fn stage_entity(&self, entity: Value) -> Result<(), String> {
        let id = entity_id(&entity)
            .ok_or_else(|| "entity must have a string 'id'".to_string())?
            .to_string();
        let mut inner = self.inner.lock().await;
        if inner.entity_ids.contains(&id) {
            return Err(format!(
                "Character with id '{id}' already exists. Use their existing id instead of creating a duplicate."
            ));
        }
        if inner.view.get("entities").is_some_and(Value::is_array) {
            let push = StateChangeOp::new(StateOp::Push, "entities", entity.clone());
            self.mutator
                .apply_one(&mut inner.view, &push)
                .map_err(|e| e.to_string())?;
            inner.staged.ops.push(push);
        }
        inner.entity_ids.insert(id);
        inner.staged.entities.push(entity);
        Ok(())
    }

    pub async fn staged(&self) -> StagedEdits {
        self.inner.lock().await.staged.clone()
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[derive(Deserialize, JsonSchema)]
struct ReadStateArgs {
    /// 点号/下标路径，如 `party[0].hp`
    path: String,
}

pub struct ReadStateTool {
    scratch: Arc<TurnScratch>,
}

#[async_trait]
impl Tool for ReadStateTool {
    fn name(&self) -> &str {
        "read_state"
    }

    fn sequential(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Read a value from the current game state by path, e.g. 'party[0].hp' or 'world.weather'."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ReadStateArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let ReadStateArgs { path } = parse_args(args)?;
        let value = self.scratch.read(&path).await?.unwrap_or(Value::Null);
        Ok(format!("State at {path}: {value}"))
    }
}

#[derive(Deserialize, JsonSchema)]
struct UpdateStateArgs {
    /// set / inc / dec / mul / patch / push / pop / addlog
    op: String,
    path: String,
    #[serde(default)]
    value: Value,
}

pub struct UpdateStateTool {
    scratch: Arc<TurnScratch>,
}

#[async_trait]
impl Tool for UpdateStateTool {
    fn name(&self) -> &str {
        "update_state"
    }

    fn sequential(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Stage a state change: op is one of set, inc, dec, mul, patch, push, pop, addlog. \
         The change is applied together with the turn outcome."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<UpdateStateArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let UpdateStateArgs { op, path, value } = parse_args(args)?;
        let op: StateOp = op.parse().map_err(|_| format!("invalid operation '{op}'"))?;
        let summary = format!("State updated: {op} {path} = {value}");
        self.scratch.stage_op(StateChangeOp::new(op, path, value)).await?;
        Ok(summary)
    }
}

#[derive(Deserialize, JsonSchema)]
struct CreateCharacterArgs {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    background: Option<String>,
}

pub struct CreateCharacterTool {
    scratch: Arc<TurnScratch>,
}

#[async_trait]
impl Tool for CreateCharacterTool {
    fn name(&self) -> &str {
        "create_character"
    }

    fn sequential(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Add a NEW character/entity to the game world. Only use this for characters that don't exist yet. \
         Provide id, type, name, and optionally background."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<CreateCharacterArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let CreateCharacterArgs {
            id,
            kind,
            name,
            background,
        } = parse_args(args)?;
        let mut entity = serde_json::json!({"id": id, "type": kind, "name": name});
        if let Some(bg) = background.filter(|b| !b.is_empty()) {
            entity["background"] = Value::String(bg);
        }
        self.scratch.stage_entity(entity).await?;
        Ok(format!("Character created: {name} ({id}) - {kind}"))
    }
}

pub struct UpdateWorldTool {
    scratch: Arc<TurnScratch>,
}

#[async_trait]
impl Tool for UpdateWorldTool {
    fn name(&self) -> &str {
        "update_world"
    }

    fn sequential(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Update world state like time, weather, locations. Pass key-value pairs in 'changes' \
         (e.g. {\"changes\": {\"time_of_day\": \"evening\"}})."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "changes": {"type": "object", "description": "key-value pairs merged into world"}
            },
            "required": ["changes"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        // 兼容直接平铺的键值对
        let changes: Map<String, Value> = match args {
            Value::Object(mut map) => match map.remove("changes") {
                Some(Value::Object(changes)) => changes,
                Some(_) => return Err("invalid arguments: 'changes' must be an object".to_string()),
                None => map,
            },
            _ => return Err("invalid arguments: expected an object".to_string()),
        };
        if changes.is_empty() {
            return Ok("No changes provided".to_string());
        }

        let world_is_map = self.scratch.read("world").await?.is_some_and(|w| w.is_object());
        if !world_is_map {
            self.scratch
                .stage_op(StateChangeOp::new(StateOp::Set, "world", Value::Object(Map::new())))
                .await?;
        }
        let summary = format!("World updated: {}", Value::Object(changes.clone()));
        self.scratch
            .stage_op(StateChangeOp::new(StateOp::Patch, "world", Value::Object(changes)))
            .await?;
        Ok(summary)
    }
}

#[derive(Deserialize, JsonSchema)]
struct MemoryArgs {
    entity_id: String,
    content: String,
    /// private（默认）/ public
    #[serde(default = "default_visibility")]
    visibility: String,
    /// belief / relationship / event / location / goal / general
    #[serde(default = "default_scope")]
    scope: String,
}

fn default_visibility() -> String {
    "private".to_string()
}

fn default_scope() -> String {
    "general".to_string()
}

async fn write_memory(memory: &dyn MemoryStore, args: &MemoryArgs) -> String {
    if args.visibility == "public" {
        memory.update_public_memory(&args.entity_id, &args.content).await;
    } else {
        memory
            .update_private_memory(&args.entity_id, &args.content, &args.scope)
            .await;
    }
    let scope = if args.scope == "general" {
        String::new()
    } else {
        format!(" ({})", args.scope)
    };
    format!(
        "Memory added for {}{scope}: {}...",
        args.entity_id,
        truncate(&args.content, 50)
    )
}

pub struct AddMemoryTool {
    memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for AddMemoryTool {
    fn name(&self) -> &str {
        "add_memory"
    }

    fn sequential(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Record a memory for an entity. visibility is private (default) or public; \
         scope is one of belief, relationship, event, location, goal, general."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<MemoryArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: MemoryArgs = parse_args(args)?;
        if args.entity_id.is_empty() || args.content.is_empty() {
            return Err("invalid arguments: entity_id and content must be non-empty".to_string());
        }
        Ok(write_memory(self.memory.as_ref(), &args).await)
    }
}

#[derive(Deserialize, JsonSchema)]
struct BatchMemoryArgs {
    memories: Vec<Value>,
}

pub struct AddMemoriesTool {
    memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for AddMemoriesTool {
    fn name(&self) -> &str {
        "add_memories"
    }

    fn sequential(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Add multiple memories in a single call. Accepts a list of objects with entity_id, content, \
         visibility and scope."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<BatchMemoryArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let BatchMemoryArgs { memories } = parse_args(args)?;
        let mut processed = 0;
        for raw in memories {
            match serde_json::from_value::<MemoryArgs>(raw.clone()) {
                Ok(m) if !m.entity_id.is_empty() && !m.content.is_empty() => {
                    write_memory(self.memory.as_ref(), &m).await;
                }
                _ => tracing::warn!(memory = %raw, "skipped invalid memory"),
            }
            processed += 1;
        }
        Ok(format!("Batch memory update completed. {processed} memories processed."))
    }
}

/// 本回合的全部内置工具
pub fn narrative_tools(scratch: Arc<TurnScratch>, memory: Arc<dyn MemoryStore>) -> Vec<Arc<dyn Tool>> {
    let state_tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ReadStateTool {
            scratch: Arc::clone(&scratch),
        }),
        Arc::new(UpdateStateTool {
            scratch: Arc::clone(&scratch),
        }),
        Arc::new(CreateCharacterTool {
            scratch: Arc::clone(&scratch),
        }),
        Arc::new(UpdateWorldTool { scratch }),
    ];
    state_tools.into_iter().chain(memory_tools(memory)).collect()
}

/// 仅记忆类工具（REFLECTION 阶段使用）
pub fn memory_tools(memory: Arc<dyn MemoryStore>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(AddMemoryTool {
            memory: Arc::clone(&memory),
        }),
        Arc::new(AddMemoriesTool { memory }),
    ]
}

/// 内置工具 + 额外工具（同名时额外工具覆盖内置）
pub fn build_registry(
    scratch: Arc<TurnScratch>,
    memory: Arc<dyn MemoryStore>,
    extra: &[Arc<dyn Tool>],
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in narrative_tools(scratch, memory) {
        registry.register_arc(tool);
    }
    for tool in extra {
        registry.register_arc(Arc::clone(tool));
    }
    registry
}
