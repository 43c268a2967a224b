//! 回合驱动器
//!
//! 七阶段状态机：AGENT → (TOOLS → PROCESS_TOOLS | HANDLE_ERRORS → AGENT)* → OUTCOME → REFLECTION → DONE。
//! 每个阶段串行执行，挂起点只有 LLM 调用与工具批次；game_state 只在 DONE 时按一个有序批次修改一次。
//! 任何逃逸出状态机的故障都在 process_turn 顶层转为默认 Outcome，且不产生 DONE 副作用。

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{
    AgentState, ErrorClassifier, ErrorContext, ToolResultBatch, TurnError, TurnPhase, DEFAULT_ERROR_WINDOW,
};
use crate::llm::{ChatRequest, ChatResponse, LlmClient};
use crate::memory::{Message, MemoryStore, ToolCall};
use crate::outcome::{outcome_json_schema, Outcome, OutcomeParser};
use crate::session::{SessionRecord, SessionStore, SessionUpdate, TurnRecord};
use crate::tools::{build_registry, memory_tools, Tool, ToolExecutor, ToolRegistry, TurnScratch};
use crate::turn::prompt::{
    build_user_prompt, pov_entity, PromptContext, DEFAULT_ACTION, NARRATOR_SYSTEM, OUTCOME_REQUEST,
    REFLECTION_REQUEST,
};
use crate::turn::{Route, Router, TurnEvent, DEFAULT_MAX_ROUNDS};
use crate::world::StateMutator;

/// 工具结果事件预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 回合驱动器配置（对应配置文件 `[turn]` 段）
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// 每回合最多执行的工具批次数
    pub max_rounds: usize,
    /// 错误检测窗口（最近 N 条 tool 消息）
    pub error_window: usize,
    /// 每隔多少回合 consolidate 一次
    pub consolidation_interval: u64,
    /// 记忆总量超过该值时也触发 consolidate
    pub memory_volume_threshold: usize,
    pub consolidate_max_per_entity: usize,
    pub consolidate_importance_threshold: u8,
    pub tool_timeout_secs: u64,
    /// 是否执行 REFLECTION 阶段的记忆整理调用
    pub reflection: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            error_window: DEFAULT_ERROR_WINDOW,
            consolidation_interval: 10,
            memory_volume_threshold: 500,
            consolidate_max_per_entity: 50,
            consolidate_importance_threshold: 3,
            tool_timeout_secs: 30,
            reflection: true,
            max_tokens: None,
            temperature: None,
        }
    }
}

pub struct TurnDriver {
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn MemoryStore>,
    sessions: Arc<dyn SessionStore>,
    config: TurnConfig,
    router: Router,
    classifier: ErrorClassifier,
    parser: OutcomeParser,
    mutator: StateMutator,
    extra_tools: Vec<Arc<dyn Tool>>,
    event_tx: Option<UnboundedSender<TurnEvent>>,
    cancel_token: CancellationToken,
}

impl TurnDriver {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        memory: Arc<dyn MemoryStore>,
        sessions: Arc<dyn SessionStore>,
        config: TurnConfig,
    ) -> Self {
        Self {
            llm,
            memory,
            sessions,
            router: Router::new(config.max_rounds),
            classifier: ErrorClassifier::new(config.error_window),
            parser: OutcomeParser::new(),
            mutator: StateMutator::new(),
            extra_tools: Vec::new(),
            event_tx: None,
            cancel_token: CancellationToken::new(),
            config,
        }
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 设置取消令牌；取消后回合以默认 Outcome 结束，game_state 不变
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// 追加工具（与内置工具同名时覆盖内置工具）
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.extra_tools.push(Arc::new(tool));
        self
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// 执行一个完整回合；永不失败，驱动器故障时返回默认 Outcome
    pub async fn process_turn(&self, session_id: &str, user_input: Option<&str>) -> Outcome {
        match self.run_turn(session_id, user_input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(session_id, error = %e, "turn failed, returning fallback outcome");
                self.emit(TurnEvent::Error { text: e.to_string() });
                Outcome::fallback()
            }
        }
    }

    async fn run_turn(&self, session_id: &str, user_input: Option<&str>) -> Result<Outcome, TurnError> {
        let record = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| TurnError::SessionNotFound(session_id.to_string()))?;
        let turn_count = self.memory.get_turn_count().await;
        let mut state = AgentState::new(
            session_id,
            record.game_state.clone(),
            record.entities.clone(),
            turn_count,
            user_input.map(str::to_string),
        );

        let scratch = Arc::new(TurnScratch::new(&state.game_state, &state.entities));
        let executor = ToolExecutor::new(
            build_registry(Arc::clone(&scratch), Arc::clone(&self.memory), &self.extra_tools),
            self.config.tool_timeout_secs,
        );
        let opening = self.opening_prompt(&state, &record).await;
        state.messages.push(Message::system(NARRATOR_SYSTEM));
        state.messages.push(Message::user(opening));

        tracing::info!(session_id, turn = turn_count, "turn started");
        let mut phase = TurnPhase::Agent;
        let mut outcome: Option<Outcome> = None;

        loop {
            tracing::info!(session_id, phase = %phase, round = state.rounds(), "turn phase");
            self.emit(TurnEvent::Phase {
                phase,
                round: state.rounds(),
            });

            phase = match phase {
                TurnPhase::Agent => {
                    let specs = executor.specs();
                    let response = self
                        .chat(ChatRequest::new(&state.messages).with_tools(&specs))
                        .await?;
                    state.messages.push(response.into_message());

                    let decision = self.router.decide(&state);
                    tracing::debug!(route = %decision.route, reason = decision.reason, "route decided");
                    self.emit(TurnEvent::Route {
                        route: decision.route.to_string(),
                        reason: decision.reason.to_string(),
                    });
                    match decision.route {
                        Route::Tools => TurnPhase::Tools,
                        Route::Outcome => TurnPhase::Outcome,
                        Route::End => {
                            tracing::warn!(session_id, "nothing to finalize, using fallback outcome");
                            outcome = Some(Outcome::fallback());
                            TurnPhase::Done
                        }
                    }
                }
                TurnPhase::Tools => {
                    let calls: Vec<ToolCall> = state
                        .last_assistant()
                        .map(|m| m.tool_calls.clone())
                        .unwrap_or_default();
                    let results = self.run_tools(&executor, &calls).await?;
                    let round = state.rounds() + 1;
                    state
                        .tool_result_batches
                        .push(ToolResultBatch::summarize(round, &calls, &results));
                    let has_errors = results.iter().any(Message::is_error_tagged);
                    state.messages.extend(results);
                    if has_errors {
                        TurnPhase::HandleErrors
                    } else {
                        TurnPhase::ProcessTools
                    }
                }
                TurnPhase::ProcessTools => {
                    if let Some(batch) = state.tool_result_batches.last() {
                        tracing::info!(
                            round = batch.round,
                            tools = batch.tools_in_batch,
                            success_rate = batch.success_rate,
                            effectiveness = ?batch.effectiveness,
                            "tool batch processed"
                        );
                    }
                    state.error_recovery_active = false;
                    state.error_context = None;
                    TurnPhase::Agent
                }
                TurnPhase::HandleErrors => {
                    self.handle_errors(&mut state);
                    TurnPhase::Agent
                }
                TurnPhase::Outcome => {
                    state.messages.push(Message::user(OUTCOME_REQUEST));
                    let schema = outcome_json_schema();
                    let response = self
                        .chat(ChatRequest::new(&state.messages).with_json_schema(&schema))
                        .await?;
                    let parsed = self.parser.parse(&response.content);
                    state.messages.push(Message::assistant(response.content));
                    outcome = Some(parsed);
                    if self.config.reflection {
                        TurnPhase::Reflection
                    } else {
                        TurnPhase::Done
                    }
                }
                TurnPhase::Reflection => {
                    self.reflect(&mut state).await?;
                    TurnPhase::Done
                }
                TurnPhase::Done => break,
            };
        }

        let outcome = outcome.unwrap_or_else(Outcome::fallback);
        if self.cancel_token.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        self.commit(&mut state, &scratch, &outcome, user_input).await?;

        self.emit(TurnEvent::Outcome {
            narrative: outcome.narrative.clone(),
            state_changes: outcome.state_changes.len(),
            fallback: outcome.is_fallback(),
        });
        tracing::info!(
            session_id,
            rounds = state.rounds(),
            messages = state.messages.len(),
            "turn completed"
        );
        Ok(outcome)
    }

    async fn opening_prompt(&self, state: &AgentState, record: &SessionRecord) -> String {
        let pov = pov_entity(&state.game_state, &state.entities);
        let private_memory = self.memory.get_private_memory(&pov).await;
        let public_memory = self.memory.get_public_memory().await;
        build_user_prompt(&PromptContext {
            game_state: &state.game_state,
            entities: &state.entities,
            turn_history: &record.turn_history,
            world_background: &record.world_background,
            pov_entity: &pov,
            private_memory: &private_memory,
            public_memory: &public_memory,
            turn: state.turn_count,
            user_input: state.user_input.as_deref(),
        })
    }

    async fn run_tools(&self, executor: &ToolExecutor, calls: &[ToolCall]) -> Result<Vec<Message>, TurnError> {
        for call in calls {
            self.emit(TurnEvent::ToolCall {
                id: call.id.clone(),
                tool: call.name.clone(),
                args: call.args.clone(),
            });
        }
        let results = self.cancellable(executor.execute_batch(calls)).await?;
        for result in &results {
            self.emit(TurnEvent::ToolResult {
                id: result.tool_call_id.clone().unwrap_or_default(),
                preview: result.content.chars().take(RESULT_PREVIEW_CHARS).collect(),
                is_error: result.is_error_tagged(),
            });
        }
        Ok(results)
    }

    /// 分析最近的工具错误并注入一条恢复引导
    fn handle_errors(&self, state: &mut AgentState) {
        let errors = self.classifier.recent_errors(&state.messages);
        let analysis = self.classifier.analyze(&errors);
        let action = self.classifier.recovery_action(&analysis);
        let details: Vec<String> = errors.iter().map(|m| m.content.clone()).collect();
        tracing::warn!(
            error_count = analysis.error_count,
            severity = ?analysis.severity,
            recoverable = analysis.recoverable,
            strategy = ?action,
            "tool errors detected"
        );
        self.emit(TurnEvent::Recovery {
            severity: analysis.severity,
            strategy: format!("{action:?}"),
            guidance: action.guidance().to_string(),
        });

        state.messages.push(Message::user(action.guidance()));
        state.error_recovery_active = true;
        state.error_context = Some(ErrorContext {
            analysis,
            details,
            recovery_strategy: action,
        });
    }

    /// 可选的记忆整理：只开放记忆类工具；LLM 失败只记录告警
    async fn reflect(&self, state: &mut AgentState) -> Result<(), TurnError> {
        let mut registry = ToolRegistry::new();
        for tool in memory_tools(Arc::clone(&self.memory)) {
            registry.register_arc(tool);
        }
        let executor = ToolExecutor::new(registry, self.config.tool_timeout_secs);
        let specs = executor.specs();

        state.messages.push(Message::user(REFLECTION_REQUEST));
        let response = match self
            .chat(ChatRequest::new(&state.messages).with_tools(&specs))
            .await
        {
            Ok(response) => response,
            Err(TurnError::Cancelled) => return Err(TurnError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "reflection skipped");
                return Ok(());
            }
        };
        let calls = response.tool_calls.clone();
        state.messages.push(response.into_message());
        if !calls.is_empty() {
            let results = self.run_tools(&executor, &calls).await?;
            state.messages.extend(results);
        }
        Ok(())
    }

    /// DONE 阶段副作用（按序）：应用状态变更 → 转发记忆 → 回合数 +1 → 按需 consolidate → 持久化会话 → 记忆快照
    async fn commit(
        &self,
        state: &mut AgentState,
        scratch: &TurnScratch,
        outcome: &Outcome,
        user_input: Option<&str>,
    ) -> Result<(), TurnError> {
        let staged = scratch.staged().await;
        let mut ops = staged.ops;
        ops.extend(outcome.state_changes.iter().cloned());
        let report = self.mutator.apply(&mut state.game_state, &ops);
        state.entities.extend(staged.entities);
        tracing::info!(
            applied = report.applied,
            skipped = report.skipped.len(),
            "state changes applied"
        );

        self.forward_memory(outcome).await;

        self.memory.increment_turn().await;
        let turn = self.memory.get_turn_count().await;
        let interval = self.config.consolidation_interval.max(1);
        let volume = self.memory.memory_volume().await;
        if turn % interval == 0 || volume > self.config.memory_volume_threshold {
            let report = self
                .memory
                .consolidate(
                    self.config.consolidate_max_per_entity,
                    self.config.consolidate_importance_threshold,
                )
                .await;
            tracing::info!(turn, volume, removed = report.memories_removed, "memory consolidation");
        }
        let user_action = user_input
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_ACTION);
        self.sessions
            .update(
                &state.session_id,
                SessionUpdate {
                    game_state: Some(state.game_state.clone()),
                    entities: Some(state.entities.clone()),
                    turn: Some(turn),
                    append_turn: Some(TurnRecord::new(turn, user_action, outcome.narrative.clone())),
                },
            )
            .await?;
        state.turn_count = turn;

        // 会话已持久化；快照失败只影响记忆的落盘，不回滚本回合
        if let Err(e) = self.memory.save().await {
            tracing::warn!(error = %e, turn, "memory snapshot failed");
        }
        Ok(())
    }

    async fn forward_memory(&self, outcome: &Outcome) {
        for update in outcome.hidden_memory_updates.iter().flatten() {
            if update.target_id.trim().is_empty() || update.content.trim().is_empty() {
                tracing::warn!(target_id = %update.target_id, "skipping empty memory update");
                continue;
            }
            match update.visibility.as_str() {
                "public" => {
                    self.memory
                        .update_public_memory(&update.target_id, &update.content)
                        .await
                }
                other => {
                    if other != "private" {
                        tracing::warn!(visibility = other, target_id = %update.target_id, "unknown visibility, storing as private");
                    }
                    self.memory
                        .update_private_memory(&update.target_id, &update.content, &update.scope)
                        .await
                }
            }
        }
        for update in outcome.emotional_state_updates.iter().flatten() {
            self.memory
                .update_emotional_state(
                    &update.entity_id,
                    &update.emotion,
                    update.intensity,
                    update.cause.as_deref(),
                    update.target_entity.as_deref(),
                )
                .await;
        }
    }

    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, TurnError> {
        let request = request.with_sampling(self.config.max_tokens, self.config.temperature);
        Ok(self.cancellable(self.llm.chat(request)).await??)
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, TurnError> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(TurnError::Cancelled),
            out = fut => Ok(out),
        }
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
