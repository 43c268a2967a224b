//! 会话存储抽象层
//!
//! 驱动器只通过 get / update 访问会话；实现方负责串行化同一会话的读写。
//! InMemorySessionStore 为内存实现，供测试与演示使用。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session backend error: {0}")]
    Backend(String),
}

/// 一个已完成回合的记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u64,
    pub user_action: String,
    pub narrative: String,
    pub recorded_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn new(turn: u64, user_action: impl Into<String>, narrative: impl Into<String>) -> Self {
        Self {
            turn,
            user_action: user_action.into(),
            narrative: narrative.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// 持久化的会话快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub game_state: Value,
    #[serde(default)]
    pub entities: Vec<Value>,
    #[serde(default)]
    pub turn: u64,
    #[serde(default)]
    pub turn_history: Vec<TurnRecord>,
    #[serde(default)]
    pub world_background: String,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, game_state: Value) -> Self {
        Self {
            session_id: session_id.into(),
            game_state,
            entities: Vec::new(),
            turn: 0,
            turn_history: Vec::new(),
            world_background: String::new(),
        }
    }

    pub fn with_entities(mut self, entities: Vec<Value>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_world_background(mut self, background: impl Into<String>) -> Self {
        self.world_background = background.into();
        self
    }
}

/// 部分更新：None 字段保持不变
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionUpdate {
    pub game_state: Option<Value>,
    pub entities: Option<Vec<Value>>,
    pub turn: Option<u64>,
    pub append_turn: Option<TurnRecord>,
}

impl SessionUpdate {
    pub fn apply_to(self, record: &mut SessionRecord) {
        if let Some(state) = self.game_state {
            record.game_state = state;
        }
        if let Some(entities) = self.entities {
            record.entities = entities;
        }
        if let Some(turn) = self.turn {
            record.turn = turn;
        }
        if let Some(entry) = self.append_turn {
            record.turn_history.push(entry);
        }
    }
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError>;

    async fn update(&self, session_id: &str, update: SessionUpdate) -> Result<(), SessionError>;
}

/// 内存会话存储
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建或覆盖会话
    pub async fn insert(&self, record: SessionRecord) {
        self.sessions
            .write()
            .await
            .insert(record.session_id.clone(), record);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn update(&self, session_id: &str, update: SessionUpdate) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        update.apply_to(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_get_update() {
        let store = InMemorySessionStore::new();
        store
            .insert(SessionRecord::new("s1", json!({"hp": 5})).with_world_background("A misty valley"))
            .await;

        store
            .update(
                "s1",
                SessionUpdate {
                    game_state: Some(json!({"hp": 4})),
                    turn: Some(1),
                    append_turn: Some(TurnRecord::new(1, "look around", "You see fog.")),
                    ..SessionUpdate::default()
                },
            )
            .await
            .unwrap();

        let record = store.get("s1").await.unwrap().unwrap();
        assert_eq!(record.game_state, json!({"hp": 4}));
        assert_eq!(record.turn, 1);
        assert_eq!(record.turn_history.len(), 1);
        assert_eq!(record.world_background, "A misty valley");
        assert!(record.entities.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_session() {
        let store = InMemorySessionStore::new();
        let err = store.update("ghost", SessionUpdate::default()).await.unwrap_err();
        assert_eq!(err, SessionError::NotFound("ghost".into()));
        assert!(store.get("ghost").await.unwrap().is_none());
    }
}
