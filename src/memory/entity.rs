//! 实体记忆：私有记忆、公开记忆、情绪状态
//!
//! MemoryStore 是回合驱动器依赖的外部协作者接口；InMemoryMemoryStore 为内存实现，
//! 内部写入由 RwLock 串行化，save() 可选写出 JSON 快照。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// 记忆写入时的默认重要度
pub const DEFAULT_IMPORTANCE: u8 = 5;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory snapshot serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 单条记忆
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    /// belief / relationship / event / location / goal / general
    pub scope: String,
    pub turn: u64,
    pub importance: u8,
}

/// 实体的一次情绪记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmotionalState {
    pub emotion: String,
    /// -1.0 ~ 1.0
    pub intensity: f64,
    pub cause: Option<String>,
    pub target: Option<String>,
    pub turn: u64,
}

/// consolidate 的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub memories_removed: usize,
}

/// 记忆协作者接口：实现方需自行串行化并发写入
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get_private_memory(&self, entity: &str) -> Vec<MemoryEntry>;

    /// entity -> 公开记忆列表
    async fn get_public_memory(&self) -> BTreeMap<String, Vec<MemoryEntry>>;

    async fn update_private_memory(&self, entity: &str, content: &str, scope: &str);

    async fn update_public_memory(&self, entity: &str, content: &str);

    async fn update_emotional_state(
        &self,
        entity: &str,
        emotion: &str,
        intensity: f64,
        cause: Option<&str>,
        target: Option<&str>,
    );

    async fn increment_turn(&self);

    async fn get_turn_count(&self) -> u64;

    /// 当前记忆总条数，用于决定是否触发 consolidate
    async fn memory_volume(&self) -> usize;

    /// 每个实体最多保留 max_per_entity 条；优先淘汰重要度低于 importance_threshold 的旧记忆
    async fn consolidate(&self, max_per_entity: usize, importance_threshold: u8) -> ConsolidationReport;

    async fn save(&self) -> Result<(), MemoryError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct MemoryBook {
    private: BTreeMap<String, Vec<MemoryEntry>>,
    public: BTreeMap<String, Vec<MemoryEntry>>,
    emotions: BTreeMap<String, Vec<EmotionalState>>,
    turn: u64,
}

/// 内存实现
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    book: RwLock<MemoryBook>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从已有回合数开始（会话恢复时使用）
    pub fn with_turn_count(turn: u64) -> Self {
        Self {
            book: RwLock::new(MemoryBook {
                turn,
                ..MemoryBook::default()
            }),
            snapshot_path: None,
        }
    }

    /// save() 时将全部记忆写入该 JSON 文件
    pub fn with_snapshot_path(mut self, path: impl AsRef<Path>) -> Self {
        self.snapshot_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub async fn emotional_history(&self, entity: &str) -> Vec<EmotionalState> {
        self.book
            .read()
            .await
            .emotions
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }
}

/// 超限时逐条淘汰：先找最旧的低重要度记忆，找不到再删最旧的一条
fn trim_entries(entries: &mut Vec<MemoryEntry>, max: usize, importance_threshold: u8) -> usize {
    let mut removed = 0;
    while entries.len() > max {
        let idx = entries
            .iter()
            .position(|e| e.importance < importance_threshold)
            .unwrap_or(0);
        entries.remove(idx);
        removed += 1;
    }
    removed
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn get_private_memory(&self, entity: &str) -> Vec<MemoryEntry> {
        self.book
            .read()
            .await
            .private
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    async fn get_public_memory(&self) -> BTreeMap<String, Vec<MemoryEntry>> {
        self.book.read().await.public.clone()
    }

    async fn update_private_memory(&self, entity: &str, content: &str, scope: &str) {
        let mut book = self.book.write().await;
        let turn = book.turn;
        book.private.entry(entity.to_string()).or_default().push(MemoryEntry {
            content: content.to_string(),
            scope: scope.to_string(),
            turn,
            importance: DEFAULT_IMPORTANCE,
        });
    }

    async fn update_public_memory(&self, entity: &str, content: &str) {
        let mut book = self.book.write().await;
        let turn = book.turn;
        book.public.entry(entity.to_string()).or_default().push(MemoryEntry {
            content: content.to_string(),
            scope: "general".to_string(),
            turn,
            importance: DEFAULT_IMPORTANCE,
        });
    }

    async fn update_emotional_state(
        &self,
        entity: &str,
        emotion: &str,
        intensity: f64,
        cause: Option<&str>,
        target: Option<&str>,
    ) {
        let mut book = self.book.write().await;
        let turn = book.turn;
        book.emotions
            .entry(entity.to_string())
            .or_default()
            .push(EmotionalState {
                emotion: emotion.to_string(),
                intensity: intensity.clamp(-1.0, 1.0),
                cause: cause.map(str::to_string),
                target: target.map(str::to_string),
                turn,
            });
    }

    async fn increment_turn(&self) {
        self.book.write().await.turn += 1;
    }

    async fn get_turn_count(&self) -> u64 {
        self.book.read().await.turn
    }

    async fn memory_volume(&self) -> usize {
        let book = self.book.read().await;
        book.private.values().map(Vec::len).sum::<usize>()
            + book.public.values().map(Vec::len).sum::<usize>()
    }

    async fn consolidate(&self, max_per_entity: usize, importance_threshold: u8) -> ConsolidationReport {
        let mut guard = self.book.write().await;
        let book = &mut *guard;
        let mut removed = 0;
        for entries in book.private.values_mut().chain(book.public.values_mut()) {
            removed += trim_entries(entries, max_per_entity, importance_threshold);
        }
        if removed > 0 {
            tracing::info!(removed, max_per_entity, "memory consolidated");
        }
        ConsolidationReport {
            memories_removed: removed,
        }
    }

    async fn save(&self) -> Result<(), MemoryError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        // 只在序列化期间持有读锁，文件写入走 tokio::fs
        let snapshot = serde_json::to_string_pretty(&*self.book.read().await)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, snapshot).await?;
        Ok(())
    }
}
