//! 记忆层：回合内消息序列、实体记忆（私有 / 公开 / 情绪）协作者接口与内存实现

pub mod conversation;
pub mod entity;

pub use conversation::{Message, Role, ToolCall};
pub use entity::{
    ConsolidationReport, EmotionalState, InMemoryMemoryStore, MemoryEntry, MemoryError, MemoryStore,
};
