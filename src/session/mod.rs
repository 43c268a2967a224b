//! 会话层：会话快照与存储接口

pub mod store;

pub use store::{InMemorySessionStore, SessionError, SessionRecord, SessionStore, SessionUpdate, TurnRecord};
