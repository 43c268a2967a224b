//! Storyloom - LLM 驱动的互动叙事回合引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 驱动器错误、工具错误分类与恢复、回合内状态
//! - **llm**: LLM 客户端抽象与脚本化 Mock
//! - **memory**: 回合消息序列、实体记忆协作者接口与内存实现
//! - **observability**: tracing 初始化
//! - **outcome**: 结构化回合结果与多级容错解析器
//! - **session**: 会话快照与存储接口
//! - **tools**: 工具注册表、并发执行器与叙事内置工具
//! - **turn**: 路由、上下文组装与七阶段回合驱动器
//! - **world**: 状态路径解析与状态变更解释器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod outcome;
pub mod session;
pub mod tools;
pub mod turn;
pub mod world;

pub use outcome::{Outcome, FALLBACK_NARRATIVE};
pub use turn::{TurnConfig, TurnDriver};
