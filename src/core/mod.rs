//! 核心层：驱动器错误、工具错误分类与恢复、回合内状态

pub mod error;
pub mod recovery;
pub mod state;

pub use error::{RecoveryAction, TurnError};
pub use recovery::{classify, ErrorAnalysis, ErrorClassifier, ErrorKind, Severity, DEFAULT_ERROR_WINDOW};
pub use state::{AgentState, Effectiveness, ErrorContext, ToolResultBatch, TurnPhase};
