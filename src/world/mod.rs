//! 世界状态：路径解析与状态变更解释器

pub mod mutator;
pub mod path;

pub use mutator::{
    MutationError, MutationReport, SkippedOp, StateChangeOp, StateMutator, StateOp, DEFAULT_LOG_PATH,
};
pub use path::{parse_path, PathError, PathSegment};
