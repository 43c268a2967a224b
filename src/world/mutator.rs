//! 状态变更解释器
//!
//! 对 game_state 按顺序应用一批 StateChangeOp：单条失败只记录并跳过，不影响后续条目的数量与顺序。
//! 写入前先做可写性检查，失败的条目不会留下半途创建的中间节点。

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::world::path::{lookup, lookup_mut, parse_path, PathError, PathSegment};

/// addlog 空路径时的默认日志位置
pub const DEFAULT_LOG_PATH: &str = "log";

/// 允许的 8 种操作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StateOp {
    Set,
    Inc,
    Dec,
    Mul,
    Patch,
    Push,
    Pop,
    Addlog,
}

impl StateOp {
    pub const ALL: [StateOp; 8] = [
        StateOp::Set,
        StateOp::Inc,
        StateOp::Dec,
        StateOp::Mul,
        StateOp::Patch,
        StateOp::Push,
        StateOp::Pop,
        StateOp::Addlog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateOp::Set => "set",
            StateOp::Inc => "inc",
            StateOp::Dec => "dec",
            StateOp::Mul => "mul",
            StateOp::Patch => "patch",
            StateOp::Push => "push",
            StateOp::Pop => "pop",
            StateOp::Addlog => "addlog",
        }
    }
}

impl fmt::Display for StateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateOp {
    type Err = MutationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateOp::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| MutationError::UnsupportedOp(s.to_string()))
    }
}

/// 单条状态变更指令
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StateChangeOp {
    pub op: StateOp,
    /// 点号/下标路径，如 `party[0].hp`
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

impl StateChangeOp {
    pub fn new(op: StateOp, path: impl Into<String>, value: Value) -> Self {
        Self {
            op,
            path: path.into(),
            value,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("Unsupported op: {0}")]
    UnsupportedOp(String),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("Index {index} out of bounds at '{path}'")]
    MissingIndex { path: String, index: usize },

    #[error("Cannot descend into non-container at '{0}'")]
    NotAContainer(String),

    #[error("Current value at '{0}' is not a number")]
    NotANumber(String),

    #[error("Operand for {op} at '{path}' is not a number")]
    OperandNotANumber { op: StateOp, path: String },

    #[error("Arithmetic result at '{0}' is not finite")]
    NonFinite(String),

    #[error("Current value at '{0}' is not a map")]
    NotAMap(String),

    #[error("Patch value for '{0}' is not a map")]
    PatchNotAMap(String),

    #[error("Current value at '{0}' is not a list")]
    NotAList(String),

    #[error("List at '{0}' is empty")]
    EmptyList(String),
}

/// 被跳过的条目
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SkippedOp {
    pub index: usize,
    pub op: StateOp,
    pub path: String,
    pub reason: String,
}

/// 一批变更的应用结果
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MutationReport {
    pub applied: usize,
    pub skipped: Vec<SkippedOp>,
}

impl MutationReport {
    pub fn total(&self) -> usize {
        self.applied + self.skipped.len()
    }
}

/// 状态变更解释器（无状态）
#[derive(Debug, Default, Clone, Copy)]
pub struct StateMutator;

impl StateMutator {
    pub fn new() -> Self {
        Self
    }

    /// 按顺序应用整批变更，尽力而为
    pub fn apply(&self, state: &mut Value, ops: &[StateChangeOp]) -> MutationReport {
        let mut report = MutationReport::default();
        for (index, change) in ops.iter().enumerate() {
            match self.apply_one(state, change) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!(index, op = %change.op, path = %change.path, error = %e, "state change skipped");
                    report.skipped.push(SkippedOp {
                        index,
                        op: change.op,
                        path: change.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// 应用单条变更；失败时 state 保持不变
    pub fn apply_one(&self, state: &mut Value, change: &StateChangeOp) -> Result<(), MutationError> {
        let path = match (change.op, change.path.trim()) {
            (StateOp::Addlog, "") => DEFAULT_LOG_PATH,
            (_, p) => p,
        };
        let segments = parse_path(path)?;

        match change.op {
            StateOp::Set => write(state, &segments, path, change.value.clone()),
            StateOp::Inc | StateOp::Dec | StateOp::Mul => {
                let current = lookup(state, &segments)
                    .ok_or_else(|| MutationError::NotANumber(path.to_string()))?;
                let next = arithmetic(change.op, path, current, &change.value)?;
                write(state, &segments, path, next)
            }
            StateOp::Patch => {
                let Value::Object(patch) = &change.value else {
                    return Err(MutationError::PatchNotAMap(path.to_string()));
                };
                match lookup_mut(state, &segments) {
                    Some(Value::Object(target)) => {
                        for (k, v) in patch {
                            target.insert(k.clone(), v.clone());
                        }
                        Ok(())
                    }
                    _ => Err(MutationError::NotAMap(path.to_string())),
                }
            }
            StateOp::Push => match lookup_mut(state, &segments) {
                Some(Value::Array(items)) => {
                    items.push(change.value.clone());
                    Ok(())
                }
                _ => Err(MutationError::NotAList(path.to_string())),
            },
            StateOp::Pop => match lookup_mut(state, &segments) {
                Some(Value::Array(items)) => items
                    .pop()
                    .map(|_| ())
                    .ok_or_else(|| MutationError::EmptyList(path.to_string())),
                _ => Err(MutationError::NotAList(path.to_string())),
            },
            StateOp::Addlog => match lookup_mut(state, &segments) {
                Some(Value::Array(items)) => {
                    items.push(change.value.clone());
                    Ok(())
                }
                _ => write(state, &segments, path, Value::Array(vec![change.value.clone()])),
            },
        }
    }
}

/// 整数保持整数（溢出时退化为浮点）
fn arithmetic(op: StateOp, path: &str, current: &Value, operand: &Value) -> Result<Value, MutationError> {
    let Value::Number(cur) = current else {
        return Err(MutationError::NotANumber(path.to_string()));
    };
    let Value::Number(rhs) = operand else {
        return Err(MutationError::OperandNotANumber {
            op,
            path: path.to_string(),
        });
    };

    if let (Some(a), Some(b)) = (cur.as_i64(), rhs.as_i64()) {
        let exact = match op {
            StateOp::Inc => a.checked_add(b),
            StateOp::Dec => a.checked_sub(b),
            _ => a.checked_mul(b),
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let (a, b) = match (cur.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(MutationError::NotANumber(path.to_string())),
    };
    let result = match op {
        StateOp::Inc => a + b,
        StateOp::Dec => a - b,
        _ => a * b,
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| MutationError::NonFinite(path.to_string()))
}

/// 可写性检查：缺失的 map 节点可创建，缺失的数组下标不可
fn check_writable(root: &Value, segments: &[PathSegment], path: &str) -> Result<(), MutationError> {
    let mut current = Some(root);
    for seg in segments {
        current = match (seg, current) {
            (PathSegment::Key(_), None) => None,
            (PathSegment::Index(i), None) => {
                return Err(MutationError::MissingIndex {
                    path: path.to_string(),
                    index: *i,
                })
            }
            (PathSegment::Key(k), Some(Value::Object(map))) => map.get(k),
            (PathSegment::Key(_), Some(Value::Null)) => None,
            (PathSegment::Key(_), Some(_)) => {
                return Err(MutationError::NotAContainer(path.to_string()))
            }
            (PathSegment::Index(i), Some(Value::Array(items))) => {
                Some(items.get(*i).ok_or_else(|| MutationError::MissingIndex {
                    path: path.to_string(),
                    index: *i,
                })?)
            }
            (PathSegment::Index(i), Some(_)) => {
                return Err(MutationError::MissingIndex {
                    path: path.to_string(),
                    index: *i,
                })
            }
        };
    }
    Ok(())
}

fn write(root: &mut Value, segments: &[PathSegment], path: &str, value: Value) -> Result<(), MutationError> {
    check_writable(root, segments, path)?;

    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for seg in parents {
        current = match seg {
            PathSegment::Key(k) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                match current {
                    Value::Object(map) => map.entry(k.clone()).or_insert(Value::Null),
                    _ => return Err(MutationError::NotAContainer(path.to_string())),
                }
            }
            PathSegment::Index(i) => match current {
                Value::Array(items) if *i < items.len() => &mut items[*i],
                _ => {
                    return Err(MutationError::MissingIndex {
                        path: path.to_string(),
                        index: *i,
                    })
                }
            },
        };
    }

    match last {
        PathSegment::Key(k) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            if let Value::Object(map) = current {
                map.insert(k.clone(), value);
            }
            Ok(())
        }
        PathSegment::Index(i) => match current {
            Value::Array(items) if *i < items.len() => {
                items[*i] = value;
                Ok(())
            }
            _ => Err(MutationError::MissingIndex {
                path: path.to_string(),
                index: *i,
            }),
        },
    }
}
