//! 状态路径解析
//!
//! `a.b[2].c` 按 `.` 切分；每段可带若干 `[N]` 下标（`[2]` 单独成段亦可）。空路径表示根。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// 路径中的一步：对象键或数组下标
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Malformed path segment '{segment}' in '{path}'")]
    Malformed { path: String, segment: String },
}

fn segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^\[\]]*)((?:\[\d+\])*)$").expect("segment regex is valid"))
}

fn index_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("index regex is valid"))
}

/// 解析路径字符串
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, PathError> {
    let path = path.trim();
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let malformed = |segment: &str| PathError::Malformed {
        path: path.to_string(),
        segment: segment.to_string(),
    };

    let mut segments = Vec::new();
    for part in path.split('.') {
        let caps = segment_regex().captures(part).ok_or_else(|| malformed(part))?;
        let key = caps.get(1).map_or("", |m| m.as_str());
        let indices = caps.get(2).map_or("", |m| m.as_str());
        if key.is_empty() && indices.is_empty() {
            return Err(malformed(part));
        }
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        }
        for idx in index_regex().captures_iter(indices) {
            let n = idx[1].parse::<usize>().map_err(|_| malformed(part))?;
            segments.push(PathSegment::Index(n));
        }
    }
    Ok(segments)
}

/// 只读查找，不创建任何节点
pub fn lookup<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, seg| match (seg, current) {
        (PathSegment::Key(k), Value::Object(map)) => map.get(k),
        (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
        _ => None,
    })
}

pub fn lookup_mut<'a>(root: &'a mut Value, segments: &[PathSegment]) -> Option<&'a mut Value> {
    segments.iter().try_fold(root, |current, seg| match (seg, current) {
        (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k),
        (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i),
        _ => None,
    })
}
