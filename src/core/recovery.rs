//! 工具错误分类与恢复
//!
//! 取最近 N 条 tool 消息中带 "error" 的部分，按关键词归类、评估严重度，
//! 再选出一条恢复引导（以 user 消息注入，随后回到 AGENT）。

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::RecoveryAction;
use crate::memory::{Message, Role};

/// 默认检查窗口：最近 5 条 tool 消息
pub const DEFAULT_ERROR_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingResource,
    Permission,
    Syntax,
    Network,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorAnalysis {
    pub error_count: usize,
    pub error_types: BTreeSet<ErrorKind>,
    pub severity: Severity,
    /// severity != High
    pub recoverable: bool,
}

/// 按关键词归类单条错误内容（按优先级取第一个命中）
pub fn classify(content: &str) -> ErrorKind {
    let lower = content.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));
    if has(&["not found", "missing"]) {
        ErrorKind::MissingResource
    } else if has(&["permission", "forbidden"]) {
        ErrorKind::Permission
    } else if has(&["syntax", "invalid"]) {
        ErrorKind::Syntax
    } else if has(&["timeout", "network"]) {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    window: usize,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_WINDOW)
    }
}

impl ErrorClassifier {
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1) }
    }

    /// 最近 window 条 tool 消息中带错误标记的那些（保持原顺序）；
    /// 末尾连续的 tool 消息即最新一批结果，批次比 window 大时窗口扩展到整批
    pub fn recent_errors<'a>(&self, messages: &'a [Message]) -> Vec<&'a Message> {
        let latest_batch = messages.iter().rev().take_while(|m| m.role == Role::Tool).count();
        let mut recent: Vec<&Message> = messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Tool)
            .take(self.window.max(latest_batch))
            .filter(|m| m.is_error_tagged())
            .collect();
        recent.reverse();
        recent
    }

    pub fn analyze(&self, errors: &[&Message]) -> ErrorAnalysis {
        let error_types = errors.iter().map(|m| classify(&m.content)).collect();

        let lowered: Vec<String> = errors.iter().map(|m| m.content.to_lowercase()).collect();
        let severity = if lowered
            .iter()
            .any(|c| c.contains("critical") || c.contains("fatal"))
        {
            Severity::High
        } else if lowered.iter().all(|c| c.contains("warning")) {
            Severity::Low
        } else {
            Severity::Medium
        };

        ErrorAnalysis {
            error_count: errors.len(),
            error_types,
            severity,
            recoverable: severity != Severity::High,
        }
    }

    /// 恢复策略选择（按优先级）
    pub fn recovery_action(&self, analysis: &ErrorAnalysis) -> RecoveryAction {
        if !analysis.recoverable {
            RecoveryAction::FinalizeNarrative
        } else if analysis.error_types.contains(&ErrorKind::MissingResource) {
            RecoveryAction::CreateMissingResource
        } else if analysis.error_types.contains(&ErrorKind::Syntax) {
            RecoveryAction::FixParameters
        } else if analysis.error_count > 2 {
            RecoveryAction::Simplify
        } else {
            RecoveryAction::RetryOrProceed
        }
    }
}
