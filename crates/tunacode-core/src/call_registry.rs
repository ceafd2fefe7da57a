// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ephemeral, per-turn registry of tool calls in flight or finished.
//!
//! Lives on [`crate::Session`] but is never persisted: it exists so a UI or
//! a resumed stream can answer "what tool calls are outstanding right now"
//! without re-deriving it from the message history.

use std::collections::HashMap;

use serde_json::Value;

/// Lifecycle state of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One entry in the [`ToolCallRegistry`].
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Plain-text result or error message, set once the call finishes.
    pub result_or_error: Option<String>,
}

/// Ordered map from `tool_call_id` to its [`ToolCallRecord`].
///
/// Backed by an insertion-order `Vec` alongside the lookup map rather than
/// an `indexmap`, since iteration order only ever needs to match the order
/// calls were registered in.
#[derive(Debug, Default)]
pub struct ToolCallRegistry {
    order: Vec<String>,
    records: HashMap<String, ToolCallRecord>,
}

impl ToolCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call as `Pending`, no start time yet.
    pub fn register(&mut self, call_id: impl Into<String>, tool_name: impl Into<String>, args: Value) {
        let call_id = call_id.into();
        if !self.records.contains_key(&call_id) {
            self.order.push(call_id.clone());
        }
        self.records.insert(
            call_id,
            ToolCallRecord {
                tool_name: tool_name.into(),
                args,
                status: ToolCallStatus::Pending,
                started_at: None,
                ended_at: None,
                result_or_error: None,
            },
        );
    }

    /// Mark a registered call as `Running`, stamping `started_at`.
    pub fn start(&mut self, call_id: &str) {
        if let Some(rec) = self.records.get_mut(call_id) {
            rec.status = ToolCallStatus::Running;
            rec.started_at = Some(chrono::Utc::now());
        }
    }

    /// Mark a call `Completed` with its plain-text result.
    pub fn complete(&mut self, call_id: &str, result: impl Into<String>) {
        self.finish(call_id, ToolCallStatus::Completed, result.into());
    }

    /// Mark a call `Failed` with an error message.
    pub fn fail(&mut self, call_id: &str, error: impl Into<String>) {
        self.finish(call_id, ToolCallStatus::Failed, error.into());
    }

    /// Mark a call `Cancelled`.
    pub fn cancel(&mut self, call_id: &str) {
        self.finish(call_id, ToolCallStatus::Cancelled, "cancelled".to_string());
    }

    fn finish(&mut self, call_id: &str, status: ToolCallStatus, message: String) {
        if let Some(rec) = self.records.get_mut(call_id) {
            rec.status = status;
            rec.ended_at = Some(chrono::Utc::now());
            rec.result_or_error = Some(message);
        }
    }

    pub fn get(&self, call_id: &str) -> Option<&ToolCallRecord> {
        self.records.get(call_id)
    }

    /// Iterate records in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ToolCallRecord)> {
        self.order.iter().filter_map(move |id| self.records.get(id).map(|r| (id.as_str(), r)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
