// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tunacode_message::UsageMetrics;
use tunacode_tools::{ToolCall, ToolOutput};

use crate::events::{NoticeCode, NoticeLevel};

/// Callback interface for observing agent activity without subscribing to
/// the full [`crate::AgentEvent`] channel.
///
/// A UI, a logger, and a metrics exporter can each implement a handful of
/// these methods and be composed behind a single `Arc<dyn EventSink>` — every
/// method has a no-op default, so implementors only override what they care
/// about.
pub trait EventSink: Send + Sync {
    /// A text delta streamed from the model.
    fn on_text_delta(&self, _delta: &str) {}
    /// A thinking/reasoning delta streamed from the model.
    fn on_thinking_delta(&self, _delta: &str) {}
    /// The model requested a tool call.
    fn on_tool_call_started(&self, _call: &ToolCall) {}
    /// A tool call finished, successfully or not.
    fn on_tool_call_finished(&self, _call_id: &str, _output: &ToolOutput) {}
    /// Cumulative session usage was updated.
    fn on_usage(&self, _usage: &UsageMetrics) {}
    /// Context was compacted. `strategy` is the lowercase strategy name
    /// (`"structured"`, `"narrative"`, or `"emergency"`).
    fn on_context_compacted(&self, _before: usize, _after: usize, _strategy: &str) {}
    /// An out-of-band notice (compaction skipped, overflow retry, cancellation,
    /// iteration limit reached, timeout). See [`crate::events::AgentEvent::Notice`].
    fn on_notice(&self, _level: NoticeLevel, _code: NoticeCode, _message: &str) {}
}

/// A sink that does nothing. Useful as a default when no observer is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}

/// Fan out every call to a fixed list of sinks, in order.
///
/// One failing/slow sink does not affect the others: each method is invoked
/// unconditionally for every sink in the list.
#[derive(Default)]
pub struct BroadcastSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl BroadcastSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for BroadcastSink {
    fn on_text_delta(&self, delta: &str) {
        for s in &self.sinks {
            s.on_text_delta(delta);
        }
    }

    fn on_thinking_delta(&self, delta: &str) {
        for s in &self.sinks {
            s.on_thinking_delta(delta);
        }
    }

    fn on_tool_call_started(&self, call: &ToolCall) {
        for s in &self.sinks {
            s.on_tool_call_started(call);
        }
    }

    fn on_tool_call_finished(&self, call_id: &str, output: &ToolOutput) {
        for s in &self.sinks {
            s.on_tool_call_finished(call_id, output);
        }
    }

    fn on_usage(&self, usage: &UsageMetrics) {
        for s in &self.sinks {
            s.on_usage(usage);
        }
    }

    fn on_context_compacted(&self, before: usize, after: usize, strategy: &str) {
        for s in &self.sinks {
            s.on_context_compacted(before, after, strategy);
        }
    }

    fn on_notice(&self, level: NoticeLevel, code: NoticeCode, message: &str) {
        for s in &self.sinks {
            s.on_notice(level, code, message);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
