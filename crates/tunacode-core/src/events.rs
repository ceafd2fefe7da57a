// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tunacode_config::CompactionStrategy;
use tunacode_tools::ToolCall;

/// Which compaction strategy actually ran, recorded on [`AgentEvent::ContextCompacted`].
///
/// Mirrors [`CompactionStrategy`] plus an `Emergency` outcome: the
/// deterministic drop-and-notice fallback used when the configured strategy
/// would itself overflow the context window, so it needs a variant the
/// config-level enum has no reason to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    Structured,
    Narrative,
    Emergency,
}

impl From<CompactionStrategy> for CompactionStrategyUsed {
    fn from(s: CompactionStrategy) -> Self {
        match s {
            CompactionStrategy::Structured => Self::Structured,
            CompactionStrategy::Narrative => Self::Narrative,
        }
    }
}

impl std::fmt::Display for CompactionStrategyUsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Narrative => write!(f, "narrative"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Severity of an [`AgentEvent::Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Machine-readable identifier for a [`AgentEvent::Notice`], so consumers can
/// switch on the kind of event without parsing `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeCode {
    CompactionApplied,
    CompactionSkipped,
    OverflowRetry,
    Cancelled,
    IterationLimitReached,
    Timeout,
}

impl std::fmt::Display for NoticeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CompactionApplied => "compaction_applied",
            Self::CompactionSkipped => "compaction_skipped",
            Self::OverflowRetry => "overflow_retry",
            Self::Cancelled => "cancelled",
            Self::IterationLimitReached => "iteration_limit_reached",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Events emitted by the agent while processing a request.
/// Consumers (a CLI, a test harness, a UI) subscribe to these through an
/// [`crate::callback::EventSink`] to drive their own output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished { call_id: String, tool_name: String, output: String, is_error: bool },
    /// Context was compacted; statistics for the consumer.
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        /// 1-based turn number at which compaction ran.
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        context_total: usize,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Cumulative cache-read tokens for the session.
        cache_read_total: u64,
        /// Cumulative cache-write tokens for the session.
        cache_write_total: u64,
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// A recoverable error occurred
    Error(String),
    /// The request was cancelled. `partial_text` carries any assistant text
    /// committed to the session before the cancellation took effect.
    Aborted { partial_text: Option<String> },
    /// An out-of-band notice: a condition the consumer may want to surface
    /// (compaction ran, the model overflowed context and was retried, an
    /// iteration limit was hit) that isn't itself an error but isn't part of
    /// the normal text/tool-call flow either.
    Notice { level: NoticeLevel, code: NoticeCode, message: String },
}
