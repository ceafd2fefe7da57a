// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_max_iterations() -> u32 {
    20
}
fn default_max_retries() -> u32 {
    3
}
fn default_global_request_timeout_secs() -> u64 {
    120
}
fn default_tool_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of model turns in a single `process_request` call
    /// before the orchestrator forces a tool-free wrap-up turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Retry budget shared by tool retries and empty/malformed-turn retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wall-clock timeout for a single request, in seconds (0 = no limit).
    #[serde(default = "default_global_request_timeout_secs")]
    pub global_request_timeout_secs: u64,
    /// Delay inserted between consecutive tool-call rounds, in milliseconds.
    /// Useful for rate-limited providers; 0 disables the delay.
    #[serde(default)]
    pub request_delay_ms: u64,
    /// Wall-clock timeout for a single tool call, in seconds (0 = no limit).
    /// A timed-out call is treated as `ToolError::Retryable`, not `Fatal`:
    /// a slow call this time does not mean it can never succeed.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_retries: default_max_retries(),
            global_request_timeout_secs: default_global_request_timeout_secs(),
            request_delay_ms: 0,
            tool_timeout_secs: default_tool_timeout_secs(),
            compaction: CompactionConfig::default(),
        }
    }
}

/// Strategy used when compacting the session context.
///
/// `Structured` (default) instructs the model to produce a typed Markdown
/// checkpoint with fixed sections. `Narrative` uses a free-form
/// summarisation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

fn default_compaction_threshold() -> f32 {
    0.85
}
fn default_compaction_keep_recent() -> usize {
    6
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_compaction_overhead_reserve() -> f32 {
    0.10
}
fn default_compaction_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Master switch. When false, `ensure_fits_budget` never triggers
    /// proactive compaction (the emergency fallback can still fire on
    /// context-overflow recovery, since that path is not optional).
    #[serde(default = "default_compaction_enabled")]
    pub enabled: bool,
    /// Token fraction (inclusive) at which proactive compaction triggers.
    #[serde(default = "default_compaction_threshold")]
    pub threshold: f32,
    /// Fraction of the context window reserved for tool schemas and
    /// measurement error in the token approximation.
    #[serde(default = "default_compaction_overhead_reserve")]
    pub reserve_fraction: f32,
    /// Number of recent non-system messages preserved verbatim.
    #[serde(default = "default_compaction_keep_recent")]
    pub keep_recent_messages: usize,
    #[serde(default)]
    pub strategy: CompactionStrategy,
    /// Maximum tokens for a single tool result before deterministic
    /// truncation; 0 disables per-result truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_compaction_enabled(),
            threshold: default_compaction_threshold(),
            reserve_fraction: default_compaction_overhead_reserve(),
            keep_recent_messages: default_compaction_keep_recent(),
            strategy: CompactionStrategy::default(),
            tool_result_token_cap: default_tool_result_token_cap(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
