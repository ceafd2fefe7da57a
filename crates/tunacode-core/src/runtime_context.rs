// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent.
//!
//! This is separate from [`tunacode_config::AgentConfig`], which holds only
//! config-file fields. [`AgentRuntimeContext`] carries values detected or
//! supplied at construction time: project root, git/CI context, and prompt
//! customization.

use std::path::PathBuf;

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (e.g. found via a `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Pre-formatted CI environment context block.
    pub ci_context_note: Option<String>,
    /// Contents of a project-level instructions file (e.g. `AGENTS.md`).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt.
    pub append_system_prompt: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
