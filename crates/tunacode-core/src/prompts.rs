// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

/// All optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes on every commit
    /// and with every file edit (dirty count). When prompt caching is enabled
    /// this content is placed in a *separate, uncached* system block so that
    /// the stable prefix remains cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Contents of a project-level instructions file (e.g. `AGENTS.md`).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block.
    ///
    /// **Caching note**: like `git_context`, this is volatile between CI runs.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the Guidelines section.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile fields cleared.
    ///
    /// Used to build the *stable* (cacheable) portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            project_context_file: self.project_context_file,
            ci_context: None,
            append: self.append,
        }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// appending to the system prompt outside the cached region.
    ///
    /// Returns `None` when neither git nor CI context is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self.git_context.filter(|s| !s.trim().is_empty()).map(|s| s.to_string());
        let ci = self.ci_context.filter(|s| !s.trim().is_empty()).map(|s| s.to_string());
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

// ─── Guidelines Module ───────────────────────────────────────────────────────
// Modular guidelines for easier maintenance and testing. Deliberately free of
// tool names: the set of registered tools is decided entirely by the caller,
// so nothing here can assume a particular one exists.

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Verify assumptions with the available tools instead of guessing.\n\
         - Read enough context before acting; do not edit code you have not read."
    }

    pub fn tool_usage() -> &'static str {
        "- Prefer the most targeted tool for a task over a broader one.\n\
         - Batch independent tool calls in parallel when they do not depend on each other's results.\n\
         - When a tool result is truncated, narrow the next call (offset, pattern, filter) instead \
           of re-requesting the same broad output."
    }

    pub fn code_quality() -> &'static str {
        "- Preserve the existing code structure and conventions of the surrounding code.\n\
         - Write tests for new functionality when the project has a test suite.\n\
         - Do not create new files unless the task requires it."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool call fails, read the error before retrying; change approach rather than \
           repeating the same call verbatim.\n\
         - Report blockers clearly instead of giving up silently."
    }

    pub fn completion() -> &'static str {
        "- Finish the task fully before ending your turn; do not leave partial work unannounced.\n\
         - Summarise what changed once the task is complete."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General\n{}\n\n\
         ### Tool Usage\n{}\n\n\
         ### Code Quality\n{}\n\n\
         ### Error Handling\n{}\n\n\
         ### Completion\n{}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::error_handling(),
        guidelines::completion(),
    )
}

/// Build the system prompt for an agent.
///
/// `custom` replaces the default identity and guidelines entirely (the
/// `ctx.append` block is still honoured on top of it). `ctx` carries the
/// optional project/CI/git context blocks detected by the caller.
pub fn system_prompt(custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let agent_identity = "You are TunaCode, an autonomous coding agent. You can read and write \
         files, run tools, and verify your own changes. Work systematically, use the tools \
         available to you instead of guessing, and report your progress clearly.";

    let project_section = ctx
        .project_root
        .map(|root| {
            format!(
                "\n\n## Project Context\n\
                 Project root directory: `{}`\n\
                 - Prefer absolute paths over relative paths in tool calls.",
                root.display()
            )
        })
        .unwrap_or_default();

    let context_file_section = ctx
        .project_context_file
        .map(|content| format!("\n\n## Project Instructions\n\n{content}"))
        .unwrap_or_default();

    let git_section = ctx.git_context.map(|git| format!("\n\n{git}")).unwrap_or_default();
    let ci_section = ctx.ci_context.map(|ci| format!("\n\n{ci}")).unwrap_or_default();

    let guidelines_section = build_guidelines_section();
    let append_section = ctx.append.map(|extra| format!("\n\n{extra}")).unwrap_or_default();

    format!(
        "{agent_identity}{project_section}{context_file_section}{git_section}{ci_section}\n\n\
         {guidelines_section}{append_section}",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_is_fully_empty() {
        let ctx = PromptContext::default();
        assert!(ctx.project_root.is_none());
        assert!(ctx.dynamic_block().is_none());
    }

    #[test]
    fn custom_prompt_is_used_verbatim_without_append() {
        let prompt = system_prompt(Some("You are a helper."), PromptContext::default());
        assert_eq!(prompt, "You are a helper.");
    }

    #[test]
    fn custom_prompt_honours_append() {
        let ctx = PromptContext { append: Some("Extra rule."), ..Default::default() };
        let prompt = system_prompt(Some("You are a helper."), ctx);
        assert_eq!(prompt, "You are a helper.\n\nExtra rule.");
    }

    #[test]
    fn default_prompt_mentions_tunacode() {
        let prompt = system_prompt(None, PromptContext::default());
        assert!(prompt.contains("TunaCode"));
    }

    #[test]
    fn default_prompt_includes_guidelines_section() {
        let prompt = system_prompt(None, PromptContext::default());
        assert!(prompt.contains("## Guidelines"));
        assert!(prompt.contains("### Tool Usage"));
    }

    #[test]
    fn project_root_appears_when_set() {
        let root = Path::new("/home/user/project");
        let ctx = PromptContext { project_root: Some(root), ..Default::default() };
        let prompt = system_prompt(None, ctx);
        assert!(prompt.contains("/home/user/project"));
    }

    #[test]
    fn no_project_section_when_root_absent() {
        let prompt = system_prompt(None, PromptContext::default());
        assert!(!prompt.contains("## Project Context"));
    }

    #[test]
    fn project_context_file_is_injected() {
        let ctx = PromptContext { project_context_file: Some("Use 4-space indents."), ..Default::default() };
        let prompt = system_prompt(None, ctx);
        assert!(prompt.contains("## Project Instructions"));
        assert!(prompt.contains("Use 4-space indents."));
    }

    #[test]
    fn git_and_ci_context_appear_in_default_prompt() {
        let ctx = PromptContext {
            git_context: Some("On branch main."),
            ci_context: Some("Running in CI."),
            ..Default::default()
        };
        let prompt = system_prompt(None, ctx);
        assert!(prompt.contains("On branch main."));
        assert!(prompt.contains("Running in CI."));
    }

    #[test]
    fn append_comes_after_guidelines_in_default_prompt() {
        let ctx = PromptContext { append: Some("MARKER_END"), ..Default::default() };
        let prompt = system_prompt(None, ctx);
        let guidelines_idx = prompt.find("## Guidelines").unwrap();
        let marker_idx = prompt.find("MARKER_END").unwrap();
        assert!(marker_idx > guidelines_idx);
    }

    // ── PromptContext::stable_only / dynamic_block ───────────────────────────

    #[test]
    fn stable_only_clears_git_and_ci() {
        let ctx = PromptContext {
            git_context: Some("git"),
            ci_context: Some("ci"),
            project_root: Some(Path::new("/p")),
            ..Default::default()
        };
        let stable = ctx.stable_only();
        assert!(stable.git_context.is_none());
        assert!(stable.ci_context.is_none());
        assert_eq!(stable.project_root, ctx.project_root);
    }

    #[test]
    fn dynamic_block_combines_git_and_ci() {
        let ctx = PromptContext { git_context: Some("git-note"), ci_context: Some("ci-note"), ..Default::default() };
        let block = ctx.dynamic_block().unwrap();
        assert!(block.contains("git-note"));
        assert!(block.contains("ci-note"));
    }

    #[test]
    fn dynamic_block_ignores_blank_strings() {
        let ctx = PromptContext { git_context: Some("   "), ci_context: None, ..Default::default() };
        assert!(ctx.dynamic_block().is_none());
    }
}
