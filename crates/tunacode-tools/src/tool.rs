// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ToolError;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Cooperative cancellation signal threaded through to every tool invocation.
///
/// Cheap to clone: every clone observes the same underlying flag. Tools that
/// run a long-lived operation should poll [`AbortSignal::is_cancelled`]
/// between steps, or `.await` [`AbortSignal::cancelled`] alongside their own
/// work, and return [`ToolError::Cancelled`] once it fires.
#[derive(Clone)]
pub struct AbortSignal(tokio::sync::watch::Receiver<bool>);

impl AbortSignal {
    pub fn new(rx: tokio::sync::watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    /// A signal that never fires. Used by callers (and most unit tests) that
    /// have no cancellation plumbing to thread through.
    pub fn never() -> Self {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal fires. Returns immediately if it already
    /// has. Intended for use inside `tokio::select!` alongside a tool's own
    /// work so a long-running operation can exit as soon as it is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

/// Progress callback a tool may invoke zero or more times while running, to
/// stream partial output before the final [`ToolOutput`] is ready.
pub type ToolUpdate = Arc<dyn Fn(String) + Send + Sync>;

/// An update callback that does nothing. The default for callers that do not
/// care about partial progress.
pub fn noop_update() -> ToolUpdate {
    Arc::new(|_| {})
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`.  Vision-capable tools may produce a mix
/// of `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The successful result of executing a tool.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts).  Tools that return images populate
/// `parts` with a mix of [`ToolOutputPart::Text`] and [`ToolOutputPart::Image`]
/// items; `tunacode-core` maps these into the matching `ToolResultContent`
/// variant when building the conversation history.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content — concatenation of all Text parts.
    pub content: String,
    /// Structured parts (text and/or images). For text-only tools this
    /// contains exactly one `Text` part mirroring `content`.
    pub parts: Vec<ToolOutputPart>,
    /// Set when the tool ran to completion but the operation itself failed
    /// in a way the model should see as a business-logic error rather than a
    /// retryable/fatal dispatch failure (e.g. "file not found", a failing
    /// test run). Dispatch-level failures still go through `ToolError`.
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: false,
        }
    }

    /// A result the tool produced successfully but that represents a failed
    /// operation (e.g. a command that ran and exited non-zero). Unlike
    /// `Err(ToolError::...)`, this does not consume a retry.
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: true,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    ///
    /// `content` is set to the concatenation of all Text parts.
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self { call_id: call_id.into(), content: text, parts, is_error: false }
    }

    /// Return `true` if this output contains at least one image part.
    pub fn has_images(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, `tunacode-core` uses
/// this category to pick the right extraction strategy. Each tool declares
/// its own category; `tunacode-core` never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    MatchList,
    /// File content: keep a head and tail window with a separator so the
    /// model sees both the top of the file and the end.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Trait that every tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Describes the shape of this tool's output for context-aware truncation.
    ///
    /// Override this when your tool produces output whose leading or trailing
    /// portion is more useful than a hard cut. The default is
    /// [`OutputCategory::Generic`] (hard truncation).
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool. `Err` carries the retryable/fatal/cancelled
    /// distinction the orchestrator uses to decide whether to spend a retry.
    ///
    /// Implementations that run a long or interruptible operation MUST poll
    /// `abort_signal` and return `Err(ToolError::Cancelled)` once it fires,
    /// rather than running to completion. `on_update` MAY be called zero or
    /// more times with partial output before the final result is ready.
    async fn execute(
        &self,
        call: &ToolCall,
        abort_signal: &AbortSignal,
        on_update: &ToolUpdate,
    ) -> Result<ToolOutput, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    // -- OutputCategory --

    #[test]
    fn output_category_default_is_generic() {
        assert_eq!(OutputCategory::default(), OutputCategory::Generic);
    }

    #[test]
    fn output_category_variants_are_distinct() {
        assert_ne!(OutputCategory::HeadTail, OutputCategory::MatchList);
        assert_ne!(OutputCategory::HeadTail, OutputCategory::FileContent);
        assert_ne!(OutputCategory::HeadTail, OutputCategory::Generic);
        assert_ne!(OutputCategory::MatchList, OutputCategory::FileContent);
        assert_ne!(OutputCategory::MatchList, OutputCategory::Generic);
        assert_ne!(OutputCategory::FileContent, OutputCategory::Generic);
    }

    #[test]
    fn output_category_copy_semantics() {
        let a = OutputCategory::HeadTail;
        let b = a; // Copy — no move
        assert_eq!(a, b);
    }

    // -- Tool trait default output_category --

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            call: &ToolCall,
            _abort_signal: &AbortSignal,
            _on_update: &ToolUpdate,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::ok(call.id.clone(), "ok"))
        }
    }

    #[test]
    fn tool_default_output_category_is_generic() {
        assert_eq!(MinimalTool.output_category(), OutputCategory::Generic);
    }

    struct HeadTailTool;

    #[async_trait]
    impl Tool for HeadTailTool {
        fn name(&self) -> &str {
            "ht"
        }
        fn description(&self) -> &str {
            "produces terminal output"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::HeadTail
        }
        async fn execute(
            &self,
            call: &ToolCall,
            _abort_signal: &AbortSignal,
            _on_update: &ToolUpdate,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::ok(call.id.clone(), "ok"))
        }
    }

    #[test]
    fn tool_can_override_output_category() {
        assert_eq!(HeadTailTool.output_category(), OutputCategory::HeadTail);
    }

    #[test]
    fn overridden_category_differs_from_default() {
        assert_ne!(HeadTailTool.output_category(), MinimalTool.output_category());
    }

    #[tokio::test]
    async fn fatal_error_propagates_message() {
        struct FailingTool;
        #[async_trait]
        impl Tool for FailingTool {
            fn name(&self) -> &str {
                "failing"
            }
            fn description(&self) -> &str {
                "always fails"
            }
            fn parameters_schema(&self) -> Value {
                json!({ "type": "object" })
            }
            async fn execute(
                &self,
                _call: &ToolCall,
                _abort_signal: &AbortSignal,
                _on_update: &ToolUpdate,
            ) -> Result<ToolOutput, ToolError> {
                Err(ToolError::Fatal("missing required argument".into()))
            }
        }
        let call = ToolCall { id: "1".into(), name: "failing".into(), args: json!({}) };
        let err = FailingTool.execute(&call, &AbortSignal::never(), &noop_update()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.message(), "missing required argument");
    }

    // -- ToolOutput::error --

    #[test]
    fn tool_output_error_sets_is_error() {
        let out = ToolOutput::error("1", "file not found");
        assert!(out.is_error);
        assert_eq!(out.content, "file not found");
    }

    #[test]
    fn tool_output_ok_is_not_error() {
        let out = ToolOutput::ok("1", "fine");
        assert!(!out.is_error);
    }

    // -- AbortSignal --

    #[test]
    fn abort_signal_never_is_never_cancelled() {
        assert!(!AbortSignal::never().is_cancelled());
    }

    #[tokio::test]
    async fn abort_signal_reports_cancellation_after_trigger() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let signal = AbortSignal::new(rx);
        assert!(!signal.is_cancelled());
        tx.send(true).unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn abort_signal_cancelled_future_resolves_once_triggered() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let signal = AbortSignal::new(rx);
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move {
                signal.cancelled().await;
            }
        });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }
}
