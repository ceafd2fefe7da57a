// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tunacode_message::{Message, UsageMetrics};
use uuid::Uuid;

use crate::call_registry::ToolCallRegistry;

/// Errors that can occur while loading or saving a [`Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("reading session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("session state is not well-formed: {0}")]
    MalformedState(String),
    #[error("parsing session state: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk representation of a [`Session`], matched field-for-field against
/// `state.json`.
#[derive(Debug, Serialize, Deserialize)]
struct SessionState {
    session_id: String,
    messages: Vec<Message>,
    max_tokens: usize,
    usage: UsageMetrics,
    #[serde(default = "legacy_timestamp_fallback")]
    created_at: DateTime<Utc>,
    #[serde(default = "legacy_timestamp_fallback")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    compaction_count: u32,
}

/// Placeholder timestamp for session files written before `created_at`/
/// `updated_at` existed. Fixed rather than `Utc::now()` so loading the same
/// legacy file twice produces identical output.
fn legacy_timestamp_fallback() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Cumulative usage across every turn of this session.
    pub usage: UsageMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of times this session has been compacted.
    pub compaction_count: u32,
    /// Ephemeral registry of in-flight and completed tool calls for the
    /// current turn. Never persisted to disk.
    pub call_registry: ToolCallRegistry,
    /// Timestamp/short-id half of the session id, still awaiting a slug
    /// derived from the first user message. `None` once `finalize_id` has
    /// run, or for a session loaded from disk (already finalized).
    pending_id_parts: Option<SessionIdParts>,
}

struct SessionIdParts {
    timestamp: String,
    short_id: String,
}

/// Generate the unfinalized `{timestamp}_{short_id}` half of a session id.
/// The slug is appended later by [`Session::finalize_id`] once the first
/// user message is known.
fn new_session_id_parts() -> SessionIdParts {
    SessionIdParts {
        timestamp: Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
        short_id: Uuid::new_v4().simple().to_string()[..6].to_string(),
    }
}

/// Lowercase, `[a-z0-9-]{,20}` slug derived from free text: non-alphanumeric
/// runs collapse to a single dash, leading/trailing dashes are trimmed, and
/// the result is truncated to 20 chars. May be empty if `text` has no
/// alphanumeric content, which is a valid (slugless) session id.
fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_was_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(20);
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        let parts = new_session_id_parts();
        let now = Utc::now();
        Self {
            id: format!("{}_{}", parts.timestamp, parts.short_id),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            usage: UsageMetrics::zero(),
            created_at: now,
            updated_at: now,
            compaction_count: 0,
            call_registry: ToolCallRegistry::new(),
            pending_id_parts: Some(parts),
        }
    }

    /// Insert the slug derived from `seed_text` into the session id, once.
    /// Idempotent: a second call is a no-op. Called by the orchestrator right
    /// after the first user message of the session is known.
    pub fn finalize_id(&mut self, seed_text: &str) {
        let Some(parts) = self.pending_id_parts.take() else { return };
        let slug = slugify(seed_text);
        self.id = if slug.is_empty() {
            format!("{}_{}", parts.timestamp, parts.short_id)
        } else {
            format!("{}_{}_{}", parts.timestamp, slug, parts.short_id)
        };
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
        self.updated_at = Utc::now();
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Persist this session to `path` atomically: write to a sibling temp
    /// file then rename over the target, so a crash mid-write never leaves a
    /// truncated `state.json` behind.
    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let state = SessionState {
            session_id: self.id.clone(),
            messages: self.messages.clone(),
            max_tokens: self.max_tokens,
            usage: self.usage,
            created_at: self.created_at,
            updated_at: self.updated_at,
            compaction_count: self.compaction_count,
        };
        let json = serde_json::to_string_pretty(&state)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load a session previously written by [`Session::save`].
    ///
    /// The top-level JSON value must be an object — any other shape (array,
    /// string, bare number) is a hard [`SessionError::MalformedState`]
    /// failure rather than a silently empty session. Legacy session files
    /// that used a plain UUID (no `sess_` prefix) for `session_id` are
    /// tolerated and loaded as-is.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if !value.is_object() {
            return Err(SessionError::MalformedState(format!(
                "expected a JSON object at the top level, found {}",
                value_kind(&value)
            )));
        }
        let state: SessionState = serde_json::from_value(value)?;
        let token_count = state.messages.iter().map(|m| m.approx_tokens()).sum();
        Ok(Self {
            id: state.session_id,
            messages: state.messages,
            token_count,
            max_tokens: state.max_tokens,
            usage: state.usage,
            created_at: state.created_at,
            updated_at: state.updated_at,
            compaction_count: state.compaction_count,
            call_registry: ToolCallRegistry::new(),
            pending_id_parts: None,
        })
    }
}

fn value_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tunacode_message::Message;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new(1000);
        let b = Session::new(1000);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_session_id_is_timestamp_and_short_id_before_finalize() {
        let s = Session::new(1000);
        // {YYYY-MM-DD_HH-MM-SS}_{6 hex chars}, no slug yet.
        let parts: Vec<&str> = s.id.rsplitn(2, '_').collect();
        assert_eq!(parts[0].len(), 6);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn finalize_id_inserts_slug_between_timestamp_and_short_id() {
        let mut s = Session::new(1000);
        s.finalize_id("Fix the login bug!!");
        assert!(s.id.contains("_fix-the-login-bug_"));
    }

    #[test]
    fn finalize_id_is_idempotent() {
        let mut s = Session::new(1000);
        s.finalize_id("first seed");
        let id_after_first = s.id.clone();
        s.finalize_id("second seed, ignored");
        assert_eq!(s.id, id_after_first);
    }

    #[test]
    fn finalize_id_with_no_alphanumeric_content_leaves_slug_empty() {
        let mut s = Session::new(1000);
        s.finalize_id("!!!");
        // {timestamp}_{short_id}, same shape as before finalize.
        let parts: Vec<&str> = s.id.rsplitn(2, '_').collect();
        assert_eq!(parts[0].len(), 6);
    }

    #[test]
    fn slugify_truncates_to_20_chars_and_trims_trailing_dash() {
        let slug = slugify("this is a very long sentence that keeps going");
        assert!(slug.len() <= 20);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn new_session_starts_empty() {
        let s = Session::new(1000);
        assert!(s.messages.is_empty());
        assert_eq!(s.token_count, 0);
        assert_eq!(s.usage.total_tokens, 0);
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    #[test]
    fn push_increments_token_count() {
        let mut s = Session::new(1000);
        // "12345678" = 8 chars → 2 tokens
        s.push(Message::user("12345678"));
        assert_eq!(s.token_count, 2);
    }

    #[test]
    fn push_many_accumulates_tokens() {
        let mut s = Session::new(10_000);
        s.push_many([
            Message::user("12345678"),  // 2 tokens
            Message::assistant("abcd"), // 1 token
        ]);
        assert_eq!(s.token_count, 3);
    }

    #[test]
    fn recalculate_tokens_matches_push_sum() {
        let mut s = Session::new(1000);
        s.push(Message::user("hello world")); // 11 chars → 2 tokens
        let after_push = s.token_count;
        s.recalculate_tokens();
        assert_eq!(s.token_count, after_push);
    }

    #[test]
    fn recalculate_after_manual_drain_resets_to_zero() {
        let mut s = Session::new(1000);
        s.push(Message::user("text"));
        s.messages.clear();
        s.recalculate_tokens();
        assert_eq!(s.token_count, 0);
    }

    #[test]
    fn replace_messages_sets_messages_and_recalculates_tokens() {
        let mut s = Session::new(1000);
        s.push(Message::user("first"));
        s.push(Message::assistant("reply"));
        assert_eq!(s.messages.len(), 2);
        let new_msgs = vec![Message::user("only")];
        s.replace_messages(new_msgs.clone());
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].as_text(), Some("only"));
        assert_eq!(s.token_count, 1); // "only" → 1 token
    }

    // ── Context fraction ──────────────────────────────────────────────────────

    #[test]
    fn context_fraction_zero_when_empty() {
        let s = Session::new(1000);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_at_zero_max_does_not_panic() {
        let s = Session::new(0);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_increases_with_messages() {
        let mut s = Session::new(100);
        let before = s.context_fraction();
        s.push(Message::user("a long message that uses more tokens"));
        assert!(s.context_fraction() > before);
    }

    // ── Near-limit detection ──────────────────────────────────────────────────

    #[test]
    fn is_near_limit_false_when_empty() {
        let s = Session::new(1000);
        assert!(!s.is_near_limit(0.8));
    }

    #[test]
    fn is_near_limit_true_when_over_threshold() {
        let mut s = Session::new(4); // tiny window
        s.push(Message::user("1234567890123")); // 13 chars = 3 tokens, fraction 0.75
        s.push(Message::user("abcd")); // + 1 token → fraction 1.0 ≥ 0.8
        assert!(s.is_near_limit(0.8));
    }

    #[test]
    fn is_near_limit_exactly_at_threshold() {
        let mut s = Session::new(10);
        s.push(Message::user("12345678901234567890")); // 20 chars = 5 tokens
        assert!(s.is_near_limit(0.5));
        assert!(!s.is_near_limit(0.6));
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut s = Session::new(5000);
        s.push(Message::user("hello"));
        s.push(Message::assistant("hi there"));
        s.usage.input_tokens = 42;
        s.usage.total_tokens = 42;
        s.save(&path).unwrap();

        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded.id, s.id);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.max_tokens, 5000);
        assert_eq!(loaded.usage.input_tokens, 42);
        assert_eq!(loaded.created_at, s.created_at);
        assert_eq!(loaded.updated_at, s.updated_at);
        assert_eq!(loaded.compaction_count, 0);
    }

    #[test]
    fn push_bumps_updated_at() {
        let mut s = Session::new(1000);
        let created = s.created_at;
        s.updated_at = DateTime::<Utc>::MIN_UTC;
        s.push(Message::user("hi"));
        assert_eq!(s.created_at, created, "created_at must not change on push");
        assert!(s.updated_at > DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn legacy_state_without_timestamps_loads_with_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let legacy = serde_json::json!({
            "session_id": "sess_legacy",
            "messages": [],
            "max_tokens": 1000,
            "usage": {
                "input_tokens": 0, "output_tokens": 0,
                "cache_read_tokens": 0, "cache_write_tokens": 0,
                "total_tokens": 0,
                "cost": {"input": 0.0, "output": 0.0, "total": 0.0}
            }
        });
        std::fs::write(&path, legacy.to_string()).unwrap();
        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded.created_at, DateTime::<Utc>::MIN_UTC);
        assert_eq!(loaded.compaction_count, 0);
    }

    #[test]
    fn save_recovers_from_stale_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(path.with_extension("json.tmp"), "garbage").unwrap();
        let s = Session::new(1000);
        s.save(&path).unwrap();
        assert!(Session::load(&path).is_ok());
    }

    #[test]
    fn load_tolerates_legacy_plain_uuid_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let legacy = serde_json::json!({
            "session_id": "550e8400-e29b-41d4-a716-446655440000",
            "messages": [],
            "max_tokens": 1000,
            "usage": {
                "input_tokens": 0, "output_tokens": 0,
                "cache_read_tokens": 0, "cache_write_tokens": 0,
                "total_tokens": 0,
                "cost": {"input": 0.0, "output": 0.0, "total": 0.0}
            }
        });
        std::fs::write(&path, legacy.to_string()).unwrap();
        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded.id, "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn load_rejects_non_object_top_level_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let err = Session::load(&path).unwrap_err();
        assert!(matches!(err, SessionError::MalformedState(_)));
    }

    #[test]
    fn load_rejects_bare_string_top_level_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "\"just a string\"").unwrap();
        let err = Session::load(&path).unwrap_err();
        assert!(matches!(err, SessionError::MalformedState(_)));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = Session::load(Path::new("/tmp/tunacode_nonexistent_state_xyz.json")).unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }
}
