// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod cache;
mod call_registry;
mod callback;
mod compact;
mod events;
mod prompts;
mod runtime_context;
mod session;

pub use agent::{Agent, UserInput};
pub use cache::AgentCache;
pub use call_registry::{ToolCallRecord, ToolCallRegistry, ToolCallStatus};
pub use callback::{BroadcastSink, EventSink, NullSink};
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, retention_boundary,
    smart_truncate,
};
pub use events::{AgentEvent, CompactionStrategyUsed, NoticeCode, NoticeLevel};
pub use prompts::{system_prompt, PromptContext};
pub use runtime_context::AgentRuntimeContext;
pub use session::{Session, SessionError};
