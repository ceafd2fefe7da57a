// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use tunacode_config::AgentConfig;
use tunacode_message::{
    CompletionRequest, ContentPart, FunctionCall, Message, ModelProvider, ResponseEvent, Role,
    ToolContentPart, Usage,
};
use tunacode_tools::{
    noop_update, AbortSignal, ToolCall, ToolError, ToolOutput, ToolOutputPart, ToolRegistry,
};

use crate::{
    callback::{EventSink, NullSink},
    compact::{compact_session_with_strategy, emergency_compact, retention_boundary, smart_truncate},
    events::{AgentEvent, CompactionStrategyUsed, NoticeCode, NoticeLevel},
    prompts::{system_prompt, PromptContext},
    runtime_context::AgentRuntimeContext,
    session::Session,
};

/// Shared retry budget for consecutive empty/malformed turns before the
/// orchestrator gives up and surfaces an error.
const MAX_EMPTY_TURN_RETRIES: u32 = 2;
/// Number of tool-call rounds within one user step before the agent gets a
/// single corrective nudge if it still hasn't produced a final answer.
const STALL_ROUNDS_BEFORE_NUDGE: u32 = 2;

/// A user turn submitted to [`Agent::process_request`].
pub enum UserInput {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl UserInput {
    fn into_message(self) -> Message {
        match self {
            UserInput::Text(text) => Message::user(text),
            UserInput::Parts(parts) => Message::user_with_parts(parts),
        }
    }
}

/// The agent's model/tools/config bundle.
///
/// `Agent` holds no session state: every field is set at construction and
/// never mutated afterward, so a single `Arc<Agent>` can be shared across
/// concurrent `process_request` calls, each driving its own [`Session`].
pub struct Agent {
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    config: Arc<AgentConfig>,
    runtime: AgentRuntimeContext,
    event_sink: Arc<dyn EventSink>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: Arc<AgentConfig>,
        runtime: AgentRuntimeContext,
    ) -> Self {
        Self { model, tools, config, runtime, event_sink: Arc::new(NullSink) }
    }

    /// Attach an [`EventSink`] observer. Defaults to [`NullSink`] when never
    /// called, so every existing `Agent::new` call site keeps working.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn model(&self) -> &Arc<dyn ModelProvider> {
        &self.model
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    /// The system message this agent would install at the start of a fresh
    /// session. Exposed so callers can pre-seed a [`Session`] or inspect it.
    pub fn current_system_message(&self) -> Message {
        self.system_message()
    }

    /// Process one user turn against `session`, driving the model/tool loop
    /// until a final answer is produced, the request is cancelled, or an
    /// unrecoverable error occurs.
    ///
    /// `cancel` is checked at every loop iteration and raced against the
    /// in-flight model call; non-cancelling callers simply never fire (and
    /// hold on to) their half of the channel. This is the single
    /// cancellation-aware loop used for every call — there is no separate
    /// "uncancellable" variant.
    pub async fn process_request(
        &self,
        session: &mut Session,
        input: UserInput,
        tx: mpsc::Sender<AgentEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        if is_cancelled(&mut cancel) {
            let _ = tx.send(AgentEvent::Aborted { partial_text: None }).await;
            return Ok(());
        }

        self.ensure_fits_budget(session, &tx, 0).await?;

        if session.messages.is_empty() {
            session.push(self.system_message());
        }
        let user_message = input.into_message();
        if let Some(text) = user_message.as_text() {
            session.finalize_id(text);
        }
        session.push(user_message);

        self.run_loop(session, tx, &mut cancel).await
    }

    /// Pull-based variant of [`Agent::process_request`] for callers that
    /// prefer consuming a [`Stream`] over subscribing to a channel.
    ///
    /// The session is moved into the driving task and handed back through the
    /// returned `JoinHandle` once the stream has been fully drained (or
    /// dropped, in which case the task keeps running to completion and the
    /// handle still yields the final session).
    pub fn process_request_stream(
        self: Arc<Self>,
        mut session: Session,
        input: UserInput,
        cancel: oneshot::Receiver<()>,
    ) -> (impl Stream<Item = AgentEvent>, tokio::task::JoinHandle<(Session, anyhow::Result<()>)>)
    {
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            let result = self.process_request(&mut session, input, tx, cancel).await;
            (session, result)
        });
        (ReceiverStream::new(rx), handle)
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            git_context: self.runtime.git_context_note.as_deref(),
            project_context_file: self.runtime.project_context_file.as_deref(),
            ci_context: self.runtime.ci_context_note.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
        }
    }

    fn system_message(&self) -> Message {
        Message::system(system_prompt(None, self.prompt_context().stable_only()))
    }

    fn dynamic_context(&self) -> Option<String> {
        self.prompt_context().dynamic_block()
    }

    /// Build the message list actually sent over the wire: drops preserved
    /// `Thinking` history (arbitrary injected reasoning text should not be
    /// replayed to a provider as if it were that provider's own extended
    /// thinking) and strips images the model doesn't accept.
    fn wire_messages(&self, session: &Session) -> Vec<Message> {
        let modalities = self.model.input_modalities();
        let without_thinking: Vec<Message> =
            session.messages.iter().filter(|m| m.role != Role::Thinking).cloned().collect();
        tunacode_message::sanitize::strip_images_if_unsupported(without_thinking, &modalities)
    }

    /// The unified cancellation-aware agentic loop.
    async fn run_loop(
        &self,
        session: &mut Session,
        tx: mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut rounds = 0u32;
        let mut partial_text = String::new();
        let mut empty_turn_retries = 0u32;
        let mut tool_call_rounds_this_step = 0u32;
        let mut stall_nudge_sent = false;

        loop {
            if is_cancelled(cancel) {
                return self.abort(session, &tx, partial_text).await;
            }

            rounds += 1;
            if rounds > self.config.max_iterations {
                return self.wrap_up(session, &tx, cancel, partial_text).await;
            }

            let turn = tokio::select! {
                biased;
                _ = &mut *cancel => None,
                result = self.stream_one_turn(session, &tx, true) => Some(result),
            };

            let (text, tool_calls) = match turn {
                None => return self.abort(session, &tx, partial_text).await,
                Some(Err(e)) => return Err(e),
                Some(Ok(t)) => t,
            };

            if !text.is_empty() {
                partial_text.push_str(&text);
                session.push(Message::assistant(text.clone()));
            }

            if tool_calls.is_empty() {
                if text.is_empty() && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    empty_turn_retries += 1;
                    session.push(Message::user(
                        "You produced no response and called no tool. Continue with your next action.",
                    ));
                    continue;
                }
                if !text.is_empty()
                    && text_contains_malformed_tool_call(&text)
                    && empty_turn_retries < MAX_EMPTY_TURN_RETRIES
                {
                    empty_turn_retries += 1;
                    session.push(Message::user(
                        "Your response contained tool-call syntax written as plain text. \
                         Do not write tool calls in text; use the structured tool-call protocol instead.",
                    ));
                    continue;
                }
                if !text.is_empty()
                    && tool_call_rounds_this_step >= STALL_ROUNDS_BEFORE_NUDGE
                    && !stall_nudge_sent
                {
                    stall_nudge_sent = true;
                    session.push(Message::user(
                        "You have not finished the task yet. Continue with your next tool call.",
                    ));
                    continue;
                }
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(());
            }

            empty_turn_retries = 0;
            tool_call_rounds_this_step += 1;

            let cancelled = self.execute_tool_calls(session, &tx, &tool_calls, cancel).await;
            if cancelled {
                return self.abort(session, &tx, partial_text).await;
            }

            if self.config.request_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.config.request_delay_ms)).await;
            }

            self.ensure_fits_budget(session, &tx, rounds).await?;
        }
    }

    async fn abort(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
        partial_text: String,
    ) -> anyhow::Result<()> {
        if !partial_text.is_empty() {
            session.push(Message::assistant(partial_text.clone()));
        }
        self.notice(tx, NoticeLevel::Info, NoticeCode::Cancelled, "request cancelled").await;
        let _ = tx
            .send(AgentEvent::Aborted {
                partial_text: if partial_text.is_empty() { None } else { Some(partial_text) },
            })
            .await;
        Ok(())
    }

    /// Emit a structured notice both on the event channel and to the
    /// attached [`EventSink`].
    async fn notice(
        &self,
        tx: &mpsc::Sender<AgentEvent>,
        level: NoticeLevel,
        code: NoticeCode,
        message: impl Into<String>,
    ) {
        let message = message.into();
        self.event_sink.on_notice(level, code, &message);
        let _ = tx.send(AgentEvent::Notice { level, code, message }).await;
    }

    /// One final tool-free turn after the iteration budget is exhausted, so
    /// the model can hand off cleanly instead of being cut off mid-tool-call.
    async fn wrap_up(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
        partial_text: String,
    ) -> anyhow::Result<()> {
        session.push(Message::user(format!(
            "You have reached the maximum turn budget ({} turns). Do not call any more tools. \
             Write a concise summary of: (1) what has been completed, (2) what still remains, \
             and (3) how to continue.",
            self.config.max_iterations
        )));

        let wrap_turn = tokio::select! {
            biased;
            _ = &mut *cancel => None,
            result = self.stream_one_turn(session, tx, false) => Some(result),
        };

        match wrap_turn {
            None => return self.abort(session, tx, partial_text).await,
            Some(Ok((text, _))) if !text.is_empty() => session.push(Message::assistant(text.clone())),
            Some(Ok(_)) => {
                self.notice(
                    tx,
                    NoticeLevel::Warning,
                    NoticeCode::IterationLimitReached,
                    format!(
                        "iteration limit ({} turns) reached and the wrap-up turn produced no text",
                        self.config.max_iterations
                    ),
                )
                .await;
            }
            Some(Err(e)) => return Err(e),
        }

        let _ = tx.send(AgentEvent::TurnComplete).await;
        Ok(())
    }

    /// Three-phase tool execution: push `tool_call` messages, dispatch every
    /// call concurrently with panic isolation, then push `tool_result`
    /// messages in the original call order.
    ///
    /// Races the whole dispatch against `cancel`: if it fires first, every
    /// in-flight tool's [`AbortSignal`] is tripped and the dispatch is
    /// awaited to completion so cooperating tools can wind down and return
    /// `Err(ToolError::Cancelled)` instead of being dropped mid-operation.
    /// Returns `true` if cancellation fired during this round.
    async fn execute_tool_calls(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
        tool_calls: &[ToolCall],
        cancel: &mut oneshot::Receiver<()>,
    ) -> bool {
        for tc in tool_calls {
            self.event_sink.on_tool_call_started(tc);
            let _ = tx.send(AgentEvent::ToolCallStarted(tc.clone())).await;
            session.call_registry.register(tc.id.clone(), tc.name.clone(), tc.args.clone());
            session.call_registry.start(&tc.id);
            session.push(Message::tool_call(
                tc.id.clone(),
                FunctionCall { name: tc.name.clone(), arguments: tc.args.to_string() },
            ));
        }

        let (abort_tx, abort_rx) = watch::channel(false);
        let max_retries = self.config.max_retries;
        let timeout_secs = self.config.tool_timeout_secs;
        let mut tasks = Vec::with_capacity(tool_calls.len());
        for tc in tool_calls.iter().cloned() {
            let registry = Arc::clone(&self.tools);
            let abort_signal = AbortSignal::new(abort_rx.clone());
            tasks.push(tokio::spawn(async move {
                execute_tool_with_retry(&registry, &tc, max_retries, timeout_secs, &abort_signal, &noop_update())
                    .await
            }));
        }

        let mut joined = Box::pin(join_all(tasks));
        let cancelled;
        let results = tokio::select! {
            biased;
            _ = &mut *cancel => {
                cancelled = true;
                let _ = abort_tx.send(true);
                joined.await
            }
            results = &mut joined => {
                cancelled = false;
                results
            }
        };

        let mut outputs: Vec<Result<ToolOutput, ToolError>> = Vec::with_capacity(tool_calls.len());
        for (i, task_result) in results.into_iter().enumerate() {
            let call_id = &tool_calls[i].id;
            let result = match task_result {
                Ok(r) => r,
                Err(e) => Err(ToolError::Fatal(format!("tool execution panicked: {e}"))),
            };
            match &result {
                Ok(o) => {
                    session.call_registry.complete(call_id, o.content.clone());
                    self.event_sink.on_tool_call_finished(call_id, o);
                }
                Err(ToolError::Cancelled) => session.call_registry.cancel(call_id),
                Err(e) => session.call_registry.fail(call_id, e.message()),
            }
            let (output_text, is_error) = match &result {
                Ok(o) => (o.content.clone(), o.is_error),
                Err(e) => (e.message(), true),
            };
            let _ = tx
                .send(AgentEvent::ToolCallFinished {
                    call_id: call_id.clone(),
                    tool_name: tool_calls[i].name.clone(),
                    output: output_text,
                    is_error,
                })
                .await;
            outputs.push(result);
        }

        let cap = self.config.compaction.tool_result_token_cap;
        for (tc, output) in tool_calls.iter().zip(outputs.into_iter()) {
            let category = self.tools.get(&tc.name).map(|t| t.output_category()).unwrap_or_default();
            let tool_msg = match output {
                Ok(o) if o.has_images() => {
                    let is_error = o.is_error;
                    let parts: Vec<ToolContentPart> = o
                        .parts
                        .iter()
                        .map(|p| match p {
                            ToolOutputPart::Text(t) => {
                                ToolContentPart::Text { text: smart_truncate(t, category, cap) }
                            }
                            ToolOutputPart::Image(url) => ToolContentPart::Image { image_url: url.clone() },
                        })
                        .collect();
                    Message::tool_result_with_parts(tc.id.clone(), parts, is_error)
                }
                Ok(o) => {
                    Message::tool_result(tc.id.clone(), smart_truncate(&o.content, category, cap), o.is_error)
                }
                Err(e) => {
                    Message::tool_result(tc.id.clone(), smart_truncate(&e.message(), category, cap), true)
                }
            };
            session.push(tool_msg);
        }

        cancelled
    }

    /// Run a single tool-free turn and return the full text response.
    /// Used for compaction summary generation.
    async fn run_single_turn(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<String> {
        let (text, _) = self.stream_one_turn(session, tx, false).await?;
        Ok(text)
    }

    /// Call the model once, streaming text deltas and collecting tool-call
    /// events. Returns the accumulated text and any tool calls requested.
    async fn stream_one_turn(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
        with_tools: bool,
    ) -> anyhow::Result<(String, Vec<ToolCall>)> {
        let tools: Vec<tunacode_message::ToolSchema> = if with_tools {
            self.tools
                .schemas()
                .into_iter()
                .map(|s| tunacode_message::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect()
        } else {
            vec![]
        };

        let req = CompletionRequest {
            messages: self.wire_messages(session),
            tools: tools.clone(),
            stream: true,
            system_dynamic_suffix: self.dynamic_context(),
            cache_key: Some(session.id.clone()),
        };

        let mut stream = match self.model.complete(req).await {
            Ok(s) => s,
            Err(e) => {
                // Provider reported a hard context-size overflow (e.g. llama.cpp's
                // `exceed_context_size_error` with `n_ctx`). Correct the session's
                // budget, compact directly (not via ensure_fits_budget, which would
                // recurse into a model call), and retry exactly once.
                if let Some(n_ctx) = extract_n_ctx_from_error(&e) {
                    warn!(
                        n_ctx,
                        old_max_tokens = session.max_tokens,
                        "context overflow: configured budget was wrong; updating to \
                         actual n_ctx and compacting before retry"
                    );
                    self.notice(
                        tx,
                        NoticeLevel::Warning,
                        NoticeCode::OverflowRetry,
                        format!(
                            "model reported a context overflow at n_ctx={n_ctx}; compacting and retrying once"
                        ),
                    )
                    .await;
                    session.max_tokens = n_ctx;
                    let sys = self.system_message();
                    emergency_compact(&mut session.messages, Some(sys), self.config.compaction.keep_recent_messages);
                    session.recalculate_tokens();

                    let req2 = CompletionRequest {
                        messages: self.wire_messages(session),
                        tools,
                        stream: true,
                        system_dynamic_suffix: self.dynamic_context(),
                        cache_key: Some(session.id.clone()),
                    };
                    self.model.complete(req2).await.context("model completion failed (after context recovery)")?
                } else {
                    return Err(e).context("model completion failed");
                }
            }
        };

        let mut full_text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        // Keyed by the parallel-tool-call index from the provider: OpenAI
        // interleaves chunks for different tool calls by index; other
        // providers always use index 0.
        let mut pending_tcs: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut thinking_buf = String::new();

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::MaxTokens => {}
                ResponseEvent::ThinkingDelta(delta) => {
                    thinking_buf.push_str(&delta);
                    self.event_sink.on_thinking_delta(&delta);
                    let _ = tx.send(AgentEvent::ThinkingDelta(delta)).await;
                }
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    if !thinking_buf.is_empty() {
                        let content = std::mem::take(&mut thinking_buf);
                        let _ = tx.send(AgentEvent::ThinkingComplete(strip_think_wrappers(content))).await;
                    }
                    full_text.push_str(&delta);
                    self.event_sink.on_text_delta(&delta);
                    let _ = tx.send(AgentEvent::TextDelta(delta)).await;
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    let ptc = pending_tcs.entry(index).or_insert_with(|| PendingToolCall {
                        id: String::new(),
                        name: String::new(),
                        args_buf: String::new(),
                    });
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => {
                    session.usage.add_turn(&Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens });
                    self.event_sink.on_usage(&session.usage);
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: input_tokens,
                            output: output_tokens,
                            context_total: session.token_count,
                            cache_read: cache_read_tokens,
                            cache_write: cache_write_tokens,
                            cache_read_total: session.usage.cache_read_tokens,
                            cache_write_total: session.usage.cache_write_tokens,
                            max_tokens: session.max_tokens,
                        })
                        .await;
                }
                ResponseEvent::Done => {
                    if !thinking_buf.is_empty() {
                        let content = std::mem::take(&mut thinking_buf);
                        let _ = tx.send(AgentEvent::ThinkingComplete(strip_think_wrappers(content))).await;
                    }
                    break;
                }
                ResponseEvent::Error(e) => {
                    warn!("model stream error: {e}");
                }
                _ => {}
            }
        }

        // Some model servers emit thinking as plain <think>...</think> text
        // instead of a dedicated reasoning channel. If the entire response is
        // such a block, reclassify it as thinking and clear full_text so the
        // loop sees a thinking-only turn and applies the empty-turn retry.
        if !full_text.is_empty() && thinking_buf.is_empty() {
            if let Some(inline_think) = extract_inline_think_block(&full_text) {
                let _ = tx.send(AgentEvent::ThinkingComplete(inline_think)).await;
                full_text.clear();
            }
        }

        // Flush accumulated parallel tool calls, ordered by provider index.
        let mut pending_sorted: Vec<(u32, PendingToolCall)> = pending_tcs.into_iter().collect();
        pending_sorted.sort_by_key(|(idx, _)| *idx);
        for (i, (_, ptc)) in pending_sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model; cannot dispatch");
                continue;
            }
            let mut tc = ptc.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
                warn!(tool_name = %tc.name, tool_call_id = %tc.id, "tool call from model had empty id; generated synthetic id");
            }
            tool_calls.push(tc);
        }

        if !full_text.is_empty() {
            let _ = tx.send(AgentEvent::TextComplete(full_text.clone())).await;
        }

        Ok((full_text, tool_calls))
    }

    /// Check the effective token budget and compact the session if needed.
    /// Called before every model submission (pre-submit, at `turn = 0`) and
    /// after every batch of tool results during the agentic loop.
    async fn ensure_fits_budget(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
        turn: u32,
    ) -> anyhow::Result<()> {
        if session.max_tokens == 0 {
            return Ok(());
        }

        // Account for the reserve fraction so compaction fires before the
        // hard ceiling, leaving headroom for tool schemas and measurement
        // error in the chars/4 token approximation.
        let threshold = (self.config.compaction.threshold - self.config.compaction.reserve_fraction).max(0.1);
        if !self.config.compaction.enabled {
            if session.is_near_limit(threshold) {
                self.notice(
                    tx,
                    NoticeLevel::Warning,
                    NoticeCode::CompactionSkipped,
                    "context is near the configured limit but compaction is disabled",
                )
                .await;
            }
            return Ok(());
        }
        if !session.is_near_limit(threshold) {
            return Ok(());
        }

        let tokens_before = session.token_count;
        let sys = self.system_message();
        let keep_n = self.config.compaction.keep_recent_messages;

        let non_system: Vec<Message> = session.messages.iter().filter(|m| m.role != Role::System).cloned().collect();
        let boundary = retention_boundary(&non_system, keep_n);
        let recent_messages: Vec<Message> = non_system[boundary..].to_vec();

        // Would the compaction prompt itself (the old messages only) overflow
        // the budget? If so there is no point asking the model to summarize;
        // fall straight to the deterministic emergency path.
        let recent_raw_tokens: usize = recent_messages.iter().map(|m| m.approx_tokens()).sum();
        let compaction_input = session.token_count.saturating_sub(recent_raw_tokens);
        let would_overflow = boundary == 0 || (compaction_input as f32 / session.max_tokens as f32) >= 0.95;

        let strategy_used = if would_overflow {
            emergency_compact(&mut session.messages, Some(sys), keep_n);
            session.recalculate_tokens();
            CompactionStrategyUsed::Emergency
        } else {
            let original_messages = session.messages.clone();
            let original_token_count = session.token_count;

            let mut to_compact: Vec<Message> = non_system[..boundary].to_vec();
            compact_session_with_strategy(&mut to_compact, Some(sys.clone()), &self.config.compaction.strategy);
            session.messages = to_compact;
            session.recalculate_tokens();

            match self.run_single_turn(session, tx).await {
                Ok(summary) if !summary.is_empty() => {
                    session.messages.clear();
                    session.messages.push(sys);
                    session.messages.push(Message::assistant(summary));
                    session.messages.extend(recent_messages);
                    session.recalculate_tokens();
                    self.config.compaction.strategy.into()
                }
                outcome => {
                    match outcome {
                        Err(e) => warn!("compaction model call failed, falling back to emergency compact: {e}"),
                        Ok(_) => warn!("compaction returned an empty summary, falling back to emergency compact"),
                    }
                    session.messages = original_messages;
                    session.token_count = original_token_count;
                    emergency_compact(&mut session.messages, Some(sys), keep_n);
                    session.recalculate_tokens();
                    CompactionStrategyUsed::Emergency
                }
            }
        };

        session.compaction_count += 1;
        self.event_sink.on_context_compacted(tokens_before, session.token_count, &strategy_used.to_string());
        self.notice(
            tx,
            NoticeLevel::Info,
            NoticeCode::CompactionApplied,
            format!(
                "compacted session from {tokens_before} to {} tokens via {strategy_used} strategy",
                session.token_count
            ),
        )
        .await;
        let _ = tx
            .send(AgentEvent::ContextCompacted {
                tokens_before,
                tokens_after: session.token_count,
                strategy: strategy_used,
                turn,
            })
            .await;

        Ok(())
    }
}

/// Dispatch a tool call, retrying within `max_retries` when the tool reports
/// a retryable failure (including a timeout). Fatal failures and
/// cancellation are surfaced immediately; a panic unwinds past this
/// function entirely and is caught by the caller at the `JoinHandle` level
/// instead (never retried there).
async fn execute_tool_with_retry(
    registry: &ToolRegistry,
    call: &ToolCall,
    max_retries: u32,
    timeout_secs: u64,
    abort_signal: &AbortSignal,
    on_update: &tunacode_tools::ToolUpdate,
) -> Result<ToolOutput, ToolError> {
    let mut attempt = 0;
    loop {
        if abort_signal.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let result = if timeout_secs == 0 {
            tokio::select! {
                biased;
                _ = abort_signal.cancelled() => Err(ToolError::Cancelled),
                r = registry.execute(call, abort_signal, on_update) => r,
            }
        } else {
            tokio::select! {
                biased;
                _ = abort_signal.cancelled() => Err(ToolError::Cancelled),
                r = tokio::time::timeout(
                    std::time::Duration::from_secs(timeout_secs),
                    registry.execute(call, abort_signal, on_update),
                ) => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::Retryable(format!("tool '{}' timed out after {timeout_secs}s", call.name))),
                },
            }
        };
        match result {
            Ok(output) => return Ok(output),
            Err(ToolError::Cancelled) => return Err(ToolError::Cancelled),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `Ok(())` or a closed channel both mean "cancelled"; `Empty` is the only
/// "still running" state.
fn is_cancelled(cancel: &mut oneshot::Receiver<()>) -> bool {
    !matches!(cancel.try_recv(), Err(TryRecvError::Empty))
}

/// Extract `n_ctx` from a provider's context-size-overflow error.
///
/// llama.cpp-compatible servers report an overflow as an HTTP error body
/// shaped like:
///
/// ```json
/// {"error":{"type":"exceed_context_size_error","n_ctx":54272,"n_prompt_tokens":54298,...}}
/// ```
///
/// Returns `Some(n_ctx)` when the error message contains that pattern,
/// `None` for any other error.
fn extract_n_ctx_from_error(err: &anyhow::Error) -> Option<usize> {
    let msg = err.to_string();
    if !msg.contains("exceed_context_size_error") {
        return None;
    }
    let json_start = msg.find('{')?;
    let body: serde_json::Value = serde_json::from_str(&msg[json_start..]).ok()?;
    if let Some(n) = body["error"]["n_ctx"].as_u64() {
        return Some(n as usize);
    }
    body["n_ctx"].as_u64().map(|n| n as usize)
}

/// Strip `<think>` / `</think>` wrapper tags from accumulated thinking content.
fn strip_think_wrappers(s: String) -> String {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("<think>").unwrap_or(trimmed);
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    inner.trim().to_string()
}

/// Detect a `<think>...</think>` block occupying the *entire* text.
///
/// Returns `None` when the text contains content outside the block.
fn extract_inline_think_block(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("<think>")?;
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    if inner.contains("</think>") {
        return None;
    }
    Some(inner.trim().to_string())
}

/// Return true when `text` contains tool-call markup that the model wrote
/// into the text stream instead of emitting as a structured tool call.
///
/// Patterns detected:
/// - `<tool_call>` / `</tool_call>` (Qwen XML format)
/// - `<function=name>` (Hermes/Nous function tag)
/// - `[TOOL_CALL]` (some other open-source variants)
fn text_contains_malformed_tool_call(text: &str) -> bool {
    text.contains("<tool_call>")
        || text.contains("</tool_call>")
        || text.contains("<function=")
        || text.contains("[TOOL_CALL]")
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCall {
        // Tool call args must resolve to a JSON object: some providers reject
        // `null` arguments on the *next* completion request.
        let args = if self.args_buf.is_empty() {
            warn!(
                tool_name = %self.name,
                tool_call_id = %self.id,
                "model sent tool call with empty arguments; substituting {{}}"
            );
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match attempt_json_repair(&self.args_buf) {
                    Ok(v) => {
                        warn!(tool_name = %self.name, tool_call_id = %self.id, "repaired invalid JSON arguments from model");
                        v
                    }
                    Err(_) => {
                        warn!(
                            tool_name = %self.name,
                            tool_call_id = %self.id,
                            args_buf = %self.args_buf,
                            error = %parse_err,
                            "model sent tool call with invalid JSON arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCall { id: self.id, name: self.name, args }
    }
}

/// Attempt to repair common JSON syntax errors in model-generated tool-call
/// arguments: invalid escape sequences, missing commas between key-value
/// pairs, and truncated strings/objects.
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }

    let repaired = regex::Regex::new(r#""([^"]+)"([a-zA-Z_][a-zA-Z0-9_]*)":\s*"#)
        .unwrap()
        .replace_all(&fixed, r#""$1", "$2": "#);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Ok(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Walk through a JSON string and replace invalid escape sequences inside
/// string values with a properly escaped backslash.
///
/// Valid JSON escape characters are `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`,
/// `u`; anything else (e.g. `\c`, `\p`, `\(`) becomes `\\X` so the result
/// round-trips through serde_json without a parse error.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}
