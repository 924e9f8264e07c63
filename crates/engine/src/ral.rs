//! The reasoning-and-action loop: one turn of one agent in one
//! conversation, triggered by one event.
//!
//! The loop streams the LLM response (flushing partial content as signed
//! stream-chunk events), dispatches tool calls through the runtime, and
//! keeps looping until the model stops calling tools. Delegation-class
//! tools park the loop on the delegation coordinator; cancellation is
//! observed at every chunk and call boundary. Every terminal outcome
//! publishes a final signed event so observers see what happened.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use cv_agents::{AgentHandle, AgentHome};
use cv_domain::cancel::CancelToken;
use cv_domain::delegation::{DelegationRecord, DelegationReplies, DelegationStatus, StopSignal};
use cv_domain::error::{Error, Result};
use cv_domain::event::{Event, EventBuilder, EventKind, Tag};
use cv_domain::message::{assistant_with_tool_calls, Message, ToolCall};
use cv_domain::stream::StreamEvent;
use cv_llm::{ChatOptions, ChatRequest, LlmService};
use cv_tools::runtime::truncate_str;
use cv_tools::scope::Sandbox;
use cv_tools::{EventPublisher, ToolContext};

use crate::cancel::ral_key;
use crate::composer::{self, ComposerInput};
use crate::coordinator::{ActionRecord, ConcurrentRalCoordinator, RalStatus};
use crate::state::{AgentPublisher, EngineState, RalMailbox, RegistryResolver};
use crate::thread;

const PREVIEW_LEN: usize = 200;

/// Spawn a loop for `agent` triggered by `trigger`. Returns immediately;
/// the loop runs on its own task.
pub fn spawn(state: EngineState, agent: Arc<AgentHandle>, conversation_id: String, trigger: Event) {
    let span = tracing::info_span!(
        "ral",
        agent = %agent.slug(),
        conversation = %conversation_id,
        trigger = %trigger.id,
    );
    tokio::spawn(run(state, agent, conversation_id, trigger).instrument(span));
}

async fn run(state: EngineState, agent: Arc<AgentHandle>, conversation_id: String, trigger: Event) {
    let key = ral_key(&conversation_id, agent.slug());
    let coordinator = state.coordinators.for_conversation(&conversation_id);
    let phase = state.phases.current(&conversation_id);
    let ral_number = coordinator.register(agent.slug(), &trigger.id, phase);

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancelToken::new();
    let claimed = state.live_rals.claim(
        &key,
        RalMailbox {
            tx,
            cancel: cancel.clone(),
            ral_number,
        },
    );
    if !claimed {
        // Raced another loop for the same (conversation, agent): fold the
        // trigger into the live one instead (resume policy).
        state.live_rals.deliver(&key, trigger);
        coordinator.set_status(ral_number, RalStatus::Cancelled);
        return;
    }
    state.cancels.insert(&key, cancel.clone());

    let started = Instant::now();
    let mut ral = Ral {
        state: state.clone(),
        agent,
        conversation_id: conversation_id.clone(),
        trigger,
        cancel: cancel.clone(),
        coordinator: coordinator.clone(),
        ral_number,
        resumptions: rx,
        started,
        tool_calls_executed: 0,
        pending_delegations: Vec::new(),
    };

    let status = match ral.run().await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(error = %e, "loop terminated with error");
            let kind_label = error_label(&e);
            ral.publish_terminal_metadata(
                e.to_string(),
                vec![Tag::new(["error", kind_label])],
            )
            .await;
            RalStatus::Errored
        }
    };

    // Whatever the terminal outcome, outstanding delegations are over;
    // late replies are dropped on arrival.
    state.delegations.cancel_for(&conversation_id, ral_number);
    coordinator.set_status(ral_number, status);
    state.live_rals.release(&key);
    state.cancels.remove(&key);
    tracing::debug!(status = status.as_str(), elapsed_ms = started.elapsed().as_millis() as u64, "loop finished");
}

fn error_label(e: &Error) -> &'static str {
    match e {
        Error::Validation(_) => "validation",
        Error::ScopeViolation(_) => "scope-violation",
        Error::Execution(_) => "execution",
        Error::Transport(_) => "transport",
        Error::Signature(_) => "signature",
        Error::Cancelled => "cancelled",
        Error::BudgetExceeded(_) => "budget-exceeded",
        Error::Io(_) => "io",
        Error::Json(_) => "json",
        Error::Config(_) => "config",
        Error::Other(_) => "other",
    }
}

struct Ral {
    state: EngineState,
    agent: Arc<AgentHandle>,
    conversation_id: String,
    trigger: Event,
    cancel: CancelToken,
    coordinator: Arc<ConcurrentRalCoordinator>,
    ral_number: u64,
    resumptions: mpsc::UnboundedReceiver<Event>,
    started: Instant,
    tool_calls_executed: usize,
    /// Receivers for delegations this loop has registered but not yet
    /// been woken for.
    pending_delegations: Vec<oneshot::Receiver<DelegationReplies>>,
}

impl Ral {
    fn publisher(&self) -> AgentPublisher {
        AgentPublisher {
            bus: self.state.bus.clone(),
            agent: self.agent.clone(),
        }
    }

    /// Tags shared by every event this loop publishes.
    fn base_tags(&self, with_delegation: bool) -> Vec<Tag> {
        let mut tags = vec![Tag::conversation(&self.conversation_id)];
        let root = self.conversation_id.clone();
        if root == self.trigger.id {
            tags.push(Tag::event_marked(&self.trigger.id, "root"));
        } else {
            tags.push(Tag::event_marked(&root, "root"));
            tags.push(Tag::event_marked(&self.trigger.id, "reply"));
        }
        let phase = self.state.phases.current(&self.conversation_id);
        tags.push(Tag::phase(phase.as_str()));
        if with_delegation {
            if let Some(parent) = self.trigger.delegation_parent() {
                tags.push(Tag::delegation(parent));
            }
        }
        tags
    }

    async fn publish_stream_chunk(&self, content: String) {
        if content.is_empty() {
            return;
        }
        let tags = self.base_tags(false);
        if let Err(e) = self
            .publisher()
            .publish(EventKind::STREAM_CHUNK, content, tags)
            .await
        {
            tracing::warn!(error = %e, "failed to publish stream chunk");
        }
    }

    /// Final conversational event for this turn.
    async fn publish_final(&self, content: String) -> Result<String> {
        let mut tags = self.base_tags(true);
        tags.push(Tag::pubkey(&self.trigger.author));
        tags.push(Tag::execution_time(self.started.elapsed().as_millis() as u64));
        self.publisher().publish(EventKind::NOTE, content, tags).await
    }

    /// Terminal metadata event (cancelled / errored / empty completion).
    async fn publish_terminal_metadata(&self, content: String, extra_tags: Vec<Tag>) {
        let mut tags = self.base_tags(false);
        tags.push(Tag::execution_time(self.started.elapsed().as_millis() as u64));
        tags.extend(extra_tags);
        if let Err(e) = self
            .publisher()
            .publish(EventKind::METADATA, content, tags)
            .await
        {
            tracing::warn!(error = %e, "failed to publish terminal metadata");
        }
    }

    fn tool_context(&self) -> Result<ToolContext> {
        let home = AgentHome::for_pubkey(&self.state.disk_root(), &self.agent.pubkey)?;
        let working_dir = self.state.working_dir(&self.conversation_id)?;
        Ok(ToolContext {
            conversation_id: self.conversation_id.clone(),
            agent_slug: self.agent.slug().to_owned(),
            agent_pubkey: self.agent.pubkey.clone(),
            agent_category: self.agent.definition.category,
            project_address: self.state.config.project_address.clone(),
            phase: self.state.phases.current(&self.conversation_id),
            sandbox: Sandbox::new(working_dir, home.path()),
            store: self.state.store.clone(),
            publisher: Arc::new(self.publisher()),
            phases: self.state.phases.clone(),
            recipients: Arc::new(RegistryResolver {
                agents: self.state.agents.clone(),
            }),
            cancel: self.cancel.clone(),
        })
    }

    /// Compose the message list from current conversation state.
    async fn compose(&self, delegation: Option<&DelegationReplies>) -> Vec<Message> {
        let conversation = self
            .state
            .store
            .snapshot(&self.conversation_id)
            .unwrap_or_else(|| cv_store::Conversation::new(&self.conversation_id));
        let thread = thread::thread_to(&conversation, &self.trigger.id);
        let phase = conversation.phase;
        let siblings = self.coordinator.other_rals(self.ral_number);
        let home_files = AgentHome::for_pubkey(&self.state.disk_root(), &self.agent.pubkey)
            .map(|h| h.context_files())
            .unwrap_or_default();
        let responding_to = self.state.author_display(&self.trigger.author);

        let input = ComposerInput {
            agent: &self.agent,
            conversation: &conversation,
            thread: &thread,
            trigger: &self.trigger,
            phase,
            ral_number: self.ral_number,
            siblings: &siblings,
            delegation,
            global_prompt: self.state.config.global_system_prompt.as_deref(),
            home_files: &home_files,
            debug: self.trigger.has_tag("debug"),
            responding_to: Some(responding_to.as_str()),
        };
        let (messages, report) = composer::compose(&input);
        if report.stripped_anything() {
            self.publish_terminal_diagnostic(&report).await;
        }
        messages
    }

    async fn publish_terminal_diagnostic(&self, report: &composer::SanitizeReport) {
        let tags = vec![
            Tag::conversation(&self.conversation_id),
            Tag::new([
                "sanitized".to_string(),
                (report.stripped_empty + report.stripped_trailing_assistant).to_string(),
            ]),
        ];
        if let Err(e) = self
            .publisher()
            .publish(EventKind::METADATA, String::new(), tags)
            .await
        {
            tracing::debug!(error = %e, "failed to publish sanitize diagnostic");
        }
    }

    async fn run(&mut self) -> Result<RalStatus> {
        let llm = self
            .state
            .llm
            .resolve(
                self.agent.definition.llm_config_name.as_deref(),
                &self.state.config.llm_defaults,
            )
            .ok_or_else(|| Error::Execution("no LLM service configured".into()))?;
        let policy = self.agent.tool_policy(&self.state.config);
        let max_steps = self
            .agent
            .definition
            .max_agent_steps
            .unwrap_or(self.state.config.limits.max_agent_steps);
        let tool_ctx = self.tool_context()?;
        let llm_deadline = Duration::from_secs(self.state.config.limits.llm_deadline_secs);

        let mut delegation_ctx: Option<DelegationReplies> = None;
        // Tool exchanges accumulated since the last full composition.
        let mut suffix: Vec<Message> = Vec::new();

        'invocation: loop {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(String::new()).await;
            }

            // Repeat triggering events delivered while we ran become the
            // new trigger (resume policy); the recomposition below folds
            // them in.
            while let Ok(event) = self.resumptions.try_recv() {
                self.trigger = event;
            }

            // Recompose every invocation: phase and sibling context stay
            // current; in-flight tool exchanges ride along as a suffix.
            let mut messages = self.compose(delegation_ctx.as_ref()).await;
            messages.extend(suffix.iter().cloned());

            let request = ChatRequest {
                messages,
                tools: self.state.tools.definitions(&policy),
                options: ChatOptions {
                    model: self.agent.definition.llm_config_name.clone(),
                    session_id: Some(format!("{}:{}", self.conversation_id, self.ral_number)),
                    conversation_id: Some(self.conversation_id.clone()),
                    working_directory: Some(tool_ctx.working_dir()),
                    mcp_servers: self.agent.definition.mcp_servers.clone(),
                    abort: Some(self.cancel.clone()),
                    ..Default::default()
                },
            };

            let turn = match tokio::time::timeout(
                llm_deadline,
                self.consume_stream(llm.as_ref(), request),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::BudgetExceeded(format!(
                        "LLM stream exceeded {}s deadline",
                        llm_deadline.as_secs()
                    )));
                }
            };

            let turn = match turn {
                TurnResult::Cancelled { partial } => {
                    return self.finish_cancelled(partial).await;
                }
                TurnResult::Finished(turn) => turn,
            };

            // ── No tool calls: this is the final answer ─────────────
            if turn.tool_calls.is_empty() {
                if turn.text.trim().is_empty() {
                    // Never publish an empty content event.
                    self.publish_terminal_metadata(String::new(), vec![]).await;
                } else {
                    self.publish_final(turn.text).await?;
                    self.fire_title_generation();
                }
                return Ok(RalStatus::Completed);
            }

            // ── Tool dispatch ───────────────────────────────────────
            suffix.push(assistant_with_tool_calls(&turn.text, &turn.tool_calls));

            let mut parked = false;
            for call in &turn.tool_calls {
                if self.cancel.is_cancelled() {
                    return self.finish_cancelled(String::new()).await;
                }
                if self.tool_calls_executed >= max_steps {
                    self.publish_terminal_metadata(
                        format!("tool budget exhausted after {max_steps} calls"),
                        vec![Tag::new(["error", "budget-exceeded"])],
                    )
                    .await;
                    return Ok(RalStatus::Errored);
                }
                self.tool_calls_executed += 1;

                let execution = self
                    .state
                    .tools
                    .execute(&call.tool_name, &call.arguments, &policy, &tool_ctx)
                    .await?;

                self.coordinator.record_action(
                    self.ral_number,
                    ActionRecord {
                        tool: call.tool_name.clone(),
                        input_preview: truncate_str(&call.arguments.to_string(), PREVIEW_LEN),
                        output_preview: truncate_str(&execution.content, PREVIEW_LEN),
                        is_error: execution.is_error,
                    },
                );

                if let Some(stop) = execution.stop {
                    // Register now, park after the whole batch so sibling
                    // delegation calls in one turn all go out.
                    self.register_delegation(stop).await?;
                    suffix.push(Message::tool_result(
                        &call.call_id,
                        "delegation dispatched; replies pending",
                    ));
                    parked = true;
                    continue;
                }

                let tool_msg = if execution.is_error {
                    Message::tool_error(&call.call_id, &execution.content)
                } else {
                    Message::tool_result(&call.call_id, &execution.content)
                };
                suffix.push(tool_msg);
            }

            if parked {
                match self.park_until_woken().await {
                    Some(replies) => {
                        delegation_ctx = Some(replies);
                        // Fresh invocation over the updated history.
                        suffix.clear();
                        continue 'invocation;
                    }
                    None => {
                        return self.finish_cancelled(String::new()).await;
                    }
                }
            }
        }
    }

    /// Consume one LLM stream, flushing buffered text as signed
    /// stream-chunk events. Flushes happen on the configured interval, on
    /// newlines, on tool calls, and at stream end.
    async fn consume_stream(
        &self,
        llm: &dyn LlmService,
        request: ChatRequest,
    ) -> Result<TurnResult> {
        let mut stream = llm.stream(request).await?;

        let flush_interval =
            Duration::from_millis(self.state.config.stream.flush_interval_ms.max(1));
        let flush_on_newline = self.state.config.stream.flush_on_newline;

        let mut text = String::new();
        let mut buffer = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        // call_id → (name, partial json) for providers that only stream deltas.
        let mut partial_calls: std::collections::HashMap<String, (String, String)> =
            std::collections::HashMap::new();
        let mut next_flush = tokio::time::Instant::now() + flush_interval;

        loop {
            if self.cancel.is_cancelled() {
                // Terminal flush happens in the cancelled path.
                buffer.clear();
                return Ok(TurnResult::Cancelled { partial: text });
            }

            let item = tokio::select! {
                item = stream.next() => item,
                _ = tokio::time::sleep_until(next_flush) => {
                    self.publish_stream_chunk(std::mem::take(&mut buffer)).await;
                    next_flush = tokio::time::Instant::now() + flush_interval;
                    continue;
                }
            };

            let Some(item) = item else {
                break;
            };

            match item? {
                StreamEvent::Token { text: chunk } => {
                    text.push_str(&chunk);
                    buffer.push_str(&chunk);
                    if flush_on_newline && buffer.contains('\n') {
                        self.publish_stream_chunk(std::mem::take(&mut buffer)).await;
                        next_flush = tokio::time::Instant::now() + flush_interval;
                    }
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    self.publish_stream_chunk(std::mem::take(&mut buffer)).await;
                    partial_calls.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = partial_calls.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    self.publish_stream_chunk(std::mem::take(&mut buffer)).await;
                    partial_calls.remove(&call_id);
                    tool_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done { .. } => break,
                StreamEvent::Error { message } => {
                    return Err(Error::Execution(message));
                }
            }
        }

        // Assemble calls that streamed deltas but never finished.
        for (call_id, (tool_name, args)) in partial_calls.drain() {
            let arguments = if args.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&args).unwrap_or_else(|e| {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %tool_name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    serde_json::Value::Object(Default::default())
                })
            };
            tool_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        self.publish_stream_chunk(std::mem::take(&mut buffer)).await;
        Ok(TurnResult::Finished(Turn { text, tool_calls }))
    }

    /// Build and register the delegation, then publish its request event.
    /// Registration happens first so even an instant reply finds the
    /// record; the receiver is queued for [`Ral::park_until_woken`].
    async fn register_delegation(&mut self, stop: StopSignal) -> Result<()> {
        let spec = stop.delegation;

        // A phase delegation roots a fresh conversation; otherwise the
        // request threads into this one.
        let rooted_here = spec.target_phase.is_none();
        let mut tags: Vec<Tag> = Vec::new();
        if rooted_here {
            tags.extend(self.base_tags(false));
        } else if let Some(phase) = spec.target_phase {
            tags.push(Tag::phase(phase.as_str()));
        }
        tags.push(Tag::delegation(&self.conversation_id));
        if spec.is_ask {
            tags.push(Tag::ask());
        }
        for recipient in &spec.recipients {
            tags.push(Tag::pubkey(recipient));
        }

        let request = EventBuilder::new(EventKind::NOTE)
            .content(spec.request.clone())
            .tags(tags)
            .sign(self.agent.signer.as_ref());
        let request_event_id = request.id.clone();
        let child_conversation_id = if rooted_here {
            self.conversation_id.clone()
        } else {
            request_event_id.clone()
        };

        let deadline = spec.deadline.or_else(|| {
            let secs = self.state.config.limits.delegation_deadline_secs;
            (secs > 0).then(|| Duration::from_secs(secs))
        });
        let deadline_at = deadline.map(|d| {
            chrono::Utc::now() + chrono::Duration::from_std(d).unwrap_or_default()
        });

        let record = DelegationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            parent_conversation_id: self.conversation_id.clone(),
            parent_ral: self.ral_number,
            child_conversation_id,
            request_event_id,
            recipients: spec.recipients.clone(),
            replies: spec
                .recipients
                .iter()
                .map(|r| (r.clone(), None))
                .collect(),
            phase_at_start: self.state.phases.current(&self.conversation_id),
            is_ask: spec.is_ask,
            deadline_at,
            status: DelegationStatus::Pending,
        };

        tracing::info!(
            delegation = %record.id,
            recipients = spec.recipients.len(),
            is_ask = spec.is_ask,
            "delegation registered"
        );
        let receiver = self.state.delegations.register(record);
        self.pending_delegations.push(receiver);
        self.state.bus.publish(&request).await?;
        Ok(())
    }

    /// Park until any registered delegation completes or this loop is
    /// cancelled. `None` means cancelled (or nothing left to wait on).
    async fn park_until_woken(&mut self) -> Option<DelegationReplies> {
        self.coordinator
            .set_status(self.ral_number, RalStatus::AwaitingDelegation);

        let cancel = self.cancel.clone();
        loop {
            if self.pending_delegations.is_empty() {
                return None;
            }
            let receivers = std::mem::take(&mut self.pending_delegations);
            let watch_cancel = async {
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            };

            tokio::select! {
                (result, _index, remaining) = futures_util::future::select_all(receivers) => {
                    self.pending_delegations = remaining;
                    match result {
                        Ok(replies) => {
                            self.coordinator
                                .set_status(self.ral_number, RalStatus::Running);
                            return Some(replies);
                        }
                        // That delegation was abandoned; wait on the rest.
                        Err(_) => continue,
                    }
                }
                _ = watch_cancel => {
                    return None;
                }
            }
        }
    }

    /// Fire-and-forget title generation for still-untitled conversations,
    /// using the summarization-role LLM.
    fn fire_title_generation(&self) {
        let already_titled = self
            .state
            .store
            .with_conversation(&self.conversation_id, |c| c.title.is_some())
            .unwrap_or(true);
        if already_titled {
            return;
        }
        let Some(llm) = self
            .state
            .llm
            .resolve(
                Some(&self.state.config.llm_defaults.summarization),
                &self.state.config.llm_defaults,
            )
        else {
            return;
        };

        let opening = self
            .state
            .store
            .with_conversation(&self.conversation_id, |c| {
                c.history.first().map(|e| e.content.clone())
            })
            .flatten()
            .unwrap_or_default();
        let publisher = self.publisher();
        let conversation_tag = Tag::conversation(&self.conversation_id);

        tokio::spawn(async move {
            let messages = vec![Message::user(format!(
                "Give this conversation a short title (a few words):\n{opening}"
            ))];
            let schema = serde_json::json!({
                "type": "object",
                "properties": { "title": { "type": "string" } },
                "required": ["title"],
            });
            match llm.generate_object(messages, schema).await {
                Ok(object) => {
                    let Some(title) = object.get("title").and_then(|t| t.as_str()) else {
                        return;
                    };
                    let tags = vec![conversation_tag, Tag::title(title)];
                    if let Err(e) = publisher
                        .publish(EventKind::METADATA, String::new(), tags)
                        .await
                    {
                        tracing::debug!(error = %e, "failed to publish title");
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "title generation unavailable");
                }
            }
        });
    }

    /// Terminal flush for a cancelled loop: at most one final event.
    async fn finish_cancelled(&self, partial: String) -> Result<RalStatus> {
        self.publish_terminal_metadata(partial, vec![Tag::new(["cancelled", "true"])])
            .await;
        Ok(RalStatus::Cancelled)
    }
}

struct Turn {
    text: String,
    tool_calls: Vec<ToolCall>,
}

enum TurnResult {
    Finished(Turn),
    Cancelled { partial: String },
}
