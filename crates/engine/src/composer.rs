//! Deterministic prompt composition.
//!
//! For identical inputs the composed message list is identical: ordering
//! is fixed, collections are pre-sorted, and nothing reads the clock.

use cv_agents::AgentHandle;
use cv_domain::delegation::DelegationReplies;
use cv_domain::event::Event;
use cv_domain::message::{Message, MessageContent, Role};
use cv_domain::phase::Phase;
use cv_store::Conversation;

use crate::coordinator::RalInfo;

/// Marker inserted just before the triggering message.
const TRIGGER_MARKER: &str = "--- the message to respond to follows ---";

pub struct ComposerInput<'a> {
    pub agent: &'a AgentHandle,
    pub conversation: &'a Conversation,
    pub thread: &'a [Event],
    pub trigger: &'a Event,
    pub phase: Phase,
    pub ral_number: u64,
    pub siblings: &'a [RalInfo],
    /// Set when this turn resumes from a completed delegation.
    pub delegation: Option<&'a DelegationReplies>,
    /// Project-wide system prompt fragment.
    pub global_prompt: Option<&'a str>,
    /// Pre-sorted `+`-files from the agent home.
    pub home_files: &'a [(String, String)],
    pub debug: bool,
    /// Display name of the triggering author.
    pub responding_to: Option<&'a str>,
}

/// What sanitization removed, for the diagnostic record.
#[derive(Debug, Default, PartialEq)]
pub struct SanitizeReport {
    pub stripped_empty: usize,
    pub stripped_trailing_assistant: usize,
}

impl SanitizeReport {
    pub fn stripped_anything(&self) -> bool {
        self.stripped_empty > 0 || self.stripped_trailing_assistant > 0
    }
}

pub fn compose(input: &ComposerInput<'_>) -> (Vec<Message>, SanitizeReport) {
    let mut messages = Vec::new();

    messages.push(Message::system(system_block(input)));
    for enhancer in enhancers(input) {
        messages.push(Message::system(enhancer));
    }

    // Thread content: events signed by this agent speak as assistant.
    for event in input.thread {
        if event.id == input.trigger.id {
            continue;
        }
        messages.push(event_to_message(event, &input.agent.pubkey));
    }

    // Delegation replies arrive as a synthetic user message.
    if let Some(delegation) = input.delegation {
        messages.push(Message::user(delegation_reply_text(delegation)));
    }

    messages.push(Message::system(TRIGGER_MARKER));
    messages.push(event_to_message(input.trigger, &input.agent.pubkey));

    sanitize(messages)
}

fn system_block(input: &ComposerInput<'_>) -> String {
    let definition = &input.agent.definition;
    let mut parts = Vec::new();

    // a. identity
    let mut identity = format!(
        "You are {} ('{}'), a {} agent in this project.",
        definition.name,
        definition.slug,
        definition.category.as_str()
    );
    if !definition.instructions.is_empty() {
        identity.push_str("\n\n");
        identity.push_str(&definition.instructions);
    }
    parts.push(identity);

    // b. phase-specific instructions
    if let Some(phase_instructions) = definition.phase_instructions(input.phase) {
        parts.push(format!(
            "Current phase: {}.\n{phase_instructions}",
            input.phase
        ));
    } else {
        parts.push(format!("Current phase: {}.", input.phase));
    }

    // c. project-wide fragment
    if let Some(global) = input.global_prompt {
        parts.push(global.to_owned());
    }

    // d. injected home files
    for (name, content) in input.home_files {
        parts.push(format!("## {name}\n{content}"));
    }

    // e. MCP resource descriptors
    if !definition.mcp_servers.is_empty() {
        parts.push(format!(
            "MCP resources available: {}",
            definition.mcp_servers.join(", ")
        ));
    }

    parts.join("\n\n")
}

fn enhancers(input: &ComposerInput<'_>) -> Vec<String> {
    let mut out = Vec::new();

    if input.trigger.has_tag("voice-mode") {
        out.push(
            "The user is speaking by voice. Keep the reply short and speakable; \
             avoid markdown and lists."
                .to_owned(),
        );
    }

    if input.debug {
        out.push("Debug mode: explain your reasoning and tool choices as you go.".to_owned());
    }

    if let Some(delegation) = input.delegation {
        let pending_note = if delegation.others_pending {
            " Other delegations you issued are still outstanding."
        } else {
            " No other delegations are outstanding."
        };
        let timeout_note = if delegation.timed_out {
            " The delegation deadline fired before every recipient replied."
        } else {
            ""
        };
        out.push(format!(
            "A delegation you issued has completed; its replies follow in the \
             conversation.{timeout_note}{pending_note}"
        ));
    }

    if !input.siblings.is_empty() {
        let mut text = format!(
            "Concurrent activity: you are loop #{} in this conversation. \
             Other active loops:",
            input.ral_number
        );
        for sibling in input.siblings {
            text.push_str(&format!(
                "\n- loop #{} ({}, phase {}, {})",
                sibling.ral_number,
                sibling.agent_slug,
                sibling.phase,
                sibling.status.as_str()
            ));
            for action in &sibling.actions {
                let flag = if action.is_error { " [error]" } else { "" };
                text.push_str(&format!(
                    "\n    {} {} -> {}{flag}",
                    action.tool, action.input_preview, action.output_preview
                ));
            }
        }
        out.push(text);
    }

    if let Some(author) = input.responding_to {
        out.push(format!("You are responding to {author}."));
    }

    out
}

fn event_to_message(event: &Event, agent_pubkey: &str) -> Message {
    if event.author == agent_pubkey {
        Message::assistant(event.content.clone())
    } else {
        Message::user(event.content.clone())
    }
}

fn delegation_reply_text(delegation: &DelegationReplies) -> String {
    let mut text = String::from("Delegation replies:");
    for reply in &delegation.replies {
        text.push_str(&format!("\n[{}] {}", &reply.recipient, reply.content));
    }
    if delegation.replies.is_empty() {
        text.push_str("\n(no replies arrived before the deadline)");
    }
    text
}

/// Pre-send sanitization: drop empty user/assistant messages, then drop
/// trailing assistant messages so the list never ends with the assistant.
fn sanitize(messages: Vec<Message>) -> (Vec<Message>, SanitizeReport) {
    let mut report = SanitizeReport::default();

    let mut kept: Vec<Message> = messages
        .into_iter()
        .filter(|m| {
            let empty = matches!(m.role, Role::User | Role::Assistant)
                && m.content.is_empty();
            if empty {
                report.stripped_empty += 1;
            }
            !empty
        })
        .collect();

    while matches!(kept.last(), Some(m) if m.role == Role::Assistant) {
        kept.pop();
        report.stripped_trailing_assistant += 1;
    }

    (kept, report)
}
