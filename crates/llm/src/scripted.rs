//! Deterministic scripted LLM service.
//!
//! Each call to `stream` pops the next scripted turn and plays back its
//! pre-recorded chunks. Requests are logged so tests can assert on the
//! exact prompt the engine composed. When the script runs dry the service
//! answers with an empty completion rather than failing, which keeps
//! engine edge-case paths reachable.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use cv_domain::error::{Error, Result};
use cv_domain::message::Message;
use cv_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::service::{ChatRequest, LlmService};

/// One scripted response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    events: Vec<StreamEvent>,
    /// Fail the whole call instead of streaming.
    error: Option<String>,
    /// Pause before the first chunk, to script slow models.
    delay: Option<std::time::Duration>,
}

impl ScriptedTurn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain text reply split into word-ish tokens.
    pub fn text(content: &str) -> Self {
        let mut turn = Self::new();
        for piece in split_tokens(content) {
            turn.events.push(StreamEvent::Token { text: piece });
        }
        turn.events.push(done());
        turn
    }

    /// A tool call (optionally preceded by some text).
    pub fn tool_call(preamble: &str, call_id: &str, tool: &str, args: serde_json::Value) -> Self {
        let mut turn = Self::new();
        for piece in split_tokens(preamble) {
            turn.events.push(StreamEvent::Token { text: piece });
        }
        turn.events.push(StreamEvent::ToolCallStarted {
            call_id: call_id.into(),
            tool_name: tool.into(),
        });
        turn.events.push(StreamEvent::ToolCallFinished {
            call_id: call_id.into(),
            tool_name: tool.into(),
            arguments: args,
        });
        turn.events.push(done());
        turn
    }

    /// A completion with no content at all.
    pub fn empty() -> Self {
        Self {
            events: vec![done()],
            ..Self::default()
        }
    }

    /// A provider-level failure.
    pub fn error(message: &str) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Arbitrary raw events, for tests that need full control.
    pub fn raw(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// Delay the first chunk by `millis`.
    pub fn with_delay_ms(mut self, millis: u64) -> Self {
        self.delay = Some(std::time::Duration::from_millis(millis));
        self
    }
}

fn done() -> StreamEvent {
    StreamEvent::Done {
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        finish_reason: Some("stop".into()),
    }
}

fn split_tokens(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    // Keep whitespace attached so concatenation reproduces the input.
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in content.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// The scripted service.
#[derive(Default)]
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    objects: Mutex<VecDeque<serde_json::Value>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn push_object(&self, object: serde_json::Value) {
        self.objects.lock().push_back(object);
    }

    /// Every request the engine has sent, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(request);

        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(ScriptedTurn::empty);

        if let Some(message) = turn.error {
            return Err(Error::Execution(message));
        }

        let events = turn.events;
        let delay = turn.delay;
        let stream = async_stream::stream! {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            for event in events {
                // Yield to the scheduler between chunks so consumers see
                // the same suspension points a network stream produces.
                tokio::task::yield_now().await;
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn generate_object(
        &self,
        _messages: Vec<Message>,
        _schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.objects
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Execution("scripted object queue is empty".into()))
    }
}
