//! End-to-end scenarios: a real engine over the in-memory relay pool,
//! deterministic signers, and scripted LLMs.

use std::sync::Arc;
use std::time::Duration;

use cv_bus::{HmacSigner, InMemoryRelayPool};
use cv_domain::agent::{AgentCategory, AgentDefinition};
use cv_domain::config::EngineConfig;
use cv_domain::event::{Event, EventBuilder, EventKind, Tag};
use cv_domain::phase::Phase;
use cv_engine::{Engine, EngineState};
use cv_llm::scripted::{ScriptedLlm, ScriptedTurn};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Project {
    pool: Arc<InMemoryRelayPool>,
    state: EngineState,
    engine: Engine,
    human: HmacSigner,
}

impl Project {
    async fn start(agents: Vec<(AgentDefinition, Arc<ScriptedLlm>)>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let mut config = EngineConfig::default();
        config.stream.flush_interval_ms = 20;

        let pool = Arc::new(InMemoryRelayPool::new());
        let state = EngineState::ephemeral(config, pool.clone()).unwrap();
        for (definition, llm) in agents {
            let config_name = definition
                .llm_config_name
                .clone()
                .expect("test agents name their llm config");
            state.llm.insert(config_name, llm);
            state.agents.register(definition).unwrap();
        }

        let engine = Engine::new(state.clone());
        engine.start().await.unwrap();
        Self {
            pool,
            state,
            engine,
            human: HmacSigner::from_name("human"),
        }
    }

    fn agent_pubkey(&self, slug: &str) -> String {
        self.state.agents.by_slug(slug).unwrap().pubkey.clone()
    }

    /// Publish a human-authored event into the relay.
    fn publish_human(&self, content: &str, created_at: i64, tags: Vec<Tag>) -> Event {
        let event = EventBuilder::new(EventKind::NOTE)
            .content(content)
            .created_at(created_at)
            .tags(tags)
            .sign(&self.human);
        self.pool.inject(event.clone());
        event
    }

    fn history(&self, conversation_id: &str) -> Vec<Event> {
        self.state
            .store
            .snapshot(conversation_id)
            .map(|c| c.history)
            .unwrap_or_default()
    }

    /// Poll until `predicate` holds or the deadline passes.
    async fn wait_until(&self, what: &str, mut predicate: impl FnMut() -> bool) {
        for _ in 0..600 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    async fn stop(self) {
        self.engine.shutdown().await;
    }
}

fn agent(slug: &str, category: AgentCategory, tools: &[&str]) -> AgentDefinition {
    AgentDefinition {
        slug: slug.into(),
        name: slug.to_uppercase(),
        category,
        instructions: format!("You are the {slug}."),
        tool_allow: tools.iter().map(|t| t.to_string()).collect(),
        llm_config_name: Some(slug.into()),
        phases: Default::default(),
        mcp_servers: vec![],
        max_agent_steps: None,
    }
}

fn past(seconds_ago: i64) -> i64 {
    chrono::Utc::now().timestamp() - seconds_ago
}

/// Flatten one recorded request into searchable text, including tool
/// results (which `extract_all_text` deliberately skips).
fn request_text(llm: &ScriptedLlm, index: usize) -> String {
    use cv_domain::message::{ContentPart, MessageContent};
    llm.requests()[index]
        .messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::ToolResult { content, .. } => content.clone(),
                    ContentPart::ToolUse { name, .. } => name.clone(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// (S1) Simple two-turn exchange
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s1_two_turn_exchange() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_turn(ScriptedTurn::text("hi"));
    llm.push_turn(ScriptedTurn::text("fine"));

    let project = Project::start(vec![(
        agent("assistant", AgentCategory::Orchestrator, &[]),
        llm.clone(),
    )])
    .await;
    let a_pk = project.agent_pubkey("assistant");

    let e0 = project.publish_human("hello", past(100), vec![Tag::pubkey(&a_pk)]);
    project
        .wait_until("first reply", || project.history(&e0.id).len() == 2)
        .await;

    let e1 = project.history(&e0.id)[1].clone();
    assert_eq!(e1.author, a_pk);
    assert_eq!(e1.content, "hi");
    assert_eq!(e1.parent_id(), Some(e0.id.as_str()));

    // Keep timestamps strictly increasing across turns.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let e2 = project.publish_human(
        "how are you?",
        chrono::Utc::now().timestamp(),
        vec![
            Tag::conversation(&e0.id),
            Tag::event_marked(&e0.id, "root"),
            Tag::event_marked(&e1.id, "reply"),
            Tag::pubkey(&a_pk),
        ],
    );
    project
        .wait_until("second reply", || project.history(&e0.id).len() == 4)
        .await;

    let history = project.history(&e0.id);
    assert_eq!(history[0].id, e0.id);
    assert_eq!(history[1].id, e1.id);
    let e3 = history
        .iter()
        .find(|e| e.content == "fine")
        .expect("second agent reply");
    assert_eq!(e3.parent_id(), Some(e2.id.as_str()));
    assert!(history.iter().any(|e| e.id == e2.id));

    // Phase never moved.
    assert_eq!(project.state.store.snapshot(&e0.id).unwrap().phase, Phase::Chat);
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// (S2) Delegation with a single recipient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s2_single_recipient_delegation() {
    let orch_llm = Arc::new(ScriptedLlm::new());
    orch_llm.push_turn(ScriptedTurn::tool_call(
        "delegating",
        "tc_1",
        "delegate",
        serde_json::json!({"recipients": ["bob"], "request": "design X"}),
    ));
    orch_llm.push_turn(ScriptedTurn::text("summary: the design is ready"));

    let bob_llm = Arc::new(ScriptedLlm::new());
    bob_llm.push_turn(ScriptedTurn::text("design blueprint attached"));

    let project = Project::start(vec![
        (
            agent("orch", AgentCategory::Orchestrator, &["delegate"]),
            orch_llm.clone(),
        ),
        (agent("bob", AgentCategory::Worker, &[]), bob_llm.clone()),
    ])
    .await;
    let orch_pk = project.agent_pubkey("orch");
    let bob_pk = project.agent_pubkey("bob");

    let e0 = project.publish_human("build X please", past(100), vec![Tag::pubkey(&orch_pk)]);

    project
        .wait_until("final summary", || {
            project
                .history(&e0.id)
                .iter()
                .any(|e| e.content.contains("summary: the design is ready"))
        })
        .await;

    let history = project.history(&e0.id);
    let request = history
        .iter()
        .find(|e| e.content == "design X")
        .expect("delegation request in history");
    assert_eq!(request.delegation_parent(), Some(e0.id.as_str()));
    assert!(request.mentioned_pubkeys().contains(&bob_pk.as_str()));

    let reply = history
        .iter()
        .find(|e| e.content == "design blueprint attached")
        .expect("delegation reply in history");
    assert_eq!(reply.author, bob_pk);
    assert_eq!(reply.parent_id(), Some(request.id.as_str()));

    // Exactly one delegation cycle: two LLM invocations for the
    // orchestrator, and the resumed prompt carried the reply content.
    assert_eq!(orch_llm.request_count(), 2);
    assert!(request_text(&orch_llm, 1).contains("design blueprint attached"));
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// (S3) Multi-recipient delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s3_multi_recipient_delegation() {
    let orch_llm = Arc::new(ScriptedLlm::new());
    orch_llm.push_turn(ScriptedTurn::tool_call(
        "",
        "tc_1",
        "delegate",
        serde_json::json!({"recipients": ["bob", "carol"], "request": "estimate the work"}),
    ));
    orch_llm.push_turn(ScriptedTurn::text("both estimates received"));

    let bob_llm = Arc::new(ScriptedLlm::new());
    bob_llm.push_turn(ScriptedTurn::text("bob: two days"));
    let carol_llm = Arc::new(ScriptedLlm::new());
    // Carol answers more than a second later so reply order is fixed.
    carol_llm.push_turn(ScriptedTurn::text("carol: one week").with_delay_ms(1300));

    let project = Project::start(vec![
        (
            agent("orch", AgentCategory::Orchestrator, &["delegate"]),
            orch_llm.clone(),
        ),
        (agent("bob", AgentCategory::Worker, &[]), bob_llm),
        (agent("carol", AgentCategory::Worker, &[]), carol_llm),
    ])
    .await;
    let orch_pk = project.agent_pubkey("orch");

    let e0 = project.publish_human("how long?", past(100), vec![Tag::pubkey(&orch_pk)]);
    project
        .wait_until("aggregated resume", || {
            project
                .history(&e0.id)
                .iter()
                .any(|e| e.content == "both estimates received")
        })
        .await;

    // The parent resumed exactly once, after both replies.
    assert_eq!(orch_llm.request_count(), 2);
    let resumed = request_text(&orch_llm, 1);
    assert!(resumed.contains("bob: two days"));
    assert!(resumed.contains("carol: one week"));
    let bob_at = resumed.find("bob: two days").unwrap();
    let carol_at = resumed.find("carol: one week").unwrap();
    assert!(bob_at < carol_at, "replies must be in ascending time order");
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// (S4) Concurrent loops in one conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s4_concurrent_rals_see_each_other() {
    let lead_llm = Arc::new(ScriptedLlm::new());
    // First turn is a slow tool call; the second composition happens
    // while the aide is still streaming.
    lead_llm.push_turn(
        ScriptedTurn::tool_call("", "tc_1", "recall", serde_json::json!({}))
            .with_delay_ms(400),
    );
    lead_llm.push_turn(ScriptedTurn::text("lead done").with_delay_ms(100));

    let aide_llm = Arc::new(ScriptedLlm::new());
    aide_llm.push_turn(ScriptedTurn::text("aide done").with_delay_ms(1500));

    let project = Project::start(vec![
        (
            agent("lead", AgentCategory::Worker, &["recall"]),
            lead_llm.clone(),
        ),
        (agent("aide", AgentCategory::Worker, &[]), aide_llm.clone()),
    ])
    .await;
    let lead_pk = project.agent_pubkey("lead");
    let aide_pk = project.agent_pubkey("aide");

    let e0 = project.publish_human("lead, start", past(100), vec![Tag::pubkey(&lead_pk)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    project.publish_human(
        "aide, you too",
        past(99),
        vec![
            Tag::conversation(&e0.id),
            Tag::event_marked(&e0.id, "root"),
            Tag::pubkey(&aide_pk),
        ],
    );

    project
        .wait_until("both finals", || {
            let h = project.history(&e0.id);
            h.iter().any(|e| e.content == "lead done")
                && h.iter().any(|e| e.content == "aide done")
        })
        .await;

    // The aide composed while the lead was live, and the lead's second
    // invocation saw the aide.
    assert!(request_text(&aide_llm, 0).contains("lead"));
    assert!(request_text(&aide_llm, 0).contains("loop #"));
    assert!(lead_llm.request_count() >= 2);
    assert!(request_text(&lead_llm, 1).contains("aide"));

    // No phase transition happened.
    assert_eq!(project.state.store.snapshot(&e0.id).unwrap().phase, Phase::Chat);
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// (S5) Tool denial
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s5_tool_denial_reports_allow_list() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_turn(ScriptedTurn::tool_call(
        "",
        "tc_1",
        "shell",
        serde_json::json!({"command": "echo pwned"}),
    ));
    llm.push_turn(ScriptedTurn::text("understood, no shell"));

    let project = Project::start(vec![(
        agent("restricted", AgentCategory::Worker, &["fs_read"]),
        llm.clone(),
    )])
    .await;
    let pk = project.agent_pubkey("restricted");

    let e0 = project.publish_human("run something", past(100), vec![Tag::pubkey(&pk)]);
    project
        .wait_until("denial final", || {
            project
                .history(&e0.id)
                .iter()
                .any(|e| e.content == "understood, no shell")
        })
        .await;

    // The model saw the denial and the allow list.
    let follow_up = request_text(&llm, 1);
    assert!(follow_up.contains("not permitted"));
    assert!(follow_up.contains("fs_read"));

    // A failed tool-status event went out.
    let failed_status = project.pool.stored().into_iter().any(|e| {
        e.kind == EventKind::TOOL_STATUS
            && e.tag_value("tool-status") == Some("failed")
            && e.tag_value("tool") == Some("shell")
    });
    assert!(failed_status, "expected a tool-status=failed event");
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// (S6) Phase transition and phase-scoped instructions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn s6_phase_transition_and_instructions() {
    let orch_llm = Arc::new(ScriptedLlm::new());
    let worker_llm = Arc::new(ScriptedLlm::new());
    worker_llm.push_turn(ScriptedTurn::text("executing now"));

    let mut worker = agent("worker", AgentCategory::Worker, &[]);
    worker
        .phases
        .insert(Phase::Execute, "Ship the change.".to_string());

    let project = Project::start(vec![
        (agent("orch", AgentCategory::Orchestrator, &[]), orch_llm),
        (worker, worker_llm.clone()),
    ])
    .await;
    let orch = project.state.agents.by_slug("orch").unwrap();
    let worker_pk = project.agent_pubkey("worker");

    let e0 = project.publish_human("kick off", past(100), vec![]);
    project
        .wait_until("conversation exists", || {
            !project.history(&e0.id).is_empty()
        })
        .await;

    // The orchestrator moves plan → execute by tagging its event.
    let to_plan = EventBuilder::new(EventKind::NOTE)
        .content("planning first")
        .tag(Tag::conversation(&e0.id))
        .tag(Tag::event_marked(&e0.id, "root"))
        .tag(Tag::phase("plan"))
        .created_at(past(90))
        .sign(orch.signer.as_ref());
    project.pool.inject(to_plan);
    project
        .wait_until("plan phase", || {
            project.state.store.snapshot(&e0.id).unwrap().phase == Phase::Plan
        })
        .await;

    let to_execute = EventBuilder::new(EventKind::NOTE)
        .content("now execute")
        .tag(Tag::conversation(&e0.id))
        .tag(Tag::event_marked(&e0.id, "root"))
        .tag(Tag::phase("execute"))
        .created_at(past(80))
        .sign(orch.signer.as_ref());
    project.pool.inject(to_execute);
    project
        .wait_until("execute phase", || {
            project.state.store.snapshot(&e0.id).unwrap().phase == Phase::Execute
        })
        .await;

    // Phase log recorded the orchestrator's pubkey.
    let snapshot = project.state.store.snapshot(&e0.id).unwrap();
    let last = snapshot.phase_log.last().unwrap();
    assert_eq!(last.to, Phase::Execute);
    assert_eq!(last.author, orch.pubkey);

    // A worker loop now sees its execute instructions exactly once.
    project.publish_human(
        "worker, go",
        past(70),
        vec![
            Tag::conversation(&e0.id),
            Tag::event_marked(&e0.id, "root"),
            Tag::pubkey(&worker_pk),
        ],
    );
    project
        .wait_until("worker reply", || {
            project
                .history(&e0.id)
                .iter()
                .any(|e| e.content == "executing now")
        })
        .await;

    let system_block = worker_llm.requests()[0].messages[0]
        .content
        .extract_all_text();
    assert_eq!(system_block.matches("Ship the change.").count(), 1);
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget enforcement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_budget_terminates_with_visible_event() {
    let llm = Arc::new(ScriptedLlm::new());
    for i in 0..3 {
        llm.push_turn(ScriptedTurn::tool_call(
            "",
            &format!("tc_{i}"),
            "recall",
            serde_json::json!({}),
        ));
    }
    llm.push_turn(ScriptedTurn::text("never reached"));

    let mut definition = agent("busy", AgentCategory::Worker, &["recall"]);
    definition.max_agent_steps = Some(2);

    let project = Project::start(vec![(definition, llm.clone())]).await;
    let pk = project.agent_pubkey("busy");
    let e0 = project.publish_human("loop forever", past(100), vec![Tag::pubkey(&pk)]);

    project
        .wait_until("budget event", || {
            project.pool.stored().into_iter().any(|e| {
                e.kind == EventKind::METADATA && e.content.contains("tool budget exhausted")
            })
        })
        .await;

    // The loop stopped at the budget: two executed calls, no final text.
    assert!(llm.request_count() <= 3);
    assert!(!project
        .history(&e0.id)
        .iter()
        .any(|e| e.content == "never reached"));
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn cancellation_produces_single_terminal_event() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_turn(ScriptedTurn::text("slow answer").with_delay_ms(5000));

    let project = Project::start(vec![(
        agent("slowpoke", AgentCategory::Worker, &[]),
        llm.clone(),
    )])
    .await;
    let pk = project.agent_pubkey("slowpoke");
    let e0 = project.publish_human("take your time", past(100), vec![Tag::pubkey(&pk)]);

    let key = format!("{}:slowpoke", e0.id);
    project
        .wait_until("loop live", || project.state.live_rals.is_live(&key))
        .await;
    assert!(project.state.cancels.cancel(&key));

    project
        .wait_until("loop released", || !project.state.live_rals.is_live(&key))
        .await;

    let terminal: Vec<Event> = project
        .pool
        .stored()
        .into_iter()
        .filter(|e| e.kind == EventKind::METADATA && e.has_tag("execution-time"))
        .collect();
    assert_eq!(terminal.len(), 1, "exactly one terminal event after cancel");
    assert!(terminal[0].has_tag("cancelled"));

    // The scripted answer never made it into history.
    assert!(!project
        .history(&e0.id)
        .iter()
        .any(|e| e.content == "slow answer"));
    project.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ask: waiting on a human
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn ask_resumes_on_human_reply() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_turn(ScriptedTurn::tool_call(
        "",
        "tc_1",
        "ask",
        serde_json::json!({"question": "ship it?", "suggestions": ["yes", "no"]}),
    ));
    llm.push_turn(ScriptedTurn::text("shipping as instructed"));

    let project = Project::start(vec![(
        agent("careful", AgentCategory::Orchestrator, &["ask"]),
        llm.clone(),
    )])
    .await;
    let pk = project.agent_pubkey("careful");
    let e0 = project.publish_human("decide", past(100), vec![Tag::pubkey(&pk)]);

    project
        .wait_until("question published", || {
            project
                .history(&e0.id)
                .iter()
                .any(|e| e.content.contains("ship it?") && e.has_tag("ask"))
        })
        .await;
    let question = project
        .history(&e0.id)
        .into_iter()
        .find(|e| e.has_tag("ask"))
        .unwrap();

    // Human answers the question event.
    project.publish_human(
        "yes",
        chrono::Utc::now().timestamp(),
        vec![
            Tag::conversation(&e0.id),
            Tag::event_marked(&e0.id, "root"),
            Tag::event_marked(&question.id, "reply"),
            Tag::delegation(&e0.id),
            Tag::pubkey(&pk),
        ],
    );

    project
        .wait_until("resumed final", || {
            project
                .history(&e0.id)
                .iter()
                .any(|e| e.content == "shipping as instructed")
        })
        .await;
    assert!(request_text(&llm, 1).contains("yes"));
    project.stop().await;
}
