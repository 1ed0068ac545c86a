//! End-to-end runs of the cascade runner against a scripted agent.

use async_trait::async_trait;
use cascade::agent::{Agent, AgentRequest, AgentResponse, Role, ToolCall, ToolSpec, Toolbox};
use cascade::audit::MemoryLogSink;
use cascade::checkpoint::{CheckpointResponse, InMemoryCheckpointGateway};
use cascade::config::EngineConfig;
use cascade::dag::{RunStatus, ScheduleMode};
use cascade::definition::{
    CandidatesSpec, Cascade, EvaluatorSpec, HumanInputSpec, MutationMode, Phase, ReforgeSpec, Rules,
    TimeoutFallback, Ward, WardMode, WardsSpec,
};
use cascade::errors::AgentError;
use cascade::runner::{CascadeRunner, SessionCleanup};
use cascade::soundings::mutation::approach_hint;
use cascade::state::EntryKind;
use cascade::wards::{ValidatorRegistry, Verdict};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

type Script = dyn Fn(&str, &AgentRequest) -> Result<AgentResponse, AgentError> + Send + Sync;

/// Agent driven by a closure over the task text (the last user message).
struct ScriptAgent {
    script: Box<Script>,
    tasks: Mutex<Vec<String>>,
}

impl ScriptAgent {
    fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&str, &AgentRequest) -> Result<AgentResponse, AgentError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Replies "done: <task>", and "Attempt 2 is best" to the judge.
    fn echo() -> Arc<Self> {
        Self::new(|task, request| {
            if request.model == "judge" {
                Ok(AgentResponse::text("judge", "Attempt 2 is best"))
            } else {
                Ok(AgentResponse::text(&request.model, &format!("done: {}", task)))
            }
        })
    }

    fn worker_calls(&self) -> Vec<String> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let task = request
            .context
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .or_else(|| request.input.clone())
            .unwrap_or_default();
        if request.model != "judge" {
            self.tasks.lock().unwrap().push(task.clone());
        }
        (self.script)(&task, &request)
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default().with_default_model("worker");
    config.engine.judge_model = Some("judge".into());
    config.retry.max_retries = 0;
    config.soundings.cost_wait_ms = 0;
    config
}

fn runner(agent: Arc<ScriptAgent>) -> CascadeRunner {
    CascadeRunner::new(agent, config())
}

#[tokio::test]
async fn test_two_independent_phases_both_complete() {
    let cascade = Cascade::new("pair", vec![Phase::new("a", "Do A"), Phase::new("b", "Do B")]);
    let result = runner(ScriptAgent::echo())
        .with_cascade(cascade)
        .run("pair", json!({}))
        .await;

    assert_eq!(result.mode, ScheduleMode::Parallel);
    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.session.is_completed("a"));
    assert!(result.session.is_completed("b"));
}

#[tokio::test]
async fn test_independent_phases_run_in_waves() {
    let agent = ScriptAgent::echo();
    let cascade = Cascade::new(
        "fan_in",
        vec![
            Phase::new("a", "Do A for {{ input.topic }}"),
            Phase::new("b", "Do B"),
            Phase::new("c", "Combine [{{ outputs.a }}] [{{ outputs.b }}]"),
        ],
    );
    let result = runner(agent.clone())
        .with_cascade(cascade)
        .run("fan_in", json!({"topic": "rust"}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.mode, ScheduleMode::Parallel);
    assert_eq!(
        result.output,
        Some(json!("done: Combine [done: Do A for rust] [done: Do B]"))
    );
    let order: Vec<&str> = result.session.lineage().iter().map(|l| l.phase.as_str()).collect();
    assert_eq!(order.last(), Some(&"c"));
    assert_eq!(agent.worker_calls().len(), 3);
}

#[tokio::test]
async fn test_soundings_pick_judged_candidate() {
    let agent = ScriptAgent::echo();
    let sink = Arc::new(MemoryLogSink::new());
    let phase = Phase::new("poem", "Write a haiku").with_candidates(
        CandidatesSpec::with_factor(3).with_mutation(MutationMode::Approach),
    );
    let result = runner(agent.clone())
        .with_sink(sink.clone())
        .with_cascade(Cascade::new("poems", vec![phase]))
        .run("poems", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    let (expected, _) = approach_hint(0, "Write a haiku");
    assert_eq!(result.output, Some(json!(format!("done: {}", expected))));
    assert_eq!(sink.entries_with_role("sounding_attempt").len(), 3);
    assert_eq!(agent.worker_calls().len(), 3);
    assert!(
        result
            .session
            .history()
            .iter()
            .any(|e| e.kind == EntryKind::Soundings)
    );
}

#[tokio::test]
async fn test_blocking_pre_ward_skips_agent() {
    let agent = ScriptAgent::echo();
    let registry = ValidatorRegistry::new().register_fn("has_topic", |_content: &str, input: &serde_json::Value| {
        if input.get("topic").is_some() {
            Verdict::pass()
        } else {
            Verdict::fail("no topic")
        }
    });
    let phase = Phase::new("draft", "Write").with_wards(WardsSpec {
        pre: vec![Ward::new("has_topic", WardMode::Blocking)],
        post: Vec::new(),
    });
    let result = runner(agent.clone())
        .with_registry(registry)
        .with_cascade(Cascade::new("gated", vec![phase]))
        .run("gated", json!({}))
        .await;

    match &result.status {
        RunStatus::Blocked { phase, reason } => {
            assert_eq!(phase, "draft");
            assert!(reason.contains("pre-ward 'has_topic' failed: no topic"));
        }
        other => panic!("expected Blocked, got {:?}", other),
    }
    assert!(agent.worker_calls().is_empty());
}

#[tokio::test]
async fn test_loop_until_exhausts_attempts() {
    let agent = ScriptAgent::echo();
    let registry = ValidatorRegistry::new().register_fn("never", |_: &str, _: &serde_json::Value| {
        Verdict::fail("not good enough")
    });
    let phase = Phase::new("draft", "Write").with_rules(
        Rules::default()
            .with_max_attempts(3)
            .with_loop_until("never"),
    );
    let result = runner(agent.clone())
        .with_registry(registry)
        .with_cascade(Cascade::new("picky", vec![phase]))
        .run("picky", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(agent.worker_calls().len(), 3);
    let last = result.errors.last().unwrap();
    assert!(last.message.contains("exhausted 3 attempts"));
    assert!(last.message.contains("not good enough"));
    // Retry attempts carry the retry instruction rather than the bare task.
    assert!(agent.worker_calls()[1].contains("not good enough"));
}

#[tokio::test]
async fn test_loop_until_passes_on_second_attempt() {
    let agent = ScriptAgent::echo();
    let registry = ValidatorRegistry::new().register_fn("retried", |content: &str, _: &serde_json::Value| {
        if content.contains("attempt 2") {
            Verdict::pass()
        } else {
            Verdict::fail("first try")
        }
    });
    let phase = Phase::new("draft", "Write").with_rules(
        Rules::default()
            .with_max_attempts(3)
            .with_loop_until("retried"),
    );
    let result = runner(agent.clone())
        .with_registry(registry)
        .with_cascade(Cascade::new("retry", vec![phase]))
        .run("retry", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(agent.worker_calls().len(), 2);
    assert_eq!(result.session.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_human_evaluator_timeout_falls_back_to_first() {
    let agent = ScriptAgent::echo();
    let gateway = Arc::new(InMemoryCheckpointGateway::new());
    let phase = Phase::new("poem", "Write a haiku").with_candidates(
        CandidatesSpec::with_factor(3)
            .with_mutation(MutationMode::Approach)
            .with_evaluator(EvaluatorSpec::Human {
                prefilter_top_k: None,
                timeout_secs: Some(5),
                on_timeout: TimeoutFallback::First,
            }),
    );
    let result = runner(agent)
        .with_gateway(gateway)
        .with_cascade(Cascade::new("poems", vec![phase]))
        .run("poems", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output, Some(json!("done: Write a haiku")));
}

#[tokio::test]
async fn test_human_input_checkpoint_records_response() {
    let agent = ScriptAgent::echo();
    let gateway = Arc::new(InMemoryCheckpointGateway::new());
    let mut checkpoints = gateway.subscribe();
    let responder = gateway.clone();
    tokio::spawn(async move {
        if let Some(checkpoint) = checkpoints.recv().await {
            responder
                .respond(&checkpoint.id, CheckpointResponse::new().with("notes", json!("ship it")))
                .unwrap();
        }
    });

    let phase = Phase::new("draft", "Write").with_human_input(HumanInputSpec {
        title: "Review the draft".into(),
        fields: vec!["notes".into()],
        timeout_secs: Some(5),
    });
    let result = runner(agent)
        .with_gateway(gateway)
        .with_cascade(Cascade::new("reviewed", vec![phase]))
        .run("reviewed", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.session.get("human_draft"), Some(&json!({"notes": "ship it"})));
}

#[tokio::test]
async fn test_human_input_without_gateway_blocks() {
    let phase = Phase::new("draft", "Write").with_human_input(HumanInputSpec {
        title: "Review".into(),
        fields: Vec::new(),
        timeout_secs: None,
    });
    let result = runner(ScriptAgent::echo())
        .with_cascade(Cascade::new("reviewed", vec![phase]))
        .run("reviewed", json!({}))
        .await;

    assert!(matches!(result.status, RunStatus::Blocked { .. }));
}

#[tokio::test]
async fn test_agent_routes_to_chosen_handoff() {
    let agent = ScriptAgent::new(|task, request| {
        if request.tools.iter().any(|t| t.name == "route_to") {
            Ok(AgentResponse::text(&request.model, "feature request").with_tool_calls(vec![
                ToolCall::new("call_1", "route_to", json!({"target": "feature"})),
            ]))
        } else {
            Ok(AgentResponse::text(&request.model, &format!("done: {}", task)))
        }
    });
    let cascade = Cascade::new(
        "triage",
        vec![
            Phase::new("classify", "Classify").with_handoffs(&["bug", "feature"]),
            Phase::new("bug", "Fix the bug"),
            Phase::new("feature", "Plan the feature"),
        ],
    );
    let result = runner(agent)
        .with_cascade(cascade)
        .run("triage", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    let lineage = result.session.lineage();
    assert_eq!(lineage.len(), 2);
    assert_eq!(lineage[0].routed_to.as_deref(), Some("feature"));
    assert_eq!(lineage[1].phase, "feature");
    assert!(result.session.output_of("bug").is_none());
}

#[tokio::test]
async fn test_cascade_validator_runs_one_level_deeper() {
    let agent = ScriptAgent::new(|task, request| {
        if task.starts_with("Judge") {
            Ok(AgentResponse::text(&request.model, r#"{"valid": true, "reason": "fine"}"#))
        } else {
            Ok(AgentResponse::text(&request.model, &format!("done: {}", task)))
        }
    });
    let sink = Arc::new(MemoryLogSink::new());
    let review = Cascade::new("review", vec![Phase::new("judge", "Judge {{ input.content }}")]);
    let draft = Phase::new("draft", "Write").with_rules(Rules::default().with_loop_until("review"));
    let result = runner(agent)
        .with_sink(sink.clone())
        .with_cascade(review)
        .with_cascade(Cascade::new("writer", vec![draft]))
        .run("writer", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    let starts = sink.entries_with_role("cascade_start");
    assert_eq!(starts.len(), 2);
    let child = starts.iter().find(|e| e.metadata["depth"] == json!(1)).unwrap();
    assert_eq!(child.metadata["parent_session_id"], json!(result.session_id));
}

#[tokio::test]
async fn test_recursive_validator_stops_at_max_depth() {
    let mut config = config();
    config.engine.max_depth = 2;
    let recurse = Cascade::new(
        "recurse",
        vec![Phase::new("again", "Check").with_rules(Rules::default().with_loop_until("recurse"))],
    );
    let result = CascadeRunner::new(ScriptAgent::echo(), config)
        .with_cascade(recurse)
        .run("recurse", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.message.contains("exceeds the maximum of 2"))
    );
}

#[tokio::test]
async fn test_resume_skips_completed_phases() {
    let flaky = ScriptAgent::new(|task, request| {
        if task.contains("second") {
            Err(AgentError::Fatal("provider down".into()))
        } else {
            Ok(AgentResponse::text(&request.model, &format!("done: {}", task)))
        }
    });
    let cascade = Cascade::new(
        "pair",
        vec![
            Phase::new("one", "first step").with_handoffs(&["two"]),
            Phase::new("two", "second step after {{ outputs.one }}"),
        ],
    );

    let failed = runner(flaky)
        .with_cascade(cascade.clone())
        .run("pair", json!({}))
        .await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.session.is_completed("one"));

    let agent = ScriptAgent::new(|task, request| {
        Ok(AgentResponse::text(&request.model, &format!("ok: {}", task.len())))
    });
    let resumed = runner(agent.clone())
        .with_cascade(cascade)
        .resume("pair", failed.session)
        .await;

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(agent.worker_calls(), vec!["second step after done: first step".to_string()]);
    assert_eq!(resumed.session_id, failed.session_id);
}

#[derive(Default)]
struct RecordingCleanup {
    closed: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionCleanup for RecordingCleanup {
    async fn close(&self, session_id: &str) -> anyhow::Result<()> {
        self.closed.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

struct FailingCleanup;

#[async_trait]
impl SessionCleanup for FailingCleanup {
    async fn close(&self, _session_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("browser already gone")
    }
}

#[tokio::test]
async fn test_cleanup_hooks_run_even_when_one_fails() {
    let recorder = Arc::new(RecordingCleanup::default());
    let result = runner(ScriptAgent::echo())
        .with_cleanup(Arc::new(FailingCleanup))
        .with_cleanup(recorder.clone())
        .with_cascade(Cascade::new("one", vec![Phase::new("only", "Do it")]))
        .run("one", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(*recorder.closed.lock().unwrap(), vec![result.session_id.clone()]);
}

#[tokio::test]
async fn test_unknown_cascade_fails_without_panicking() {
    let result = runner(ScriptAgent::echo()).run("missing", json!({})).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.errors[0].message.contains("Unknown sub-cascade 'missing'"));
}

#[tokio::test]
async fn test_negative_backoff_multiplier_still_returns_a_result() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let agent = ScriptAgent::new(move |task, request| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(AgentError::EmptyResponse)
        } else {
            Ok(AgentResponse::text(&request.model, &format!("done: {}", task)))
        }
    });
    let mut config = config();
    config.retry.max_retries = 3;
    config.retry.initial_delay_ms = 10;
    config.retry.backoff_multiplier = -2.0;

    let result = CascadeRunner::new(agent, config)
        .with_cascade(Cascade::new("flaky", vec![Phase::new("only", "Do it")]))
        .run("flaky", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rejected_attempt_images_stay_out_of_reforge() {
    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let capture = seen.clone();
    let agent = ScriptAgent::new(move |task, request| {
        if request.model == "judge" {
            return Ok(AgentResponse::text("judge", "Attempt 2 is best"));
        }
        if task.starts_with("Original task:") {
            let images = request
                .context
                .iter()
                .flat_map(|m| m.images.iter().cloned())
                .collect();
            capture.lock().unwrap().push(images);
            return Ok(AgentResponse::text(&request.model, "good"));
        }
        let (content, image) = if task.contains("rejected:") {
            ("good", "good.png")
        } else {
            ("bad", "rejected.png")
        };
        Ok(AgentResponse {
            images: vec![image.to_string()],
            ..AgentResponse::text(&request.model, content)
        })
    });
    let registry = ValidatorRegistry::new().register_fn("looks_good", |content: &str, _: &serde_json::Value| {
        if content == "good" {
            Verdict::pass()
        } else {
            Verdict::fail("looks bad")
        }
    });
    let phase = Phase::new("art", "Draw")
        .with_rules(Rules::default().with_max_attempts(2).with_loop_until("looks_good"))
        .with_candidates(CandidatesSpec::with_factor(2).with_reforge(ReforgeSpec::new(1)));

    let result = runner(agent)
        .with_registry(registry)
        .with_cascade(Cascade::new("gallery", vec![phase]))
        .run("gallery", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    for images in seen {
        assert_eq!(images, vec!["good.png".to_string()]);
    }
}

fn always_ok() -> ValidatorRegistry {
    ValidatorRegistry::new().register_fn("ok", |_: &str, _: &serde_json::Value| Verdict::pass())
}

#[tokio::test]
async fn test_per_turn_validation_ends_turns_early() {
    let mut rules = Rules::default().with_max_turns(3).with_loop_until("ok");
    rules.per_turn_validation = true;
    let agent = ScriptAgent::echo();
    let result = runner(agent.clone())
        .with_registry(always_ok())
        .with_cascade(Cascade::new("early", vec![Phase::new("draft", "Write").with_rules(rules)]))
        .run("early", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(agent.worker_calls(), vec!["Write".to_string()]);

    // Without per-turn checks every turn runs, continuing with the default prompt.
    let agent = ScriptAgent::echo();
    let rules = Rules::default().with_max_turns(3).with_loop_until("ok");
    let result = runner(agent.clone())
        .with_registry(always_ok())
        .with_cascade(Cascade::new("full", vec![Phase::new("draft", "Write").with_rules(rules)]))
        .run("full", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(agent.worker_calls(), vec!["Write", "Continue.", "Continue."]);
}

#[tokio::test]
async fn test_turn_prompt_drives_later_turns() {
    let mut rules = Rules::default().with_max_turns(3);
    rules.turn_prompt = Some("Keep going".into());
    let agent = ScriptAgent::echo();
    let result = runner(agent.clone())
        .with_cascade(Cascade::new("turns", vec![Phase::new("draft", "Write").with_rules(rules)]))
        .run("turns", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(agent.worker_calls(), vec!["Write", "Keep going", "Keep going"]);
    assert_eq!(result.output, Some(json!("done: Keep going")));
}

/// System messages the worker model saw on its first call.
async fn system_messages(rules: Rules) -> Vec<String> {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let capture = seen.clone();
    let agent = ScriptAgent::new(move |task, request| {
        let mut seen = capture.lock().unwrap();
        if seen.is_empty() {
            seen.extend(
                request
                    .context
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .map(|m| m.content.clone()),
            );
        }
        Ok(AgentResponse::text(&request.model, &format!("done: {}", task)))
    });
    let result = runner(agent)
        .with_registry(always_ok())
        .with_cascade(Cascade::new("announce", vec![Phase::new("draft", "Write").with_rules(rules)]))
        .run("announce", json!({}))
        .await;
    assert_eq!(result.status, RunStatus::Completed);
    let seen = seen.lock().unwrap().clone();
    seen
}

#[tokio::test]
async fn test_loop_until_announcement() {
    let announced = system_messages(Rules::default().with_loop_until("ok")).await;
    assert!(announced.iter().any(|m| m.contains("'ok' validator")));

    let mut custom = Rules::default().with_loop_until("ok");
    custom.loop_until_prompt = Some("Every line must rhyme.".into());
    let announced = system_messages(custom).await;
    assert!(announced.iter().any(|m| m == "Every line must rhyme."));
    assert!(!announced.iter().any(|m| m.contains("'ok' validator")));

    let mut silent = Rules::default().with_loop_until("ok");
    silent.loop_until_silent = true;
    let announced = system_messages(silent).await;
    assert!(!announced.iter().any(|m| m.contains("validator")));
}

#[tokio::test]
async fn test_post_ward_retry_reruns_the_phase() {
    let agent = ScriptAgent::echo();
    let registry = ValidatorRegistry::new().register_fn("long_enough", |content: &str, _: &serde_json::Value| {
        if content.contains("rejected:") {
            Verdict::pass()
        } else {
            Verdict::fail("too short")
        }
    });
    let phase = Phase::new("draft", "Write")
        .with_rules(Rules::default().with_max_attempts(2))
        .with_wards(WardsSpec {
            pre: Vec::new(),
            post: vec![Ward::new("long_enough", WardMode::Retry)],
        });
    let result = runner(agent.clone())
        .with_registry(registry)
        .with_cascade(Cascade::new("warded", vec![phase]))
        .run("warded", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    let calls = agent.worker_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].starts_with("Write"));
    assert!(calls[1].contains("too short"));
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].message.contains("post-ward 'long_enough'"));
}

#[tokio::test]
async fn test_post_ward_retry_shares_attempt_budget() {
    let agent = ScriptAgent::echo();
    let registry = ValidatorRegistry::new()
        .register_fn("second_try", |content: &str, _: &serde_json::Value| {
            if content.contains("rejected:") {
                Verdict::pass()
            } else {
                Verdict::fail("first try")
            }
        })
        .register_fn("never", |_: &str, _: &serde_json::Value| Verdict::fail("still wrong"));
    let phase = Phase::new("draft", "Write")
        .with_rules(Rules::default().with_max_attempts(2).with_loop_until("second_try"))
        .with_wards(WardsSpec {
            pre: Vec::new(),
            post: vec![Ward::new("never", WardMode::Retry)],
        });
    let result = runner(agent.clone())
        .with_registry(registry)
        .with_cascade(Cascade::new("budget", vec![phase]))
        .run("budget", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(agent.worker_calls().len(), 2);
    let last = result.errors.last().unwrap();
    assert!(last.message.contains("exhausted 2 attempts"));
    assert!(last.message.contains("post-ward 'never'"));
}

struct SearchToolbox;

#[async_trait]
impl Toolbox for SearchToolbox {
    async fn call(&self, _name: &str, arguments: &serde_json::Value) -> anyhow::Result<String> {
        Ok(format!("results for {}", arguments["q"].as_str().unwrap_or_default()))
    }

    fn specs(&self, names: &[String]) -> Vec<ToolSpec> {
        names
            .iter()
            .filter(|n| n.as_str() == "search" || n.as_str() == "delete")
            .map(|n| ToolSpec::new(n, "test tool"))
            .collect()
    }
}

#[tokio::test]
async fn test_tool_calls_are_dispatched_and_fed_back() {
    let offered: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let capture = offered.clone();
    let agent = ScriptAgent::new(move |_task, request| {
        let results: Vec<String> = request
            .context
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.clone())
            .collect();
        if results.is_empty() {
            capture
                .lock()
                .unwrap()
                .extend(request.tools.iter().map(|t| t.name.clone()));
            Ok(AgentResponse::text(&request.model, "looking").with_tool_calls(vec![
                ToolCall::new("call_1", "search", json!({"q": "rust"})),
                ToolCall::new("call_2", "delete", json!({"path": "/"})),
            ]))
        } else {
            Ok(AgentResponse::text(&request.model, &results.join(" | ")))
        }
    });
    let phase = Phase::new("research", "Find")
        .with_tools(&["search"])
        .with_rules(Rules::default().with_max_turns(2));
    let result = runner(agent)
        .with_toolbox(Arc::new(SearchToolbox))
        .with_cascade(Cascade::new("tools", vec![phase]))
        .run("tools", json!({}))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(*offered.lock().unwrap(), vec!["search".to_string()]);
    assert_eq!(
        result.output,
        Some(json!("results for rust | Tool 'delete' failed: not available in this phase"))
    );
    let tool_entries = result
        .session
        .history()
        .iter()
        .filter(|e| e.kind == EntryKind::ToolResult)
        .count();
    assert_eq!(tool_entries, 2);
}
