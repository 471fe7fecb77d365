//! End-to-end tests of the inference loop against a scripted provider.

use coil::agent::{Agent, AgentError, AgentEvent};
use coil::bus::Bus;
use coil::config::Config;
use coil::db::Store;
use coil::message::{ContentPart, FinishReason, Message, Role};
use coil::permission::{Decision, PermissionGate};
use coil::provider::{
    models, Model, Provider, ProviderError, ProviderRequest, ProviderSource, StopReason,
    StreamEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted action in a provider turn.
enum Step {
    Emit(StreamEvent),
    Wait(Duration),
}

fn emit(event: StreamEvent) -> Step {
    Step::Emit(event)
}

/// A provider that replays pre-scripted event streams, one script per
/// provider call.
struct ScriptedProvider {
    model: Model,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    title: String,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            model: models::lookup("claude-sonnet-4-20250514").unwrap(),
            scripts: Mutex::new(scripts.into()),
            title: "Scripted session".to_string(),
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn model(&self) -> &Model {
        &self.model
    }

    async fn stream(
        &self,
        _request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Step::Wait(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn send(&self, request: ProviderRequest) -> Result<Message, ProviderError> {
        let session_id = request
            .messages
            .first()
            .map(|m| m.session_id.clone())
            .unwrap_or_default();
        let mut msg = Message::assistant(session_id, &self.model.id);
        msg.append_text(&self.title);
        Ok(msg)
    }
}

struct ScriptedSource(Arc<ScriptedProvider>);

impl ProviderSource for ScriptedSource {
    fn resolve(&self, _model_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        Ok(self.0.clone())
    }
}

struct Harness {
    agent: Agent,
    store: Arc<Store>,
    bus: Arc<Bus>,
    gate: Arc<PermissionGate>,
    session_id: String,
}

async fn harness(root: &Path, scripts: Vec<Vec<Step>>, config: Config) -> Harness {
    let config = Arc::new(config);
    let bus = Arc::new(Bus::new());
    let store = Arc::new(Store::in_memory(bus.clone()).await.unwrap());
    let gate = Arc::new(PermissionGate::new(
        store.clone(),
        bus.clone(),
        config.permissions.allow.clone(),
    ));
    let provider = ScriptedProvider::new(scripts);
    let agent = Agent::new(
        config,
        store.clone(),
        bus.clone(),
        gate.clone(),
        Arc::new(ScriptedSource(provider)),
        None,
        root.to_path_buf(),
    );
    let session = store.create_session(None).await.unwrap();
    Harness {
        agent,
        store,
        bus,
        gate,
        session_id: session.id,
    }
}

fn usage(prompt: u64, completion: u64) -> StreamEvent {
    StreamEvent::Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
    }
}

fn tool_call(id: &str, name: &str, input: &str) -> Vec<Step> {
    vec![
        emit(StreamEvent::ToolCallStart {
            id: id.into(),
            name: name.into(),
        }),
        emit(StreamEvent::ToolCallDelta {
            id: id.into(),
            fragment: input.into(),
        }),
        emit(StreamEvent::ToolCallEnd { id: id.into() }),
    ]
}

fn tool_results(msg: &Message) -> Vec<(&str, &str, bool)> {
    msg.parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => Some((tool_call_id.as_str(), content.as_str(), *is_error)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn single_turn_text_response() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = vec![vec![
        emit(StreamEvent::TextDelta("Hi".into())),
        emit(StreamEvent::TextDelta(" there".into())),
        emit(usage(12, 4)),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ]];
    let h = harness(tmp.path(), scripts, Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "hello".into(), Vec::new()).unwrap();
    let event = events.recv().await.unwrap();
    let AgentEvent::Response(response) = event else {
        panic!("expected response, got {event:?}");
    };
    assert_eq!(response.text(), "Hi there");
    assert_eq!(response.finish_reason(), Some(FinishReason::EndTurn));
    assert!(response.is_finished());

    let session = h.store.get_session(&h.session_id).await.unwrap().unwrap();
    assert_eq!(session.message_count, 2);
    assert_eq!(session.prompt_tokens, 12);
    assert_eq!(session.completion_tokens, 4);
    assert!(session.cost > 0.0);

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
}

#[tokio::test]
async fn one_tool_call_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("src")).unwrap();
    std::fs::write(tmp.path().join("src/a.rs"), "").unwrap();
    std::fs::write(tmp.path().join("src/b.rs"), "").unwrap();

    let mut first = tool_call("T1", "list", r#"{"path":"src"}"#);
    first.push(emit(usage(20, 9)));
    first.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
    let second = vec![
        emit(StreamEvent::TextDelta("Two files: a.rs, b.rs".into())),
        emit(usage(30, 8)),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ];
    let h = harness(tmp.path(), vec![first, second], Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "list src".into(), Vec::new()).unwrap();
    let AgentEvent::Response(response) = events.recv().await.unwrap() else {
        panic!("expected response");
    };
    assert_eq!(response.text(), "Two files: a.rs, b.rs");

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].finish_reason(), Some(FinishReason::ToolUse));
    let calls = messages[1].tool_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].finished);

    assert_eq!(messages[2].role, Role::Tool);
    let results = tool_results(&messages[2]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "T1");
    assert!(results[0].1.contains("a.rs"));
    assert!(results[0].1.contains("b.rs"));
    assert!(!results[0].2);

    assert_eq!(messages[3].finish_reason(), Some(FinishReason::EndTurn));

    // Counters accumulated across both iterations.
    let session = h.store.get_session(&h.session_id).await.unwrap().unwrap();
    assert_eq!(session.prompt_tokens, 50);
    assert_eq!(session.completion_tokens, 17);
}

#[tokio::test]
async fn parallel_tool_calls_keep_declaration_order() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("slow.txt"), "needle").unwrap();

    // T1 (grep, slower: scans content) is declared before T2 (glob).
    let mut first = tool_call("T1", "grep", r#"{"pattern":"needle"}"#);
    first.extend(tool_call("T2", "glob", r#"{"pattern":"*.txt"}"#));
    first.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
    let second = vec![
        emit(StreamEvent::TextDelta("done".into())),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ];
    let h = harness(tmp.path(), vec![first, second], Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "search".into(), Vec::new()).unwrap();
    assert!(matches!(events.recv().await, Some(AgentEvent::Response(_))));

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let results = tool_results(&messages[2]);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "T1");
    assert_eq!(results[1].0, "T2");
    assert!(results[0].1.contains("slow.txt"));
    assert!(results[1].1.contains("slow.txt"));
}

#[tokio::test]
async fn permission_denied_feeds_back_and_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let mut first = tool_call("T1", "write", r#"{"path":"a.txt","content":"x"}"#);
    first.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
    let second = vec![
        emit(StreamEvent::TextDelta("Understood, not writing.".into())),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ];
    let h = harness(tmp.path(), vec![first, second], Config::default()).await;

    // Act as the UI: deny the prompt when it appears.
    let mut prompts = h.bus.permissions.subscribe();
    let gate = h.gate.clone();
    let denier = tokio::spawn(async move {
        loop {
            let event = prompts.recv().await.unwrap();
            if event.kind == coil::bus::EventKind::Created {
                gate.resolve(&event.payload.id, Decision::Deny);
                break;
            }
        }
    });

    let mut events = h.agent.run(&h.session_id, "write it".into(), Vec::new()).unwrap();
    let AgentEvent::Response(response) = events.recv().await.unwrap() else {
        panic!("expected response after denial");
    };
    denier.await.unwrap();
    assert_eq!(response.text(), "Understood, not writing.");

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let results = tool_results(&messages[2]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, "permission denied");
    assert!(results[0].2);

    // Denied write leaves no file and no file version.
    assert!(!tmp.path().join("a.txt").exists());
    assert!(h
        .store
        .list_file_versions(&h.session_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn loop_limit_terminates_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.limits.max_iterations = 3;

    let mut scripts = Vec::new();
    for i in 0..5 {
        let mut script = tool_call(&format!("T{i}"), "glob", r#"{"pattern":"*.rs"}"#);
        script.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
        scripts.push(script);
    }
    let h = harness(tmp.path(), scripts, config).await;

    let mut events = h.agent.run(&h.session_id, "loop".into(), Vec::new()).unwrap();
    let event = events.recv().await.unwrap();
    assert!(matches!(event, AgentEvent::Error(AgentError::LoopLimit(3))));

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.finish_reason(), Some(FinishReason::Error));
    assert!(last.text().contains("maximum"));
}

#[tokio::test]
async fn tool_use_with_zero_calls_ends_turn() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = vec![vec![
        emit(StreamEvent::TextDelta("thinking aloud".into())),
        emit(StreamEvent::Finish(StopReason::ToolUse)),
    ]];
    let h = harness(tmp.path(), scripts, Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "hi".into(), Vec::new()).unwrap();
    let AgentEvent::Response(response) = events.recv().await.unwrap() else {
        panic!("expected response");
    };
    assert_eq!(response.finish_reason(), Some(FinishReason::EndTurn));
}

#[tokio::test]
async fn unknown_tool_recovers_via_synthetic_result() {
    let tmp = tempfile::tempdir().unwrap();
    let mut first = tool_call("T1", "launch_missiles", r#"{}"#);
    first.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
    let second = vec![
        emit(StreamEvent::TextDelta("sorry".into())),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ];
    let h = harness(tmp.path(), vec![first, second], Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "go".into(), Vec::new()).unwrap();
    assert!(matches!(events.recv().await, Some(AgentEvent::Response(_))));

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let results = tool_results(&messages[2]);
    assert!(results[0].2);
    assert!(results[0].1.contains("unknown tool"));
}

#[tokio::test]
async fn bad_arguments_recover_via_synthetic_result() {
    let tmp = tempfile::tempdir().unwrap();
    let mut first = tool_call("T1", "glob", "this is not json");
    first.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
    let second = vec![
        emit(StreamEvent::TextDelta("retrying".into())),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ];
    let h = harness(tmp.path(), vec![first, second], Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "go".into(), Vec::new()).unwrap();
    assert!(matches!(events.recv().await, Some(AgentEvent::Response(_))));

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let results = tool_results(&messages[2]);
    assert!(results[0].2);
    assert!(results[0].1.contains("bad arguments"));
}

#[tokio::test]
async fn cancellation_during_streaming_preserves_partial_text() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = vec![vec![
        emit(StreamEvent::TextDelta("partial".into())),
        Step::Wait(Duration::from_secs(30)),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ]];
    let h = harness(tmp.path(), scripts, Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "go".into(), Vec::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.agent.cancel(&h.session_id);

    let event = events.recv().await.unwrap();
    assert!(matches!(event, AgentEvent::Error(AgentError::Canceled)));

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let assistant = messages
        .iter()
        .find(|m| m.role == Role::Assistant)
        .unwrap();
    assert_eq!(assistant.text(), "partial");
    assert_eq!(assistant.finish_reason(), Some(FinishReason::Canceled));
    assert!(assistant.is_finished());
}

#[tokio::test]
async fn cancellation_during_tool_writes_stub_results() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    // Pre-approve the shell program so the run reaches execution.
    config
        .permissions
        .allow
        .insert("shell".into(), vec!["sleep".into()]);

    let mut first = tool_call("T1", "shell", r#"{"command":"sleep 30"}"#);
    first.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
    let h = harness(tmp.path(), vec![first], config).await;

    let mut events = h.agent.run(&h.session_id, "sleep".into(), Vec::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.agent.cancel(&h.session_id);

    let event = events.recv().await.unwrap();
    assert!(matches!(event, AgentEvent::Error(AgentError::Canceled)));

    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    let results = tool_results(tool_msg);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "T1");
    assert_eq!(results[0].1, "request cancelled");
    assert!(results[0].2);

    // History stays a valid alternation ending in an assistant message.
    assert_eq!(messages.last().unwrap().role, Role::Assistant);
    assert_eq!(
        messages.last().unwrap().finish_reason(),
        Some(FinishReason::Canceled)
    );
}

#[tokio::test]
async fn title_side_task_updates_session_without_blocking() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = vec![vec![
        emit(StreamEvent::TextDelta("hello".into())),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ]];
    let h = harness(tmp.path(), scripts, Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "first message".into(), Vec::new()).unwrap();
    assert!(matches!(events.recv().await, Some(AgentEvent::Response(_))));

    // The title lands asynchronously; poll briefly.
    let mut title = String::new();
    for _ in 0..50 {
        let session = h.store.get_session(&h.session_id).await.unwrap().unwrap();
        if !session.title.is_empty() {
            title = session.title;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(title, "Scripted session");
}

#[tokio::test]
async fn busy_session_rejects_second_run() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = vec![vec![Step::Wait(Duration::from_secs(30))]];
    let h = harness(tmp.path(), scripts, Config::default()).await;

    let _events = h.agent.run(&h.session_id, "first".into(), Vec::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.agent.is_busy(&h.session_id));

    let second = h.agent.run(&h.session_id, "second".into(), Vec::new());
    assert!(matches!(second, Err(AgentError::Busy(_))));

    h.agent.cancel(&h.session_id);
}

#[tokio::test]
async fn context_overflow_surfaces_with_actionable_text() {
    use coil::provider::ErrorKind;

    struct OverflowingSource(Arc<ScriptedProvider>);

    struct OverflowingProvider(Arc<ScriptedProvider>);

    #[async_trait]
    impl Provider for OverflowingProvider {
        fn model(&self) -> &Model {
            self.0.model()
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
            _cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
            Err(ProviderError::new(
                ErrorKind::ContextOverflow,
                "prompt is too long",
            ))
        }

        async fn send(&self, request: ProviderRequest) -> Result<Message, ProviderError> {
            self.0.send(request).await
        }
    }

    impl ProviderSource for OverflowingSource {
        fn resolve(&self, _model_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
            Ok(Arc::new(OverflowingProvider(self.0.clone())))
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(Config::default());
    let bus = Arc::new(Bus::new());
    let store = Arc::new(Store::in_memory(bus.clone()).await.unwrap());
    let gate = Arc::new(PermissionGate::new(
        store.clone(),
        bus.clone(),
        Default::default(),
    ));
    let agent = Agent::new(
        config,
        store.clone(),
        bus,
        gate,
        Arc::new(OverflowingSource(ScriptedProvider::new(Vec::new()))),
        None,
        tmp.path().to_path_buf(),
    );
    let session = store.create_session(None).await.unwrap();

    let mut events = agent.run(&session.id, "hi".into(), Vec::new()).unwrap();
    let event = events.recv().await.unwrap();
    let AgentEvent::Error(AgentError::Provider(err)) = event else {
        panic!("expected provider error, got {event:?}");
    };
    assert_eq!(err.kind, ErrorKind::ContextOverflow);

    // The failure is visible in the history as an assistant message with
    // an explanatory text part and an error finish-reason.
    let messages = store.list_messages(&session.id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.finish_reason(), Some(FinishReason::Error));
    assert!(last.text().contains("fresh session"));
}

#[tokio::test]
async fn delegation_runs_child_session_and_rolls_up_usage() {
    let tmp = tempfile::tempdir().unwrap();
    let mut first = tool_call("T1", "delegate", r#"{"task":"survey the project"}"#);
    first.push(emit(StreamEvent::Finish(StopReason::ToolUse)));
    let child_turn = vec![
        emit(StreamEvent::TextDelta("Found two modules.".into())),
        emit(usage(40, 11)),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ];
    let wrap_up = vec![
        emit(StreamEvent::TextDelta("Summary delivered.".into())),
        emit(StreamEvent::Finish(StopReason::EndTurn)),
    ];
    let h = harness(tmp.path(), vec![first, child_turn, wrap_up], Config::default()).await;

    let mut events = h.agent.run(&h.session_id, "survey".into(), Vec::new()).unwrap();
    let AgentEvent::Response(response) = events.recv().await.unwrap() else {
        panic!("expected response");
    };
    assert_eq!(response.text(), "Summary delivered.");

    // The child's result came back as the tool result.
    let messages = h.store.list_messages(&h.session_id).await.unwrap();
    let results = tool_results(&messages[2]);
    assert_eq!(results[0].1, "Found two modules.");

    // A child session exists, linked to the parent.
    let sessions = h.store.list_sessions().await.unwrap();
    let child = sessions
        .iter()
        .find(|s| s.parent_id.as_deref() == Some(h.session_id.as_str()))
        .expect("child session");
    assert_eq!(child.prompt_tokens, 40);
    assert_eq!(child.completion_tokens, 11);

    // The parent's counters include the child's usage.
    let parent = h.store.get_session(&h.session_id).await.unwrap().unwrap();
    assert!(parent.prompt_tokens >= 40);
    assert!(parent.completion_tokens >= 11);
}

#[tokio::test]
async fn concurrent_sessions_do_not_interfere() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = vec![
        vec![
            emit(StreamEvent::TextDelta("session one".into())),
            emit(StreamEvent::Finish(StopReason::EndTurn)),
        ],
        vec![
            emit(StreamEvent::TextDelta("session two".into())),
            emit(StreamEvent::Finish(StopReason::EndTurn)),
        ],
    ];
    let h = harness(tmp.path(), scripts, Config::default()).await;
    let other = h.store.create_session(None).await.unwrap();

    let mut first = h.agent.run(&h.session_id, "one".into(), Vec::new()).unwrap();
    let AgentEvent::Response(r1) = first.recv().await.unwrap() else {
        panic!("expected response");
    };
    let mut second = h.agent.run(&other.id, "two".into(), Vec::new()).unwrap();
    let AgentEvent::Response(r2) = second.recv().await.unwrap() else {
        panic!("expected response");
    };

    assert_eq!(r1.session_id, h.session_id);
    assert_eq!(r2.session_id, other.id);
    assert_ne!(r1.text(), r2.text());
}
