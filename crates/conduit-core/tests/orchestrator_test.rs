//! End-to-end tests against fake agent binaries.
//!
//! Each test writes a small `/bin/sh` script into a temp directory, points
//! the orchestrator at it, and checks the canonical events it publishes.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use conduit_core::{
    CanonicalEvent, InvocationRequest, Orchestrator, OrchestratorConfig, OutboundEvent,
    SupervisorConfig, SupervisorError,
};

const DEADLINE: Duration = Duration::from_secs(10);

fn fake_agent(dir: &Path, body: &str) -> PathBuf {
    let script_path = dir.join("fake_claude.sh");
    std::fs::write(&script_path, format!("#!/bin/sh\n{body}\n")).unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    script_path
}

fn orchestrator(script: &Path, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(
        SupervisorConfig::with_binary(script.to_str().unwrap()),
        config,
    )
}

async fn collect(orchestrator: &Orchestrator, request: InvocationRequest) -> Vec<OutboundEvent> {
    let stream = orchestrator.invoke_stream(request).await.unwrap();
    tokio::time::timeout(DEADLINE, stream.collect::<Vec<_>>())
        .await
        .expect("invocation did not finish in time")
}

fn kinds(events: &[OutboundEvent]) -> Vec<CanonicalEvent> {
    events.iter().map(|e| e.event.clone()).collect()
}

fn delta(text: &str) -> CanonicalEvent {
    CanonicalEvent::ResponseDelta {
        text: text.to_string(),
    }
}

fn completion(exit_code: i32, is_new_session: bool) -> CanonicalEvent {
    CanonicalEvent::Completion {
        exit_code,
        is_new_session,
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Option<OutboundEvent> {
    tokio::time::timeout(DEADLINE, rx.recv())
        .await
        .expect("no event in time")
}

#[tokio::test]
async fn new_streaming_session_publishes_identity_and_deltas() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(
        tmp.path(),
        r#"cat <<'EOF'
{"type":"system","subtype":"init","session_id":"abc123"}
{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}
{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}}
{"type":"assistant","message":{"content":[{"type":"text","text":"Hi there"}]},"session_id":"abc123"}
{"type":"result","subtype":"success","is_error":false,"result":"Hi there","session_id":"abc123"}
EOF"#,
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());
    let request = InvocationRequest::new("req-1")
        .with_prompt("hello")
        .streamed()
        .in_directory(tmp.path());

    let events = collect(&orchestrator, request).await;

    assert!(events.iter().all(|e| e.correlation_token == "req-1"));
    assert_eq!(
        kinds(&events),
        vec![
            CanonicalEvent::SessionCreated {
                session_id: "abc123".to_string()
            },
            delta("Hi"),
            delta(" there"),
            completion(0, true),
        ]
    );
    assert!(orchestrator.supervisor().registry().is_empty().await);
}

#[tokio::test]
async fn resumed_batch_invocation_passes_resume_and_no_model() {
    let tmp = tempfile::tempdir().unwrap();
    let args_file = tmp.path().join("args");
    let script = fake_agent(
        tmp.path(),
        &format!(
            r#"printf '%s\n' "$@" > '{}'
echo '{{"type":"result","result":"42","session_id":"abc123"}}'"#,
            args_file.display()
        ),
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());
    let request = InvocationRequest::new("req-2")
        .with_prompt("meaning?")
        .with_model("opus")
        .resuming("abc123")
        .in_directory(tmp.path());

    let events = collect(&orchestrator, request).await;
    assert_eq!(kinds(&events), vec![delta("42"), completion(0, false)]);

    let args = std::fs::read_to_string(&args_file).unwrap();
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(
        args,
        vec!["-p", "meaning?", "--output-format", "json", "--resume", "abc123"]
    );
}

#[tokio::test]
async fn new_session_gets_generated_id_model_and_env() {
    let tmp = tempfile::tempdir().unwrap();
    let args_file = tmp.path().join("args");
    let env_file = tmp.path().join("env");
    let script = fake_agent(
        tmp.path(),
        &format!(
            r#"printf '%s\n' "$@" > '{}'
printf '%s' "$CLAUDE_CODE_OUTPUT_FORMAT" > '{}'
echo '{{"result":"ok"}}'"#,
            args_file.display(),
            env_file.display()
        ),
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());
    let request = InvocationRequest::new("req")
        .with_prompt("hi")
        .with_model("opus")
        .in_directory(tmp.path());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = orchestrator.invoke(request, Arc::new(tx)).await.unwrap();
    let generated = handle.session_id().to_string();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.session_id, generated);
    assert_eq!(outcome.response, "ok");
    assert!(uuid::Uuid::parse_str(&generated).is_ok());

    let args = std::fs::read_to_string(&args_file).unwrap();
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(
        args,
        vec![
            "-p",
            "hi",
            "--output-format",
            "json",
            "--session-id",
            generated.as_str(),
            "--model",
            "opus"
        ]
    );
    assert_eq!(std::fs::read_to_string(&env_file).unwrap(), "stream-json");

    // No identity was reported, so nothing is announced.
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    assert_eq!(events, vec![delta("ok"), completion(0, true)]);
}

#[tokio::test]
async fn failed_agent_reports_stderr_before_completion() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(tmp.path(), "echo 'auth required' >&2\nexit 1");
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = orchestrator
        .invoke(
            InvocationRequest::new("req-3").with_prompt("hi").in_directory(tmp.path()),
            Arc::new(tx),
        )
        .await
        .unwrap();
    let generated = handle.session_id().to_string();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.exit_code, 1);

    assert_eq!(
        next_event(&mut rx).await.unwrap().event,
        CanonicalEvent::Error {
            session_id: Some(generated),
            message: "auth required".to_string()
        }
    );
    assert_eq!(next_event(&mut rx).await.unwrap().event, completion(1, true));
    assert!(next_event(&mut rx).await.is_none());
}

#[tokio::test]
async fn unterminated_last_line_is_still_parsed() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(
        tmp.path(),
        r#"printf '%s' '{"type":"result","result":"tail","session_id":"s-9"}'"#,
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let events = collect(
        &orchestrator,
        InvocationRequest::new("req").with_prompt("hi").in_directory(tmp.path()),
    )
    .await;
    assert_eq!(
        kinds(&events),
        vec![
            CanonicalEvent::SessionCreated {
                session_id: "s-9".to_string()
            },
            delta("tail"),
            completion(0, true),
        ]
    );
}

#[tokio::test]
async fn noise_and_malformed_lines_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(
        tmp.path(),
        r#"echo 'Welcome to the agent!'
echo '{"type":"assistant", broken'
echo ''
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"valid line"}]}}'
echo '{"type":"result","result":"valid line"}'"#,
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let events = collect(
        &orchestrator,
        InvocationRequest::new("req").with_prompt("hi").in_directory(tmp.path()),
    )
    .await;
    let kinds = kinds(&events);
    assert_eq!(kinds.first(), Some(&delta("valid line")));
    assert_eq!(kinds.last(), Some(&completion(0, true)));
    assert_eq!(
        kinds
            .iter()
            .filter(|e| matches!(e, CanonicalEvent::Completion { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn acknowledgment_precedes_agent_output() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(tmp.path(), r#"echo '{"result":"done"}'"#);
    let orchestrator = orchestrator(
        &script,
        OrchestratorConfig {
            acknowledgment: Some("…".to_string()),
            ..OrchestratorConfig::default()
        },
    );

    let events = collect(
        &orchestrator,
        InvocationRequest::new("req").with_prompt("hi").in_directory(tmp.path()),
    )
    .await;
    assert_eq!(
        kinds(&events),
        vec![delta("…"), delta("done"), completion(0, true)]
    );
}

#[tokio::test]
async fn cancel_by_reported_identity_terminates_the_agent() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(
        tmp.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"abc123"}'
exec sleep 30"#,
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = orchestrator
        .invoke(
            InvocationRequest::new("req").streamed().with_prompt("hi").in_directory(tmp.path()),
            Arc::new(tx),
        )
        .await
        .unwrap();

    let first = next_event(&mut rx).await.unwrap();
    assert_eq!(
        first.event,
        CanonicalEvent::SessionCreated {
            session_id: "abc123".to_string()
        }
    );

    assert!(orchestrator.cancel("abc123").await);
    // Every alias went with the entry.
    assert!(!orchestrator.cancel(handle.session_id()).await);
    assert!(!orchestrator.cancel("abc123").await);

    let outcome = tokio::time::timeout(DEADLINE, handle.wait())
        .await
        .expect("cancelled agent did not exit")
        .unwrap();
    assert_eq!(outcome.exit_code, 128 + libc::SIGTERM);
    assert_eq!(outcome.session_id, "abc123");

    let mut rest = Vec::new();
    while let Some(event) = next_event(&mut rx).await {
        rest.push(event.event);
    }
    assert!(matches!(rest.first(), Some(CanonicalEvent::Error { .. })));
    assert_eq!(rest.last(), Some(&completion(128 + libc::SIGTERM, true)));
}

#[tokio::test]
async fn timeout_terminates_and_reports() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(tmp.path(), "exec sleep 30");
    let orchestrator = orchestrator(
        &script,
        OrchestratorConfig {
            timeout: Some(Duration::from_millis(200)),
            ..OrchestratorConfig::default()
        },
    );

    let events = collect(
        &orchestrator,
        InvocationRequest::new("req").with_prompt("hi").in_directory(tmp.path()),
    )
    .await;
    let kinds = kinds(&events);
    assert_eq!(kinds.len(), 2, "unexpected events: {kinds:?}");
    match &kinds[0] {
        CanonicalEvent::Error { message, .. } => {
            assert!(message.contains("timed out"), "unexpected message: {message}")
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(kinds[1], completion(128 + libc::SIGTERM, true));
}

#[tokio::test]
async fn interactive_invocation_accepts_input() {
    let tmp = tempfile::tempdir().unwrap();
    let input_file = tmp.path().join("input");
    let script = fake_agent(
        tmp.path(),
        &format!(
            r#"read line
printf '%s' "$line" > '{}'
echo '{{"type":"result","result":"got it","session_id":"s1"}}'"#,
            input_file.display()
        ),
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = orchestrator
        .invoke(InvocationRequest::new("req").in_directory(tmp.path()), Arc::new(tx))
        .await
        .unwrap();
    orchestrator.send(handle.session_id(), "hello there").await.unwrap();

    let outcome = tokio::time::timeout(DEADLINE, handle.wait())
        .await
        .expect("interactive agent did not exit")
        .unwrap();
    assert_eq!(outcome.response, "got it");

    let sent: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&input_file).unwrap()).unwrap();
    assert_eq!(sent["type"], "user");
    assert_eq!(sent["message"]["content"][0]["text"], "hello there");

    let mut events = Vec::new();
    while let Some(event) = next_event(&mut rx).await {
        events.push(event.event);
    }
    assert!(events.contains(&delta("got it")));
    assert_eq!(events.last(), Some(&completion(0, true)));
}

#[tokio::test]
async fn send_to_batch_invocation_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(tmp.path(), "exec sleep 30");
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = orchestrator
        .invoke(
            InvocationRequest::new("req").with_prompt("hi").in_directory(tmp.path()),
            Arc::new(tx),
        )
        .await
        .unwrap();

    let err = orchestrator
        .send(handle.session_id(), "more")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::InputClosed(_)));

    assert!(orchestrator.cancel(handle.session_id()).await);
    tokio::time::timeout(DEADLINE, handle.wait())
        .await
        .expect("cancelled agent did not exit")
        .unwrap();
}

#[tokio::test]
async fn missing_working_directory_fails_before_spawn() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(tmp.path(), r#"echo '{"result":"unreachable"}'"#);
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = orchestrator
        .invoke(
            InvocationRequest::new("req")
                .with_prompt("hi")
                .in_directory(tmp.path().join("gone")),
            Arc::new(tx),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SupervisorError::MissingDirectory(_)));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn concurrent_invocations_stay_separate() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(
        tmp.path(),
        r#"echo "{\"result\":\"$2\"}""#,
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let a = collect(
        &orchestrator,
        InvocationRequest::new("a").with_prompt("first").in_directory(tmp.path()),
    );
    let b = collect(
        &orchestrator,
        InvocationRequest::new("b").with_prompt("second").in_directory(tmp.path()),
    );
    let (a, b) = tokio::join!(a, b);

    assert!(a.iter().all(|e| e.correlation_token == "a"));
    assert!(b.iter().all(|e| e.correlation_token == "b"));
    assert_eq!(kinds(&a), vec![delta("first"), completion(0, true)]);
    assert_eq!(kinds(&b), vec![delta("second"), completion(0, true)]);
}

#[tokio::test]
async fn closing_input_lets_the_agent_finish() {
    let tmp = tempfile::tempdir().unwrap();
    let input_file = tmp.path().join("input");
    let script = fake_agent(
        tmp.path(),
        &format!(
            r#"cat > '{}'
echo '{{"type":"result","result":"bye"}}'"#,
            input_file.display()
        ),
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = orchestrator
        .invoke(InvocationRequest::new("req").in_directory(tmp.path()), Arc::new(tx))
        .await
        .unwrap();
    let session = handle.session_id().to_string();

    orchestrator.send(&session, "first").await.unwrap();
    orchestrator.send(&session, "second").await.unwrap();
    orchestrator.close_input(&session).await.unwrap();
    assert!(matches!(
        orchestrator.send(&session, "third").await,
        Err(SupervisorError::InputClosed(_))
    ));

    let outcome = tokio::time::timeout(DEADLINE, handle.wait())
        .await
        .expect("agent did not exit after end of input")
        .unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.response, "bye");

    let input = std::fs::read_to_string(&input_file).unwrap();
    let texts: Vec<String> = input
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["message"]["content"][0]["text"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(texts, vec!["first", "second"]);
}

#[tokio::test]
async fn resuming_a_session_that_is_still_running_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(tmp.path(), "exec sleep 30");
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());
    let request = || {
        InvocationRequest::new("req")
            .with_prompt("hi")
            .resuming("abc")
            .in_directory(tmp.path())
    };

    let (tx, _rx) = mpsc::unbounded_channel();
    let first = orchestrator.invoke(request(), Arc::new(tx)).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = orchestrator.invoke(request(), Arc::new(tx)).await.unwrap_err();
    assert!(matches!(err, SupervisorError::SessionBusy(ref id) if id == "abc"), "got {err}");
    assert!(rx.recv().await.is_none());
    assert_eq!(orchestrator.supervisor().registry().len().await, 1);

    assert!(orchestrator.cancel("abc").await);
    let outcome = tokio::time::timeout(DEADLINE, first.wait())
        .await
        .expect("cancelled agent did not exit")
        .unwrap();
    assert_eq!(outcome.exit_code, 128 + libc::SIGTERM);
    assert!(orchestrator.supervisor().registry().is_empty().await);
}

#[tokio::test]
async fn background_child_holding_the_pipes_does_not_block_completion() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(
        tmp.path(),
        r#"sleep 30 &
echo '{"type":"result","result":"done"}'
exit 0"#,
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = orchestrator
        .invoke(
            InvocationRequest::new("req").with_prompt("hi").in_directory(tmp.path()),
            Arc::new(tx),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("invocation outlived its agent")
        .unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert!(orchestrator.supervisor().registry().is_empty().await);

    let mut events = Vec::new();
    while let Some(event) = next_event(&mut rx).await {
        events.push(event.event);
    }
    assert_eq!(events, vec![delta("done"), completion(0, true)]);
}

#[tokio::test]
async fn interactive_session_completes_once_at_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let script = fake_agent(
        tmp.path(),
        r#"read line
echo '{"type":"system","subtype":"init","session_id":"s1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"turn one"}]},"session_id":"s1"}'
echo '{"type":"result","result":"turn one","session_id":"s1"}'
read line
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"turn two"}]},"session_id":"s1"}'
echo '{"type":"result","result":"turn two","session_id":"s1"}'
echo crashed >&2
exit 1"#,
    );
    let orchestrator = orchestrator(&script, OrchestratorConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = orchestrator
        .invoke(InvocationRequest::new("req").in_directory(tmp.path()), Arc::new(tx))
        .await
        .unwrap();
    let session = handle.session_id().to_string();

    orchestrator.send(&session, "first").await.unwrap();
    assert_eq!(
        next_event(&mut rx).await.unwrap().event,
        CanonicalEvent::SessionCreated {
            session_id: "s1".to_string()
        }
    );
    assert_eq!(next_event(&mut rx).await.unwrap().event, delta("turn one"));
    orchestrator.send("s1", "second").await.unwrap();

    let outcome = tokio::time::timeout(DEADLINE, handle.wait())
        .await
        .expect("interactive agent did not exit")
        .unwrap();
    assert_eq!(outcome.exit_code, 1);

    let mut rest = Vec::new();
    while let Some(event) = next_event(&mut rx).await {
        rest.push(event.event);
    }
    assert_eq!(
        rest,
        vec![
            delta("turn two"),
            CanonicalEvent::Error {
                session_id: Some("s1".to_string()),
                message: "crashed".to_string()
            },
            completion(1, true),
        ]
    );
}
