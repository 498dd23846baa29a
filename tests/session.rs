//! Assistant session integration tests
//!
//! Drives the session actor against the mock audio backend and connector.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use visor_assistant::session::{
    AssistantSession, Backoff, SessionEvent, SessionHandle, SessionSettings, SessionState,
};
use visor_assistant::tools::ToolDispatcher;
use visor_assistant::voice::{LeaseAuthority, samples_to_le_bytes};

mod common;

use common::{MockBackend, MockConnector, MockServer, WAIT, sine};

struct Harness {
    handle: SessionHandle,
    events: mpsc::Receiver<SessionEvent>,
    servers: mpsc::UnboundedReceiver<MockServer>,
    backend: MockBackend,
    connector: Arc<MockConnector>,
    authority: LeaseAuthority,
    task: JoinHandle<()>,
}

fn test_settings() -> SessionSettings {
    SessionSettings {
        flush_timeout: Duration::from_secs(1),
        configure_timeout: Duration::from_millis(500),
        backoff: Backoff::new(2, Duration::from_millis(50), Duration::from_millis(100)),
        ..SessionSettings::default()
    }
}

fn start(backend: MockBackend) -> Harness {
    start_with(backend, test_settings())
}

fn start_with(backend: MockBackend, settings: SessionSettings) -> Harness {
    let (connector, servers) = MockConnector::new();
    let (events_tx, events) = mpsc::channel(8);
    let dispatcher = Arc::new(ToolDispatcher::new(Duration::from_secs(2)));
    let (handle, task) = AssistantSession::spawn(
        settings,
        Arc::new(backend.clone()),
        connector.clone(),
        dispatcher,
        events_tx,
    );
    Harness {
        handle,
        events,
        servers,
        backend,
        connector,
        authority: LeaseAuthority::new(),
        task,
    }
}

impl Harness {
    async fn wait_for_state(&self, state: SessionState) {
        let mut rx = self.handle.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("session never reached {state}"))
            .unwrap();
    }

    async fn next_server(&mut self) -> MockServer {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("no session event")
            .expect("session exited")
    }

    /// Activate and complete configuration; returns the live server end
    async fn activate(&mut self) -> MockServer {
        let lease = self.authority.acquire().expect("lease outstanding");
        self.handle.activate(lease).await.expect("session exited");
        let mut server = self.next_server().await;
        server.accept_session().await;
        server.expect("response.create").await;
        self.wait_for_state(SessionState::Listening).await;
        server
    }
}

fn audio_delta(response_id: &str, samples: usize) -> serde_json::Value {
    let pcm = sine(440.0, 24_000, samples, 0.2);
    json!({
        "type": "response.audio.delta",
        "response_id": response_id,
        "delta": BASE64.encode(samples_to_le_bytes(&pcm)),
    })
}

fn response_event(kind: &str, id: &str) -> serde_json::Value {
    json!({ "type": kind, "response": { "id": id } })
}

fn dismissal(transcript: &str) -> serde_json::Value {
    json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "item_1",
        "transcript": transcript,
    })
}

fn appends(events: &[serde_json::Value]) -> usize {
    events
        .iter()
        .filter(|e| e["type"] == "input_audio_buffer.append")
        .count()
}

#[tokio::test]
async fn test_activation_reaches_listening_and_greets() {
    let mut h = start(MockBackend::permissive());
    let lease = h.authority.acquire().unwrap();
    h.handle.activate(lease).await.unwrap();

    let mut server = h.next_server().await;
    let update = server.accept_session().await;
    assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");
    assert_eq!(update["session"]["tool_choice"], "auto");

    let greeting = server.expect("response.create").await;
    assert!(
        greeting["response"]["instructions"]
            .as_str()
            .unwrap()
            .contains("Sir")
    );

    h.wait_for_state(SessionState::Listening).await;
    server.expect("input_audio_buffer.append").await;

    assert_eq!(h.backend.input_opens(), 1);
    assert_eq!(h.backend.max_open_inputs(), 1);
    assert_eq!(h.connector.attempts(), 1);

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_runs_on_worker_threads() {
    let mut h = start(MockBackend::permissive());
    let mut server = h.activate().await;
    server.expect("input_audio_buffer.append").await;

    h.handle.deactivate().await.unwrap();
    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));
    h.wait_for_state(SessionState::Idle).await;

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_speaking_discards_microphone() {
    let mut h = start(MockBackend::permissive());
    let mut server = h.activate().await;
    server.expect("input_audio_buffer.append").await;

    server.push(&audio_delta("resp_1", 4_800));
    h.wait_for_state(SessionState::Speaking).await;
    server.drain();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(appends(&server.drain()), 0);
    assert_eq!(h.handle.state(), SessionState::Speaking);

    // Playback thread resamples 24 kHz to the 44.1 kHz output
    tokio::time::timeout(WAIT, async {
        while h.backend.played() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("nothing played");

    server.push(&json!({ "type": "response.done", "response": {} }));
    h.wait_for_state(SessionState::Listening).await;
    server.expect("input_audio_buffer.append").await;

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_deactivate_twice_releases_once() {
    let mut h = start(MockBackend::permissive());
    let server = h.activate().await;

    h.handle.deactivate().await.unwrap();
    h.handle.deactivate().await.unwrap();

    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));
    h.wait_for_state(SessionState::Idle).await;
    assert!(server.is_closed());
    assert_eq!(h.backend.open_inputs(), 0);

    let extra = tokio::time::timeout(Duration::from_millis(300), h.events.recv()).await;
    assert!(extra.is_err(), "unexpected second event");

    // Deactivating an idle session is a no-op
    h.handle.deactivate().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Idle);

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_dismissal_acknowledges_then_releases() {
    let mut h = start(MockBackend::permissive());
    let mut server = h.activate().await;

    server.push(&dismissal("Okay, THANKS a lot"));

    // Input is released before the closing words play
    let SessionEvent::Released(lease) = h.next_event().await else {
        panic!("expected the lease back");
    };
    assert!(h.authority.is_leased());
    drop(lease);
    assert!(!h.authority.is_leased());

    server.expect_acknowledgement("Understood, Sir").await;
    assert_eq!(h.handle.state(), SessionState::Deactivating);

    server.push(&response_event("response.created", "resp_ack"));
    server.push(&audio_delta("resp_ack", 2_400));
    server.push(&response_event("response.done", "resp_ack"));
    h.wait_for_state(SessionState::Idle).await;
    assert!(server.is_closed());

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_earlier_response_does_not_cut_acknowledgement() {
    let mut h = start(MockBackend::permissive());
    let mut server = h.activate().await;

    // Assistant is mid-reply when the user dismisses it
    server.push(&response_event("response.created", "resp_1"));
    server.push(&audio_delta("resp_1", 4_800));
    h.wait_for_state(SessionState::Speaking).await;
    server.push(&dismissal("thanks a lot"));
    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));
    server.expect_acknowledgement("Understood, Sir").await;

    // The interrupted reply finishes first
    server.push(&response_event("response.done", "resp_1"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.handle.state(), SessionState::Deactivating);
    assert!(!server.is_closed());

    server.push(&response_event("response.created", "resp_ack"));
    server.push(&audio_delta("resp_ack", 2_400));
    server.push(&response_event("response.done", "resp_ack"));
    h.wait_for_state(SessionState::Idle).await;
    assert!(server.is_closed());

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_flush_timeout_tears_down() {
    let mut h = start(MockBackend::permissive());
    let server = h.activate().await;

    server.push(&dismissal("goodbye"));
    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));

    // No response.done: the flush timer ends the session
    h.wait_for_state(SessionState::Idle).await;
    assert!(server.is_closed());

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_tool_call_answers_with_error_text() {
    let mut h = start(MockBackend::permissive());
    let mut server = h.activate().await;

    server.push(&json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_42",
        "name": "get_system_status",
        "arguments": "{}",
    }));

    let output = server.expect("conversation.item.create").await;
    assert_eq!(output["item"]["type"], "function_call_output");
    assert_eq!(output["item"]["call_id"], "call_42");
    assert_eq!(output["item"]["output"], "System monitor not available.");

    let follow_up = server.expect("response.create").await;
    assert!(follow_up.get("response").is_none());

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_skips_greeting() {
    let mut h = start(MockBackend::permissive());
    let server = h.activate().await;

    // Remote hangs up
    drop(server);
    h.wait_for_state(SessionState::Connecting).await;

    let mut server = h.next_server().await;
    server.accept_session().await;
    h.wait_for_state(SessionState::Listening).await;

    let before_audio = server.collect_until("input_audio_buffer.append").await;
    assert!(!before_audio.iter().any(|e| e["type"] == "response.create"));
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.backend.input_opens(), 1);

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_retries_exhausted_reports_unavailable() {
    let mut h = start(MockBackend::permissive());
    let server = h.activate().await;

    h.connector.fail_next(10);
    drop(server);

    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));
    assert!(matches!(
        h.next_event().await,
        SessionEvent::Unavailable { .. }
    ));
    h.wait_for_state(SessionState::Idle).await;
    // One successful connect plus two failed retries
    assert_eq!(h.connector.attempts(), 3);

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_connections_lost_before_configuration_exhaust_retries() {
    let mut h = start(MockBackend::permissive());
    let lease = h.authority.acquire().unwrap();
    h.handle.activate(lease).await.unwrap();

    // Every connection opens and then drops before session.updated
    for _ in 0..3 {
        drop(h.next_server().await);
    }

    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));
    assert!(matches!(
        h.next_event().await,
        SessionEvent::Unavailable { .. }
    ));
    h.wait_for_state(SessionState::Idle).await;
    assert_eq!(h.connector.attempts(), 3);
    assert!(h.servers.try_recv().is_err());

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_stalled_capture_releases_when_thread_exits() {
    // The capture thread sits inside one long read
    let backend = MockBackend::permissive().with_read_time(Duration::from_millis(1500));
    let settings = SessionSettings {
        capture_stop_timeout: Duration::from_millis(100),
        ..test_settings()
    };
    let mut h = start_with(backend, settings);
    let server = h.activate().await;

    h.handle.deactivate().await.unwrap();
    h.wait_for_state(SessionState::Idle).await;
    assert!(server.is_closed());
    assert_eq!(h.backend.open_inputs(), 1);
    assert!(h.authority.is_leased());

    let SessionEvent::Released(lease) = h.next_event().await else {
        panic!("expected the lease once capture stopped");
    };
    assert_eq!(h.backend.open_inputs(), 0);
    drop(lease);
    assert!(!h.authority.is_leased());

    let extra = tokio::time::timeout(Duration::from_millis(200), h.events.recv()).await;
    assert!(extra.is_err(), "unexpected second event");

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_failing_microphone_reads_back_off() {
    let backend = MockBackend::permissive().failing_reads();
    let mut h = start(backend);
    let mut server = h.activate().await;

    let before = h.backend.reads();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reads = h.backend.reads() - before;
    assert!(reads <= 30, "{reads} reads in 300 ms");
    assert_eq!(appends(&server.drain()), 0);

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_device_failure_returns_lease_without_connecting() {
    let mut h = start(MockBackend::new(&[8_000], &[24_000]));
    let lease = h.authority.acquire().unwrap();
    h.handle.activate(lease).await.unwrap();

    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));
    let SessionEvent::Unavailable { reason } = h.next_event().await else {
        panic!("expected unavailable");
    };
    assert!(reason.contains("24000"), "reason: {reason}");
    assert_eq!(h.connector.attempts(), 0);
    h.wait_for_state(SessionState::Idle).await;

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_second_activation_returns_lease() {
    let mut h = start(MockBackend::permissive());
    let _server = h.activate().await;

    let other = LeaseAuthority::new();
    h.handle.activate(other.acquire().unwrap()).await.unwrap();

    assert!(matches!(h.next_event().await, SessionEvent::Released(_)));
    assert_eq!(h.handle.state(), SessionState::Listening);
    assert!(h.authority.is_leased());
    assert!(!other.is_leased());

    h.handle.shutdown().await;
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_remote_noise_is_tolerated() {
    let mut h = start(MockBackend::permissive());
    let mut server = h.activate().await;

    server.push(&json!({
        "type": "error",
        "error": { "code": "input_audio_buffer_commit_empty", "message": "buffer too small" },
    }));
    server.push(&json!({
        "type": "error",
        "error": { "code": "server_error", "message": "boom" },
    }));
    server.push_raw("{ not json");
    server.push(&json!({ "type": "rate_limits.updated", "rate_limits": [] }));
    server.push(&json!({ "type": "input_audio_buffer.speech_started" }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle.state(), SessionState::Listening);
    server.expect("input_audio_buffer.append").await;

    h.handle.shutdown().await;
    h.task.await.unwrap();
}
