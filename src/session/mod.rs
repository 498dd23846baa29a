//! Assistant session
//!
//! [`AssistantSession`] is a single actor task that owns the realtime
//! connection, the session's capture and playback threads, and the
//! [`SessionState`]. Every state change goes through [`transition`]; the
//! actor only performs the effects it returns.
//!
//! ```text
//!  Coordinator ──activate(lease)──▶ ┌───────────────┐ ◀──text──  Connection
//!              ◀──Released(lease)── │ SessionActor  │ ──events──▶
//!                                   └──┬─────────▲──┘
//!                          playback    │         │ mic frames (24 kHz)
//!                          queue       ▼         │
//!                                PlaybackWorker  CaptureWorker
//! ```

mod audio;
mod backoff;
mod dismissal;
mod protocol;
mod state;
mod transport;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use audio::{
    CAPTURE_STOP_TIMEOUT, CaptureFailure, CaptureStop, CaptureWorker, PlaybackWorker,
};
pub use backoff::Backoff;
pub use dismissal::{DEFAULT_DISMISSAL_PHRASES, DismissalMatcher};
pub use protocol::{
    ClientEvent, ContentPart, ConversationItem, ErrorDetail, InputTranscription, ResponseInfo,
    ResponseOptions, ServerEvent, SessionConfig, TurnDetection,
};
pub use state::{Effect, SessionState, Trigger, transition};
pub use transport::{Connection, Connector, RealtimeConnector};

use crate::tools::{ToolCall, ToolDispatcher};
use crate::voice::{
    AudioBackend, AudioFrame, DeviceLease, SESSION_FRAME_MS, le_bytes_to_samples,
};
use crate::{Error, Result};

const CAPTURE_LOST: &str = "microphone capture thread exited without the device lease";

/// Session tuning and conversation content
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// System instructions
    pub instructions: String,
    /// Remote voice
    pub voice: String,
    /// Instructions for the greeting turn
    pub greeting: String,
    /// Spoken after a dismissal phrase
    pub acknowledgement: String,
    /// Server VAD threshold
    pub vad_threshold: f32,
    /// Server VAD prefix padding
    pub prefix_padding_ms: u32,
    /// Server VAD end-of-turn silence
    pub silence_duration_ms: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Response length cap
    pub max_output_tokens: u32,
    /// Input transcription model
    pub transcription_model: String,
    /// Remote error codes logged at debug level only
    pub benign_error_codes: Vec<String>,
    /// Dismissal phrases
    pub dismissal_phrases: Vec<String>,
    /// Keepalive period
    pub ping_interval: Duration,
    /// Configuration is assumed accepted after this long
    pub configure_timeout: Duration,
    /// Longest wait for the closing utterance
    pub flush_timeout: Duration,
    /// Wait for the capture thread before releasing the lease from a watcher
    pub capture_stop_timeout: Duration,
    /// Reconnect policy
    pub backoff: Backoff,
    /// Input rates tried in order
    pub input_rates: Vec<u32>,
    /// Output rates tried in order
    pub output_rates: Vec<u32>,
    /// Capture frame duration
    pub frame_ms: u32,
    /// Output volume (0.0-1.0)
    pub output_volume: f32,
    /// Playback chunks buffered ahead of the speaker
    pub playback_queue: usize,
    /// Microphone frames buffered ahead of the network
    pub mic_queue: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            instructions: "You are a helpful AI assistant.".to_string(),
            voice: "alloy".to_string(),
            greeting: "Greet the user with just the word 'Sir' in a professional tone.".to_string(),
            acknowledgement: "Understood, Sir. I'll be here if you need me.".to_string(),
            vad_threshold: 0.95,
            prefix_padding_ms: 300,
            silence_duration_ms: 1800,
            temperature: 0.7,
            max_output_tokens: 200,
            transcription_model: "whisper-1".to_string(),
            benign_error_codes: vec!["input_audio_buffer_commit_empty".to_string()],
            dismissal_phrases: DEFAULT_DISMISSAL_PHRASES
                .iter()
                .map(ToString::to_string)
                .collect(),
            ping_interval: Duration::from_secs(20),
            configure_timeout: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(5),
            capture_stop_timeout: CAPTURE_STOP_TIMEOUT,
            backoff: Backoff::default(),
            input_rates: vec![24_000, 48_000, 44_100],
            output_rates: vec![44_100, 48_000, 24_000],
            frame_ms: SESSION_FRAME_MS,
            output_volume: 1.0,
            playback_queue: 256,
            mic_queue: 32,
        }
    }
}

impl SessionSettings {
    /// Payload of the one-time `session.update`
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: InputTranscription {
                model: self.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: self.vad_threshold,
                prefix_padding_ms: self.prefix_padding_ms,
                silence_duration_ms: self.silence_duration_ms,
            },
            temperature: self.temperature,
            max_response_output_tokens: self.max_output_tokens,
            tools: ToolDispatcher::descriptors(),
            tool_choice: "auto".to_string(),
        }
    }
}

/// Notifications from the session to the coordinator
#[derive(Debug)]
pub enum SessionEvent {
    /// The input device is closed and its lease handed back
    Released(DeviceLease),
    /// The assistant gave up (devices or connection); the user must re-trigger
    Unavailable {
        /// Last failure seen
        reason: String,
    },
}

/// Progress of the dismissal acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
enum Closing {
    /// Not dismissed
    Idle,
    /// Acknowledgement sent; the next `response.created` is its response
    Requested,
    /// Remote response speaking the acknowledgement
    Speaking(Option<String>),
}

enum Command {
    Activate(DeviceLease),
    Deactivate,
    Shutdown,
}

/// Control handle for the session actor
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Hand the device lease to the session and start a conversation
    ///
    /// # Errors
    ///
    /// Gives the lease back if the session has exited
    pub async fn activate(&self, lease: DeviceLease) -> std::result::Result<(), DeviceLease> {
        match self.commands.reserve().await {
            Ok(permit) => {
                permit.send(Command::Activate(lease));
                Ok(())
            }
            Err(_) => Err(lease),
        }
    }

    /// End the conversation; a no-op when already idle
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub async fn deactivate(&self) -> Result<()> {
        self.commands
            .send(Command::Deactivate)
            .await
            .map_err(|_| Error::Handoff("session is not running".to_string()))
    }

    /// Tear everything down and stop the actor
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

/// The realtime assistant session
pub struct AssistantSession;

impl AssistantSession {
    /// Spawn the session actor on the current runtime
    pub fn spawn(
        settings: SessionSettings,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<ToolDispatcher>,
        events: mpsc::Sender<SessionEvent>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let actor = SessionActor {
            dismissal: DismissalMatcher::new(&settings.dismissal_phrases),
            backoff: settings.backoff.clone(),
            settings,
            backend,
            connector,
            dispatcher,
            events,
            state: SessionState::Idle,
            state_tx,
            pending_lease: None,
            capture: None,
            mic: None,
            playback: None,
            connection: None,
            greeted: false,
            closing: Closing::Idle,
            last_error: None,
            configure_deadline: None,
            flush_deadline: None,
            retry_at: None,
            discarded_frames: 0,
        };

        let task = tokio::spawn(actor.run(commands_rx));
        let handle = SessionHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (handle, task)
    }
}

struct SessionActor {
    settings: SessionSettings,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<ToolDispatcher>,
    events: mpsc::Sender<SessionEvent>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    dismissal: DismissalMatcher,
    backoff: Backoff,
    /// Lease received on activation, before capture takes it
    pending_lease: Option<DeviceLease>,
    capture: Option<CaptureWorker>,
    mic: Option<mpsc::Receiver<AudioFrame>>,
    playback: Option<PlaybackWorker>,
    connection: Option<Box<dyn Connection>>,
    greeted: bool,
    closing: Closing,
    last_error: Option<String>,
    configure_deadline: Option<Instant>,
    flush_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    discarded_frames: u64,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Activate(lease)) => self.on_activate(lease).await,
                    Some(Command::Deactivate) => self.apply(Trigger::Deactivate).await,
                    Some(Command::Shutdown) | None => break,
                },
                message = next_message(self.connection.as_mut()) => self.on_message(message).await,
                frame = next_frame(self.mic.as_mut()) => self.on_mic_frame(frame).await,
                () = wait_until(self.configure_deadline) => {
                    tracing::debug!("no session.updated received, assuming configuration accepted");
                    self.on_configured().await;
                }
                () = wait_until(self.flush_deadline) => {
                    self.flush_deadline = None;
                    tracing::debug!("closing utterance did not finish in time");
                    self.apply(Trigger::FlushTimeout).await;
                }
                () = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.apply(Trigger::RetryDue).await;
                }
                _ = ping.tick(), if self.connection.is_some() => self.ping().await,
            }
        }

        self.apply(Trigger::Deactivate).await;
        tracing::info!(discarded_frames = self.discarded_frames, "session stopped");
    }

    async fn on_activate(&mut self, lease: DeviceLease) {
        if self.state == SessionState::Deactivating {
            // Cut the closing utterance short
            self.apply(Trigger::Deactivate).await;
        }

        if self.state != SessionState::Idle {
            tracing::warn!(state = %self.state, "activation while active, returning lease");
            self.emit(SessionEvent::Released(lease)).await;
            return;
        }

        self.pending_lease = Some(lease);
        self.greeted = false;
        self.closing = Closing::Idle;
        self.last_error = None;
        self.backoff.reset();
        self.apply(Trigger::Activate).await;
    }

    /// Feed a trigger (and any follow-ups) through the state machine
    async fn apply(&mut self, trigger: Trigger) {
        let mut queue = VecDeque::from([trigger]);

        while let Some(trigger) = queue.pop_front() {
            let (next, effects) = transition(self.state, trigger);
            if next != self.state {
                tracing::info!(from = %self.state, to = %next, ?trigger, "session state changed");
                self.state = next;
                self.state_tx.send_replace(next);
            }

            for effect in effects {
                if let Some(follow_up) = self.perform(effect).await {
                    queue.push_back(follow_up);
                    break;
                }
            }
        }
    }

    async fn perform(&mut self, effect: Effect) -> Option<Trigger> {
        tracing::trace!(?effect, "performing effect");
        match effect {
            Effect::OpenAudio => self.open_audio().await,
            Effect::Connect => self.connect().await,
            Effect::SendSessionUpdate => {
                let update = ClientEvent::SessionUpdate {
                    session: Box::new(self.settings.session_config()),
                };
                self.configure_deadline = Some(Instant::now() + self.settings.configure_timeout);
                self.send_or_lost(&update).await
            }
            Effect::RequestGreeting => {
                self.greeted = true;
                let greeting = ClientEvent::spoken_response(self.settings.greeting.clone());
                self.send_or_lost(&greeting).await
            }
            Effect::ReleaseInput => {
                self.release_input().await;
                None
            }
            Effect::SendAcknowledgement => {
                self.closing = Closing::Requested;
                let text = ClientEvent::user_text(format!(
                    "Say this exactly: {}",
                    self.settings.acknowledgement
                ));
                if let Some(lost) = self.send_or_lost(&text).await {
                    return Some(lost);
                }
                self.send_or_lost(&ClientEvent::spoken_reply()).await
            }
            Effect::ArmFlushTimer => {
                self.flush_deadline = Some(Instant::now() + self.settings.flush_timeout);
                None
            }
            Effect::Teardown => {
                self.teardown().await;
                Some(Trigger::TornDown)
            }
            Effect::ScheduleReconnect => {
                self.connection = None;
                self.configure_deadline = None;
                match self.backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            attempt = self.backoff.attempts(),
                            delay_secs = delay.as_secs_f32(),
                            "connection lost, reconnecting"
                        );
                        self.retry_at = Some(Instant::now() + delay);
                        None
                    }
                    None => Some(Trigger::RetriesExhausted),
                }
            }
            Effect::ReportUnavailable => {
                let reason = self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string());
                tracing::error!(reason = %reason, "assistant unavailable");
                self.emit(SessionEvent::Unavailable { reason }).await;
                None
            }
        }
    }

    async fn open_audio(&mut self) -> Option<Trigger> {
        let Some(lease) = self.pending_lease.take() else {
            self.last_error = Some("activation without a device lease".to_string());
            return Some(Trigger::DeviceFailed);
        };

        let (frames_tx, frames_rx) = mpsc::channel(self.settings.mic_queue.max(1));
        let backend = Arc::clone(&self.backend);
        let rates = self.settings.input_rates.clone();
        let frame_ms = self.settings.frame_ms;
        let capture = tokio::task::spawn_blocking(move || {
            CaptureWorker::start(backend, lease, rates, frame_ms, frames_tx)
        })
        .await;

        match capture {
            Ok(Ok(worker)) => {
                self.capture = Some(worker);
                self.mic = Some(frames_rx);
            }
            Ok(Err(CaptureFailure { lease, error })) => {
                tracing::error!(error = %error, "microphone unavailable");
                self.last_error = Some(error.to_string());
                self.pending_lease = lease;
                return Some(Trigger::DeviceFailed);
            }
            Err(e) => {
                tracing::error!(error = %e, "capture start panicked");
                self.last_error = Some(e.to_string());
                return Some(Trigger::DeviceFailed);
            }
        }

        let backend = Arc::clone(&self.backend);
        let rates = self.settings.output_rates.clone();
        let volume = self.settings.output_volume;
        let depth = self.settings.playback_queue;
        let playback =
            tokio::task::spawn_blocking(move || PlaybackWorker::start(backend, rates, volume, depth))
                .await;

        match playback {
            Ok(Ok(worker)) => {
                self.playback = Some(worker);
                None
            }
            Ok(Err(error)) => {
                tracing::error!(error = %error, "speaker unavailable");
                self.last_error = Some(error.to_string());
                Some(Trigger::DeviceFailed)
            }
            Err(e) => {
                tracing::error!(error = %e, "playback start panicked");
                self.last_error = Some(e.to_string());
                Some(Trigger::DeviceFailed)
            }
        }
    }

    async fn connect(&mut self) -> Option<Trigger> {
        match self.connector.connect().await {
            Ok(connection) => {
                self.connection = Some(connection);
                Some(Trigger::Connected)
            }
            Err(e) => {
                tracing::warn!(error = %e, "realtime connect failed");
                self.last_error = Some(e.to_string());
                Some(Trigger::ConnectionLost)
            }
        }
    }

    /// Stop capture and hand the lease to the coordinator
    ///
    /// A capture thread stuck in a device read keeps the lease; a watcher
    /// reports the release once the thread exits.
    async fn release_input(&mut self) {
        self.mic = None;

        let stopped = match self.capture.take() {
            Some(worker) => {
                let timeout = self.settings.capture_stop_timeout;
                tokio::task::spawn_blocking(move || worker.stop(timeout))
                    .await
                    .unwrap_or(CaptureStop::Lost)
            }
            None => self
                .pending_lease
                .take()
                .map_or(CaptureStop::Lost, CaptureStop::Released),
        };

        match stopped {
            CaptureStop::Released(lease) => self.emit(SessionEvent::Released(lease)).await,
            CaptureStop::Lost => {
                tracing::error!("input lease was lost with the capture thread");
                self.emit(SessionEvent::Unavailable {
                    reason: CAPTURE_LOST.to_string(),
                })
                .await;
            }
            stalled @ CaptureStop::Stalled(_) => {
                let events = self.events.clone();
                tokio::task::spawn_blocking(move || {
                    let event = match stalled.wait() {
                        Some(lease) => {
                            tracing::info!("stalled capture thread exited, releasing input");
                            SessionEvent::Released(lease)
                        }
                        None => SessionEvent::Unavailable {
                            reason: CAPTURE_LOST.to_string(),
                        },
                    };
                    if events.blocking_send(event).is_err() {
                        tracing::warn!("session event receiver dropped");
                    }
                });
            }
        }
    }

    async fn teardown(&mut self) {
        self.closing = Closing::Idle;
        self.configure_deadline = None;
        self.flush_deadline = None;
        self.retry_at = None;

        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        if let Some(worker) = self.playback.take() {
            let _ = tokio::task::spawn_blocking(move || worker.stop()).await;
        }
        if self.capture.is_some() || self.pending_lease.is_some() {
            self.release_input().await;
        }
    }

    async fn emit(&mut self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::warn!("session event receiver dropped");
        }
    }

    async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(Error::ConnectionLost("not connected".to_string()));
        };
        tracing::trace!(kind = event.kind(), "sending");
        connection.send(event).await
    }

    async fn send_or_lost(&mut self, event: &ClientEvent) -> Option<Trigger> {
        match self.send(event).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(kind = event.kind(), error = %e, "send failed");
                self.last_error = Some(e.to_string());
                self.connection = None;
                Some(Trigger::ConnectionLost)
            }
        }
    }

    async fn connection_lost(&mut self, reason: String) {
        self.connection = None;
        self.last_error = Some(reason);
        self.apply(Trigger::ConnectionLost).await;
    }

    async fn ping(&mut self) {
        let result = match self.connection.as_mut() {
            Some(connection) => connection.ping().await,
            None => return,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "keepalive failed");
            self.connection_lost(e.to_string()).await;
        }
    }

    async fn on_configured(&mut self) {
        self.configure_deadline = None;
        // Only a configured session counts as a successful reconnect
        self.backoff.reset();
        let greet = !self.greeted;
        self.apply(Trigger::Configured { greet }).await;
    }

    async fn on_message(&mut self, message: Result<Option<String>>) {
        let text = match message {
            Ok(Some(text)) => text,
            Ok(None) => return self.connection_lost("closed by remote".to_string()).await,
            Err(e) => return self.connection_lost(e.to_string()).await,
        };

        let event = match ServerEvent::parse(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed message");
                return;
            }
        };

        match event {
            ServerEvent::SessionCreated => tracing::debug!("session created"),
            ServerEvent::SessionUpdated => {
                if self.state == SessionState::Configuring {
                    self.on_configured().await;
                }
            }
            ServerEvent::AudioDelta { delta } => self.on_audio_delta(&delta).await,
            ServerEvent::ResponseCreated { response } => self.on_response_created(response),
            ServerEvent::ResponseDone { response } => self.on_response_done(response).await,
            ServerEvent::TranscriptionCompleted { transcript } => {
                self.on_transcript(&transcript).await;
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                self.on_tool_call(ToolCall::from_wire(call_id, name, &arguments))
                    .await;
            }
            ServerEvent::TextDelta { delta } | ServerEvent::AudioTranscriptDelta { delta } => {
                tracing::trace!(delta = %delta, "assistant");
            }
            ServerEvent::SpeechStarted => tracing::debug!("user speech started"),
            ServerEvent::SpeechStopped => tracing::debug!("user speech stopped"),
            ServerEvent::Error { error } => self.on_remote_error(error),
            ServerEvent::Unknown => {}
        }
    }

    async fn on_audio_delta(&mut self, delta: &str) {
        if !matches!(
            self.state,
            SessionState::Listening | SessionState::Speaking | SessionState::Deactivating
        ) {
            return;
        }

        match BASE64.decode(delta) {
            Ok(bytes) => {
                if let Some(playback) = self.playback.as_ref() {
                    playback.enqueue(le_bytes_to_samples(&bytes));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "audio delta is not valid base64");
                return;
            }
        }

        self.apply(Trigger::AudioDelta).await;
    }

    fn on_response_created(&mut self, response: ResponseInfo) {
        tracing::debug!(id = ?response.id, "response started");
        if self.closing == Closing::Requested {
            self.closing = Closing::Speaking(response.id);
        }
    }

    async fn on_response_done(&mut self, response: ResponseInfo) {
        let closing = matches!(&self.closing, Closing::Speaking(id) if *id == response.id);
        if self.state == SessionState::Deactivating && !closing {
            tracing::debug!(
                id = ?response.id,
                "earlier response finished, still waiting for the acknowledgement"
            );
        }
        self.apply(Trigger::ResponseDone { closing }).await;
    }

    async fn on_transcript(&mut self, transcript: &str) {
        tracing::info!(transcript = %transcript, "user said");
        if !self.state.is_conversing() {
            return;
        }
        if let Some(phrase) = self.dismissal.find(transcript) {
            tracing::info!(phrase = %phrase, "dismissal phrase heard");
            self.apply(Trigger::Dismissed).await;
        }
    }

    /// Run the tool to completion before any further input is processed
    async fn on_tool_call(&mut self, call: ToolCall) {
        let result = self.dispatcher.execute(&call).await;

        let output = ClientEvent::function_output(result.call_id, result.text);
        if let Err(e) = self.send(&output).await {
            return self.connection_lost(e.to_string()).await;
        }
        if let Err(e) = self.send(&ClientEvent::continue_response()).await {
            return self.connection_lost(e.to_string()).await;
        }

        // Frames captured while the tool ran are stale
        if let Some(mic) = self.mic.as_mut() {
            while mic.try_recv().is_ok() {
                self.discarded_frames += 1;
            }
        }
    }

    fn on_remote_error(&self, detail: ErrorDetail) {
        let code = detail.code.unwrap_or_default();
        if self.settings.benign_error_codes.iter().any(|c| *c == code) {
            tracing::debug!(code = %code, "suppressed remote error");
            return;
        }
        let error = Error::Model {
            code,
            message: detail.message,
        };
        tracing::error!(error = %error, "remote model error");
    }

    async fn on_mic_frame(&mut self, frame: Option<AudioFrame>) {
        let Some(frame) = frame else {
            self.mic = None;
            return;
        };

        // Echo avoidance: only forward while listening
        if !self.state.accepts_input() {
            self.discarded_frames += 1;
            return;
        }

        let append = ClientEvent::InputAudioAppend {
            audio: BASE64.encode(frame.to_le_bytes()),
        };
        if let Err(e) = self.send(&append).await {
            self.connection_lost(e.to_string()).await;
        }
    }
}

async fn next_message(connection: Option<&mut Box<dyn Connection>>) -> Result<Option<String>> {
    match connection {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(mic: Option<&mut mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match mic {
        Some(mic) => mic.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compiles only while the actor future can move between worker threads
    #[allow(dead_code)]
    fn actor_future_is_send(actor: SessionActor, commands: mpsc::Receiver<Command>) {
        fn is_send<T: Send>(_: &T) {}
        is_send(&actor.run(commands));
    }

    #[test]
    fn test_session_config_content() {
        let value = serde_json::to_value(ClientEvent::SessionUpdate {
            session: Box::new(SessionSettings::default().session_config()),
        })
        .unwrap();

        assert_eq!(value["type"], "session.update");
        let session = &value["session"];
        assert_eq!(session["modalities"], serde_json::json!(["text", "audio"]));
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["silence_duration_ms"], 1800);
        assert_eq!(session["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(session["max_response_output_tokens"], 200);
        assert_eq!(session["tool_choice"], "auto");
        assert_eq!(session["tools"].as_array().unwrap().len(), 5);
    }
}
