//! Session state machine
//!
//! Transitions are a pure function of `(state, trigger)`. The session actor
//! performs the returned effects in order; an effect that yields a follow-up
//! trigger ends its batch.

use std::fmt;

/// Lifecycle of the assistant session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No device, no connection
    #[default]
    Idle,
    /// Devices open, connecting (or reconnecting) to the remote service
    Connecting,
    /// Connected, waiting for the configuration to be acknowledged
    Configuring,
    /// Microphone audio is forwarded
    Listening,
    /// Remote audio is playing; microphone audio is discarded
    Speaking,
    /// Input released, flushing the closing utterance before teardown
    Deactivating,
}

impl SessionState {
    /// Whether captured microphone audio may be sent to the remote service
    #[must_use]
    pub const fn accepts_input(self) -> bool {
        matches!(self, Self::Listening)
    }

    /// Whether the session is in a conversation (listening or speaking)
    #[must_use]
    pub const fn is_conversing(self) -> bool {
        matches!(self, Self::Listening | Self::Speaking)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Configuring => "configuring",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Deactivating => "deactivating",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Coordinator handed over the device lease
    Activate,
    /// Audio devices could not be opened
    DeviceFailed,
    /// Socket open
    Connected,
    /// Configuration acknowledged (explicitly or by timeout)
    Configured {
        /// Whether to request the greeting turn
        greet: bool,
    },
    /// Remote audio arrived
    AudioDelta,
    /// Remote finished a response
    ResponseDone {
        /// Whether it was the dismissal acknowledgement
        closing: bool,
    },
    /// A dismissal phrase was heard
    Dismissed,
    /// Explicit stop
    Deactivate,
    /// Closing utterance did not finish in time
    FlushTimeout,
    /// Connection and output are gone
    TornDown,
    /// Socket closed or a connect attempt failed
    ConnectionLost,
    /// Backoff delay elapsed
    RetryDue,
    /// Reconnect attempts used up
    RetriesExhausted,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Open capture and playback under the pending lease
    OpenAudio,
    /// Open the duplex connection
    Connect,
    /// Send `session.update`
    SendSessionUpdate,
    /// Ask for the short greeting utterance
    RequestGreeting,
    /// Stop capture and hand the lease back to the coordinator
    ReleaseInput,
    /// Ask the remote to speak the dismissal acknowledgement
    SendAcknowledgement,
    /// Start the flush deadline for the closing utterance
    ArmFlushTimer,
    /// Close the socket and the output stream
    Teardown,
    /// Wait out the next backoff delay (or give up)
    ScheduleReconnect,
    /// Report that the assistant is unavailable
    ReportUnavailable,
}

/// Compute the next state and the effects to perform
///
/// Triggers that make no sense in the current state leave it unchanged and
/// produce no effects.
#[must_use]
pub fn transition(state: SessionState, trigger: Trigger) -> (SessionState, Vec<Effect>) {
    use Effect as E;
    use SessionState as S;
    use Trigger as T;

    match (state, trigger) {
        (S::Idle, T::Activate) => (S::Connecting, vec![E::OpenAudio, E::Connect]),

        (S::Connecting, T::Connected) => (S::Configuring, vec![E::SendSessionUpdate]),
        (S::Connecting, T::RetryDue) => (S::Connecting, vec![E::Connect]),
        (S::Connecting, T::DeviceFailed | T::RetriesExhausted) => (
            S::Deactivating,
            vec![E::ReleaseInput, E::ReportUnavailable, E::Teardown],
        ),

        (S::Configuring, T::Configured { greet: true }) => (S::Listening, vec![E::RequestGreeting]),
        (S::Configuring, T::Configured { greet: false }) => (S::Listening, vec![]),

        (S::Listening | S::Speaking, T::AudioDelta) => (S::Speaking, vec![]),
        (S::Speaking, T::ResponseDone { .. }) => (S::Listening, vec![]),

        (S::Listening | S::Speaking, T::Dismissed) => (
            S::Deactivating,
            vec![E::ReleaseInput, E::SendAcknowledgement, E::ArmFlushTimer],
        ),

        (S::Connecting | S::Configuring | S::Listening | S::Speaking, T::Deactivate) => {
            (S::Deactivating, vec![E::ReleaseInput, E::Teardown])
        }

        (S::Configuring | S::Listening | S::Speaking | S::Connecting, T::ConnectionLost) => {
            (S::Connecting, vec![E::ScheduleReconnect])
        }

        (
            S::Deactivating,
            T::ResponseDone { closing: true } | T::FlushTimeout | T::Deactivate | T::ConnectionLost,
        ) => (S::Deactivating, vec![E::Teardown]),
        (S::Deactivating, T::TornDown) => (S::Idle, vec![]),

        (state, _) => (state, vec![]),
    }
}
