//! Microphone handoff between the wake word gate and the assistant session
//!
//! Exactly one side holds the [`DeviceLease`] at a time. The gate gives it up
//! inside a [`DetectionEvent`], the coordinator passes it to the session, and
//! the session hands it back in [`SessionEvent::Released`] when the
//! conversation ends. [`Handoff`] tracks which side should be holding it so
//! that an out-of-order event is caught instead of acted on.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::session::{SessionEvent, SessionHandle};
use crate::voice::{
    AudioBackend, DetectionEvent, DeviceLease, GateEvent, GateSettings, KeywordScorer,
    LeaseAuthority, WakeWordGate,
};
use crate::{Error, Result};

/// Builds a fresh scorer each time the gate is (re)started
pub type ScorerFactory = Box<dyn Fn() -> Box<dyn KeywordScorer> + Send + Sync>;

/// Side expected to hold the microphone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MicHolder {
    /// Wake word gate is listening (or about to)
    #[default]
    Gate,
    /// Assistant session owns the device
    Session,
}

/// Pure tracker of microphone ownership
#[derive(Debug, Default)]
pub struct Handoff {
    holder: MicHolder,
    handoffs: u64,
}

impl Handoff {
    /// Tracker with the gate holding the microphone
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder
    #[must_use]
    pub const fn holder(&self) -> MicHolder {
        self.holder
    }

    /// Completed gate-to-session handoffs
    #[must_use]
    pub const fn handoffs(&self) -> u64 {
        self.handoffs
    }

    /// Record a detection handing the device to the session
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handoff`] if the session already holds it
    pub fn to_session(&mut self) -> Result<()> {
        if self.holder != MicHolder::Gate {
            return Err(Error::Handoff(
                "detection while the session holds the microphone".to_string(),
            ));
        }
        self.holder = MicHolder::Session;
        self.handoffs += 1;
        Ok(())
    }

    /// Record the session giving the device back
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handoff`] if the gate already holds it
    pub fn to_gate(&mut self) -> Result<()> {
        if self.holder != MicHolder::Session {
            return Err(Error::Handoff(
                "release while the gate holds the microphone".to_string(),
            ));
        }
        self.holder = MicHolder::Gate;
        Ok(())
    }

    /// Force the gate as holder after a reset
    pub fn reset(&mut self) {
        self.holder = MicHolder::Gate;
    }
}

/// Runs the wake word gate and routes the device lease to and from the session
pub struct Coordinator {
    authority: LeaseAuthority,
    settings: GateSettings,
    backend: Arc<dyn AudioBackend>,
    scorers: ScorerFactory,
    session: SessionHandle,
    session_events: mpsc::Receiver<SessionEvent>,
    gate_tx: mpsc::Sender<GateEvent>,
    gate_events: mpsc::Receiver<GateEvent>,
    gate: Option<WakeWordGate>,
    handoff: Handoff,
}

impl Coordinator {
    /// Create a coordinator; nothing runs until [`Coordinator::run`]
    #[must_use]
    pub fn new(
        settings: GateSettings,
        backend: Arc<dyn AudioBackend>,
        scorers: ScorerFactory,
        session: SessionHandle,
        session_events: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        let (gate_tx, gate_events) = mpsc::channel(4);
        Self {
            authority: LeaseAuthority::new(),
            settings,
            backend,
            scorers,
            session,
            session_events,
            gate_tx,
            gate_events,
            gate: None,
            handoff: Handoff::new(),
        }
    }

    /// Authority minting the microphone lease
    #[must_use]
    pub const fn authority(&self) -> &LeaseAuthority {
        &self.authority
    }

    /// Listen for the wake word and hand off until `shutdown` completes
    ///
    /// # Errors
    ///
    /// Returns error if the gate cannot open the microphone or the session
    /// exits unexpectedly
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let lease = self
            .authority
            .acquire()
            .ok_or_else(|| Error::Handoff("microphone lease already outstanding".to_string()))?;
        self.start_gate(lease)?;
        tracing::info!("listening for wake word");

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                Some(event) = self.gate_events.recv() => {
                    let handled = match event {
                        GateEvent::Detected(detection) => self.on_detection(detection).await,
                        GateEvent::Failed { error, lease } => {
                            drop(lease);
                            tracing::error!(error = %error, "wake word gate could not open the microphone");
                            Err(error)
                        }
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
                Some(event) = self.session_events.recv() => {
                    let handled = match event {
                        SessionEvent::Released(lease) => self.on_released(lease).await,
                        SessionEvent::Unavailable { reason } => self.on_unavailable(&reason).await,
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
            }
        };

        self.session.shutdown().await;
        // Drain releases so the lease is not left in the channel
        while let Ok(event) = self.session_events.try_recv() {
            tracing::debug!(?event, "session event after shutdown");
        }
        if let Some(gate) = self.gate.take() {
            let _ = tokio::task::spawn_blocking(move || gate.stop()).await;
        }
        outcome
    }

    fn start_gate(&mut self, lease: DeviceLease) -> Result<()> {
        let gate = WakeWordGate::start(
            self.settings.clone(),
            Arc::clone(&self.backend),
            (self.scorers)(),
            lease,
            self.gate_tx.clone(),
        )?;
        self.gate = Some(gate);
        Ok(())
    }

    /// Stop the gate and start a new one, reclaiming the lease if needed
    async fn reset_gate(&mut self, lease: Option<DeviceLease>) -> Result<()> {
        tracing::warn!("resetting wake word gate");
        let returned = match self.gate.take() {
            Some(gate) => tokio::task::spawn_blocking(move || gate.stop())
                .await
                .ok()
                .flatten(),
            None => None,
        };

        let lease = lease
            .or(returned)
            .or_else(|| self.authority.acquire())
            .ok_or_else(|| Error::Handoff("microphone lease could not be reclaimed".to_string()))?;
        self.handoff.reset();
        self.start_gate(lease)
    }

    async fn on_detection(&mut self, detection: DetectionEvent) -> Result<()> {
        tracing::info!(
            keyword = %detection.keyword,
            score = detection.score,
            at = %detection.timestamp,
            "wake word detected"
        );

        if let Err(e) = self.handoff.to_session() {
            tracing::error!(error = %e, "handoff invariant violated");
            return self.reset_gate(Some(detection.into_lease())).await;
        }

        match self.session.activate(detection.into_lease()).await {
            Ok(()) => Ok(()),
            Err(lease) => {
                self.handoff.reset();
                drop(lease);
                Err(Error::Handoff("assistant session exited".to_string()))
            }
        }
    }

    async fn on_released(&mut self, lease: DeviceLease) -> Result<()> {
        if let Err(e) = self.handoff.to_gate() {
            tracing::error!(error = %e, "handoff invariant violated");
            return self.reset_gate(Some(lease)).await;
        }
        self.resume_gate(lease).await
    }

    async fn on_unavailable(&mut self, reason: &str) -> Result<()> {
        tracing::warn!(reason, "assistant unavailable");
        if self.handoff.holder() != MicHolder::Session {
            return Ok(());
        }

        match self.authority.acquire() {
            // The lease died with the session's capture thread
            Some(lease) => {
                self.handoff.reset();
                self.resume_gate(lease).await
            }
            // Capture is still stopping; its release resumes the gate
            None => {
                tracing::warn!("session still holds the microphone, waiting for its release");
                Ok(())
            }
        }
    }

    async fn resume_gate(&mut self, lease: DeviceLease) -> Result<()> {
        let resumed = match self.gate.as_ref() {
            Some(gate) => gate.resume(lease),
            None => return self.reset_gate(Some(lease)).await,
        };
        match resumed {
            Ok(()) => {
                tracing::info!("listening for wake word");
                Ok(())
            }
            Err(e) if e.is_invariant_violation() => {
                tracing::error!(error = %e, "wake word gate did not accept the lease");
                self.reset_gate(None).await
            }
            Err(e) => Err(e),
        }
    }
}
