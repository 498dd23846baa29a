//! Visor - wake word gated realtime voice assistant
//!
//! This library provides the core functionality for the Visor assistant:
//! - Wake word gating on a dedicated listening thread
//! - A realtime speech-to-speech session over a duplex WebSocket
//! - Dispatch of model-initiated tool calls
//! - Exclusive microphone handoff between the two
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  DetectionEvent(lease)  ┌──────────────┐
//! │   WakeWordGate   │ ──────────────────────▶ │ Coordinator  │
//! │  (mic @ 16 kHz)  │ ◀────── resume(lease) ─ │  (Handoff)   │
//! └──────────────────┘                         └──────┬───────┘
//!                               activate(lease) │     ▲ Released(lease)
//!                                               ▼     │
//! ┌──────────────────┐    tool calls   ┌─────────────────────────┐
//! │  ToolDispatcher  │ ◀────────────── │    AssistantSession     │
//! │ search/telemetry │ ──────────────▶ │ (mic + speaker @ 24 kHz)│ ◀─▶ Realtime API
//! └──────────────────┘    results      └─────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use coordinator::{Coordinator, Handoff, MicHolder};
pub use error::{Error, Result};
pub use session::{AssistantSession, SessionEvent, SessionHandle, SessionSettings, SessionState};
pub use tools::{ToolCall, ToolDispatcher, ToolResult};
pub use voice::{DeviceLease, LeaseAuthority, WakeWordGate};
