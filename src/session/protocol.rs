//! Realtime protocol message types
//!
//! Outbound [`ClientEvent`]s and inbound [`ServerEvent`]s are JSON objects
//! tagged by their `type` field. Unknown inbound types deserialize to
//! [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-side voice activity detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    /// Always `server_vad`
    #[serde(rename = "type")]
    pub kind: String,
    /// Speech probability threshold (0.0-1.0)
    pub threshold: f32,
    /// Audio kept before detected speech start
    pub prefix_padding_ms: u32,
    /// Silence that ends a user turn
    pub silence_duration_ms: u32,
}

/// Input transcription settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTranscription {
    /// Transcription model
    pub model: String,
}

/// Payload of `session.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputTranscription,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
    /// Function tool descriptors
    pub tools: Vec<Value>,
    pub tool_choice: String,
}

/// Options for `response.create`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Content part of a user message item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

/// Conversation item created by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    /// Text-injected user turn
    Message {
        role: String,
        content: Vec<ContentPart>,
    },
    /// Result of a tool call
    FunctionCallOutput { call_id: String, output: String },
}

/// Messages sent to the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: Box<SessionConfig> },

    /// Base64 PCM16 at the protocol rate
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },
}

impl ClientEvent {
    /// Relay a tool result
    #[must_use]
    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    /// Inject a user text turn
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user".to_string(),
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    /// Ask the remote to continue the turn
    #[must_use]
    pub const fn continue_response() -> Self {
        Self::ResponseCreate { response: None }
    }

    /// Ask for a spoken response following `instructions`
    #[must_use]
    pub fn spoken_response(instructions: impl Into<String>) -> Self {
        Self::ResponseCreate {
            response: Some(ResponseOptions {
                modalities: Some(spoken_modalities()),
                instructions: Some(instructions.into()),
            }),
        }
    }

    /// Ask for a spoken answer to the conversation so far
    #[must_use]
    pub fn spoken_reply() -> Self {
        Self::ResponseCreate {
            response: Some(ResponseOptions {
                modalities: Some(spoken_modalities()),
                instructions: None,
            }),
        }
    }

    /// Message type, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioAppend { .. } => "input_audio_buffer.append",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate { .. } => "response.create",
        }
    }
}

fn spoken_modalities() -> Vec<String> {
    vec!["text".to_string(), "audio".to_string()]
}

/// Response identity carried by `response.created` and `response.done`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
}

/// Error payload reported by the remote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Messages received from the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    /// Base64 PCM16 at the protocol rate
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { transcript: String },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one inbound text message
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Protocol`] if the message is not a valid event
    pub fn parse(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::Protocol(e.to_string()))
    }
}
