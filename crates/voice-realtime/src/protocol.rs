//! Wire protocol between this client and the conversational-voice service.
//!
//! Every message is a single JSON object in a WebSocket text frame. Inbound
//! messages are discriminated by a `type` tag; the one untagged outbound
//! shape is the audio chunk, which the service identifies by its single
//! field.

use serde::{Deserialize, Serialize};

/// Tagged messages sent from the client to the voice service.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The session handshake. The service treats the conversation as
    /// not-ready until this arrives.
    ConversationInitiationClientData {
        conversation_config_override: ConversationConfigOverride,
        dynamic_variables: DynamicVariables,
    },
    /// Best-effort informational update injected into the conversation.
    ContextualUpdate { text: String },
    /// Keepalive reply; `event_id` is echoed opaquely from the ping.
    Pong { event_id: serde_json::Value },
}

/// One block of captured microphone audio, PCM16 base64.
#[derive(Serialize, Debug)]
pub struct UserAudioChunk {
    pub user_audio_chunk: String,
}

#[derive(Serialize, Debug, Default)]
pub struct ConversationConfigOverride {
    pub agent: AgentOverride,
}

/// Optional per-session overrides for the agent's opening behavior.
#[derive(Serialize, Debug, Default)]
pub struct AgentOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Date/time context threaded into the agent's prompt at handshake time.
#[derive(Serialize, Debug)]
pub struct DynamicVariables {
    pub current_date: String,
    pub current_time: String,
    pub current_day: String,
    pub user_name: String,
}

/// Tagged messages received from the voice service.
///
/// Variants the dispatcher does not know stay forward-compatible: they fail
/// to parse and are logged and ignored by the session.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Informational; carries conversation ids we do not act on.
    ConversationInitiationMetadata {
        #[serde(default)]
        conversation_initiation_metadata_event: Option<serde_json::Value>,
    },
    /// Final transcription of what the user said.
    UserTranscript {
        user_transcription_event: UserTranscriptionEvent,
    },
    /// The agent's textual reply (the spoken audio arrives separately).
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    /// A chunk of synthesized agent speech.
    Audio { audio_event: AudioEvent },
    /// Keepalive; the client must answer with a pong after `ping_ms`.
    Ping { ping_event: PingEvent },
    /// The user barged in; all queued agent speech must stop now.
    Interruption {
        #[serde(default)]
        interruption_event: Option<serde_json::Value>,
    },
    /// Voice-activity score, informational only.
    VadScore { vad_score_event: VadScoreEvent },
}

#[derive(Deserialize, Debug)]
pub struct UserTranscriptionEvent {
    pub user_transcript: String,
}

#[derive(Deserialize, Debug)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Deserialize, Debug)]
pub struct AudioEvent {
    #[serde(default)]
    pub audio_base_64: Option<String>,
    #[serde(default)]
    pub event_id: serde_json::Value,
}

#[derive(Deserialize, Debug)]
pub struct PingEvent {
    pub event_id: serde_json::Value,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct VadScoreEvent {
    pub vad_score: f64,
}
