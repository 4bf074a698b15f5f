//! Realtime Voice Conversation Client
//!
//! This library contains everything needed to hold a live spoken
//! conversation with a hosted conversational agent: broker signaling,
//! the WebSocket wire protocol, the PCM16 audio codec, ordered playback,
//! and the session state machine that ties them together. Hosts plug in
//! platform audio through the traits in [`capture`] and [`playback`] and
//! drive everything through [`session::VoiceSession`].

pub mod capture;
pub mod codec;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod signaling;
