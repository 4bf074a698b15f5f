//! Error taxonomy for the realtime voice client.

use std::time::Duration;

/// Errors surfaced by the voice session and its collaborators.
///
/// Session-fatal variants (`PermissionDenied`, `Authorization`,
/// `InvalidEndpoint`, `ConnectionTimeout`, `Connection`, `AbnormalClose`)
/// always leave the session stopped; a fresh `start_conversation` is valid
/// afterwards. `MalformedAudio` is recovered locally by skipping the one bad
/// item and never reaches the host's error callback.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// `start_conversation` was called while a session was already running.
    #[error("a conversation is already active; stop it first")]
    AlreadyActive,

    /// Microphone access was refused or the capture device is unavailable.
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    /// The signaling broker refused, timed out, or returned an unusable body.
    #[error("session authorization failed: {0}")]
    Authorization(String),

    /// The broker handed back a URL outside the trusted endpoint prefix.
    #[error("untrusted voice endpoint: {0}")]
    InvalidEndpoint(String),

    /// The socket did not reach the active state within the allowed window.
    #[error("connection did not become active within {0:?}")]
    ConnectionTimeout(Duration),

    /// Connection establishment failed before the handshake completed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The socket closed unexpectedly while the session was active. `reason`
    /// carries the mapped close-code description plus any server-sent text.
    #[error("connection closed abnormally: code {code} ({reason})")]
    AbnormalClose { code: u16, reason: String },

    /// An inbound audio payload could not be decoded.
    #[error("malformed audio payload: {0}")]
    MalformedAudio(String),
}

impl VoiceError {
    /// Builds an `AbnormalClose` whose reason starts with the human-readable
    /// description of `code`.
    pub fn abnormal_close(code: u16, server_reason: &str) -> Self {
        let reason = if server_reason.is_empty() {
            describe_close_code(code).to_string()
        } else {
            format!("{}: {}", describe_close_code(code), server_reason)
        };
        VoiceError::AbnormalClose { code, reason }
    }
}

/// Maps well-known WebSocket close codes to a human-readable description.
pub fn describe_close_code(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        1001 => "Going away",
        1002 => "Protocol error",
        1003 => "Unsupported data",
        1005 => "No status received",
        1006 => "Abnormal closure",
        1007 => "Invalid frame payload data",
        1008 => "Policy violation",
        1009 => "Message too big",
        1010 => "Mandatory extension missing",
        1011 => "Internal server error",
        1015 => "TLS handshake failure",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_descriptions() {
        assert_eq!(describe_close_code(1000), "Normal closure");
        assert_eq!(describe_close_code(1006), "Abnormal closure");
        assert_eq!(describe_close_code(1011), "Internal server error");
        assert_eq!(describe_close_code(4999), "Unknown");
    }

    #[test]
    fn test_abnormal_close_display_includes_code_and_description() {
        let err = VoiceError::abnormal_close(1006, "");
        let rendered = format!("{}", err);
        assert!(rendered.contains("1006"));
        assert!(rendered.contains("Abnormal closure"));
    }

    #[test]
    fn test_abnormal_close_keeps_server_reason() {
        let err = VoiceError::abnormal_close(1011, "backend restarting");
        let rendered = format!("{}", err);
        assert!(rendered.contains("Internal server error"));
        assert!(rendered.contains("backend restarting"));
    }

    #[test]
    fn test_unknown_close_code_renders_unknown() {
        let err = VoiceError::abnormal_close(4321, "");
        assert!(format!("{}", err).contains("Unknown"));
    }
}
