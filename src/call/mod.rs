//! Live voice call core
//!
//! Wires microphone capture to the streaming session and streamed replies
//! back to the speaker.
//!
//! # Architecture
//!
//! ```text
//! Capture Thread (interrupt)         Tokio Runtime (async)
//! ┌──────────────────────┐           ┌──────────────────────────┐
//! │ InputPipeline        │           │ writer task              │
//! │   ├─ meter (always)  │──queue──▶ │   └─ TransportSession    │
//! │   ├─ mute gate       │           │        .send()           │
//! │   └─ encode PCM16    │           │                          │
//! └──────────────────────┘           │ reader task              │
//!                                    │   └─ OutputPipeline      │
//!                                    │        ├─ decode         │
//!                                    │        └─ OutputScheduler│
//!                                    └──────────────────────────┘
//! ```
//!
//! `CallSession` owns every resource for exactly one call and releases them
//! in reverse acquisition order, whichever way the call ends.

mod input;
mod output;
mod scheduler;
mod session;

pub use input::InputPipeline;
pub use output::OutputPipeline;
pub use scheduler::{OutputScheduler, PlaybackCursor};
pub use session::{CallConfig, CallSession};

/// Errors that can occur during a live call
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Microphone permission refused or no capture device present
    DeviceAccessDenied(String),
    /// Streaming session could not be opened
    TransportOpenFailed(String),
    /// Streaming session failed after it was open
    TransportRuntimeError(String),
    /// Inbound audio chunk could not be decoded
    MalformedAudio(String),
    /// API key not configured
    MissingApiKey,
    /// Non-fatal device failure (render or release)
    DeviceError(String),
    /// The call was hung up before setup finished
    Cancelled,
}

impl CallError {
    /// Whether this error ends the call.
    ///
    /// Malformed chunks are dropped and device hiccups are logged; everything
    /// else moves the session to `Failed`.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CallError::MalformedAudio(_) | CallError::DeviceError(_)
        )
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::DeviceAccessDenied(e) => {
                write!(f, "Microphone access denied: {}", e)
            }
            CallError::TransportOpenFailed(e) => {
                write!(f, "Failed to connect to the live session: {}", e)
            }
            CallError::TransportRuntimeError(e) => write!(f, "Connection error: {}", e),
            CallError::MalformedAudio(e) => write!(f, "Malformed audio chunk: {}", e),
            CallError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            CallError::DeviceError(e) => write!(f, "Audio device error: {}", e),
            CallError::Cancelled => write!(f, "Call ended during setup"),
        }
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_display() {
        let err = CallError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = CallError::DeviceAccessDenied("permission refused".to_string());
        assert!(err.to_string().contains("permission refused"));

        let err = CallError::TransportOpenFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_malformed_audio_is_recoverable() {
        assert!(!CallError::MalformedAudio("odd length".into()).is_fatal());
        assert!(!CallError::DeviceError("underrun".into()).is_fatal());
        assert!(CallError::TransportRuntimeError("reset".into()).is_fatal());
        assert!(CallError::DeviceAccessDenied("no".into()).is_fatal());
    }
}
