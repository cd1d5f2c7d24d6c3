pub mod audio;
pub mod call;
pub mod genai;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

use state_machine::CallState;

/// Call status shown to the user.
/// Uses tagged union format: { "status": "idle" } or { "status": "active", "elapsedSecs": 5 }
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Active {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Ending,
    Ended,
    Failed {
        message: String,
    },
}

/// Observable view of a call, published on every state change
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_id: Option<Uuid>,
    #[serde(flatten)]
    pub status: CallStatus,
    pub muted: bool,
    pub volume_level: f32,
    pub error: Option<String>,
    pub next_playback_time: f64,
    pub chunks_sent: u64,
    pub chunks_scheduled: u64,
}

/// Convert internal CallState to CallStatus for the UI
pub fn status_of(state: &CallState) -> CallStatus {
    match state {
        CallState::Idle => CallStatus::Idle,
        CallState::Connecting { .. } => CallStatus::Connecting,
        CallState::Active { started_at, .. } => CallStatus::Active {
            elapsed_secs: started_at.elapsed().as_secs(),
        },
        CallState::Ending { .. } => CallStatus::Ending,
        CallState::Ended { .. } => CallStatus::Ended,
        CallState::Failed { error, .. } => CallStatus::Failed {
            message: error.to_string(),
        },
    }
}

/// Initialise `env_logger` with a timestamped format.
///
/// Defaults to `info`; `RUST_LOG` overrides. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] [{}] - {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallError;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(CallStatus::Active { elapsed_secs: 5 }).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["elapsedSecs"], 5);

        let json = serde_json::to_value(CallStatus::Idle).unwrap();
        assert_eq!(json["status"], "idle");
    }

    #[test]
    fn test_snapshot_flattens_status() {
        let snapshot = CallSnapshot {
            status: CallStatus::Failed {
                message: "no mic".to_string(),
            },
            muted: true,
            ..CallSnapshot::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["message"], "no mic");
        assert_eq!(json["muted"], true);
        assert_eq!(json["nextPlaybackTime"], 0.0);
    }

    #[test]
    fn test_status_of_failed_carries_message() {
        let state = CallState::Failed {
            call_id: Uuid::new_v4(),
            error: CallError::DeviceAccessDenied("refused".to_string()),
        };
        match status_of(&state) {
            CallStatus::Failed { message } => assert!(message.contains("refused")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
