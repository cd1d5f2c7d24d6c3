//! Gemini Live API protocol types
//!
//! This module defines the JSON messages exchanged with the Live API over
//! WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the `BidiGenerateContent` endpoint
//! 2. Send `setup` with model, voice and system instruction
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive model audio via `serverContent.modelTurn.parts[].inlineData`

use serde::{Deserialize, Serialize};

use super::transport::{InboundChunk, LiveConfig};
use crate::audio::WireAudioChunk;

/// Gemini Live API endpoint
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

// ============================================================================
// Client Messages (sent TO the Live API)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection
    Setup(SetupConfig),

    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Create the setup message for a voice session
    pub fn setup(config: &LiveConfig) -> Self {
        let system_instruction = if config.system_instruction.is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![TextPart {
                    text: config.system_instruction.clone(),
                }],
            })
        };

        Self::Setup(SetupConfig {
            model: model_resource(&config.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    /// Create a realtime input message carrying one PCM16 chunk
    pub fn audio(chunk: &WireAudioChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: chunk.mime_type.clone(),
                data: chunk.to_base64(),
            }],
        })
    }
}

/// Prefix a bare model name with `models/`
fn model_resource(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Base64 payload with its MIME type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

// ============================================================================
// Server Messages (received FROM the Live API)
// ============================================================================

/// Messages received from the Live API
///
/// Each message sets exactly one of the fields; unknown fields are ignored so
/// new server message kinds never fail deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,

    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,

    /// The model finished its turn
    #[serde(default)]
    pub turn_complete: bool,

    /// The user barged in; the model stopped generating
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub inline_data: Option<Blob>,

    #[serde(default)]
    pub text: Option<String>,
}

/// Server notice that the connection will close soon
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Error information from the API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<i64>,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub status: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Audio parts of this message, in order
    pub fn audio_chunks(&self) -> Vec<InboundChunk> {
        self.server_content
            .as_ref()
            .and_then(|content| content.model_turn.as_ref())
            .map(|turn| {
                turn.parts
                    .iter()
                    .filter_map(|part| part.inline_data.as_ref())
                    .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
                    .map(|blob| InboundChunk {
                        mime_type: blob.mime_type.clone(),
                        data: blob.data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.turn_complete)
            .unwrap_or(false)
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.interrupted)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;

    fn live_config() -> LiveConfig {
        LiveConfig {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: "Be brief.".to_string(),
            api_key: "test-key".to_string(),
        }
    }

    #[test]
    fn test_setup_serialization() {
        let msg = ClientMessage::setup(&live_config());
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        let setup = &json["setup"];
        assert_eq!(
            setup["model"],
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Zephyr"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
    }

    #[test]
    fn test_setup_omits_empty_instruction() {
        let mut config = live_config();
        config.system_instruction.clear();
        config.model = "models/custom".to_string();

        let json = serde_json::to_value(ClientMessage::setup(&config)).unwrap();
        assert!(json["setup"].get("systemInstruction").is_none());
        assert_eq!(json["setup"]["model"], "models/custom");
    }

    #[test]
    fn test_audio_serialization() {
        let chunk = codec::encode(&[0.5, -0.5]);
        let json = serde_json::to_value(ClientMessage::audio(&chunk)).unwrap();

        let media = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");

        let bytes = codec::unframe_base64(media["data"].as_str().unwrap()).unwrap();
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn test_setup_complete_deserialization() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.audio_chunks().is_empty());
    }

    #[test]
    fn test_server_audio_deserialization() {
        let json = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                        {"text": "thinking"},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQA="}}
                    ]
                }
            }
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let chunks = msg.audio_chunks();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, "AAA=");
        assert_eq!(chunks[1].data, "AQA=");
        assert_eq!(chunks[0].mime_type, "audio/pcm;rate=24000");
        assert!(!msg.is_turn_complete());
    }

    #[test]
    fn test_turn_flags() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        assert!(msg.is_turn_complete());
        assert!(!msg.is_interrupted());

        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert!(msg.is_interrupted());
    }

    #[test]
    fn test_unknown_message_kind() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"toolCall": {"functionCalls": []}}"#).unwrap();

        assert!(!msg.is_setup_complete());
        assert!(msg.server_content.is_none());
        assert!(msg.audio_chunks().is_empty());
    }

    #[test]
    fn test_go_away_deserialization() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(msg.go_away.unwrap().time_left.as_deref(), Some("10s"));
    }
}
