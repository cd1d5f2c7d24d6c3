//! Streaming session seam
//!
//! The call core opens one transport session per call, pushes outbound audio
//! through it and consumes inbound events from a channel in arrival order.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::WireAudioChunk;
use crate::call::CallError;

/// Session parameters. Opaque to the call core.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub api_key: String,
}

/// Base64-framed audio received from the remote side
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChunk {
    pub mime_type: String,
    pub data: String,
}

/// Events delivered by an open transport session, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Model audio
    Audio(InboundChunk),
    /// The model finished its turn
    TurnComplete,
    /// The user barged in on the model
    Interrupted,
    /// The connection failed
    Error(String),
    /// The remote side closed the connection
    Closed(Option<String>),
}

/// Receiver for inbound transport events
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Factory for streaming sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session. Resolves once the remote side reports the session open.
    async fn open(
        &self,
        config: &LiveConfig,
    ) -> Result<(Box<dyn TransportSession>, TransportEvents), CallError>;
}

/// One open streaming session
#[async_trait]
pub trait TransportSession: Send {
    /// Send one outbound audio chunk.
    async fn send(&mut self, chunk: WireAudioChunk) -> Result<(), CallError>;

    /// Close the session. Called once, as the last teardown step.
    async fn close(&mut self) -> Result<(), CallError>;
}
