//! Streaming session for live calls
//!
//! This module provides the transport seam the call core talks to and a
//! WebSocket implementation against the Gemini Live API.
//!
//! # Architecture
//!
//! ```text
//! InputPipeline ──▶ writer task ──▶ TransportSession::send ──▶ WebSocket
//!                                                                  │
//! OutputPipeline ◀── reader task ◀── TransportEvent channel ◀──────┘
//! ```
//!
//! # Failure Strategy
//!
//! - No retry on open: a failed open fails the call
//! - A mid-call error or remote close ends the call; a new call starts a
//!   new session

mod live_client;
mod protocol;
mod transport;

pub use live_client::{get_api_key, GeminiLiveTransport, LiveSession};
pub use protocol::{ClientMessage, ServerMessage, LIVE_API_URL};
pub use transport::{
    InboundChunk, LiveConfig, Transport, TransportEvent, TransportEvents, TransportSession,
};
