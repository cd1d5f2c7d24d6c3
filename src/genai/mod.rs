//! Request/response clients for the Gemini REST API
//!
//! Text chat and image-to-video generation. Both share one HTTP client and
//! one error type; the live call does not use this module.

mod chat;
mod video;

pub use chat::{chat_model, send_message, ChatMessage, ChatRole, ChatTurn, Conversation};
pub use video::{generate_video, sniff_image_mime, AspectRatio, VideoRequest};

use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

/// REST endpoint prefix
pub(crate) const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

pub(crate) fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Errors from the chat and video clients
#[derive(Debug)]
pub enum GenAiError {
    /// Gemini API key not configured
    MissingApiKey,
    /// Network/HTTP error
    NetworkError(String),
    /// The API returned an error
    ApiError { status: u16, message: String },
    /// Failed to parse API response
    ParseError(String),
    /// Video operation finished without a video
    NoVideo,
}

impl std::fmt::Display for GenAiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenAiError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            GenAiError::NetworkError(e) => write!(f, "Network error: {}", e),
            GenAiError::ApiError { status, message } => {
                write!(f, "Gemini API error ({}): {}", status, message)
            }
            GenAiError::ParseError(e) => write!(f, "Failed to parse API response: {}", e),
            GenAiError::NoVideo => write!(f, "Video generation failed or returned no URI."),
        }
    }
}

impl std::error::Error for GenAiError {}

/// Gemini API error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Turn a non-success response into `GenAiError::ApiError`.
pub(crate) async fn api_error(response: reqwest::Response) -> GenAiError {
    let status = response.status().as_u16();
    let error_text = response.text().await.unwrap_or_default();
    let message = error_message(&error_text);

    log::error!("Gemini API error ({}): {}", status, message);
    GenAiError::ApiError { status, message }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(error_response) => error_response.error.message,
        Err(_) => body.to_string(),
    }
}
