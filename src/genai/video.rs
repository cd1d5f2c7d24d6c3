//! Image-to-video generation via a long-running prediction
//!
//! Submit the image, poll the operation until it is done, then return the
//! download URI of the first generated video.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{api_error, get_http_client, GenAiError, API_BASE};
use crate::settings::AppSettings;

/// Prompt used when the user gives none
pub const DEFAULT_PROMPT: &str = "Animate this image";

const RESOLUTION: &str = "720p";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[default]
    Landscape,
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
        }
    }
}

/// One animation job
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    /// Base64 image bytes, no data-URL prefix
    pub image_base64: String,
    pub mime_type: String,
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

pub fn build_request(request: &VideoRequest) -> Value {
    let prompt = if request.prompt.trim().is_empty() {
        DEFAULT_PROMPT
    } else {
        request.prompt.as_str()
    };

    json!({
        "instances": [{
            "prompt": prompt,
            "image": {
                "bytesBase64Encoded": request.image_base64,
                "mimeType": request.mime_type,
            }
        }],
        "parameters": {
            "aspectRatio": request.aspect_ratio.as_str(),
            "resolution": RESOLUTION,
            "sampleCount": 1,
        }
    })
}

/// URI of the first generated video in a finished operation response
fn video_uri(response: &Value) -> Option<&str> {
    response
        .pointer("/generateVideoResponse/generatedSamples/0/video/uri")
        .or_else(|| response.pointer("/generatedVideos/0/video/uri"))
        .and_then(Value::as_str)
        .filter(|uri| !uri.is_empty())
}

/// Append the API key so the URI can be downloaded directly.
pub fn with_key(uri: &str, api_key: &str) -> String {
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{}{}key={}", uri, separator, api_key)
}

/// Guess an image MIME type from its magic bytes.
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/png",
    }
}

/// Animate an image. Polls until the operation finishes.
pub async fn generate_video(
    api_key: &str,
    request: &VideoRequest,
    settings: &AppSettings,
) -> Result<String, GenAiError> {
    if api_key.is_empty() {
        return Err(GenAiError::MissingApiKey);
    }

    let client = get_http_client();
    log::info!(
        "Submitting video generation ({}, {}) to {}",
        request.aspect_ratio.as_str(),
        request.mime_type,
        settings.video_model
    );

    let response = client
        .post(format!(
            "{}/models/{}:predictLongRunning",
            API_BASE, settings.video_model
        ))
        .header("x-goog-api-key", api_key)
        .json(&build_request(request))
        .send()
        .await
        .map_err(|e| GenAiError::NetworkError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let mut operation: Operation = response
        .json()
        .await
        .map_err(|e| GenAiError::ParseError(e.to_string()))?;

    let interval = Duration::from_secs(settings.video_poll_interval_secs.max(1));
    let mut polls = 0u32;

    while !operation.done {
        tokio::time::sleep(interval).await;
        polls += 1;
        log::debug!("Polling video operation {} (poll {})", operation.name, polls);

        let response = client
            .get(format!("{}/{}", API_BASE, operation.name))
            .header("x-goog-api-key", api_key)
            .send()
            .await
            .map_err(|e| GenAiError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        operation = response
            .json()
            .await
            .map_err(|e| GenAiError::ParseError(e.to_string()))?;
    }

    if let Some(error) = operation.error {
        return Err(GenAiError::ApiError {
            status: error.code.unwrap_or(500),
            message: error.message,
        });
    }

    let uri = operation
        .response
        .as_ref()
        .and_then(video_uri)
        .ok_or(GenAiError::NoVideo)?;

    log::info!("Video ready after {} polls", polls);
    Ok(with_key(uri, api_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> VideoRequest {
        VideoRequest {
            prompt: prompt.to_string(),
            image_base64: "iVBORw0KGgo=".to_string(),
            mime_type: "image/png".to_string(),
            aspect_ratio: AspectRatio::Portrait,
        }
    }

    #[test]
    fn test_request_shape() {
        let body = build_request(&request("Make it rain"));

        assert_eq!(body["instances"][0]["prompt"], "Make it rain");
        assert_eq!(
            body["instances"][0]["image"]["bytesBase64Encoded"],
            "iVBORw0KGgo="
        );
        assert_eq!(body["parameters"]["aspectRatio"], "9:16");
        assert_eq!(body["parameters"]["resolution"], "720p");
        assert_eq!(body["parameters"]["sampleCount"], 1);
    }

    #[test]
    fn test_blank_prompt_uses_default() {
        let body = build_request(&request("  "));
        assert_eq!(body["instances"][0]["prompt"], DEFAULT_PROMPT);
    }

    #[test]
    fn test_video_uri_extraction() {
        let response = json!({
            "generateVideoResponse": {
                "generatedSamples": [{"video": {"uri": "https://example.test/v.mp4?alt=media"}}]
            }
        });
        assert_eq!(
            video_uri(&response),
            Some("https://example.test/v.mp4?alt=media")
        );
        assert_eq!(video_uri(&json!({"generateVideoResponse": {}})), None);
    }

    #[test]
    fn test_with_key() {
        assert_eq!(
            with_key("https://x.test/v?alt=media", "k1"),
            "https://x.test/v?alt=media&key=k1"
        );
        assert_eq!(with_key("https://x.test/v", "k1"), "https://x.test/v?key=k1");
    }

    #[test]
    fn test_operation_parse() {
        let op: Operation = serde_json::from_str(r#"{"name": "models/veo/operations/abc"}"#).unwrap();
        assert!(!op.done);
        assert_eq!(op.name, "models/veo/operations/abc");
    }

    #[test]
    fn test_sniff_image_mime() {
        assert_eq!(sniff_image_mime(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_image_mime(b"RIFF\x00\x00\x00\x00WEBPVP8"), "image/webp");
        assert_eq!(sniff_image_mime(b"??"), "image/png");
    }

    #[tokio::test]
    async fn test_empty_api_key_is_rejected() {
        let result = generate_video("", &request(""), &AppSettings::default()).await;
        assert!(matches!(result, Err(GenAiError::MissingApiKey)));
    }
}
