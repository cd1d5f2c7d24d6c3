//! PCM16 sample codec and base64 framing
//!
//! Outbound audio is 16 kHz PCM16 little-endian; inbound audio is 24 kHz
//! PCM16 little-endian. Both travel base64-encoded inside JSON messages.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::device::PlaybackBuffer;
use crate::call::CallError;

/// Sample rate of audio sent to the live session
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio received from the live session
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// MIME tag attached to outbound chunks
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

const PCM16_SCALE: f32 = 32768.0;

/// Encoded PCM16 audio plus the MIME tag describing it
#[derive(Debug, Clone, PartialEq)]
pub struct WireAudioChunk {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl WireAudioChunk {
    /// Base64 form used inside JSON envelopes
    pub fn to_base64(&self) -> String {
        frame_base64(&self.data)
    }

    /// Number of PCM16 samples carried
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }
}

/// Convert one float sample to PCM16.
///
/// Clamps to [-1, 1]. NaN becomes silence.
fn sample_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * PCM16_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode float samples as a 16 kHz PCM16 wire chunk.
pub fn encode(frame: &[f32]) -> WireAudioChunk {
    let mut data = Vec::with_capacity(frame.len() * 2);
    for &sample in frame {
        data.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }

    WireAudioChunk {
        mime_type: CAPTURE_MIME_TYPE.to_string(),
        data,
    }
}

/// Decode PCM16 little-endian bytes to float samples.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, CallError> {
    if bytes.len() % 2 != 0 {
        return Err(CallError::MalformedAudio(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

pub fn frame_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn unframe_base64(encoded: &str) -> Result<Vec<u8>, CallError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| CallError::MalformedAudio(e.to_string()))
}

/// Unframe and decode an inbound chunk into a playback buffer at `sample_rate`.
pub fn decode_playback(encoded: &str, sample_rate: u32) -> Result<PlaybackBuffer, CallError> {
    let bytes = unframe_base64(encoded)?;
    let samples = decode(&bytes)?;
    Ok(PlaybackBuffer::new(samples, sample_rate))
}

/// Read the `rate=` parameter of a PCM MIME tag such as `audio/pcm;rate=24000`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse::<u32>().ok())
        .filter(|&rate| rate > 0)
}
