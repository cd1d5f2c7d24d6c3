//! Audio I/O for live calls
//!
//! Sample conversion, loudness metering and the device seams the call core
//! acquires and releases. Uses CPAL for capture and playback.

pub mod codec;
mod cpal_backend;
mod device;
pub mod meter;
mod render_queue;
pub mod resample;

pub use codec::{WireAudioChunk, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
pub use cpal_backend::CpalBackend;
pub use device::{
    AudioBackend, CaptureContext, CaptureFormat, CaptureGraph, CapturedFrame, FrameHandler,
    Microphone, PlaybackBuffer, PlaybackContext,
};
pub use render_queue::RenderQueue;
