//! Audio device seams
//!
//! The call core never talks to a sound API directly. It acquires a
//! microphone, a capture context and a playback context through an
//! [`AudioBackend`], and releases each of them exactly once on teardown.

use std::sync::Arc;

use async_trait::async_trait;

use crate::call::CallError;

/// One fixed-length chunk of mono samples from the capture device.
///
/// Samples are in [-1.0, 1.0]. Frames are consumed once and discarded.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl CapturedFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decoded audio ready to be rendered by the playback device
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Callback invoked from the capture thread for every captured frame.
///
/// Runs as an interrupt with respect to the rest of the call: it may fire
/// while teardown is in progress.
pub type FrameHandler = Arc<dyn Fn(CapturedFrame) + Send + Sync>;

/// Rate and chunk size a capture context delivers frames in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub chunk_size: usize,
}

/// Platform audio subsystem
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Open a capture context running at `format.sample_rate`.
    fn open_capture_context(
        &self,
        format: CaptureFormat,
    ) -> Result<Box<dyn CaptureContext>, CallError>;

    /// Open a playback context running at `sample_rate`.
    fn open_playback_context(
        &self,
        sample_rate: u32,
    ) -> Result<Arc<dyn PlaybackContext>, CallError>;

    /// Ask for the microphone. May be refused.
    async fn request_microphone(&self) -> Result<Box<dyn Microphone>, CallError>;
}

/// Exclusive handle on the microphone
pub trait Microphone: Send {
    /// Start delivering frames in `format` to `handler`.
    fn connect(
        &mut self,
        format: CaptureFormat,
        handler: FrameHandler,
    ) -> Result<Box<dyn CaptureGraph>, CallError>;

    /// Release the device. Called once, after the graph is disconnected.
    fn stop_tracks(&mut self) -> Result<(), CallError>;
}

/// Capture-rate audio context
pub trait CaptureContext: Send {
    fn format(&self) -> CaptureFormat;

    fn close(&mut self) -> Result<(), CallError>;
}

/// Running capture subscription
pub trait CaptureGraph: Send {
    /// Stop invoking the frame handler. Synchronous: once this returns the
    /// handler is never called again.
    fn detach_handler(&mut self);

    /// Tear down the capture stream.
    fn disconnect(&mut self) -> Result<(), CallError>;
}

/// Playback-rate audio context with its own monotonic clock
pub trait PlaybackContext: Send + Sync {
    /// Device clock in seconds.
    fn current_time(&self) -> f64;

    /// Render `buffer` starting at device time `start`.
    ///
    /// No gap or overlap protection; callers are expected to schedule.
    fn render_at(&self, buffer: PlaybackBuffer, start: f64) -> Result<(), CallError>;

    fn close(&self) -> Result<(), CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_buffer_duration() {
        let buffer = PlaybackBuffer::new(vec![0.0; 12_000], 24_000);
        assert!((buffer.duration() - 0.5).abs() < 1e-12);

        let buffer = PlaybackBuffer::new(vec![0.0; 100], 0);
        assert_eq!(buffer.duration(), 0.0);
    }

    #[test]
    fn test_captured_frame_accessors() {
        let frame = CapturedFrame::new(vec![0.25, -0.25], 16_000);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.sample_rate(), 16_000);
        assert_eq!(frame.samples(), &[0.25, -0.25]);
        assert!(!frame.is_empty());
    }
}
