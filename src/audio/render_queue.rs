//! Timeline of scheduled playback buffers
//!
//! The output stream callback pulls device frames from a `RenderQueue`. The
//! queue owns the device clock (frames rendered so far) and plays each
//! buffer from its scheduled start frame. It does not prevent overlaps;
//! buffers are expected to arrive already placed back-to-back.

use std::collections::VecDeque;

use super::device::PlaybackBuffer;

#[derive(Debug)]
struct ScheduledBuffer {
    start_frame: u64,
    samples: Vec<f32>,
    source_rate: u32,
}

#[derive(Debug)]
pub struct RenderQueue {
    device_rate: u32,
    frames_rendered: u64,
    pending: VecDeque<ScheduledBuffer>,
}

impl RenderQueue {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate: device_rate.max(1),
            frames_rendered: 0,
            pending: VecDeque::new(),
        }
    }

    /// Device clock in seconds
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.device_rate as f64
    }

    /// Queue `buffer` to start at device time `start` (seconds).
    pub fn push(&mut self, buffer: PlaybackBuffer, start: f64) {
        if buffer.samples.is_empty() || buffer.sample_rate == 0 {
            return;
        }
        let start_frame = (start.max(0.0) * self.device_rate as f64).round() as u64;
        self.pending.push_back(ScheduledBuffer {
            start_frame,
            samples: buffer.samples,
            source_rate: buffer.sample_rate,
        });
    }

    /// Buffers not yet fully rendered
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fill one interleaved output block and advance the clock.
    pub fn fill(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);

        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let now = self.frames_rendered + i as u64;
            let value = self.sample_at(now);
            for slot in frame.iter_mut() {
                *slot = value;
            }
        }

        self.frames_rendered += (out.len() / channels) as u64;
    }

    fn sample_at(&mut self, frame: u64) -> f32 {
        while let Some(front) = self.pending.front() {
            if frame < front.start_frame {
                return 0.0;
            }
            let elapsed = (frame - front.start_frame) as u128;
            let position =
                (elapsed * front.source_rate as u128 / self.device_rate as u128) as usize;
            if position < front.samples.len() {
                return front.samples[position];
            }
            // Finished; the next buffer may already be due
            self.pending.pop_front();
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_with_rendered_frames() {
        let mut queue = RenderQueue::new(100);
        assert_eq!(queue.current_time(), 0.0);

        let mut out = vec![0.0f32; 100]; // 50 stereo frames
        queue.fill(&mut out, 2);
        assert!((queue.current_time() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_buffer_plays_at_scheduled_frame() {
        let mut queue = RenderQueue::new(10);
        queue.push(PlaybackBuffer::new(vec![0.5, 0.6], 10), 0.3);

        let mut out = vec![0.0f32; 6];
        queue.fill(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.5, 0.6, 0.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_back_to_back_buffers_are_gapless() {
        let mut queue = RenderQueue::new(10);
        queue.push(PlaybackBuffer::new(vec![0.1, 0.2], 10), 0.0);
        queue.push(PlaybackBuffer::new(vec![0.3, 0.4], 10), 0.2);

        let mut out = vec![0.0f32; 4];
        queue.fill(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_source_rate_is_converted_to_device_rate() {
        // 5 Hz source on a 10 Hz device: each sample held for two frames
        let mut queue = RenderQueue::new(10);
        queue.push(PlaybackBuffer::new(vec![0.1, 0.2], 5), 0.0);

        let mut out = vec![0.0f32; 4];
        queue.fill(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_same_sample_on_every_channel() {
        let mut queue = RenderQueue::new(10);
        queue.push(PlaybackBuffer::new(vec![0.7], 10), 0.0);

        let mut out = vec![0.0f32; 4];
        queue.fill(&mut out, 2);
        assert_eq!(out, vec![0.7, 0.7, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_buffers_are_ignored() {
        let mut queue = RenderQueue::new(10);
        queue.push(PlaybackBuffer::new(vec![], 10), 0.0);
        assert!(queue.is_empty());
    }
}
