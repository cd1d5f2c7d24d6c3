//! Gapless playback scheduling
//!
//! Each decoded buffer starts exactly where the previous one ends, or at the
//! current device time if playback has fallen behind.

use std::sync::{Arc, Mutex};

use crate::audio::{PlaybackBuffer, PlaybackContext};

/// Playback cursor on the device clock
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    next_start: f64,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device time the next buffer will start at, at the earliest
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Place a buffer of `duration` seconds given device time `now`.
    /// Returns its start time and advances the cursor past it.
    pub fn place(&mut self, duration: f64, now: f64) -> f64 {
        let start = now.max(self.next_start);
        self.next_start = start + duration.max(0.0);
        start
    }
}

/// Places decoded buffers on one playback context.
pub struct OutputScheduler {
    cursor: Mutex<PlaybackCursor>,
    playback: Arc<dyn PlaybackContext>,
}

impl OutputScheduler {
    pub fn new(playback: Arc<dyn PlaybackContext>) -> Self {
        Self {
            cursor: Mutex::new(PlaybackCursor::new()),
            playback,
        }
    }

    /// Schedule `buffer` and return the device time it starts at.
    ///
    /// The cursor lock is held across `render_at` so buffers reach the
    /// device in the order their start times were decided.
    pub fn schedule(&self, buffer: PlaybackBuffer, device_now: f64) -> f64 {
        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let duration = buffer.duration();
        let start = cursor.place(duration, device_now);

        if let Err(e) = self.playback.render_at(buffer, start) {
            // The slot stays reserved so the next buffer cannot overlap it
            log::warn!("Failed to render buffer at {:.3}s: {}", start, e);
        }

        start
    }

    /// Device clock of the playback context
    pub fn device_time(&self) -> f64 {
        self.playback.current_time()
    }

    pub fn next_playback_time(&self) -> f64 {
        match self.cursor.lock() {
            Ok(guard) => guard.next_start(),
            Err(poisoned) => poisoned.into_inner().next_start(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallError;

    #[derive(Default)]
    struct RecordingPlayback {
        now: Mutex<f64>,
        rendered: Mutex<Vec<(usize, f64)>>,
        fail: bool,
    }

    impl PlaybackContext for RecordingPlayback {
        fn current_time(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn render_at(&self, buffer: PlaybackBuffer, start: f64) -> Result<(), CallError> {
            self.rendered
                .lock()
                .unwrap()
                .push((buffer.samples.len(), start));
            if self.fail {
                return Err(CallError::DeviceError("underrun".to_string()));
            }
            Ok(())
        }

        fn close(&self) -> Result<(), CallError> {
            Ok(())
        }
    }

    fn half_second() -> PlaybackBuffer {
        PlaybackBuffer::new(vec![0.0; 12_000], 24_000)
    }

    #[test]
    fn test_cursor_starts_at_now_when_idle() {
        let mut cursor = PlaybackCursor::new();
        assert_eq!(cursor.place(1.0, 3.0), 3.0);
        assert_eq!(cursor.next_start(), 4.0);
    }

    #[test]
    fn test_cursor_chains_back_to_back() {
        let mut cursor = PlaybackCursor::new();
        let a = cursor.place(0.25, 1.0);
        let b = cursor.place(0.5, 1.1);
        let c = cursor.place(0.25, 1.2);

        assert_eq!(a, 1.0);
        assert_eq!(b, 1.25);
        assert_eq!(c, 1.75);
    }

    #[test]
    fn test_cursor_never_schedules_in_the_past() {
        let mut cursor = PlaybackCursor::new();
        cursor.place(0.5, 0.0);
        // Device clock ran past the end of the last buffer
        assert_eq!(cursor.place(0.5, 2.0), 2.0);
        assert_eq!(cursor.next_start(), 2.5);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let mut cursor = PlaybackCursor::new();
        let mut last = cursor.next_start();
        for (duration, now) in [(0.1, 5.0), (0.0, 1.0), (0.3, 5.05), (0.2, 9.0), (0.1, 0.0)] {
            cursor.place(duration, now);
            assert!(cursor.next_start() >= last);
            last = cursor.next_start();
        }
    }

    #[test]
    fn test_three_chunks_start_back_to_back() {
        let playback = Arc::new(RecordingPlayback::default());
        *playback.now.lock().unwrap() = 10.0;
        let scheduler = OutputScheduler::new(playback.clone());

        let starts: Vec<f64> = (0..3)
            .map(|_| scheduler.schedule(half_second(), scheduler.device_time()))
            .collect();

        assert_eq!(starts, vec![10.0, 10.5, 11.0]);
        assert_eq!(scheduler.next_playback_time(), 11.5);

        let rendered = playback.rendered.lock().unwrap();
        assert_eq!(
            rendered.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
            vec![10.0, 10.5, 11.0]
        );
    }

    #[test]
    fn test_render_failure_still_advances_cursor() {
        let playback = Arc::new(RecordingPlayback {
            fail: true,
            ..Default::default()
        });
        let scheduler = OutputScheduler::new(playback.clone());

        assert_eq!(scheduler.schedule(half_second(), 0.0), 0.0);
        assert_eq!(scheduler.schedule(half_second(), 0.0), 0.5);
        assert_eq!(playback.rendered.lock().unwrap().len(), 2);
    }
}
