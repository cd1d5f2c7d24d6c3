//! Speaker side of a call

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::scheduler::OutputScheduler;
use crate::audio::{codec, PlaybackContext, PLAYBACK_SAMPLE_RATE};
use crate::streaming::InboundChunk;

/// Log stats every N chunks
const LOG_INTERVAL_CHUNKS: u64 = 50;

/// Decodes inbound chunks in arrival order and schedules them for playback.
pub struct OutputPipeline {
    scheduler: OutputScheduler,
    playback: Arc<dyn PlaybackContext>,
    rate: u32,
    rate_mismatch_logged: AtomicBool,
    chunks_scheduled: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl OutputPipeline {
    pub fn new(playback: Arc<dyn PlaybackContext>) -> Self {
        Self::with_rate(playback, PLAYBACK_SAMPLE_RATE)
    }

    /// Every chunk is decoded at `rate`, whatever its MIME type declares.
    pub fn with_rate(playback: Arc<dyn PlaybackContext>, rate: u32) -> Self {
        Self {
            scheduler: OutputScheduler::new(Arc::clone(&playback)),
            playback,
            rate,
            rate_mismatch_logged: AtomicBool::new(false),
            chunks_scheduled: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
        }
    }

    /// Decode and schedule one chunk. Returns its start time, or `None` if
    /// the chunk was dropped.
    pub fn on_chunk(&self, chunk: &InboundChunk) -> Option<f64> {
        if let Some(declared) = codec::parse_pcm_rate(&chunk.mime_type) {
            if declared != self.rate && !self.rate_mismatch_logged.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "Inbound chunk declares {} Hz, decoding at {} Hz",
                    declared,
                    self.rate
                );
            }
        }

        let buffer = match codec::decode_playback(&chunk.data, self.rate) {
            Ok(buffer) => buffer,
            Err(e) => {
                let dropped = self.chunks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("Dropping inbound chunk ({} dropped so far): {}", dropped, e);
                return None;
            }
        };

        let device_now = self.playback.current_time();
        let start = self.scheduler.schedule(buffer, device_now);

        let scheduled = self.chunks_scheduled.fetch_add(1, Ordering::Relaxed) + 1;
        if scheduled % LOG_INTERVAL_CHUNKS == 0 {
            log::debug!(
                "Output: {} chunks scheduled, next start {:.3}s",
                scheduled,
                self.scheduler.next_playback_time()
            );
        }

        Some(start)
    }

    pub fn next_playback_time(&self) -> f64 {
        self.scheduler.next_playback_time()
    }

    pub fn chunks_scheduled(&self) -> u64 {
        self.chunks_scheduled.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PlaybackBuffer;
    use crate::call::CallError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePlayback {
        now: Mutex<f64>,
        rendered: Mutex<Vec<PlaybackBuffer>>,
    }

    impl PlaybackContext for FakePlayback {
        fn current_time(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn render_at(&self, buffer: PlaybackBuffer, _start: f64) -> Result<(), CallError> {
            self.rendered.lock().unwrap().push(buffer);
            Ok(())
        }

        fn close(&self) -> Result<(), CallError> {
            Ok(())
        }
    }

    fn chunk(samples: &[i16], mime_type: &str) -> InboundChunk {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        InboundChunk {
            mime_type: mime_type.to_string(),
            data: codec::frame_base64(&bytes),
        }
    }

    #[test]
    fn test_chunk_is_decoded_and_scheduled() {
        let playback = Arc::new(FakePlayback::default());
        *playback.now.lock().unwrap() = 2.0;
        let pipeline = OutputPipeline::new(playback.clone());

        let start = pipeline.on_chunk(&chunk(&[16384, -16384], "audio/pcm;rate=24000"));

        assert_eq!(start, Some(2.0));
        let rendered = playback.rendered.lock().unwrap();
        assert_eq!(rendered[0].samples, vec![0.5, -0.5]);
        assert_eq!(rendered[0].sample_rate, 24_000);
    }

    #[test]
    fn test_declared_rate_does_not_change_decode_rate() {
        let playback = Arc::new(FakePlayback::default());
        let pipeline = OutputPipeline::new(playback.clone());

        // 12000 samples last 0.5 s at 24 kHz, not 0.75 s at 16 kHz
        pipeline.on_chunk(&chunk(&[0; 12_000], "audio/pcm;rate=16000"));

        assert_eq!(playback.rendered.lock().unwrap()[0].sample_rate, 24_000);
        assert!((pipeline.next_playback_time() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_missing_rate_decodes_at_playback_rate() {
        let playback = Arc::new(FakePlayback::default());
        let pipeline = OutputPipeline::new(playback.clone());

        pipeline.on_chunk(&chunk(&[0; 4], ""));

        assert_eq!(playback.rendered.lock().unwrap()[0].sample_rate, 24_000);
    }

    #[test]
    fn test_malformed_chunks_are_skipped() {
        let playback = Arc::new(FakePlayback::default());
        let pipeline = OutputPipeline::new(playback.clone());

        let odd_length = InboundChunk {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: codec::frame_base64(&[0x01, 0x02, 0x03]),
        };
        let bad_base64 = InboundChunk {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: "not base64!".to_string(),
        };

        assert!(pipeline.on_chunk(&chunk(&[1, 2], "audio/pcm;rate=24000")).is_some());
        assert!(pipeline.on_chunk(&odd_length).is_none());
        assert!(pipeline.on_chunk(&bad_base64).is_none());
        assert!(pipeline.on_chunk(&chunk(&[3, 4], "audio/pcm;rate=24000")).is_some());

        assert_eq!(pipeline.chunks_scheduled(), 2);
        assert_eq!(pipeline.chunks_dropped(), 2);
        assert_eq!(playback.rendered.lock().unwrap().len(), 2);
    }
}
