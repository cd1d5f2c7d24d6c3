//! Microphone side of a call
//!
//! `on_frame` runs on the capture thread. It meters every frame, and when the
//! call is armed and not muted encodes the frame and hands it to the writer
//! task through a bounded queue.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::audio::{codec, meter, CapturedFrame, FrameHandler, WireAudioChunk};
use crate::call::CallError;
use crate::streaming::TransportSession;

/// Consecutive send failures before the writer gives up on the transport
pub const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 5;

/// Log stats every N chunks
const LOG_INTERVAL_CHUNKS: u64 = 50;

#[derive(Debug, Default)]
pub struct InputPipeline {
    muted: AtomicBool,
    /// f32 bits
    volume: AtomicU32,
    /// Present only while the call is Active
    outbound: Mutex<Option<mpsc::Sender<WireAudioChunk>>>,
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl InputPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame handler for the capture graph
    pub fn handler(self: &Arc<Self>) -> FrameHandler {
        let pipeline = Arc::clone(self);
        Arc::new(move |frame: CapturedFrame| pipeline.on_frame(&frame))
    }

    /// Process one captured frame.
    pub fn on_frame(&self, frame: &CapturedFrame) {
        // Metering ignores mute so the UI can show the user is being heard
        self.volume
            .store(meter::estimate(frame.samples()).to_bits(), Ordering::Relaxed);

        if self.is_muted() {
            return;
        }

        // Hold the slot lock while sending so detach() cannot interleave
        let slot = self.slot();
        let Some(tx) = slot.as_ref() else {
            return;
        };

        match tx.try_send(codec::encode(frame.samples())) {
            Ok(()) => {
                let sent = self.chunks_sent.fetch_add(1, Ordering::Relaxed) + 1;
                if sent % LOG_INTERVAL_CHUNKS == 0 {
                    log::debug!(
                        "Input: {} chunks queued, {} dropped",
                        sent,
                        self.chunks_dropped.load(Ordering::Relaxed)
                    );
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.chunks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Outbound queue full, dropped frame ({} total)", dropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbound queue closed, dropped frame");
            }
        }
    }

    /// Open the outbound slot. Frames captured from now on are sent.
    pub fn arm(&self, tx: mpsc::Sender<WireAudioChunk>) {
        *self.slot() = Some(tx);
        log::debug!("Input armed");
    }

    /// Close the outbound slot. Once this returns no frame reaches `tx`.
    pub fn detach(&self) {
        if self.slot().take().is_some() {
            log::debug!("Input detached");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot().is_some()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Loudness of the most recent frame
    pub fn volume_level(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }

    fn slot(&self) -> MutexGuard<'_, Option<mpsc::Sender<WireAudioChunk>>> {
        match self.outbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Drain the outbound queue into the transport in capture order.
///
/// Calls `on_fatal` once and returns after too many consecutive failures.
/// Returns quietly when the queue is closed.
pub(crate) async fn run_writer<F>(
    mut rx: mpsc::Receiver<WireAudioChunk>,
    transport: Arc<tokio::sync::Mutex<Box<dyn TransportSession>>>,
    on_fatal: F,
) where
    F: FnOnce(CallError),
{
    let mut failures = 0u32;

    while let Some(chunk) = rx.recv().await {
        let result = transport.lock().await.send(chunk).await;
        match result {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                log::warn!(
                    "Failed to send audio chunk ({}/{}): {}",
                    failures,
                    MAX_CONSECUTIVE_SEND_FAILURES,
                    e
                );
                if failures >= MAX_CONSECUTIVE_SEND_FAILURES {
                    log::error!("Giving up on transport after {} failed sends", failures);
                    on_fatal(CallError::TransportRuntimeError(e.to_string()));
                    return;
                }
            }
        }
    }

    log::debug!("Writer task exiting");
}
