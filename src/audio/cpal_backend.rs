//! CPAL implementation of the audio device seams
//!
//! CPAL streams are not `Send`, so each stream lives on a dedicated thread
//! that owns it from build to drop. The call core only ever holds the
//! control handle for that thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::device::{
    AudioBackend, CaptureContext, CaptureFormat, CaptureGraph, CapturedFrame, FrameHandler,
    Microphone, PlaybackBuffer, PlaybackContext,
};
use super::render_queue::RenderQueue;
use super::resample::FrameAssembler;
use crate::call::CallError;

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Audio backend on the host's default input and output devices
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    fn open_capture_context(
        &self,
        format: CaptureFormat,
    ) -> Result<Box<dyn CaptureContext>, CallError> {
        log::info!(
            "Capture context opened ({} Hz, {}-sample frames)",
            format.sample_rate,
            format.chunk_size
        );
        Ok(Box::new(CpalCaptureContext {
            format,
            open: true,
        }))
    }

    fn open_playback_context(
        &self,
        sample_rate: u32,
    ) -> Result<Arc<dyn PlaybackContext>, CallError> {
        let context = CpalPlaybackContext::open(sample_rate)?;
        Ok(Arc::new(context))
    }

    async fn request_microphone(&self) -> Result<Box<dyn Microphone>, CallError> {
        let device = tokio::task::spawn_blocking(|| {
            let host = cpal::default_host();
            let device = host.default_input_device().ok_or_else(|| {
                CallError::DeviceAccessDenied("No audio input device found".to_string())
            })?;

            // Probing the default config is where a refused permission shows up
            device
                .default_input_config()
                .map_err(|e| CallError::DeviceAccessDenied(e.to_string()))?;

            Ok::<Device, CallError>(device)
        })
        .await
        .map_err(|e| CallError::DeviceAccessDenied(format!("Device probe failed: {}", e)))??;

        log::info!("Using audio input device: {:?}", device.name());
        Ok(Box::new(CpalMicrophone {
            device: Some(device),
        }))
    }
}

// ============================================================================
// Stream threads
// ============================================================================

/// Control handle for a thread that owns one CPAL stream
struct StreamThread {
    label: &'static str,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Spawn a thread that builds a stream with `build`, plays it and keeps it
    /// alive until stopped. Returns once the stream is playing or has failed.
    fn spawn<F>(label: &'static str, build: F) -> Result<Self, CallError>
    where
        F: FnOnce() -> Result<Stream, CallError> + Send + 'static,
    {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), CallError>>(1);

        let thread = std::thread::Builder::new()
            .name(format!("live-call-{}", label))
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CallError::DeviceError(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Park until stopped or the control handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("{} stream thread exiting", label);
            })
            .map_err(|e| {
                CallError::DeviceError(format!("Failed to spawn {} thread: {}", label, e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                label,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CallError::DeviceError(format!(
                    "{} thread exited before the stream started",
                    label
                )))
            }
        }
    }

    fn stop(&mut self) -> Result<(), CallError> {
        // Dropping the sender also wakes the thread
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| {
                CallError::DeviceError(format!("{} stream thread panicked", self.label))
            })?;
        }
        Ok(())
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("{}", e);
        }
    }
}

// ============================================================================
// Capture
// ============================================================================

struct CpalCaptureContext {
    format: CaptureFormat,
    open: bool,
}

impl CaptureContext for CpalCaptureContext {
    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn close(&mut self) -> Result<(), CallError> {
        if self.open {
            self.open = false;
            log::info!("Capture context closed");
        }
        Ok(())
    }
}

struct CpalMicrophone {
    device: Option<Device>,
}

impl CpalMicrophone {
    /// Pick a device config close to the requested rate.
    ///
    /// Prefers a native range that includes the capture rate (fewest channels
    /// first); otherwise falls back to the device default and resamples.
    fn choose_config(
        device: &Device,
        sample_rate: u32,
    ) -> Result<(StreamConfig, SampleFormat), CallError> {
        let mut ranges: Vec<_> = device
            .supported_input_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default();
        ranges.sort_by_key(|range| range.channels());

        let native = ranges.into_iter().find(|range| {
            range.min_sample_rate().0 <= sample_rate
                && range.max_sample_rate().0 >= sample_rate
                && matches!(
                    range.sample_format(),
                    SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                )
        });

        let supported = match native {
            Some(range) => range.with_sample_rate(cpal::SampleRate(sample_rate)),
            None => device
                .default_input_config()
                .map_err(|e| CallError::DeviceAccessDenied(e.to_string()))?,
        };

        log::info!(
            "Capture config: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        let sample_format = supported.sample_format();
        Ok((supported.into(), sample_format))
    }
}

impl Microphone for CpalMicrophone {
    fn connect(
        &mut self,
        format: CaptureFormat,
        handler: FrameHandler,
    ) -> Result<Box<dyn CaptureGraph>, CallError> {
        let device = self.device.clone().ok_or_else(|| {
            CallError::DeviceAccessDenied("Microphone already released".to_string())
        })?;
        let (config, sample_format) = Self::choose_config(&device, format.sample_rate)?;

        let slot: Arc<Mutex<Option<FrameHandler>>> = Arc::new(Mutex::new(Some(handler)));
        let callback_slot = slot.clone();

        let thread = StreamThread::spawn("capture", move || {
            build_input_stream(&device, &config, sample_format, format, callback_slot)
        })?;

        log::info!("Capture graph connected");
        Ok(Box::new(CpalCaptureGraph {
            handler: slot,
            thread: Some(thread),
        }))
    }

    fn stop_tracks(&mut self) -> Result<(), CallError> {
        if self.device.take().is_some() {
            log::info!("Microphone released");
        }
        Ok(())
    }
}

struct CpalCaptureGraph {
    handler: Arc<Mutex<Option<FrameHandler>>>,
    thread: Option<StreamThread>,
}

impl CaptureGraph for CpalCaptureGraph {
    fn detach_handler(&mut self) {
        // Waits out a callback that is mid-delivery
        lock_or_recover(&self.handler).take();
    }

    fn disconnect(&mut self) -> Result<(), CallError> {
        match self.thread.take() {
            Some(mut thread) => thread.stop(),
            None => Ok(()),
        }
    }
}

fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    format: CaptureFormat,
    slot: Arc<Mutex<Option<FrameHandler>>>,
) -> Result<Stream, CallError> {
    match sample_format {
        SampleFormat::I16 => build_input_stream_typed::<i16>(device, config, format, slot),
        SampleFormat::U16 => build_input_stream_typed::<u16>(device, config, format, slot),
        SampleFormat::F32 => build_input_stream_typed::<f32>(device, config, format, slot),
        other => Err(CallError::DeviceError(format!(
            "Unsupported capture sample format {:?}",
            other
        ))),
    }
}

fn build_input_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    format: CaptureFormat,
    slot: Arc<Mutex<Option<FrameHandler>>>,
) -> Result<Stream, CallError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let mut assembler = FrameAssembler::new(
        config.sample_rate.0,
        format.sample_rate,
        config.channels as usize,
        format.chunk_size,
    );
    let mut scratch: Vec<f32> = Vec::new();
    let target_rate = format.sample_rate;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let guard = lock_or_recover(&slot);
                let Some(handler) = guard.as_ref() else {
                    return;
                };

                scratch.clear();
                scratch.extend(data.iter().map(|&s| f32::from_sample_(s)));

                for samples in assembler.push(&scratch) {
                    handler(CapturedFrame::new(samples, target_rate));
                }
            },
            |err| log::error!("Audio capture error: {}", err),
            None,
        )
        .map_err(|e| CallError::DeviceAccessDenied(e.to_string()))
}

// ============================================================================
// Playback
// ============================================================================

struct CpalPlaybackContext {
    queue: Arc<Mutex<RenderQueue>>,
    thread: Mutex<Option<StreamThread>>,
    closed: AtomicBool,
}

impl CpalPlaybackContext {
    fn open(sample_rate: u32) -> Result<Self, CallError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| CallError::DeviceError("No audio output device found".to_string()))?;

        log::info!("Using audio output device: {:?}", device.name());

        let supported_configs: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| CallError::DeviceError(e.to_string()))?
            .collect();

        let supported = supported_configs
            .iter()
            .find(|c| {
                c.min_sample_rate().0 <= sample_rate
                    && c.max_sample_rate().0 >= sample_rate
                    && matches!(
                        c.sample_format(),
                        SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                    )
            })
            .cloned()
            .map(|c| c.with_sample_rate(cpal::SampleRate(sample_rate)));

        let supported = match supported {
            Some(config) => config,
            None => device
                .default_output_config()
                .map_err(|e| CallError::DeviceError(e.to_string()))?,
        };

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        log::info!(
            "Playback context opened: {} Hz, {} channels, {:?}",
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let queue = Arc::new(Mutex::new(RenderQueue::new(config.sample_rate.0)));
        let callback_queue = queue.clone();

        let thread = StreamThread::spawn("playback", move || {
            build_output_stream(&device, &config, sample_format, callback_queue)
        })?;

        Ok(Self {
            queue,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        })
    }
}

impl PlaybackContext for CpalPlaybackContext {
    fn current_time(&self) -> f64 {
        lock_or_recover(&self.queue).current_time()
    }

    fn render_at(&self, buffer: PlaybackBuffer, start: f64) -> Result<(), CallError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::DeviceError(
                "Playback context is closed".to_string(),
            ));
        }
        lock_or_recover(&self.queue).push(buffer, start);
        Ok(())
    }

    fn close(&self) -> Result<(), CallError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let thread = lock_or_recover(&self.thread).take();
        let result = match thread {
            Some(mut thread) => thread.stop(),
            None => Ok(()),
        };

        let remaining = lock_or_recover(&self.queue).len();
        log::info!(
            "Playback context closed ({} scheduled buffers discarded)",
            remaining
        );
        result
    }
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    queue: Arc<Mutex<RenderQueue>>,
) -> Result<Stream, CallError> {
    match sample_format {
        SampleFormat::I16 => build_output_stream_typed::<i16>(device, config, queue),
        SampleFormat::U16 => build_output_stream_typed::<u16>(device, config, queue),
        SampleFormat::F32 => build_output_stream_typed::<f32>(device, config, queue),
        other => Err(CallError::DeviceError(format!(
            "Unsupported playback sample format {:?}",
            other
        ))),
    }
}

fn build_output_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    queue: Arc<Mutex<RenderQueue>>,
) -> Result<Stream, CallError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                lock_or_recover(&queue).fill(&mut scratch, channels);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample_(sample);
                }
            },
            |err| log::error!("Audio playback error: {}", err),
            None,
        )
        .map_err(|e| CallError::DeviceError(e.to_string()))
}
