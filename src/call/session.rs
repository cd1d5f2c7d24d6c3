//! One live call: acquisition, the state loop and teardown
//!
//! Every event goes through a single state loop task that runs the reducer
//! and executes its effects. Resources live in a per-session arena and are
//! released in reverse acquisition order. Setup runs as its own task; the
//! teardown effect waits for it to finish (setup stops early once the call
//! is hung up) before releasing, so nothing acquired late escapes teardown.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::input::{run_writer, InputPipeline};
use super::output::OutputPipeline;
use super::CallError;
use crate::audio::{
    AudioBackend, CaptureContext, CaptureFormat, CaptureGraph, Microphone, PlaybackContext,
    CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE,
};
use crate::settings::AppSettings;
use crate::state_machine::{reduce, CallEvent, CallState, Effect};
use crate::streaming::{LiveConfig, Transport, TransportEvent, TransportEvents, TransportSession};
use crate::{status_of, CallSnapshot, CallStatus};

/// Capacity of the state loop's event channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

type SharedTransport = Arc<tokio::sync::Mutex<Box<dyn TransportSession>>>;

/// Parameters for one call
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub live: LiveConfig,
    pub capture: CaptureFormat,
    pub playback_sample_rate: u32,
    /// Outbound chunks buffered between the capture thread and the writer
    pub outbound_queue_capacity: usize,
}

impl CallConfig {
    pub fn new(live: LiveConfig) -> Self {
        Self {
            live,
            capture: CaptureFormat {
                sample_rate: CAPTURE_SAMPLE_RATE,
                chunk_size: 4096,
            },
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            outbound_queue_capacity: 64,
        }
    }

    pub fn from_settings(settings: &AppSettings, api_key: String) -> Self {
        Self {
            live: LiveConfig {
                model: settings.live_model.clone(),
                voice_name: settings.voice_name.clone(),
                system_instruction: settings.system_instruction.clone(),
                api_key,
            },
            capture: CaptureFormat {
                sample_rate: settings.capture_sample_rate,
                chunk_size: settings.capture_chunk_size,
            },
            playback_sample_rate: settings.playback_sample_rate,
            outbound_queue_capacity: settings.outbound_queue_capacity.max(1),
        }
    }
}

/// Everything acquired for one call
#[derive(Default)]
struct Resources {
    capture: Option<Box<dyn CaptureContext>>,
    playback: Option<Arc<dyn PlaybackContext>>,
    microphone: Option<Box<dyn Microphone>>,
    graph: Option<Box<dyn CaptureGraph>>,
    transport: Option<SharedTransport>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct Inner {
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    config: CallConfig,
    input: Arc<InputPipeline>,
    output: Mutex<Option<Arc<OutputPipeline>>>,
    state: Mutex<CallState>,
    resources: tokio::sync::Mutex<Resources>,
    /// Setup task of the current call, awaited by teardown
    setup: Mutex<Option<JoinHandle<()>>>,
    /// Set once the call is over; setup checks it after every acquisition
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<CallSnapshot>,
    /// True once the call is terminal and every resource is released
    settled_tx: watch::Sender<bool>,
}

/// A live voice call.
///
/// Must be created inside a Tokio runtime. A session runs at most one call;
/// once it is `Ended` or `Failed` a new session is needed.
pub struct CallSession {
    inner: Arc<Inner>,
    events: mpsc::Sender<CallEvent>,
}

impl CallSession {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        config: CallConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(CallSnapshot::default());
        let (settled_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            backend,
            transport,
            config,
            input: Arc::new(InputPipeline::new()),
            output: Mutex::new(None),
            state: Mutex::new(CallState::Idle),
            resources: tokio::sync::Mutex::new(Resources::default()),
            setup: Mutex::new(None),
            cancel: CancellationToken::new(),
            snapshot_tx,
            settled_tx,
        });

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(run_call_loop(Arc::clone(&inner), rx, tx.clone()));

        Self { inner, events: tx }
    }

    /// Start the call and wait until it is `Active`.
    ///
    /// Returns the setup error if the call failed, or `Cancelled` if it was
    /// hung up before it became active.
    pub async fn start(&self) -> Result<(), CallError> {
        match self.state() {
            CallState::Idle => {
                if self.events.send(CallEvent::Start).await.is_err() {
                    return Err(CallError::Cancelled);
                }
            }
            CallState::Connecting { .. } => {}
            CallState::Active { .. } => return Ok(()),
            CallState::Failed { error, .. } => return Err(error),
            CallState::Ending { .. } | CallState::Ended { .. } => {
                return Err(CallError::Cancelled)
            }
        }

        let mut rx = self.inner.snapshot_tx.subscribe();
        let _ = rx
            .wait_for(|s| !matches!(s.status, CallStatus::Idle | CallStatus::Connecting))
            .await;

        match self.state() {
            CallState::Active { .. } => Ok(()),
            CallState::Failed { error, .. } => Err(error),
            _ => Err(CallError::Cancelled),
        }
    }

    /// Hang up and wait until every resource is released.
    ///
    /// Safe to call at any time, any number of times.
    pub async fn stop(&self) {
        // Nothing captured from here on may reach the transport
        self.inner.input.detach();
        self.inner.cancel.cancel();

        if self.events.send(CallEvent::HangUp).await.is_err() {
            log::debug!("Call loop already finished");
        }

        let mut settled = self.inner.settled_tx.subscribe();
        let _ = settled.wait_for(|done| *done).await;
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.input.set_muted(muted);
        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        self.inner.emit();
    }

    pub fn is_muted(&self) -> bool {
        self.inner.input.is_muted()
    }

    pub fn state(&self) -> CallState {
        self.inner.state()
    }

    pub fn call_id(&self) -> Option<Uuid> {
        self.state().call_id()
    }

    /// Loudness of the most recent captured frame
    pub fn volume_level(&self) -> f32 {
        self.inner.input.volume_level()
    }

    /// The error that failed the call, if any
    pub fn error(&self) -> Option<CallError> {
        match self.state() {
            CallState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Device time the next inbound buffer will start at, at the earliest
    pub fn next_playback_time(&self) -> f64 {
        self.inner.next_playback_time()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshot()
    }

    /// Snapshots published on every state change and mute toggle
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // The loop keeps its own handle on the session and finishes teardown
        self.inner.input.detach();
        self.inner.cancel.cancel();
        if self.events.try_send(CallEvent::HangUp).is_err() {
            log::warn!("Could not queue hang up for dropped call session");
        }
    }
}

/// Run the state loop for one call
async fn run_call_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<CallEvent>,
    tx: mpsc::Sender<CallEvent>,
) {
    let mut state = CallState::default();
    // Follow-up events from effects run inline, ahead of the channel
    let mut pending: VecDeque<CallEvent> = VecDeque::new();

    inner.emit();
    log::debug!("Call loop started");

    loop {
        let event = match pending.pop_front() {
            Some(event) => event,
            None => match rx.recv().await {
                Some(event) => event,
                None => break,
            },
        };
        log::debug!("Received call event: {:?}", event);

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        // Log state transitions
        if old_discriminant != new_discriminant {
            log::info!("Call state transition: {:?} -> {:?}", state, next);
        }

        state = next;
        inner.set_state(state.clone());

        for eff in effects {
            match eff {
                Effect::Acquire { id } => {
                    let task_inner = Arc::clone(&inner);
                    let tx = tx.clone();
                    let handle = tokio::spawn(async move {
                        let result = task_inner.acquire(id, tx.clone()).await;
                        let _ = tx.send(result).await;
                    });
                    inner.set_setup(handle);
                }
                Effect::ArmInput { id } => {
                    if let Err(error) = inner.arm(id, &tx).await {
                        pending.push_back(CallEvent::TransportError { id, error });
                    }
                }
                Effect::Teardown { id } => {
                    inner.finish_setup().await;
                    inner.release_all().await;
                    pending.push_back(CallEvent::TeardownComplete { id });
                }
                Effect::EmitUi => inner.emit(),
            }
        }

        if state.is_terminal() && pending.is_empty() {
            inner.settled_tx.send_replace(true);
            break;
        }
    }

    log::debug!("Call loop ended");
}

impl Inner {
    fn state(&self) -> CallState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: CallState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn set_setup(&self, handle: JoinHandle<()>) {
        match self.setup.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    /// Stop setup and wait for it, so whatever it acquired is in the arena.
    async fn finish_setup(&self) {
        self.cancel.cancel();

        let handle = match self.setup.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Call setup task failed: {}", e);
            }
        }
    }

    fn output(&self) -> Option<Arc<OutputPipeline>> {
        match self.output.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn next_playback_time(&self) -> f64 {
        self.output()
            .map(|output| output.next_playback_time())
            .unwrap_or(0.0)
    }

    fn snapshot(&self) -> CallSnapshot {
        let state = self.state();
        let output = self.output();

        CallSnapshot {
            call_id: state.call_id(),
            status: status_of(&state),
            muted: self.input.is_muted(),
            volume_level: self.input.volume_level(),
            error: match &state {
                CallState::Failed { error, .. } => Some(error.to_string()),
                _ => None,
            },
            next_playback_time: output
                .as_ref()
                .map(|o| o.next_playback_time())
                .unwrap_or(0.0),
            chunks_sent: self.input.chunks_sent(),
            chunks_scheduled: output.as_ref().map(|o| o.chunks_scheduled()).unwrap_or(0),
        }
    }

    /// Publish a snapshot to subscribers
    fn emit(&self) {
        let snapshot = self.snapshot();
        log::debug!("Emitting call snapshot: {:?}", snapshot.status);
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Store a freshly acquired resource. Returns `false` if the call was
    /// hung up meanwhile, after releasing everything stored so far.
    async fn store<F>(&self, put: F) -> bool
    where
        F: FnOnce(&mut Resources),
    {
        let cancelled = {
            let mut resources = self.resources.lock().await;
            put(&mut resources);
            self.cancel.is_cancelled()
        };

        if cancelled {
            log::info!("Call hung up during setup, releasing acquired resources");
            self.release_all().await;
        }
        !cancelled
    }

    /// Acquire contexts, microphone and transport for call `id`.
    ///
    /// Returns the event that reports the outcome.
    async fn acquire(self: &Arc<Self>, id: Uuid, events: mpsc::Sender<CallEvent>) -> CallEvent {
        match self.try_acquire(id, events).await {
            Ok(()) => CallEvent::ResourcesReady { id },
            Err(error) => {
                if error != CallError::Cancelled {
                    log::error!("Call setup failed: {}", error);
                }
                CallEvent::SetupFailed { id, error }
            }
        }
    }

    async fn try_acquire(
        self: &Arc<Self>,
        id: Uuid,
        events: mpsc::Sender<CallEvent>,
    ) -> Result<(), CallError> {
        log::info!("Setting up call {}", id);

        let backend = Arc::clone(&self.backend);
        let requested = self.config.capture;
        let capture = run_blocking(move || backend.open_capture_context(requested)).await?;
        let format = capture.format();
        if !self.store(|r| r.capture = Some(capture)).await {
            return Err(CallError::Cancelled);
        }

        let backend = Arc::clone(&self.backend);
        let rate = self.config.playback_sample_rate;
        let playback = run_blocking(move || backend.open_playback_context(rate)).await?;
        let output = Arc::new(OutputPipeline::with_rate(Arc::clone(&playback), rate));
        match self.output.lock() {
            Ok(mut guard) => *guard = Some(Arc::clone(&output)),
            Err(poisoned) => *poisoned.into_inner() = Some(Arc::clone(&output)),
        }
        if !self.store(|r| r.playback = Some(playback)).await {
            return Err(CallError::Cancelled);
        }

        // Permission prompt and network handshake run concurrently; a hang up
        // abandons whichever is still pending
        let mut microphone_request = self.backend.request_microphone();
        let mut transport_open = self.transport.open(&self.config.live);
        let mut microphone = None;
        let mut opened = None;

        while microphone.is_none() || opened.is_none() {
            tokio::select! {
                result = &mut microphone_request, if microphone.is_none() => {
                    microphone = Some(result);
                }
                result = &mut transport_open, if opened.is_none() => {
                    opened = Some(result);
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        drop(microphone_request);
        drop(transport_open);

        let (microphone, opened) = match (microphone, opened) {
            (Some(Ok(mic)), Some(Ok(opened))) => (mic, opened),
            (mic, opened) => {
                // Keep whichever half succeeded so it is released in order
                let mut first_error = None;
                let mic = match mic {
                    Some(Ok(mic)) => Some(mic),
                    Some(Err(e)) => {
                        first_error = Some(e);
                        None
                    }
                    None => None,
                };
                let session = match opened {
                    Some(Ok((session, _events))) => Some(session),
                    Some(Err(e)) => {
                        first_error.get_or_insert(e);
                        None
                    }
                    None => None,
                };
                self.store(|r| {
                    r.microphone = mic;
                    r.transport = session.map(|s| Arc::new(tokio::sync::Mutex::new(s)));
                })
                .await;
                return Err(first_error.unwrap_or(CallError::Cancelled));
            }
        };

        let (session, transport_events) = opened;
        let reader = tokio::spawn(run_reader(id, transport_events, output, events));
        if !self
            .store(|r| {
                r.microphone = Some(microphone);
                r.transport = Some(Arc::new(tokio::sync::Mutex::new(session)));
                r.reader = Some(reader);
            })
            .await
        {
            return Err(CallError::Cancelled);
        }

        // Connecting starts a stream thread, so it runs off the runtime with
        // the microphone out of the arena; teardown waits for setup first
        let microphone = {
            let mut resources = self.resources.lock().await;
            if self.cancel.is_cancelled() {
                None
            } else {
                resources.microphone.take()
            }
        };
        let Some(microphone) = microphone else {
            return Err(CallError::Cancelled);
        };

        let handler = self.input.handler();
        let (microphone, connected) = run_blocking(move || {
            let mut microphone = microphone;
            let connected = microphone.connect(format, handler);
            Ok((microphone, connected))
        })
        .await?;

        let (graph, connect_error) = match connected {
            Ok(graph) => (Some(graph), None),
            Err(e) => (None, Some(e)),
        };
        if !self
            .store(|r| {
                r.microphone = Some(microphone);
                r.graph = graph;
            })
            .await
        {
            return Err(CallError::Cancelled);
        }
        if let Some(e) = connect_error {
            return Err(e);
        }

        log::info!("Call {} ready", id);
        Ok(())
    }

    /// Open the outbound path: spawn the writer and fill the input slot.
    async fn arm(&self, id: Uuid, events: &mpsc::Sender<CallEvent>) -> Result<(), CallError> {
        let mut resources = self.resources.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let transport = resources.transport.clone().ok_or_else(|| {
            CallError::TransportRuntimeError("Transport not open".to_string())
        })?;

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let events = events.clone();
        resources.writer = Some(tokio::spawn(run_writer(rx, transport, move |error| {
            if events
                .try_send(CallEvent::TransportError { id, error })
                .is_err()
            {
                log::warn!("Could not report transport failure for call {}", id);
            }
        })));

        self.input.arm(tx);
        log::info!("Call {} active", id);
        Ok(())
    }

    /// Release every acquired resource in reverse acquisition order.
    ///
    /// Each step is independent; failures are logged and swallowed.
    /// Safe to call any number of times.
    async fn release_all(&self) {
        self.cancel.cancel();
        self.input.detach();

        let mut resources = self.resources.lock().await;

        if let Some(graph) = resources.graph.as_mut() {
            graph.detach_handler();
        }

        // Pending outbound sends are dropped
        for task in [resources.writer.take(), resources.reader.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
            let _ = task.await;
        }

        // Stopping stream threads joins them, so the device steps run off the runtime
        let graph = resources.graph.take();
        let microphone = resources.microphone.take();
        let capture = resources.capture.take();
        let playback = resources.playback.take();

        if graph.is_some() || microphone.is_some() || capture.is_some() || playback.is_some() {
            let released = tokio::task::spawn_blocking(move || {
                release_devices(graph, microphone, capture, playback)
            })
            .await;
            if let Err(e) = released {
                log::warn!("Device release task failed: {}", e);
            }
        }

        if let Some(transport) = resources.transport.take() {
            if let Err(e) = transport.lock().await.close().await {
                log::warn!("Failed to close transport: {}", e);
            }
        }

        log::info!("Call resources released");
    }
}

/// Release the device side in order: capture graph, microphone, capture
/// context, playback context.
fn release_devices(
    graph: Option<Box<dyn CaptureGraph>>,
    microphone: Option<Box<dyn Microphone>>,
    capture: Option<Box<dyn CaptureContext>>,
    playback: Option<Arc<dyn PlaybackContext>>,
) {
    if let Some(mut graph) = graph {
        if let Err(e) = graph.disconnect() {
            log::warn!("Failed to disconnect capture graph: {}", e);
        }
    }

    if let Some(mut microphone) = microphone {
        if let Err(e) = microphone.stop_tracks() {
            log::warn!("Failed to stop microphone: {}", e);
        }
    }

    if let Some(mut capture) = capture {
        if let Err(e) = capture.close() {
            log::warn!("Failed to close capture context: {}", e);
        }
    }

    if let Some(playback) = playback {
        if let Err(e) = playback.close() {
            log::warn!("Failed to close playback context: {}", e);
        }
    }
}

/// Run a device call that may block on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, CallError>
where
    F: FnOnce() -> Result<T, CallError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CallError::DeviceError(format!("Device task failed: {}", e)))?
}

/// Feed inbound transport events to the output pipeline in arrival order.
async fn run_reader(
    id: Uuid,
    mut events: TransportEvents,
    output: Arc<OutputPipeline>,
    tx: mpsc::Sender<CallEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Audio(chunk) => {
                output.on_chunk(&chunk);
            }
            TransportEvent::TurnComplete => log::debug!("Model turn complete"),
            TransportEvent::Interrupted => log::info!("Model interrupted"),
            TransportEvent::Error(message) => {
                log::error!("Transport error: {}", message);
                let error = CallError::TransportRuntimeError(message);
                let _ = tx.send(CallEvent::TransportError { id, error }).await;
                return;
            }
            TransportEvent::Closed(reason) => {
                let _ = tx.send(CallEvent::RemoteClosed { id, reason }).await;
                return;
            }
        }
    }

    let _ = tx.send(CallEvent::RemoteClosed { id, reason: None }).await;
}
