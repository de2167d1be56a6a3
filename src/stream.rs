//! The stream facade used by the owning framework thread.
//!
//! [`StreamOut`] coordinates the staging buffer, the sink set, and the
//! command worker under a stream-wide lock. A second, finer admission
//! lock is always taken first, so a fast-polling writer cannot starve
//! the command worker's attempts to take the main lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;

use crate::config::{AudioFormat, GaplessMetadata, StreamConfig};
use crate::error::OffloadError;
use crate::event::{EventCallback, StreamEvent};
use crate::pipeline::command::OffloadCommand;
use crate::pipeline::render::{Decoder, RenderEngine, RenderOutcome};
use crate::pipeline::staging::BitstreamBuffer;
use crate::pipeline::RoutePlan;
use crate::sink::{SinkOpener, SinkSet};

/// Stream-level playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Opened or standby'd; no hardware start issued yet.
    #[default]
    Idle,
    /// Rendering; entered on the first committed write.
    Playing,
    /// Paused by the framework; queued data is retained.
    Paused,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Statistics about a stream's lifetime so far.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Input bytes retired by the render step.
    pub bytes_consumed: u64,
    /// PCM frames handed to hardware (internal counter).
    pub frames_rendered: u64,
    /// Times a write was deferred because a sink had no space.
    pub backpressure_events: u64,
}

/// A rendered-frame count paired with when it was sampled.
#[derive(Debug, Clone, Copy)]
pub struct PresentationPosition {
    /// Frames presented to the output.
    pub frames: u64,
    /// Instant the count was captured.
    pub at: Instant,
}

/// State guarded by the main stream lock.
pub(crate) struct StreamInner {
    pub buffer: BitstreamBuffer,
    pub sinks: SinkSet,
    pub engine: RenderEngine,
    pub plan: RoutePlan,
    pub state: PlaybackState,
    pub frames_rendered: u64,
    pub bytes_consumed: u64,
    pub backpressure_events: u64,
}

impl StreamInner {
    pub(crate) fn new(
        buffer: BitstreamBuffer,
        sinks: SinkSet,
        format: AudioFormat,
        channels: u16,
        decoder: Option<Box<dyn Decoder>>,
        plan: RoutePlan,
    ) -> Self {
        Self {
            buffer,
            sinks,
            engine: RenderEngine::new(format, channels, decoder),
            plan,
            state: PlaybackState::Idle,
            frames_rendered: 0,
            bytes_consumed: 0,
            backpressure_events: 0,
        }
    }

    /// One render pass over the split-borrowed fields.
    async fn render_once(
        &mut self,
        cmd_tx: &mpsc::Sender<OffloadCommand>,
    ) -> Result<RenderOutcome, OffloadError> {
        let Self {
            buffer,
            sinks,
            engine,
            ..
        } = self;
        engine.process(buffer, sinks, cmd_tx).await
    }
}

/// State shared between the facade and the command worker.
pub(crate) struct StreamShared {
    /// Anti-starvation lock: always acquired before `inner`, never after.
    admission: Mutex<()>,
    inner: Mutex<StreamInner>,
    busy: AtomicBool,
    busy_changed: Notify,
    pub(crate) callback: parking_lot::Mutex<Option<EventCallback>>,
    pub(crate) config: StreamConfig,
}

impl StreamShared {
    pub(crate) fn new(inner: StreamInner, config: StreamConfig) -> Self {
        Self {
            admission: Mutex::new(()),
            inner: Mutex::new(inner),
            busy: AtomicBool::new(false),
            busy_changed: Notify::new(),
            callback: parking_lot::Mutex::new(None),
            config,
        }
    }

    /// Takes the main lock through the admission lock.
    ///
    /// The admission guard is dropped as soon as the main lock is held:
    /// it only exists to order contenders, not to nest.
    pub(crate) async fn lock_inner(&self) -> MutexGuard<'_, StreamInner> {
        let admission = self.admission.lock().await;
        let guard = self.inner.lock().await;
        drop(admission);
        guard
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
        self.busy_changed.notify_waiters();
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Waits until the command worker is not mid-operation.
    pub(crate) async fn wait_until_idle(&self) {
        loop {
            let notified = self.busy_changed.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn callback(&self) -> Option<EventCallback> {
        self.callback.lock().clone()
    }
}

/// An open offload output stream.
///
/// Created by [`OffloadStreamBuilder::open()`]. The framework writes
/// encoded or PCM bytes with [`write`](Self::write) and controls playback
/// with the pause/resume/flush/drain/standby surface; all blocking sink
/// work happens on the stream's command worker.
///
/// # Example
///
/// ```ignore
/// let stream = OffloadStream::builder()
///     .format(AudioFormat::Ac3)
///     .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
///     .opener(driver)
///     .on_event(|e| tracing::debug!(?e, "stream event"))
///     .open()
///     .await?;
///
/// let consumed = stream.write(&frame).await?;
/// if consumed == 0 {
///     // retry after the WriteReady callback
/// }
/// ```
///
/// [`OffloadStreamBuilder::open()`]: crate::OffloadStreamBuilder::open
pub struct StreamOut {
    shared: Arc<StreamShared>,
    cmd_tx: mpsc::Sender<OffloadCommand>,
    worker: Option<JoinHandle<()>>,
    opener: Arc<dyn SinkOpener>,
    format: AudioFormat,
    sample_rate: u32,
    channels: u16,
}

impl StreamOut {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        cmd_tx: mpsc::Sender<OffloadCommand>,
        worker: JoinHandle<()>,
        opener: Arc<dyn SinkOpener>,
        format: AudioFormat,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            shared,
            cmd_tx,
            worker: Some(worker),
            opener,
            format,
            sample_rate,
            channels,
        }
    }

    /// Input format of the stream.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count of the source.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Writes bytes into the pipeline.
    ///
    /// Returns the number of bytes the render step consumed during this
    /// call. Bytes that fit the input staging region are admitted even
    /// when zero is returned, so zero is not an error and the same bytes
    /// must not be resubmitted. It means one of two things:
    ///
    /// - not enough data is staged for a decode step yet - keep feeding
    /// - a sink ran out of space and the write was deferred - wait for the
    ///   [`WriteReady`] callback, then call `write(&[])` until the staged
    ///   bytes flush, and continue with the next buffer
    ///
    /// Raw-PCM sinks may block this call; compressed sinks never do.
    ///
    /// The first call that commits data moves the stream from idle to
    /// playing and starts every compressed sink exactly once.
    ///
    /// [`WriteReady`]: crate::StreamEvent::WriteReady
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, OffloadError> {
        let mut events = Vec::new();
        let mut total = 0usize;

        {
            let mut inner = self.shared.lock_inner().await;

            // Sinks are torn down on standby; bring them back lazily.
            if inner.sinks.is_empty() {
                let plan = inner.plan.clone();
                inner
                    .sinks
                    .activate(
                        &plan,
                        self.opener.as_ref(),
                        self.format,
                        self.sample_rate,
                        self.channels,
                    )
                    .await?;
            }

            if !inner.buffer.append(bytes) {
                // Input region full: one render pass may free it.
                total += self.pump(&mut inner, &mut events).await?;
                if !inner.buffer.append(bytes) {
                    drop(inner);
                    self.deliver(events);
                    return Ok(total);
                }
            }

            total += self.pump(&mut inner, &mut events).await?;

            if total > 0 && inner.state == PlaybackState::Idle {
                inner.sinks.start_compressed().await;
                inner.state = PlaybackState::Playing;
                tracing::debug!("stream idle -> playing");
            }
        }

        self.deliver(events);
        Ok(total)
    }

    /// Runs render passes until no further progress, tallying stats.
    async fn pump(
        &self,
        inner: &mut StreamInner,
        events: &mut Vec<StreamEvent>,
    ) -> Result<usize, OffloadError> {
        let mut total = 0usize;
        loop {
            let outcome = inner.render_once(&self.cmd_tx).await?;
            total += outcome.consumed;
            inner.bytes_consumed += outcome.consumed as u64;
            inner.frames_rendered += outcome.pcm_frames;
            inner.backpressure_events += u64::from(outcome.backpressure);
            events.extend(outcome.events);
            if outcome.backpressure || outcome.consumed == 0 {
                break;
            }
        }
        Ok(total)
    }

    fn deliver(&self, events: Vec<StreamEvent>) {
        if events.is_empty() {
            return;
        }
        if let Some(callback) = self.shared.callback() {
            for event in events {
                callback(event);
            }
        }
    }

    /// Pauses rendering on every sink.
    pub async fn pause(&self) -> Result<(), OffloadError> {
        let mut inner = self.shared.lock_inner().await;
        match inner.state {
            PlaybackState::Playing => {
                inner.sinks.pause_all().await;
                inner.state = PlaybackState::Paused;
                Ok(())
            }
            state => Err(OffloadError::InvalidState {
                operation: "pause",
                state,
            }),
        }
    }

    /// Resumes rendering after a pause.
    pub async fn resume(&self) -> Result<(), OffloadError> {
        let mut inner = self.shared.lock_inner().await;
        match inner.state {
            PlaybackState::Paused => {
                inner.sinks.resume_all().await;
                inner.state = PlaybackState::Playing;
                Ok(())
            }
            state => Err(OffloadError::InvalidState {
                operation: "resume",
                state,
            }),
        }
    }

    /// Asks the command worker to drain every compressed sink.
    ///
    /// With `early_notify` the drain stops at the last track boundary
    /// (gapless handoff). Completion arrives as a [`DrainComplete`]
    /// event; this call only enqueues.
    ///
    /// [`DrainComplete`]: crate::StreamEvent::DrainComplete
    pub async fn drain(&self, early_notify: bool) -> Result<(), OffloadError> {
        {
            let inner = self.shared.lock_inner().await;
            if !inner.plan.has_compressed_route() {
                return Err(OffloadError::Unsupported { operation: "drain" });
            }
        }
        let command = if early_notify {
            OffloadCommand::PartialDrain
        } else {
            OffloadCommand::Drain
        };
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| OffloadError::Closed)
    }

    /// Takes the main lock while the command worker is provably idle.
    ///
    /// The worker raises the busy flag before it snapshots the sink list,
    /// so a guard obtained here with the flag down means any command
    /// dequeued later snapshots the state *after* the caller's changes.
    async fn lock_idle(&self) -> MutexGuard<'_, StreamInner> {
        loop {
            self.shared.wait_until_idle().await;
            let inner = self.shared.lock_inner().await;
            if !self.shared.is_busy() {
                return inner;
            }
            // A queued command went busy between the wait and the lock.
            drop(inner);
        }
    }

    /// Discards everything staged but not yet handed to hardware.
    ///
    /// Waits for the command worker to finish any in-flight operation
    /// first, so no sink is touched mid-drain.
    pub async fn flush(&self) -> Result<(), OffloadError> {
        let mut inner = self.lock_idle().await;
        inner.buffer.reset();
        inner.sinks.clear_awaiting_space();
        inner.frames_rendered = 0;
        Ok(())
    }

    /// Releases every sink and returns the stream to idle.
    ///
    /// Idempotent; the next write re-activates the route plan. Waits for
    /// the command worker before releasing hardware resources.
    pub async fn standby(&self) -> Result<(), OffloadError> {
        let mut inner = self.lock_idle().await;
        inner.sinks.teardown().await;
        inner.buffer.reset();
        inner.state = PlaybackState::Idle;
        Ok(())
    }

    /// Frames rendered since the stream started playing.
    ///
    /// Prefers the hardware timestamp of a compressed sink; falls back to
    /// the internal PCM frame counter.
    pub async fn get_render_position(&self) -> Result<u64, OffloadError> {
        let inner = self.shared.lock_inner().await;
        for (route, sink) in inner.sinks.sink_snapshot() {
            if route.is_compressed() {
                if let Ok(ts) = sink.get_timestamp().await {
                    return Ok(ts.rendered_frames);
                }
            }
        }
        Ok(inner.frames_rendered)
    }

    /// Render position paired with the instant it was sampled.
    pub async fn get_presentation_position(
        &self,
    ) -> Result<PresentationPosition, OffloadError> {
        let frames = self.get_render_position().await?;
        Ok(PresentationPosition {
            frames,
            at: Instant::now(),
        })
    }

    /// Registers the completion callback for write-ready and drain-ready
    /// events. Replaces any previous callback.
    pub fn set_completion_callback(&self, callback: EventCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    /// Sets gapless trim counts for the upcoming track.
    ///
    /// Every compressed sink receives the new values exactly once before
    /// its next write.
    pub async fn set_gapless_metadata(&self, metadata: GaplessMetadata) {
        let mut inner = self.shared.lock_inner().await;
        inner.sinks.set_gapless(metadata);
    }

    /// Current playback state.
    pub async fn state(&self) -> PlaybackState {
        self.shared.lock_inner().await.state
    }

    /// Returns current stream statistics.
    pub async fn stats(&self) -> StreamStats {
        let inner = self.shared.lock_inner().await;
        StreamStats {
            bytes_consumed: inner.bytes_consumed,
            frames_rendered: inner.frames_rendered,
            backpressure_events: inner.backpressure_events,
        }
    }

    /// Gracefully closes the stream.
    ///
    /// Standbys (stopping and closing every sink), then terminates the
    /// command worker and joins it before returning.
    pub async fn close(mut self) -> Result<(), OffloadError> {
        self.standby().await?;
        let _ = self.cmd_tx.send(OffloadCommand::Exit).await;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        Ok(())
    }
}

impl Drop for StreamOut {
    fn drop(&mut self) {
        if self.worker.is_some() {
            // Dropped without explicit close() - stop the worker; sinks
            // close when the records drop.
            let _ = self.cmd_tx.try_send(OffloadCommand::Exit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_state_display() {
        assert_eq!(PlaybackState::Idle.to_string(), "idle");
        assert_eq!(PlaybackState::Playing.to_string(), "playing");
        assert_eq!(PlaybackState::Paused.to_string(), "paused");
        assert_eq!(PlaybackState::default(), PlaybackState::Idle);
    }

    #[test]
    fn test_stream_stats_default() {
        let stats = StreamStats::default();
        assert_eq!(stats.bytes_consumed, 0);
        assert_eq!(stats.frames_rendered, 0);
        assert_eq!(stats.backpressure_events, 0);
    }

    #[tokio::test]
    async fn test_wait_until_idle_returns_immediately_when_idle() {
        use crate::config::{AudioFormat, StreamConfig};
        use crate::pipeline::staging::BitstreamBuffer;
        use crate::pipeline::{Route, RoutePlan};
        use crate::sink::SinkSet;

        let config = StreamConfig::default();
        let buffer = BitstreamBuffer::new(&config, 1024, [1024; Route::COUNT]).unwrap();
        let inner = StreamInner::new(
            buffer,
            SinkSet::new(),
            AudioFormat::PcmS16,
            2,
            None,
            RoutePlan::default(),
        );
        let shared = StreamShared::new(inner, config);

        // Must not hang.
        shared.wait_until_idle().await;

        shared.set_busy(true);
        assert!(shared.is_busy());
        shared.set_busy(false);
        shared.wait_until_idle().await;
    }
}
