//! Builder pattern for opening an [`OffloadStream`].

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{
    AudioFormat, DeviceClass, PlaybackMode, StreamConfig, OUTPUT_BUFFER_MULTIPLIER,
    SAMPLE_WIDTH_BYTES,
};
use crate::error::OffloadError;
use crate::event::{event_callback, EventCallback, StreamEvent};
use crate::pipeline::command::run_worker;
use crate::pipeline::render::Decoder;
use crate::pipeline::routing::classify;
use crate::pipeline::staging::BitstreamBuffer;
use crate::pipeline::Route;
use crate::sink::{SinkOpener, SinkSet};
use crate::stream::{StreamInner, StreamOut, StreamShared};

/// Channel capacity for offload commands.
/// Small on purpose: WaitForBuffer is deduplicated at the source and the
/// control surface only ever has a drain or two in flight.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Entry point for opening offload streams.
///
/// # Example
///
/// ```no_run
/// use offload_audio::{
///     AudioFormat, DeviceClass, MockOpener, OffloadStream, PlaybackMode,
/// };
///
/// # async fn open() -> Result<(), offload_audio::OffloadError> {
/// let stream = OffloadStream::builder()
///     .format(AudioFormat::Ac3)
///     .sample_rate(48_000)
///     .channels(6)
///     .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
///     .opener(MockOpener::new(64 * 1024))
///     .open()
///     .await?;
/// # let _ = stream;
/// # Ok(())
/// # }
/// ```
pub struct OffloadStream;

impl OffloadStream {
    /// Creates a builder with default settings.
    pub fn builder() -> OffloadStreamBuilder {
        OffloadStreamBuilder::new()
    }
}

/// Builder for configuring and opening an offload stream.
///
/// Open performs, in order: route classification, staging-region
/// allocation (fatal on failure, everything rolled back), sink activation
/// (rolled back on partial failure), and the command-worker spawn.
#[must_use]
pub struct OffloadStreamBuilder {
    format: AudioFormat,
    sample_rate: u32,
    channels: u16,
    /// Attached device classes with their playback overrides.
    devices: Vec<(DeviceClass, PlaybackMode)>,
    opener: Option<Arc<dyn SinkOpener>>,
    decoder: Option<Box<dyn Decoder>>,
    config: StreamConfig,
    callback: Option<EventCallback>,
}

impl Default for OffloadStreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OffloadStreamBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            format: AudioFormat::PcmS16,
            sample_rate: 48_000,
            channels: 2,
            devices: Vec::new(),
            opener: None,
            decoder: None,
            config: StreamConfig::default(),
            callback: None,
        }
    }

    /// Input format of the byte stream.
    ///
    /// Default: [`AudioFormat::PcmS16`]
    pub fn format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    /// Sample rate in Hz. Default: 48000
    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Source channel count. Default: 2
    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Attaches an output device class with its playback override.
    ///
    /// Classes resolving to the same route share one sink; classes
    /// resolving to different routes activate in parallel.
    pub fn attach_device(mut self, class: DeviceClass, mode: PlaybackMode) -> Self {
        self.devices.push((class, mode));
        self
    }

    /// Sets the driver backend that opens hardware sinks.
    pub fn opener<O: SinkOpener + 'static>(mut self, opener: O) -> Self {
        self.opener = Some(Arc::new(opener));
        self
    }

    /// Sets the decoder used when a PCM route is fed from a compressed
    /// source. Not needed for passthrough-only or PCM-input streams.
    pub fn decoder<D: Decoder + 'static>(mut self, decoder: D) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    /// Sets stream behavior configuration.
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers the completion/event callback.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        self.callback = Some(event_callback(f));
        self
    }

    /// Classifies routes, allocates staging, activates sinks, and spawns
    /// the command worker.
    ///
    /// # Errors
    ///
    /// [`NoDevicesAttached`], [`NoOpenerConfigured`], [`NoRoutesResolved`],
    /// [`MissingDecoder`], [`AllocationFailed`], or [`SinkOpenFailed`].
    ///
    /// [`NoDevicesAttached`]: OffloadError::NoDevicesAttached
    /// [`NoOpenerConfigured`]: OffloadError::NoOpenerConfigured
    /// [`NoRoutesResolved`]: OffloadError::NoRoutesResolved
    /// [`MissingDecoder`]: OffloadError::MissingDecoder
    /// [`AllocationFailed`]: OffloadError::AllocationFailed
    /// [`SinkOpenFailed`]: OffloadError::SinkOpenFailed
    pub async fn open(self) -> Result<StreamOut, OffloadError> {
        if self.devices.is_empty() {
            return Err(OffloadError::NoDevicesAttached);
        }
        let opener = self.opener.ok_or(OffloadError::NoOpenerConfigured)?;

        let plan = classify(self.format, self.channels, &self.devices);
        if plan.is_empty() {
            return Err(OffloadError::NoRoutesResolved);
        }
        if plan.needs_decoder(self.format) && self.decoder.is_none() {
            return Err(OffloadError::MissingDecoder {
                format: self.format,
            });
        }

        // Input holds buffering_factor + 1 worst-case frames; each output
        // region is channel count x sample width x a fixed multiplier.
        let input_capacity = (self.config.buffering_factor + 1) * self.format.max_frame_size();
        let mut output_capacities = [0usize; Route::COUNT];
        for route in Route::all() {
            let channels = match route {
                Route::StereoPcm => 2,
                _ => usize::from(self.channels.max(1)),
            };
            output_capacities[route.index()] =
                channels * SAMPLE_WIDTH_BYTES * OUTPUT_BUFFER_MULTIPLIER;
        }
        let buffer = BitstreamBuffer::new(&self.config, input_capacity, output_capacities)?;

        let mut sinks = SinkSet::new();
        sinks
            .activate(
                &plan,
                opener.as_ref(),
                self.format,
                self.sample_rate,
                self.channels,
            )
            .await?;

        tracing::debug!(
            format = %self.format,
            route_mask = plan.route_mask(),
            sinks = sinks.len(),
            "offload stream opened"
        );

        let inner = StreamInner::new(
            buffer,
            sinks,
            self.format,
            self.channels,
            self.decoder,
            plan,
        );
        let shared = Arc::new(StreamShared::new(inner, self.config));
        if let Some(callback) = self.callback {
            *shared.callback.lock() = Some(callback);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let worker = tokio::spawn(run_worker(shared.clone(), cmd_rx));

        Ok(StreamOut::new(
            shared,
            cmd_tx,
            worker,
            opener,
            self.format,
            self.sample_rate,
            self.channels,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MockOpener;

    #[tokio::test]
    async fn test_open_requires_devices() {
        let result = OffloadStream::builder()
            .opener(MockOpener::new(1024))
            .open()
            .await;
        assert!(matches!(result, Err(OffloadError::NoDevicesAttached)));
    }

    #[tokio::test]
    async fn test_open_requires_opener() {
        let result = OffloadStream::builder()
            .attach_device(DeviceClass::Speaker, PlaybackMode::StereoPcm)
            .open()
            .await;
        assert!(matches!(result, Err(OffloadError::NoOpenerConfigured)));
    }

    #[tokio::test]
    async fn test_open_requires_a_route() {
        // PCM input cannot be passed through; the only device class is
        // unroutable and the plan comes back empty.
        let result = OffloadStream::builder()
            .format(AudioFormat::PcmS16)
            .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
            .opener(MockOpener::new(1024))
            .open()
            .await;
        assert!(matches!(result, Err(OffloadError::NoRoutesResolved)));
    }

    #[tokio::test]
    async fn test_open_requires_decoder_for_decode_routes() {
        let result = OffloadStream::builder()
            .format(AudioFormat::Mp3)
            .attach_device(DeviceClass::Speaker, PlaybackMode::StereoPcm)
            .opener(MockOpener::new(1024))
            .open()
            .await;
        assert!(matches!(
            result,
            Err(OffloadError::MissingDecoder {
                format: AudioFormat::Mp3
            })
        ));
    }

    #[tokio::test]
    async fn test_open_surfaces_sink_failure_after_rollback() {
        let opener = Arc::new(MockOpener::new(1024));
        opener.fail_route(Route::CompressedPassthrough);

        let result = OffloadStream::builder()
            .format(AudioFormat::Ac3)
            .attach_device(DeviceClass::Speaker, PlaybackMode::StereoPcm)
            .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
            .opener(opener.clone())
            .decoder(NullDecoder)
            .open()
            .await;

        assert!(matches!(result, Err(OffloadError::SinkOpenFailed { .. })));
        // The stereo sink opened first and was closed by the rollback.
        let stereo = opener.sink_for(Route::StereoPcm).unwrap();
        assert_eq!(stereo.closes(), 1);
    }

    #[tokio::test]
    async fn test_open_passthrough_only() {
        let stream = OffloadStream::builder()
            .format(AudioFormat::Ac3)
            .sample_rate(48_000)
            .channels(6)
            .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
            .opener(MockOpener::new(64 * 1024))
            .open()
            .await
            .unwrap();

        assert_eq!(stream.format(), AudioFormat::Ac3);
        assert_eq!(stream.channels(), 6);
        stream.close().await.unwrap();
    }

    struct NullDecoder;

    impl Decoder for NullDecoder {
        fn decode(
            &mut self,
            input: &[u8],
            _route: Route,
            _output: &mut [u8],
        ) -> Result<crate::DecodeStep, OffloadError> {
            Ok(crate::DecodeStep {
                consumed: input.len(),
                produced: 0,
            })
        }
    }
}
