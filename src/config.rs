//! Configuration types for offload streams.

use std::time::Duration;

/// Bytes per sample for the 16-bit PCM pipeline.
pub(crate) const SAMPLE_WIDTH_BYTES: usize = 2;

/// Frames of headroom in each output staging region.
///
/// Output region capacity is `channel_count * sample_width * this`.
pub(crate) const OUTPUT_BUFFER_MULTIPLIER: usize = 2048;

/// Input format of the byte stream handed to [`StreamOut::write`].
///
/// PCM formats tolerate partial frames and can always be rendered as soon
/// as any bytes are staged; compressed formats are only admitted to the
/// render step once a worst-case frame is buffered.
///
/// [`StreamOut::write`]: crate::StreamOut::write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    /// Interleaved signed 16-bit PCM.
    PcmS16,
    /// MPEG-1/2 Layer III.
    Mp3,
    /// AAC in ADTS framing.
    Aac,
    /// Free Lossless Audio Codec.
    Flac,
    /// Dolby Digital (AC-3).
    Ac3,
    /// Dolby Digital Plus (E-AC-3).
    Eac3,
}

impl AudioFormat {
    /// Returns `true` for compressed bitstream formats.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        !matches!(self, Self::PcmS16)
    }

    /// Worst-case encoded frame size in bytes.
    ///
    /// Sizes the input staging region (`(buffering_factor + 1)` worst-case
    /// frames) and gates decode admission for compressed formats.
    #[must_use]
    pub fn max_frame_size(self) -> usize {
        match self {
            // PCM has no framing; stage in fixed quanta.
            Self::PcmS16 => 4096,
            Self::Mp3 => 2048,
            Self::Aac => 8192,
            Self::Flac => 65536,
            // An AC-3 syncframe never exceeds 3840 bytes.
            Self::Ac3 => 3840,
            Self::Eac3 => 8192,
        }
    }

    /// Minimum staged bytes before a decode/copy step is admitted.
    ///
    /// Zero for formats that tolerate partial frames, one worst-case frame
    /// for formats that do not.
    #[must_use]
    pub fn min_bytes_to_decode(self) -> usize {
        if self.is_compressed() {
            self.max_frame_size()
        } else {
            0
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PcmS16 => "pcm-s16",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
        };
        f.write_str(name)
    }
}

/// Output device classes a stream can be attached to.
///
/// Physical-device resolution (which PCM/compressed device a class maps
/// to) lives behind the [`SinkOpener`](crate::SinkOpener) boundary; the
/// pipeline only works with class bitmasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Built-in speaker.
    Speaker,
    /// Wired headphones / line out.
    WiredHeadphones,
    /// HDMI output.
    Hdmi,
    /// USB audio device or dock.
    Usb,
    /// Bluetooth A2DP endpoint.
    BluetoothA2dp,
}

impl DeviceClass {
    /// Stable bit for device bitmasks.
    #[must_use]
    pub fn bit(self) -> u32 {
        match self {
            Self::Speaker => 1 << 0,
            Self::WiredHeadphones => 1 << 1,
            Self::Hdmi => 1 << 2,
            Self::Usb => 1 << 3,
            Self::BluetoothA2dp => 1 << 4,
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Speaker => "speaker",
            Self::WiredHeadphones => "wired-headphones",
            Self::Hdmi => "hdmi",
            Self::Usb => "usb",
            Self::BluetoothA2dp => "bluetooth-a2dp",
        };
        f.write_str(name)
    }
}

/// Per-device-class playback preference.
///
/// Combined with the input format in the route decision table to pick the
/// output representation produced for that device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackMode {
    /// Prefer uncompressed stereo PCM.
    #[default]
    StereoPcm,
    /// Prefer uncompressed multichannel PCM.
    MultichannelPcm,
    /// Prefer forwarding the compressed bitstream unmodified.
    Passthrough,
    /// Prefer DSP-side transcoding to another compressed format.
    DspTranscode,
    /// Host-side transcoding. Not routable in this configuration; device
    /// classes requesting it are skipped with a warning.
    SoftwareTranscode,
}

impl std::fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StereoPcm => "stereo-pcm",
            Self::MultichannelPcm => "multichannel-pcm",
            Self::Passthrough => "passthrough",
            Self::DspTranscode => "dsp-transcode",
            Self::SoftwareTranscode => "software-transcode",
        };
        f.write_str(name)
    }
}

/// Gapless playback metadata for track boundaries.
///
/// Set once per track via [`StreamOut::set_gapless_metadata`]; delivered to
/// every compressed sink exactly once before that sink's next write.
///
/// [`StreamOut::set_gapless_metadata`]: crate::StreamOut::set_gapless_metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GaplessMetadata {
    /// Samples of encoder delay to trim at track start.
    pub encoder_delay: u32,
    /// Samples of encoder padding to trim at track end.
    pub encoder_padding: u32,
}

/// Configuration for stream behavior.
///
/// Use [`StreamConfig::default()`] for sensible defaults, or customize as
/// needed.
///
/// # Example
///
/// ```
/// use offload_audio::StreamConfig;
///
/// let config = StreamConfig {
///     buffering_factor: 8,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Worst-case input frames buffered before compaction kicks in.
    ///
    /// The input staging region holds `buffering_factor + 1` worst-case
    /// frames; compaction to the region base is amortized until the
    /// append counter saturates at this value.
    /// Default: 4
    pub buffering_factor: usize,

    /// Poll interval the command worker uses while waiting for sink space.
    ///
    /// Default: 5ms
    pub sink_poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffering_factor: 4,
            sink_poll_interval: Duration::from_millis(5),
        }
    }
}
