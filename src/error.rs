//! Error types for offload-audio.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`OffloadError`]): prevent a stream from opening, or
//!   reject an operation outright (bad state, unroutable configuration)
//! - **Driver errors** ([`SinkError`]): failures at the hardware sink
//!   boundary. Inside the command worker these are logged and absorbed;
//!   during activation they roll the whole attempt back.
//!
//! Backpressure is deliberately *not* an error: a full sink queue is
//! reported as a zero-byte write plus a deferred write-ready callback.

use crate::pipeline::Route;
use crate::stream::PlaybackState;

/// Fatal errors surfaced to the caller of the stream facade.
///
/// These are returned from [`OffloadStreamBuilder::open()`] and the
/// [`StreamOut`] control operations. Per-command hardware failures inside
/// the worker never surface here; they are logged and the worker moves on.
///
/// [`OffloadStreamBuilder::open()`]: crate::OffloadStreamBuilder::open
/// [`StreamOut`]: crate::StreamOut
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    /// A staging region could not be allocated at stream-open.
    ///
    /// All regions allocated so far are freed and the open call fails.
    #[error("failed to allocate {bytes} bytes for the {region} staging region")]
    AllocationFailed {
        /// Which region failed (input, or one of the output routes).
        region: &'static str,
        /// Requested size in bytes.
        bytes: usize,
    },

    /// A hardware sink failed to open during route activation.
    ///
    /// Every sink opened earlier in the same activation attempt has been
    /// closed again; the set is never left half-open.
    #[error("sink for route {route} failed to open: {reason}")]
    SinkOpenFailed {
        /// Route whose sink could not be opened.
        route: Route,
        /// Why the driver refused.
        reason: String,
    },

    /// No output devices were attached before opening the stream.
    #[error("no output devices attached - use attach_device() before open()")]
    NoDevicesAttached,

    /// Every attached device class classified as unroutable.
    ///
    /// Individual unroutable devices are skipped with a warning; a stream
    /// with zero resulting routes cannot do anything and fails to open.
    #[error("no route resolved for any attached device class")]
    NoRoutesResolved,

    /// No sink opener was configured before opening the stream.
    #[error("no sink opener configured - use opener() before open()")]
    NoOpenerConfigured,

    /// The route plan requires decoding but no decoder was provided.
    #[error("route plan requires decoding {format} but no decoder was configured")]
    MissingDecoder {
        /// The compressed input format that would need decoding.
        format: crate::AudioFormat,
    },

    /// The requested transition is not legal from the current state.
    #[error("{operation} is not valid while the stream is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// State the stream was in.
        state: PlaybackState,
    },

    /// The operation is not supported by the active route configuration.
    #[error("{operation} is not supported by the active routes")]
    Unsupported {
        /// The unsupported operation.
        operation: &'static str,
    },

    /// An output-region advance would have run past the region's capacity.
    ///
    /// The original implementation clamped this silently, dropping bytes;
    /// here it is reported so the caller can see the truncation.
    #[error("output region {route} overflow: {requested} bytes requested, {available} available")]
    RegionOverflow {
        /// Route whose region would have overflowed.
        route: Route,
        /// Bytes the caller asked to commit.
        requested: usize,
        /// Spare bytes actually left in the region.
        available: usize,
    },

    /// The external decoder reported a failure.
    #[error("decode failed: {reason}")]
    DecodeFailed {
        /// Decoder-provided description.
        reason: String,
    },

    /// The stream has already been closed.
    #[error("stream is closed")]
    Closed,
}

/// Errors that can occur at the hardware sink boundary.
///
/// Returned by [`HardwareSink`](crate::HardwareSink) and
/// [`SinkOpener`](crate::SinkOpener) implementations. During activation an
/// open failure is fatal to the attempt; inside the command worker these
/// are logged and the loop continues with the next command.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The driver refused to open the sink.
    #[error("open failed: {reason}")]
    OpenFailed {
        /// Driver-provided reason.
        reason: String,
    },

    /// The device is currently held by another client.
    #[error("device busy")]
    DeviceBusy,

    /// The device bitmask resolved to no usable physical device.
    #[error("invalid device mask {devices:#06x}")]
    InvalidDevice {
        /// The offending device bitmask.
        devices: u32,
    },

    /// A write to the sink failed.
    #[error("write failed: {reason}")]
    WriteFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// The sink does not report a rendering timestamp.
    #[error("timestamp unavailable")]
    TimestampUnavailable,

    /// The sink handle was already closed.
    #[error("sink closed")]
    Closed,

    /// Custom error for user-implemented sinks.
    #[error("{0}")]
    Custom(String),
}

impl SinkError {
    /// Creates a custom sink error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates an open-failed error with the given reason.
    pub fn open_failed(reason: impl Into<String>) -> Self {
        Self::OpenFailed {
            reason: reason.into(),
        }
    }

    /// Creates a write-failed error with the given reason.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            reason: reason.into(),
        }
    }
}
