//! Hardware sink boundary and the per-stream sink collection.
//!
//! A [`HardwareSink`] is an open handle to a hardware (or
//! hardware-adjacent) audio output bound to one [`Route`]. The crate never
//! implements a physical driver; production code supplies a
//! [`SinkOpener`] backed by the platform's PCM/compressed driver, and
//! tests use [`MockSink`](crate::MockSink).
//!
//! # Implementation notes
//!
//! - Methods take `&self` - use interior mutability (`Mutex`, atomics) so
//!   the command worker can operate on a sink snapshot outside the
//!   stream lock
//! - Raw-PCM sinks may block the caller inside `write` until the driver
//!   accepts everything
//! - Compressed sinks must return immediately; a short count means the
//!   sink's internal queue is full and the caller defers to the command
//!   worker rather than blocking

mod mock;
mod set;

pub use mock::{MockOpener, MockSink};
pub(crate) use set::SinkSet;
pub use set::SinkHandle;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AudioFormat, GaplessMetadata};
use crate::error::SinkError;
use crate::pipeline::Route;

/// Configuration handed to the driver when opening a sink.
///
/// Derived from the stream's format/sample-rate/channel-count and the
/// route being activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    /// Route this sink renders.
    pub route: Route,
    /// Bitmask of device classes fanned out to this sink.
    pub devices: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channels delivered to this sink (2 for the stereo route, the
    /// stream's channel count otherwise).
    pub channels: u16,
    /// Input format of the bytes this sink will receive.
    pub format: AudioFormat,
}

/// Rendering progress reported by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkTimestamp {
    /// Frames the hardware has rendered since the sink started.
    pub rendered_frames: u64,
    /// Sample rate the frame count is expressed in.
    pub sample_rate: u32,
}

/// An open hardware audio output bound to one route.
///
/// Mirrors the narrow driver calls the pipeline consumes: write, space
/// query, transport control, drain, and timestamp. Errors from these
/// methods are absorbed and logged when they happen inside the command
/// worker; open-time errors roll back the activation.
#[async_trait]
pub trait HardwareSink: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    /// Hands bytes to the driver, returning how many it accepted.
    ///
    /// Raw-PCM sinks may block until everything is accepted. Compressed
    /// sinks return immediately; a short count signals a full queue.
    async fn write(&self, bytes: &[u8]) -> Result<usize, SinkError>;

    /// Free bytes in the sink's internal queue.
    async fn available_space(&self) -> Result<usize, SinkError>;

    /// Starts rendering. Issued exactly once per compressed sink on the
    /// stream's first committed write.
    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Stops rendering.
    async fn stop(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Pauses rendering, keeping queued data.
    async fn pause(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Resumes rendering after a pause.
    async fn resume(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Blocks until all queued data has been rendered.
    async fn drain(&self) -> Result<(), SinkError>;

    /// Drains up to the last track boundary (early-notify drain).
    ///
    /// Defaults to a full drain for sinks without partial-drain support.
    async fn partial_drain(&self) -> Result<(), SinkError> {
        self.drain().await
    }

    /// Rendering progress, if the driver reports one.
    async fn get_timestamp(&self) -> Result<SinkTimestamp, SinkError> {
        Err(SinkError::TimestampUnavailable)
    }

    /// Delivers gapless trim counts for the upcoming track.
    ///
    /// Only meaningful for compressed sinks; the default ignores it.
    async fn set_gapless_metadata(&self, _metadata: GaplessMetadata) -> Result<(), SinkError> {
        Ok(())
    }

    /// Releases the driver handle. Further calls are invalid.
    async fn close(&self) -> Result<(), SinkError>;
}

/// Opens hardware sinks for the pipeline.
///
/// This is the seam to the platform's device layer: resolving a device
/// bitmask to a physical PCM or compressed device and opening it. The
/// pipeline calls it once per route during activation.
#[async_trait]
pub trait SinkOpener: Send + Sync {
    /// Opens a sink for the given configuration.
    async fn open(&self, config: &SinkConfig) -> Result<Arc<dyn HardwareSink>, SinkError>;
}

#[async_trait]
impl<O: SinkOpener + ?Sized> SinkOpener for Arc<O> {
    async fn open(&self, config: &SinkConfig) -> Result<Arc<dyn HardwareSink>, SinkError> {
        (**self).open(config).await
    }
}
