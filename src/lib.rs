//! # offload-audio
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Compressed/PCM offload rendering pipeline with multi-route sink fan-out.
//!
//! `offload-audio` takes a stream of encoded or raw audio bytes from a
//! framework writer, decides per attached output device which output
//! representations must be produced (uncompressed stereo, uncompressed
//! multichannel, compressed passthrough, transcoded compressed), stages
//! data into per-route buffers, and fans it out to one or more
//! simultaneous hardware sinks - with asynchronous pause/resume/drain/
//! flush semantics and exact playback-position feedback.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use offload_audio::{
//!     AudioFormat, DeviceClass, OffloadStream, PlaybackMode, StreamEvent,
//! };
//!
//! let stream = OffloadStream::builder()
//!     .format(AudioFormat::Ac3)
//!     .sample_rate(48_000)
//!     .channels(6)
//!     .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
//!     .attach_device(DeviceClass::Speaker, PlaybackMode::StereoPcm)
//!     .opener(driver_backend)          // your SinkOpener implementation
//!     .decoder(dsp_decoder)            // needed for the stereo route
//!     .on_event(|e| tracing::debug!(?e, "stream event"))
//!     .open()
//!     .await?;
//!
//! // Feed the bitstream; zero consumed means retry after WriteReady.
//! let consumed = stream.write(&encoded_bytes).await?;
//!
//! stream.drain(false).await?;     // DrainComplete arrives via callback
//! stream.close().await?;
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary per stream:
//!
//! - **Writer path**: appends to the input staging region and runs the
//!   decode/copy step; never blocks on a compressed sink
//! - **Staging buffer**: one bounded input region and four per-route
//!   output regions with explicit residue compaction
//! - **Command worker**: a dedicated task that absorbs every blocking
//!   sink operation (wait-for-space, drain, partial drain)
//!
//! Backpressure from a compressed sink is resolved by deferral: the write
//! reports zero bytes consumed, a wait command goes to the worker, and
//! the framework retries after the write-ready callback.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod config;
mod error;
mod event;
mod pipeline;
mod sink;
mod stream;

pub use builder::{OffloadStream, OffloadStreamBuilder};
pub use config::{AudioFormat, DeviceClass, GaplessMetadata, PlaybackMode, StreamConfig};
pub use error::{OffloadError, SinkError};
pub use event::{event_callback, EventCallback, StreamEvent};
pub use pipeline::render::{DecodeStep, Decoder};
pub use pipeline::routing::{classify, Route, RouteEntry, RoutePlan};
pub use sink::{HardwareSink, MockOpener, MockSink, SinkConfig, SinkOpener, SinkTimestamp};
pub use stream::{PlaybackState, PresentationPosition, StreamOut, StreamStats};
