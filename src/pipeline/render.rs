//! The decode/copy step between staged input and the sinks.
//!
//! Passthrough and DSP-transcode routes copy staged bytes verbatim into
//! their output regions; PCM routes fed from a compressed source go
//! through the external [`Decoder`] seam. Production is speculative:
//! bytes land in a region's spare space first, every target sink's free
//! space is consulted, and only then is anything committed. A shortfall
//! leaves the input read offset at its pre-attempt value so the retry
//! reprocesses the same bytes, enqueues a single `WaitForBuffer`, and
//! reports zero consumed.

use tokio::sync::mpsc;

use crate::config::{AudioFormat, SAMPLE_WIDTH_BYTES};
use crate::error::OffloadError;
use crate::event::StreamEvent;
use crate::pipeline::command::OffloadCommand;
use crate::pipeline::staging::BitstreamBuffer;
use crate::pipeline::Route;
use crate::sink::{SinkHandle, SinkSet};

/// Byte counts reported by one decode invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStep {
    /// Input bytes the decoder retired.
    pub consumed: usize,
    /// Output bytes written into the region.
    pub produced: usize,
}

/// External decode seam.
///
/// The pipeline never decodes audio itself; a decoder is injected at
/// build time when the route plan needs PCM produced from a compressed
/// source. When several decode routes are active the decoder is invoked
/// once per route over the same input window and must report the same
/// consumed count for each.
pub trait Decoder: Send {
    /// Decodes from `input` into `output`, returning the byte counts.
    ///
    /// Returning `consumed: 0, produced: 0` means "not enough input yet".
    fn decode(
        &mut self,
        input: &[u8],
        route: Route,
        output: &mut [u8],
    ) -> Result<DecodeStep, OffloadError>;
}

/// What one render pass did.
pub(crate) struct RenderOutcome {
    /// Input bytes retired from the staging buffer.
    pub consumed: usize,
    /// A sink could not take the produced bytes; a `WaitForBuffer` is
    /// pending and the caller should report zero progress.
    pub backpressure: bool,
    /// PCM frames handed to hardware this pass (position fallback).
    pub pcm_frames: u64,
    /// Events to deliver once the stream lock is released.
    pub events: Vec<StreamEvent>,
}

impl RenderOutcome {
    fn stalled(backpressure: bool, events: Vec<StreamEvent>) -> Self {
        Self {
            consumed: 0,
            backpressure,
            pcm_frames: 0,
            events,
        }
    }
}

/// Consumes staged input bytes and fans them out to the active routes.
pub(crate) struct RenderEngine {
    format: AudioFormat,
    channels: u16,
    min_bytes: usize,
    decoder: Option<Box<dyn Decoder>>,
}

impl RenderEngine {
    pub fn new(format: AudioFormat, channels: u16, decoder: Option<Box<dyn Decoder>>) -> Self {
        Self {
            format,
            channels,
            min_bytes: format.min_bytes_to_decode(),
            decoder,
        }
    }

    fn frame_bytes(&self, route: Route) -> usize {
        let channels = match route {
            Route::StereoPcm => 2,
            _ => usize::from(self.channels.max(1)),
        };
        channels * SAMPLE_WIDTH_BYTES
    }

    /// Whether a route is produced by decoding rather than copying.
    fn is_decode_route(&self, route: Route) -> bool {
        route.is_pcm() && self.format.is_compressed()
    }

    /// Marks sinks as awaiting space and enqueues `WaitForBuffer` once.
    ///
    /// `short` pairs each starved sink with the free byte count its
    /// deferred write needs. The command stays un-reenqueued while any
    /// sink is already flagged, so a fast-retrying writer cannot flood
    /// the command queue.
    fn defer_to_worker(
        sinks: &mut SinkSet,
        short: &[(SinkHandle, usize)],
        cmd_tx: &mpsc::Sender<OffloadCommand>,
    ) {
        let already_pending = sinks.any_awaiting_space();
        for &(handle, required) in short {
            sinks.set_awaiting_space(handle, required);
        }
        if !already_pending {
            if let Err(err) = cmd_tx.try_send(OffloadCommand::WaitForBuffer) {
                tracing::warn!(error = %err, "could not enqueue wait-for-buffer");
            }
        }
    }

    /// Runs one render pass: flush residue, admit, produce, check, commit.
    pub async fn process(
        &mut self,
        buffer: &mut BitstreamBuffer,
        sinks: &mut SinkSet,
        cmd_tx: &mpsc::Sender<OffloadCommand>,
    ) -> Result<RenderOutcome, OffloadError> {
        let mut events = Vec::new();
        let targets = sinks.targets();
        if targets.is_empty() {
            // No active sinks: keep the input staged rather than consume
            // it into nowhere.
            return Ok(RenderOutcome::stalled(false, events));
        }

        // Residue first: bytes committed on an earlier pass but not yet
        // accepted by their sink must drain before new input is admitted,
        // or the routes drift apart.
        for &(handle, route) in &targets {
            let pending_len = buffer.output_pending(route).len();
            if pending_len == 0 {
                continue;
            }
            match sinks.write(handle, buffer.output_pending(route)).await {
                Ok(accepted) => {
                    buffer.compact_output(route, accepted);
                    if accepted < pending_len {
                        Self::defer_to_worker(sinks, &[(handle, pending_len - accepted)], cmd_tx);
                        return Ok(RenderOutcome::stalled(true, events));
                    }
                }
                Err(err) => {
                    tracing::error!(route = %route, error = %err, "residue write failed");
                    events.push(StreamEvent::SinkError {
                        route,
                        error: err.to_string(),
                    });
                }
            }
        }

        if !buffer.has_enough_to_decode(self.min_bytes) {
            return Ok(RenderOutcome::stalled(false, events));
        }

        // Produce speculatively into each region's spare space. Decode
        // routes run first and fix the joint consumed count.
        let mut staged: Vec<(SinkHandle, Route, usize)> = Vec::with_capacity(targets.len());
        let mut consumed: Option<usize> = None;

        for &(handle, route) in &targets {
            if !self.is_decode_route(route) {
                continue;
            }
            let decoder = self
                .decoder
                .as_mut()
                .ok_or(OffloadError::MissingDecoder {
                    format: self.format,
                })?;
            let (input, spare) = buffer.stage(route);
            let step = decoder.decode(input, route, spare)?;
            match consumed {
                None => consumed = Some(step.consumed),
                Some(prev) if prev != step.consumed => {
                    return Err(OffloadError::DecodeFailed {
                        reason: format!(
                            "decoder consumed {} bytes for {route} but {prev} for an earlier route",
                            step.consumed
                        ),
                    });
                }
                Some(_) => {}
            }
            staged.push((handle, route, step.produced));
        }

        let consumed = consumed.unwrap_or_else(|| buffer.pending_input().len());
        if consumed == 0 && staged.iter().all(|&(_, _, produced)| produced == 0) {
            // Decoder wants more input.
            return Ok(RenderOutcome::stalled(false, events));
        }

        for &(handle, route) in &targets {
            if self.is_decode_route(route) {
                continue;
            }
            let (input, spare) = buffer.stage(route);
            if spare.len() < consumed {
                // Region congested because its sink stopped draining.
                Self::defer_to_worker(sinks, &[(handle, consumed)], cmd_tx);
                return Ok(RenderOutcome::stalled(true, events));
            }
            spare[..consumed].copy_from_slice(&input[..consumed]);
            staged.push((handle, route, consumed));
        }

        // Admission: every target sink must have room for what was just
        // produced, or nothing at all is committed.
        let mut short = Vec::new();
        for &(handle, route, produced) in &staged {
            let space = match sinks.available_space(handle).await {
                Ok(space) => space,
                Err(err) => {
                    tracing::error!(route = %route, error = %err, "space query failed");
                    events.push(StreamEvent::SinkError {
                        route,
                        error: err.to_string(),
                    });
                    0
                }
            };
            if space < produced {
                short.push((handle, produced));
            }
        }
        if !short.is_empty() {
            Self::defer_to_worker(sinks, &short, cmd_tx);
            return Ok(RenderOutcome::stalled(true, events));
        }

        // Commit and hand off.
        let mut pcm_frames = 0u64;
        let mut backpressure = false;
        for &(handle, route, produced) in &staged {
            buffer.advance_output(route, produced)?;
            let pending_len = buffer.output_pending(route).len();
            let accepted = match sinks.write(handle, buffer.output_pending(route)).await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(route = %route, error = %err, "sink write failed");
                    events.push(StreamEvent::SinkError {
                        route,
                        error: err.to_string(),
                    });
                    0
                }
            };
            buffer.compact_output(route, accepted);
            if route.is_pcm() {
                pcm_frames = pcm_frames.max((accepted / self.frame_bytes(route)) as u64);
            }
            if accepted < pending_len {
                Self::defer_to_worker(sinks, &[(handle, pending_len - accepted)], cmd_tx);
                backpressure = true;
            }
        }

        buffer.compact_input(consumed);

        Ok(RenderOutcome {
            consumed,
            backpressure,
            pcm_frames,
            events,
        })
    }
}
