//! Completion and monitoring events.
//!
//! Events are how the asynchronous side of the pipeline talks back to the
//! framework: the command worker reports write-ready and drain-ready
//! transitions, and the render step reports sink write failures. The
//! stream keeps running after any event.

use std::sync::Arc;

use crate::pipeline::Route;

/// Events delivered through the stream's completion callback.
///
/// `WriteReady` and `DrainComplete` are the offload contract: a write that
/// returned zero bytes consumed should be retried once `WriteReady`
/// arrives, and a `drain()` call completes when `DrainComplete` fires.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A sink that previously reported no space can accept data again.
    ///
    /// Emitted by the command worker after a `WaitForBuffer` command
    /// finishes. The framework should retry its last write.
    WriteReady,

    /// All compressed sinks finished draining.
    DrainComplete {
        /// `true` for an early-notify (partial) drain.
        partial: bool,
    },

    /// A sink write or hardware operation failed.
    ///
    /// The pipeline absorbs the failure and continues; the affected sink
    /// may stay inconsistent until the next standby or teardown.
    SinkError {
        /// Route of the affected sink.
        route: Route,
        /// Description of the failure.
        error: String,
    },
}

/// Callback type for receiving stream events.
///
/// Register via [`StreamOut::set_completion_callback`] or
/// [`OffloadStreamBuilder::on_event`]. The callback is always invoked with
/// the stream lock released; it may call back into the stream.
///
/// [`StreamOut::set_completion_callback`]: crate::StreamOut::set_completion_callback
/// [`OffloadStreamBuilder::on_event`]: crate::OffloadStreamBuilder::on_event
pub type EventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use offload_audio::{event_callback, StreamEvent};
///
/// let callback = event_callback(|event| {
///     if matches!(event, StreamEvent::WriteReady) {
///         // wake the writer
///     }
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(StreamEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
