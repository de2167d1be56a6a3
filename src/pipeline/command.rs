//! The per-stream offload command worker.
//!
//! All potentially-blocking sink operations (waiting for queue space,
//! drains) run here, off the writer's call path. Commands arrive through
//! a bounded channel and are processed strictly in FIFO order; the
//! stream-wide busy flag is raised around each command so flush and
//! standby can wait for the worker to step off the sinks before touching
//! them.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::event::StreamEvent;
use crate::pipeline::Route;
use crate::sink::HardwareSink;
use crate::stream::StreamShared;

/// Asynchronous operations deferred to the command worker.
///
/// Queued by the writer/render path and the control surface, dequeued
/// strictly FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OffloadCommand {
    /// Terminate the worker, discarding anything still queued.
    Exit,
    /// Block until every compressed sink has rendered its queue.
    Drain,
    /// Drain up to the last track boundary (early notify).
    PartialDrain,
    /// Poll sinks flagged as out of space until they can accept data.
    WaitForBuffer,
}

/// Runs the command loop until `Exit`.
///
/// Hardware failures inside the loop are logged and absorbed; the loop
/// always continues to the next command. The busy flag is set before a
/// command executes and cleared (with a wakeup) after, and the completion
/// callback is invoked with the stream lock released.
pub(crate) async fn run_worker(shared: Arc<StreamShared>, mut rx: mpsc::Receiver<OffloadCommand>) {
    while let Some(command) = rx.recv().await {
        if command == OffloadCommand::Exit {
            // Free whatever is still queued; nothing may run after Exit.
            while rx.try_recv().is_ok() {}
            break;
        }

        shared.set_busy(true);
        let event = execute(&shared, command).await;
        shared.set_busy(false);

        if let Some(event) = event {
            if let Some(callback) = shared.callback() {
                callback(event);
            }
        }
    }
    tracing::debug!("offload command worker exited");
}

async fn execute(shared: &StreamShared, command: OffloadCommand) -> Option<StreamEvent> {
    match command {
        OffloadCommand::Exit => None,
        OffloadCommand::WaitForBuffer => {
            let waiting = shared.lock_inner().await.sinks.awaiting_snapshot();
            for (route, sink, required) in waiting {
                wait_for_space(route, sink.as_ref(), required, shared).await;
            }
            shared.lock_inner().await.sinks.clear_awaiting_space();
            Some(StreamEvent::WriteReady)
        }
        OffloadCommand::Drain => {
            drain_compressed(shared, false).await;
            Some(StreamEvent::DrainComplete { partial: false })
        }
        OffloadCommand::PartialDrain => {
            drain_compressed(shared, true).await;
            Some(StreamEvent::DrainComplete { partial: true })
        }
    }
}

/// Polls one sink until it has room for the deferred write.
///
/// Hardware operations are assumed to complete or error, never hang; an
/// error ends the wait so the writer's retry can surface it.
async fn wait_for_space(
    route: Route,
    sink: &dyn HardwareSink,
    required: usize,
    shared: &StreamShared,
) {
    loop {
        match sink.available_space().await {
            Ok(space) if space >= required => return,
            Ok(_) => tokio::time::sleep(shared.config.sink_poll_interval).await,
            Err(err) => {
                tracing::error!(route = %route, sink = sink.name(), error = %err, "space poll failed");
                return;
            }
        }
    }
}

/// Issues drain (or partial drain) on every compressed sink.
///
/// Each sink drains independently; one failure does not block the others.
async fn drain_compressed(shared: &StreamShared, partial: bool) {
    let sinks: Vec<(Route, Arc<dyn HardwareSink>)> = shared
        .lock_inner()
        .await
        .sinks
        .sink_snapshot()
        .into_iter()
        .filter(|(route, _)| route.is_compressed())
        .collect();

    let results = join_all(sinks.iter().map(|(_, sink)| async move {
        if partial {
            sink.partial_drain().await
        } else {
            sink.drain().await
        }
    }))
    .await;

    for ((route, sink), result) in sinks.iter().zip(results) {
        if let Err(err) = result {
            tracing::error!(route = %route, sink = sink.name(), error = %err, "drain failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::config::{AudioFormat, DeviceClass, PlaybackMode, StreamConfig};
    use crate::event::event_callback;
    use crate::pipeline::routing::classify;
    use crate::pipeline::staging::BitstreamBuffer;
    use crate::sink::{MockOpener, SinkSet};
    use crate::stream::StreamInner;

    async fn shared_with_passthrough(capacity: usize) -> (Arc<StreamShared>, MockOpener) {
        let config = StreamConfig::default();
        let plan = classify(
            AudioFormat::Ac3,
            2,
            &[(DeviceClass::Hdmi, PlaybackMode::Passthrough)],
        );
        let opener = MockOpener::new(capacity);
        let mut sinks = SinkSet::new();
        sinks
            .activate(&plan, &opener, AudioFormat::Ac3, 48_000, 2)
            .await
            .unwrap();
        let buffer = BitstreamBuffer::new(&config, 1 << 15, [1 << 15; Route::COUNT]).unwrap();
        let inner = StreamInner::new(buffer, sinks, AudioFormat::Ac3, 2, None, plan);
        (Arc::new(StreamShared::new(inner, config)), opener)
    }

    #[tokio::test]
    async fn test_drain_command_reaches_compressed_sinks() {
        let (shared, opener) = shared_with_passthrough(1 << 15).await;
        let drained = Arc::new(AtomicUsize::new(0));
        let drained_cb = drained.clone();
        *shared.callback.lock() = Some(event_callback(move |event| {
            if matches!(event, StreamEvent::DrainComplete { partial: false }) {
                drained_cb.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run_worker(shared.clone(), rx));

        tx.send(OffloadCommand::Drain).await.unwrap();
        tx.send(OffloadCommand::Exit).await.unwrap();
        worker.await.unwrap();

        let sink = opener.sink_for(Route::CompressedPassthrough).unwrap();
        assert_eq!(sink.drains(), 1);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
        assert!(!shared.is_busy());
    }

    #[tokio::test]
    async fn test_wait_for_buffer_polls_until_space() {
        let (shared, opener) = shared_with_passthrough(8).await;
        let sink = opener.sink_for(Route::CompressedPassthrough).unwrap();

        // Fill the queue and flag the sink as waiting for 8 free bytes.
        sink.write(&[0u8; 8]).await.unwrap();
        {
            let mut inner = shared.lock_inner().await;
            let (handle, _) = inner.sinks.targets()[0];
            inner.sinks.set_awaiting_space(handle, 8);
        }

        let ready = Arc::new(AtomicUsize::new(0));
        let ready_cb = ready.clone();
        *shared.callback.lock() = Some(event_callback(move |event| {
            if matches!(event, StreamEvent::WriteReady) {
                ready_cb.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run_worker(shared.clone(), rx));
        tx.send(OffloadCommand::WaitForBuffer).await.unwrap();

        // Let the worker spin on the full queue, then free space.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ready.load(Ordering::SeqCst), 0);
        sink.render(8);

        tx.send(OffloadCommand::Exit).await.unwrap();
        worker.await.unwrap();

        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert!(!shared.lock_inner().await.sinks.any_awaiting_space());
    }

    #[tokio::test]
    async fn test_one_failing_drain_does_not_block_the_others() {
        // Two compressed routes: passthrough and DSP transcode.
        let config = StreamConfig::default();
        let plan = classify(
            AudioFormat::Ac3,
            6,
            &[
                (DeviceClass::Hdmi, PlaybackMode::Passthrough),
                (DeviceClass::Usb, PlaybackMode::DspTranscode),
            ],
        );
        let opener = MockOpener::new(1 << 15);
        let mut sinks = SinkSet::new();
        sinks
            .activate(&plan, &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap();
        let buffer = BitstreamBuffer::new(&config, 1 << 15, [1 << 15; Route::COUNT]).unwrap();
        let inner = StreamInner::new(buffer, sinks, AudioFormat::Ac3, 6, None, plan);
        let shared = Arc::new(StreamShared::new(inner, config));

        let failing = opener.sink_for(Route::CompressedPassthrough).unwrap();
        failing.fail_next_drain();

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run_worker(shared.clone(), rx));
        tx.send(OffloadCommand::Drain).await.unwrap();
        tx.send(OffloadCommand::Exit).await.unwrap();
        worker.await.unwrap();

        // The healthy sink drained despite its sibling's failure, and the
        // failure did not take the worker down.
        let healthy = opener.sink_for(Route::TranscodedCompressed).unwrap();
        assert_eq!(healthy.drains(), 1);
        assert_eq!(failing.drains(), 0);
        assert!(!shared.is_busy());
    }

    #[tokio::test]
    async fn test_exit_discards_queued_commands() {
        let (shared, opener) = shared_with_passthrough(1 << 15).await;
        let (tx, rx) = mpsc::channel(8);

        // Exit is queued ahead of the drain; the drain must be freed
        // without running.
        tx.send(OffloadCommand::Exit).await.unwrap();
        tx.send(OffloadCommand::Drain).await.unwrap();

        run_worker(shared.clone(), rx).await;

        let sink = opener.sink_for(Route::CompressedPassthrough).unwrap();
        assert_eq!(sink.drains(), 0);
    }

    #[tokio::test]
    async fn test_busy_flag_raised_during_command() {
        let (shared, opener) = shared_with_passthrough(1 << 15).await;
        let sink = opener.sink_for(Route::CompressedPassthrough).unwrap();
        sink.set_drain_delay(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run_worker(shared.clone(), rx));
        tx.send(OffloadCommand::Drain).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(shared.is_busy());

        shared.wait_until_idle().await;
        assert_eq!(sink.drains(), 1);

        tx.send(OffloadCommand::Exit).await.unwrap();
        worker.await.unwrap();
    }
}
