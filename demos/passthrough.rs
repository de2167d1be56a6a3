//! Compressed passthrough example.
//!
//! Feeds an AC-3 bitstream through the pipeline to a mock HDMI sink with a
//! small driver queue, so the backpressure/retry protocol is visible: a
//! write that returns zero waits for the write-ready callback and then
//! flushes the staged bytes with an empty write.
//!
//! Run with: cargo run --example passthrough

use std::sync::Arc;
use std::time::Duration;

use offload_audio::{
    AudioFormat, DeviceClass, MockOpener, OffloadStream, PlaybackMode, Route, StreamEvent,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // A small driver queue so backpressure actually happens.
    let opener = Arc::new(MockOpener::new(16 * 1024));
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();

    let stream = OffloadStream::builder()
        .format(AudioFormat::Ac3)
        .sample_rate(48_000)
        .channels(6)
        .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
        .opener(opener.clone())
        .on_event(move |event| match event {
            StreamEvent::WriteReady => {
                let _ = ready_tx.send(());
            }
            StreamEvent::DrainComplete { partial } => {
                println!("drain complete (partial: {partial})");
            }
            StreamEvent::SinkError { route, error } => {
                eprintln!("sink on {route} failed: {error}");
            }
        })
        .open()
        .await?;

    // Simulate the DSP rendering the queue in the background.
    let dsp = opener.sink_for(Route::CompressedPassthrough).unwrap();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(2)).await;
            dsp.render(4096);
        }
    });

    println!("Feeding 256 KiB of bitstream in 4 KiB chunks...");

    // Each chunk crosses the decode-admission gate on its own, so a zero
    // return always means a deferred write, never "need more data".
    let chunk = vec![0u8; 4096];
    for _ in 0..64 {
        let mut consumed = stream.write(&chunk).await?;
        while consumed == 0 {
            // Sink queue is full; the worker fires WriteReady once the
            // DSP has rendered enough. Flush the staged bytes, do not
            // resubmit the chunk.
            ready_rx.recv().await;
            consumed = stream.write(&[]).await?;
        }
    }

    let stats = stream.stats().await;
    println!(
        "consumed {} bytes with {} backpressure deferrals",
        stats.bytes_consumed, stats.backpressure_events
    );

    stream.drain(false).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!(
        "rendered position: {} frames",
        stream.get_render_position().await?
    );

    stream.close().await?;
    Ok(())
}
