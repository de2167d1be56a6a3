//! Custom driver backend example.
//!
//! Demonstrates implementing [`SinkOpener`] and [`HardwareSink`] for a
//! platform's driver layer. The sink here just meters throughput instead
//! of talking to real hardware.
//!
//! Run with: cargo run --example custom_sink

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use offload_audio::{
    AudioFormat, DeviceClass, HardwareSink, OffloadStream, PlaybackMode, SinkConfig, SinkError,
    SinkOpener, SinkTimestamp,
};

/// A sink that counts what the pipeline hands it.
struct MeterSink {
    name: String,
    sample_rate: u32,
    frame_bytes: u64,
    accepted: AtomicU64,
}

#[async_trait]
impl HardwareSink for MeterSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, SinkError> {
        self.accepted.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes.len())
    }

    async fn available_space(&self) -> Result<usize, SinkError> {
        // A real compressed driver reports its queue's free bytes here.
        Ok(usize::MAX)
    }

    async fn start(&self) -> Result<(), SinkError> {
        println!("[{}] started", self.name);
        Ok(())
    }

    async fn drain(&self) -> Result<(), SinkError> {
        println!(
            "[{}] drained after {} bytes",
            self.name,
            self.accepted.load(Ordering::Relaxed)
        );
        Ok(())
    }

    async fn get_timestamp(&self) -> Result<SinkTimestamp, SinkError> {
        Ok(SinkTimestamp {
            rendered_frames: self.accepted.load(Ordering::Relaxed) / self.frame_bytes,
            sample_rate: self.sample_rate,
        })
    }

    async fn close(&self) -> Result<(), SinkError> {
        println!("[{}] closed", self.name);
        Ok(())
    }
}

/// The seam to the device layer: resolves a sink config to an open sink.
struct MeterBackend;

#[async_trait]
impl SinkOpener for MeterBackend {
    async fn open(&self, config: &SinkConfig) -> Result<Arc<dyn HardwareSink>, SinkError> {
        println!(
            "opening {} sink for device mask {:#x} ({} ch @ {} Hz)",
            config.route, config.devices, config.channels, config.sample_rate
        );
        Ok(Arc::new(MeterSink {
            name: format!("meter:{}", config.route),
            sample_rate: config.sample_rate,
            frame_bytes: u64::from(config.channels.max(1)) * 2,
            accepted: AtomicU64::new(0),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let stream = OffloadStream::builder()
        .format(AudioFormat::Eac3)
        .sample_rate(48_000)
        .channels(6)
        .attach_device(DeviceClass::Hdmi, PlaybackMode::Passthrough)
        .opener(MeterBackend)
        .open()
        .await?;

    // Feed ten chunks, each comfortably past the decode-admission gate.
    let chunk = vec![0u8; 2 * AudioFormat::Eac3.max_frame_size()];
    for _ in 0..10 {
        stream.write(&chunk).await?;
    }

    let stats = stream.stats().await;
    println!("pipeline consumed {} bytes", stats.bytes_consumed);

    stream.drain(false).await?;
    // Give the worker a moment to run the drain before the stream closes.
    tokio::time::sleep(Duration::from_millis(20)).await;

    stream.close().await?;
    Ok(())
}
