//! Mock hardware sink for testing without a driver.
//!
//! [`MockSink`] models the driver contract closely enough to exercise the
//! whole pipeline in CI: compressed sinks carry a bounded internal queue
//! (short writes when full, space freed as the fake DSP "renders"), raw
//! sinks accept everything like a blocking PCM write that has completed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::config::GaplessMetadata;
use crate::error::SinkError;
use crate::pipeline::Route;
use crate::sink::{HardwareSink, SinkConfig, SinkOpener, SinkTimestamp};

struct QueueHalves {
    prod: HeapProd<u8>,
    cons: HeapCons<u8>,
}

/// A test sink with a bounded driver queue and full call recording.
///
/// # Example
///
/// ```
/// use offload_audio::{MockSink, Route};
///
/// let sink = MockSink::new(Route::CompressedPassthrough, 4096);
/// assert_eq!(sink.accepted_bytes(), 0);
/// ```
pub struct MockSink {
    name: String,
    route: Route,
    devices: u32,
    sample_rate: u32,
    frame_bytes: usize,
    queue: Mutex<QueueHalves>,
    written: Mutex<Vec<u8>>,
    rendered_bytes: AtomicUsize,
    accepted: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    drains: AtomicUsize,
    partial_drains: AtomicUsize,
    closes: AtomicUsize,
    metadata: Mutex<Vec<GaplessMetadata>>,
    drain_delay: Mutex<Option<Duration>>,
    fail_next_write: AtomicBool,
    fail_next_drain: AtomicBool,
}

impl MockSink {
    /// Creates a mock sink for a route with the given queue capacity.
    pub fn new(route: Route, capacity: usize) -> Self {
        let (prod, cons) = HeapRb::<u8>::new(capacity).split();
        Self {
            name: format!("mock:{route}"),
            route,
            devices: 0,
            sample_rate: 48_000,
            frame_bytes: 4,
            queue: Mutex::new(QueueHalves { prod, cons }),
            written: Mutex::new(Vec::new()),
            rendered_bytes: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            drains: AtomicUsize::new(0),
            partial_drains: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            metadata: Mutex::new(Vec::new()),
            drain_delay: Mutex::new(None),
            fail_next_write: AtomicBool::new(false),
            fail_next_drain: AtomicBool::new(false),
        }
    }

    /// Creates a mock sink matching an open configuration.
    pub fn from_config(config: &SinkConfig, capacity: usize) -> Self {
        let mut sink = Self::new(config.route, capacity);
        sink.devices = config.devices;
        sink.sample_rate = config.sample_rate;
        sink.frame_bytes = usize::from(config.channels.max(1)) * 2;
        sink
    }

    /// Route this sink was opened for.
    pub fn route(&self) -> Route {
        self.route
    }

    /// Device bitmask this sink was opened with.
    pub fn devices(&self) -> u32 {
        self.devices
    }

    /// Every byte the sink has accepted, in order.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    /// Total bytes accepted across all writes.
    pub fn accepted_bytes(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Bytes currently sitting in the fake driver queue.
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().cons.occupied_len()
    }

    /// Simulates the DSP rendering `n` queued bytes, freeing space.
    ///
    /// Returns how many bytes were actually rendered.
    pub fn render(&self, n: usize) -> usize {
        let mut tmp = vec![0u8; n];
        let popped = self.queue.lock().cons.pop_slice(&mut tmp);
        self.rendered_bytes.fetch_add(popped, Ordering::SeqCst);
        popped
    }

    /// Makes the next drain/partial-drain sleep, simulating hardware that
    /// takes time to empty its queue.
    pub fn set_drain_delay(&self, delay: Duration) {
        *self.drain_delay.lock() = Some(delay);
    }

    /// Makes the next write fail with a driver error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Makes the next drain fail with a driver error.
    pub fn fail_next_drain(&self) {
        self.fail_next_drain.store(true, Ordering::SeqCst);
    }

    /// Gapless metadata deliveries, in order.
    pub fn metadata_deliveries(&self) -> Vec<GaplessMetadata> {
        self.metadata.lock().clone()
    }

    /// Number of `start` calls.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of `pause` calls.
    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    /// Number of `resume` calls.
    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Number of `drain` calls.
    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    /// Number of `partial_drain` calls.
    pub fn partial_drains(&self) -> usize {
        self.partial_drains.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    async fn apply_drain_delay(&self) {
        let delay = self.drain_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl HardwareSink for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, SinkError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(SinkError::write_failed("injected failure"));
        }

        let accepted = if self.route.is_compressed() {
            // Compressed semantics: accept up to the queue's free space and
            // return immediately with a possibly short count.
            self.queue.lock().prod.push_slice(bytes)
        } else {
            // Raw-PCM semantics: the blocking driver write has completed.
            self.rendered_bytes.fetch_add(bytes.len(), Ordering::SeqCst);
            bytes.len()
        };

        self.written.lock().extend_from_slice(&bytes[..accepted]);
        self.accepted.fetch_add(accepted, Ordering::SeqCst);
        Ok(accepted)
    }

    async fn available_space(&self) -> Result<usize, SinkError> {
        if self.route.is_compressed() {
            Ok(self.queue.lock().prod.vacant_len())
        } else {
            Ok(usize::MAX)
        }
    }

    async fn start(&self) -> Result<(), SinkError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SinkError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) -> Result<(), SinkError> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), SinkError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drain(&self) -> Result<(), SinkError> {
        self.apply_drain_delay().await;
        if self.fail_next_drain.swap(false, Ordering::SeqCst) {
            return Err(SinkError::custom("injected drain failure"));
        }
        self.drains.fetch_add(1, Ordering::SeqCst);
        let queued = self.queued_bytes();
        self.render(queued);
        Ok(())
    }

    async fn partial_drain(&self) -> Result<(), SinkError> {
        self.apply_drain_delay().await;
        self.partial_drains.fetch_add(1, Ordering::SeqCst);
        let queued = self.queued_bytes();
        self.render(queued);
        Ok(())
    }

    async fn get_timestamp(&self) -> Result<SinkTimestamp, SinkError> {
        Ok(SinkTimestamp {
            rendered_frames: (self.rendered_bytes.load(Ordering::SeqCst) / self.frame_bytes) as u64,
            sample_rate: self.sample_rate,
        })
    }

    async fn set_gapless_metadata(&self, metadata: GaplessMetadata) -> Result<(), SinkError> {
        self.metadata.lock().push(metadata);
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An opener that hands out [`MockSink`]s and remembers them.
///
/// Supports failure injection for activation-rollback tests.
pub struct MockOpener {
    capacity: usize,
    fail_route: Mutex<Option<Route>>,
    opened: Mutex<Vec<Arc<MockSink>>>,
}

impl MockOpener {
    /// Creates an opener whose sinks carry a queue of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            fail_route: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Makes opens for the given route fail with `DeviceBusy`.
    pub fn fail_route(&self, route: Route) {
        *self.fail_route.lock() = Some(route);
    }

    /// Every sink this opener has handed out, in open order.
    pub fn opened(&self) -> Vec<Arc<MockSink>> {
        self.opened.lock().clone()
    }

    /// The most recently opened sink for a route, if any.
    pub fn sink_for(&self, route: Route) -> Option<Arc<MockSink>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|s| s.route() == route)
            .cloned()
    }
}

#[async_trait]
impl SinkOpener for MockOpener {
    async fn open(&self, config: &SinkConfig) -> Result<Arc<dyn HardwareSink>, SinkError> {
        if *self.fail_route.lock() == Some(config.route) {
            return Err(SinkError::DeviceBusy);
        }
        let sink = Arc::new(MockSink::from_config(config, self.capacity));
        self.opened.lock().push(sink.clone());
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compressed_sink_short_writes_when_full() {
        let sink = MockSink::new(Route::CompressedPassthrough, 8);

        assert_eq!(sink.write(&[1, 2, 3, 4, 5, 6]).await.unwrap(), 6);
        assert_eq!(sink.available_space().await.unwrap(), 2);

        // Only two bytes fit; short write, no error.
        assert_eq!(sink.write(&[7, 8, 9]).await.unwrap(), 2);
        assert_eq!(sink.written(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_render_frees_space() {
        let sink = MockSink::new(Route::CompressedPassthrough, 8);
        sink.write(&[0u8; 8]).await.unwrap();
        assert_eq!(sink.available_space().await.unwrap(), 0);

        assert_eq!(sink.render(5), 5);
        assert_eq!(sink.available_space().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_raw_sink_accepts_everything() {
        let sink = MockSink::new(Route::StereoPcm, 8);
        assert_eq!(sink.write(&[0u8; 100]).await.unwrap(), 100);
        assert_eq!(sink.available_space().await.unwrap(), usize::MAX);
    }

    #[tokio::test]
    async fn test_timestamp_counts_rendered_frames() {
        let sink = MockSink::new(Route::StereoPcm, 8);
        sink.write(&[0u8; 400]).await.unwrap();

        let ts = sink.get_timestamp().await.unwrap();
        // 400 bytes / 4 bytes per stereo frame.
        assert_eq!(ts.rendered_frames, 100);
        assert_eq!(ts.sample_rate, 48_000);
    }

    #[tokio::test]
    async fn test_opener_failure_injection() {
        let opener = MockOpener::new(64);
        opener.fail_route(Route::CompressedPassthrough);

        let config = SinkConfig {
            route: Route::CompressedPassthrough,
            devices: 0x4,
            sample_rate: 48_000,
            channels: 2,
            format: crate::AudioFormat::Ac3,
        };
        assert!(matches!(
            opener.open(&config).await,
            Err(SinkError::DeviceBusy)
        ));

        let ok = SinkConfig {
            route: Route::StereoPcm,
            ..config
        };
        assert!(opener.open(&ok).await.is_ok());
        assert_eq!(opener.opened().len(), 1);
    }
}
