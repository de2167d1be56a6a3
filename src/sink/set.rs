//! The per-stream collection of open hardware sinks.
//!
//! One sink exists per active route; device classes sharing a route share
//! the sink via a merged device bitmask. The set owns its sinks
//! exclusively: activation either opens everything or rolls everything
//! back, and teardown is idempotent so standby and close can both call it.

use std::sync::Arc;

use crate::config::{AudioFormat, GaplessMetadata};
use crate::error::{OffloadError, SinkError};
use crate::pipeline::{Route, RoutePlan};
use crate::sink::{HardwareSink, SinkConfig, SinkOpener};

/// Stable identifier for a sink within its set.
///
/// Indices stay valid until the next teardown; the set is only ever
/// rebuilt as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkHandle(pub(crate) usize);

pub(crate) struct SinkRecord {
    pub route: Route,
    pub devices: u32,
    pub sink: Arc<dyn HardwareSink>,
    /// Hardware start has been issued (compressed sinks, exactly once).
    pub started: bool,
    /// Bytes of free space an outstanding `WaitForBuffer` must see before
    /// the deferred write can succeed.
    pub awaiting_space: Option<usize>,
    /// Gapless metadata changed and must reach this sink before its next
    /// write.
    pub metadata_pending: bool,
}

/// Ordered collection of per-route sink records.
pub(crate) struct SinkSet {
    records: Vec<SinkRecord>,
    gapless: GaplessMetadata,
}

impl SinkSet {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            gapless: GaplessMetadata::default(),
        }
    }

    /// Opens one sink per route entry in the plan.
    ///
    /// Partial failure closes every sink opened in this attempt before
    /// returning the error; the set is never left half-open.
    pub async fn activate(
        &mut self,
        plan: &RoutePlan,
        opener: &dyn SinkOpener,
        format: AudioFormat,
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), OffloadError> {
        debug_assert!(self.records.is_empty(), "activate on a live set");

        let mut opened: Vec<SinkRecord> = Vec::with_capacity(plan.entries().len());

        for entry in plan.entries() {
            let config = SinkConfig {
                route: entry.route,
                devices: entry.devices,
                sample_rate,
                channels: match entry.route {
                    Route::StereoPcm => 2,
                    _ => channels,
                },
                format,
            };

            match opener.open(&config).await {
                Ok(sink) => opened.push(SinkRecord {
                    route: entry.route,
                    devices: entry.devices,
                    sink,
                    started: false,
                    awaiting_space: None,
                    metadata_pending: false,
                }),
                Err(err) => {
                    for record in &opened {
                        if let Err(close_err) = record.sink.close().await {
                            tracing::warn!(
                                sink = record.sink.name(),
                                error = %close_err,
                                "close during activation rollback failed"
                            );
                        }
                    }
                    return Err(OffloadError::SinkOpenFailed {
                        route: entry.route,
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.records = opened;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `(handle, route)` pairs for every open sink.
    pub fn targets(&self) -> Vec<(SinkHandle, Route)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (SinkHandle(i), r.route))
            .collect()
    }

    /// Snapshot of sinks the command worker operates on outside the lock.
    pub fn sink_snapshot(&self) -> Vec<(Route, Arc<dyn HardwareSink>)> {
        self.records
            .iter()
            .map(|r| (r.route, r.sink.clone()))
            .collect()
    }

    /// Snapshot of sinks currently awaiting space, with the free byte
    /// count each one must reach.
    pub fn awaiting_snapshot(&self) -> Vec<(Route, Arc<dyn HardwareSink>, usize)> {
        self.records
            .iter()
            .filter_map(|r| {
                r.awaiting_space
                    .map(|required| (r.route, r.sink.clone(), required))
            })
            .collect()
    }

    pub fn any_awaiting_space(&self) -> bool {
        self.records.iter().any(|r| r.awaiting_space.is_some())
    }

    pub fn set_awaiting_space(&mut self, handle: SinkHandle, required: usize) {
        self.records[handle.0].awaiting_space = Some(required);
    }

    pub fn clear_awaiting_space(&mut self) {
        for record in &mut self.records {
            record.awaiting_space = None;
        }
    }

    /// Free space in a sink's queue.
    pub async fn available_space(&self, handle: SinkHandle) -> Result<usize, SinkError> {
        self.records[handle.0].sink.available_space().await
    }

    /// Hands bytes to a sink, delivering pending gapless metadata first.
    ///
    /// Raw sinks may block the caller; compressed sinks return a short
    /// count when their queue fills.
    pub async fn write(&mut self, handle: SinkHandle, bytes: &[u8]) -> Result<usize, SinkError> {
        let gapless = self.gapless;
        let record = &mut self.records[handle.0];

        if record.metadata_pending && record.route.is_compressed() {
            record.sink.set_gapless_metadata(gapless).await?;
            record.metadata_pending = false;
        }

        record.sink.write(bytes).await
    }

    /// Records new gapless metadata; every compressed sink receives it
    /// before its next write.
    pub fn set_gapless(&mut self, metadata: GaplessMetadata) {
        self.gapless = metadata;
        for record in &mut self.records {
            if record.route.is_compressed() {
                record.metadata_pending = true;
            }
        }
    }

    /// Issues the hardware start on compressed sinks that have not been
    /// started yet. Called on the stream's first committed write.
    pub async fn start_compressed(&mut self) {
        for record in &mut self.records {
            if record.route.is_compressed() && !record.started {
                match record.sink.start().await {
                    Ok(()) => record.started = true,
                    Err(err) => {
                        tracing::error!(
                            sink = record.sink.name(),
                            error = %err,
                            "sink start failed"
                        );
                    }
                }
            }
        }
    }

    /// Pauses every sink; failures are logged and absorbed.
    pub async fn pause_all(&self) {
        for record in &self.records {
            if let Err(err) = record.sink.pause().await {
                tracing::warn!(sink = record.sink.name(), error = %err, "pause failed");
            }
        }
    }

    /// Resumes every sink; failures are logged and absorbed.
    pub async fn resume_all(&self) {
        for record in &self.records {
            if let Err(err) = record.sink.resume().await {
                tracing::warn!(sink = record.sink.name(), error = %err, "resume failed");
            }
        }
    }

    /// Stops and closes every sink and empties the set.
    ///
    /// Idempotent: a second call finds an empty set and does nothing, so
    /// no sink is ever double-closed.
    pub async fn teardown(&mut self) {
        for record in self.records.drain(..) {
            if record.started {
                if let Err(err) = record.sink.stop().await {
                    tracing::warn!(sink = record.sink.name(), error = %err, "stop failed");
                }
            }
            if let Err(err) = record.sink.close().await {
                tracing::warn!(sink = record.sink.name(), error = %err, "close failed");
            }
            tracing::debug!(
                sink = record.sink.name(),
                route = %record.route,
                devices = record.devices,
                "sink released"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::routing::classify;
    use crate::sink::{MockOpener, MockSink};
    use crate::{DeviceClass, PlaybackMode};

    fn dual_route_plan() -> RoutePlan {
        classify(
            AudioFormat::Ac3,
            6,
            &[
                (DeviceClass::Speaker, PlaybackMode::StereoPcm),
                (DeviceClass::Hdmi, PlaybackMode::Passthrough),
            ],
        )
    }

    #[tokio::test]
    async fn test_activate_opens_one_sink_per_route() {
        let opener = MockOpener::new(4096);
        let mut set = SinkSet::new();

        set.activate(&dual_route_plan(), &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(opener.opened().len(), 2);
        // Stereo route is always opened with two channels.
        let stereo = opener.sink_for(Route::StereoPcm).unwrap();
        assert_eq!(stereo.route(), Route::StereoPcm);
    }

    #[tokio::test]
    async fn test_activate_rolls_back_on_partial_failure() {
        let opener = MockOpener::new(4096);
        opener.fail_route(Route::CompressedPassthrough);
        let mut set = SinkSet::new();

        let err = set
            .activate(&dual_route_plan(), &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OffloadError::SinkOpenFailed {
                route: Route::CompressedPassthrough,
                ..
            }
        ));
        assert!(set.is_empty());
        // The sink opened before the failure was closed again.
        let stereo = opener.sink_for(Route::StereoPcm).unwrap();
        assert_eq!(stereo.closes(), 1);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let opener = MockOpener::new(4096);
        let mut set = SinkSet::new();
        set.activate(&dual_route_plan(), &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap();

        set.teardown().await;
        set.teardown().await;

        for sink in opener.opened() {
            assert_eq!(sink.closes(), 1);
        }
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_start_compressed_is_exactly_once() {
        let opener = MockOpener::new(4096);
        let mut set = SinkSet::new();
        set.activate(&dual_route_plan(), &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap();

        set.start_compressed().await;
        set.start_compressed().await;

        let passthrough = opener.sink_for(Route::CompressedPassthrough).unwrap();
        let stereo = opener.sink_for(Route::StereoPcm).unwrap();
        assert_eq!(passthrough.starts(), 1);
        // Raw sinks are never started through the compressed path.
        assert_eq!(stereo.starts(), 0);
    }

    #[tokio::test]
    async fn test_gapless_delivered_once_before_next_write() {
        let opener = MockOpener::new(4096);
        let mut set = SinkSet::new();
        set.activate(&dual_route_plan(), &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap();

        let metadata = GaplessMetadata {
            encoder_delay: 576,
            encoder_padding: 1201,
        };
        set.set_gapless(metadata);

        let targets = set.targets();
        let (passthrough_handle, _) = targets
            .iter()
            .find(|(_, r)| *r == Route::CompressedPassthrough)
            .copied()
            .unwrap();

        set.write(passthrough_handle, &[1, 2, 3]).await.unwrap();
        set.write(passthrough_handle, &[4, 5, 6]).await.unwrap();

        let sink = opener.sink_for(Route::CompressedPassthrough).unwrap();
        assert_eq!(sink.metadata_deliveries(), vec![metadata]);

        // Raw sinks never receive metadata.
        let (stereo_handle, _) = targets
            .iter()
            .find(|(_, r)| *r == Route::StereoPcm)
            .copied()
            .unwrap();
        set.write(stereo_handle, &[7, 8]).await.unwrap();
        let stereo = opener.sink_for(Route::StereoPcm).unwrap();
        assert!(stereo.metadata_deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_awaiting_space_flags() {
        let opener = MockOpener::new(16);
        let mut set = SinkSet::new();
        set.activate(&dual_route_plan(), &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap();

        assert!(!set.any_awaiting_space());
        let (handle, _) = set.targets()[0];
        set.set_awaiting_space(handle, 512);
        assert!(set.any_awaiting_space());
        let waiting = set.awaiting_snapshot();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].2, 512);

        set.clear_awaiting_space();
        assert!(!set.any_awaiting_space());
    }

    #[tokio::test]
    async fn test_write_reaches_hardware() {
        let opener = MockOpener::new(4096);
        let mut set = SinkSet::new();
        set.activate(&dual_route_plan(), &opener, AudioFormat::Ac3, 48_000, 6)
            .await
            .unwrap();

        let (handle, _) = set
            .targets()
            .into_iter()
            .find(|(_, r)| *r == Route::CompressedPassthrough)
            .unwrap();
        let accepted = set.write(handle, &[0xaa; 128]).await.unwrap();
        assert_eq!(accepted, 128);

        let sink = opener.sink_for(Route::CompressedPassthrough).unwrap();
        assert_eq!(sink.accepted_bytes(), 128);
    }

    // Direct MockSink sanity: SinkSet assumes &self interior mutability.
    #[test]
    fn test_records_are_exclusively_owned() {
        let sink: Arc<dyn HardwareSink> = Arc::new(MockSink::new(Route::StereoPcm, 8));
        assert_eq!(Arc::strong_count(&sink), 1);
    }
}
