//! Route classification for attached output devices.
//!
//! Given the stream's input format and the set of attached device classes
//! (each carrying a playback-mode override), this module decides which
//! output representations the pipeline must produce and which devices each
//! representation fans out to. Device classes that resolve to the same
//! route share one entry (one staged buffer, several physical devices);
//! classes resolving to different routes activate in parallel.

use crate::config::{AudioFormat, DeviceClass, PlaybackMode};

/// One of the four output representations a stream can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Uncompressed stereo PCM.
    StereoPcm,
    /// Uncompressed multichannel PCM.
    MultichannelPcm,
    /// Compressed bitstream forwarded unmodified.
    CompressedPassthrough,
    /// Compressed bitstream transcoded by the DSP.
    TranscodedCompressed,
}

impl Route {
    /// Number of routes; sizes the output staging region array.
    pub const COUNT: usize = 4;

    /// Dense index for per-route storage.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::StereoPcm => 0,
            Self::MultichannelPcm => 1,
            Self::CompressedPassthrough => 2,
            Self::TranscodedCompressed => 3,
        }
    }

    /// Stable bit for aggregate route masks.
    #[must_use]
    pub fn bit(self) -> u8 {
        1 << self.index()
    }

    /// Returns `true` if this route's sink consumes a compressed bitstream.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::CompressedPassthrough | Self::TranscodedCompressed)
    }

    /// Returns `true` if this route carries decoded PCM.
    #[must_use]
    pub fn is_pcm(self) -> bool {
        !self.is_compressed()
    }

    /// All routes, in index order.
    #[must_use]
    pub fn all() -> [Route; Self::COUNT] {
        [
            Self::StereoPcm,
            Self::MultichannelPcm,
            Self::CompressedPassthrough,
            Self::TranscodedCompressed,
        ]
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StereoPcm => "stereo-pcm",
            Self::MultichannelPcm => "multichannel-pcm",
            Self::CompressedPassthrough => "compressed-passthrough",
            Self::TranscodedCompressed => "transcoded-compressed",
        };
        f.write_str(name)
    }
}

/// One active route and the device classes that receive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// The output representation to produce.
    pub route: Route,
    /// Bitmask of [`DeviceClass::bit`] values routed to it.
    pub devices: u32,
}

/// The classifier's output: active routes with their device fan-out.
///
/// Built once per device configuration and consumed by
/// [`SinkSet::activate`](crate::sink::SinkSet::activate).
#[derive(Debug, Clone, Default)]
pub struct RoutePlan {
    entries: Vec<RouteEntry>,
}

impl RoutePlan {
    /// Active route entries, in first-seen order.
    #[must_use]
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Returns `true` if no device class produced a route.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aggregate bitmask of all active routes.
    #[must_use]
    pub fn route_mask(&self) -> u8 {
        self.entries.iter().fold(0, |mask, e| mask | e.route.bit())
    }

    /// Device mask for a route, if that route is active.
    #[must_use]
    pub fn devices_for(&self, route: Route) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.route == route)
            .map(|e| e.devices)
    }

    /// Returns `true` if any active route consumes a compressed bitstream.
    #[must_use]
    pub fn has_compressed_route(&self) -> bool {
        self.entries.iter().any(|e| e.route.is_compressed())
    }

    /// Returns `true` if any PCM route must be produced by decoding.
    #[must_use]
    pub fn needs_decoder(&self, format: AudioFormat) -> bool {
        format.is_compressed() && self.entries.iter().any(|e| e.route.is_pcm())
    }
}

/// Decision table: resolves one `(format, override)` pair to a route.
///
/// `None` means the combination is unroutable and the device class is
/// skipped. Host-side transcoding is never routable here.
fn resolve(format: AudioFormat, channels: u16, mode: PlaybackMode) -> Option<Route> {
    match (format.is_compressed(), mode) {
        (false, PlaybackMode::StereoPcm) => Some(Route::StereoPcm),
        // A stereo source cannot fill a multichannel representation.
        (false, PlaybackMode::MultichannelPcm) => {
            if channels > 2 {
                Some(Route::MultichannelPcm)
            } else {
                Some(Route::StereoPcm)
            }
        }
        (false, _) => None,
        (true, PlaybackMode::StereoPcm) => Some(Route::StereoPcm),
        (true, PlaybackMode::MultichannelPcm) => Some(Route::MultichannelPcm),
        (true, PlaybackMode::Passthrough) => Some(Route::CompressedPassthrough),
        (true, PlaybackMode::DspTranscode) => Some(Route::TranscodedCompressed),
        (true, PlaybackMode::SoftwareTranscode) => None,
    }
}

/// Classifies every attached device class and aggregates the results.
///
/// Unroutable `(format, override)` combinations are logged and skipped;
/// they never fail the stream as a whole.
#[must_use]
pub fn classify(
    format: AudioFormat,
    channels: u16,
    devices: &[(DeviceClass, PlaybackMode)],
) -> RoutePlan {
    let mut plan = RoutePlan::default();

    for &(class, mode) in devices {
        let Some(route) = resolve(format, channels, mode) else {
            tracing::warn!(
                device = %class,
                format = %format,
                mode = %mode,
                "no route for device class, leaving it unrouted"
            );
            continue;
        };

        match plan.entries.iter_mut().find(|e| e.route == route) {
            Some(entry) => entry.devices |= class.bit(),
            None => plan.entries.push(RouteEntry {
                route,
                devices: class.bit(),
            }),
        }
    }

    plan
}
