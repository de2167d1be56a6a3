//! Byte staging between the writer, the render step, and the sinks.
//!
//! [`BitstreamBuffer`] owns one input staging region and four output
//! staging regions (one per [`Route`]). It is a pure data-movement
//! component: no device or task knowledge, just bounded regions with
//! index-based read/write offsets and explicit residue compaction.
//!
//! Invariants:
//! - `read <= write <= capacity` for the input region, always; an append
//!   that would violate the bound is rejected without partial writes
//! - an output region's write offset returns to zero whenever compaction
//!   consumes everything that was pending

use crate::config::StreamConfig;
use crate::error::OffloadError;
use crate::pipeline::Route;

/// Region names for allocation-failure reporting.
const REGION_NAMES: [&str; Route::COUNT] = [
    "stereo-pcm output",
    "multichannel-pcm output",
    "compressed-passthrough output",
    "transcoded-compressed output",
];

/// Allocates a zeroed region, surfacing allocation failure instead of
/// aborting.
fn alloc_region(region: &'static str, bytes: usize) -> Result<Vec<u8>, OffloadError> {
    let mut data = Vec::new();
    data.try_reserve_exact(bytes)
        .map_err(|_| OffloadError::AllocationFailed { region, bytes })?;
    data.resize(bytes, 0);
    Ok(data)
}

/// One output staging region: fixed storage plus a write offset.
struct OutputRegion {
    data: Vec<u8>,
    write: usize,
}

/// Input ring plus four per-route output regions.
///
/// The writer appends encoded bytes to the input region; the render step
/// consumes them into the output regions; the sink writer drains each
/// output region from its base. Compaction shifts unconsumed residue to
/// the region base so the regions stay contiguous for driver writes.
pub(crate) struct BitstreamBuffer {
    input: Vec<u8>,
    read: usize,
    write: usize,
    outputs: [OutputRegion; Route::COUNT],
    buffering_factor: usize,
    buffering_factor_cnt: usize,
}

impl BitstreamBuffer {
    /// Allocates all five regions.
    ///
    /// `input_capacity` should hold `buffering_factor + 1` worst-case
    /// frames; `output_capacities` is indexed by [`Route::index`]. Any
    /// region failing to allocate fails the whole construction (regions
    /// allocated earlier are dropped on the way out).
    pub fn new(
        config: &StreamConfig,
        input_capacity: usize,
        output_capacities: [usize; Route::COUNT],
    ) -> Result<Self, OffloadError> {
        let input = alloc_region("input", input_capacity)?;

        let mut outputs = Vec::with_capacity(Route::COUNT);
        for (idx, &bytes) in output_capacities.iter().enumerate() {
            outputs.push(OutputRegion {
                data: alloc_region(REGION_NAMES[idx], bytes)?,
                write: 0,
            });
        }
        let outputs = match <[OutputRegion; Route::COUNT]>::try_from(outputs) {
            Ok(arr) => arr,
            Err(_) => unreachable!("exactly Route::COUNT regions are pushed"),
        };

        Ok(Self {
            input,
            read: 0,
            write: 0,
            outputs,
            buffering_factor: config.buffering_factor,
            buffering_factor_cnt: 0,
        })
    }

    /// Input region capacity in bytes.
    pub fn input_capacity(&self) -> usize {
        self.input.len()
    }

    /// Bytes staged but not yet consumed by the render step.
    pub fn input_pending(&self) -> usize {
        self.write - self.read
    }

    /// Appends bytes to the input region.
    ///
    /// Returns `false` without mutating anything if the bytes do not fit
    /// behind the current write offset; the caller retries after the next
    /// compaction or render step frees space.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if self.write + bytes.len() > self.input.len() {
            return false;
        }
        self.input[self.write..self.write + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        if self.buffering_factor_cnt < self.buffering_factor {
            self.buffering_factor_cnt += 1;
        }
        true
    }

    /// Admission gate for the render step.
    ///
    /// `min_bytes` is format-dependent: zero for formats that tolerate
    /// partial frames, one worst-case frame otherwise.
    pub fn has_enough_to_decode(&self, min_bytes: usize) -> bool {
        self.input_pending() > min_bytes
    }

    /// The staged input bytes, in consumption order.
    pub fn pending_input(&self) -> &[u8] {
        &self.input[self.read..self.write]
    }

    /// Retires `consumed` input bytes.
    ///
    /// Once the append counter has saturated the region is considered
    /// full: the unconsumed tail is shifted down to the base and both
    /// offsets reset relative to it. Until then this only advances the
    /// read offset, amortizing the copy while keeping memory bounded.
    pub fn compact_input(&mut self, consumed: usize) {
        debug_assert!(consumed <= self.input_pending());
        let consumed = consumed.min(self.input_pending());
        let read = self.read + consumed;

        if self.buffering_factor_cnt == self.buffering_factor {
            self.input.copy_within(read..self.write, 0);
            self.write -= read;
            self.read = 0;
            self.buffering_factor_cnt = 0;
        } else {
            self.read = read;
        }
    }

    /// Borrows the staged input and a route's spare space together.
    ///
    /// The render step copies or decodes from the first slice into the
    /// second, then commits with [`advance_output`](Self::advance_output).
    pub fn stage(&mut self, route: Route) -> (&[u8], &mut [u8]) {
        let input = &self.input[self.read..self.write];
        let out = &mut self.outputs[route.index()];
        (input, &mut out.data[out.write..])
    }

    /// Bytes staged in a route's region and not yet handed to its sink.
    pub fn output_pending(&self, route: Route) -> &[u8] {
        let out = &self.outputs[route.index()];
        &out.data[..out.write]
    }

    /// Current write offset of a route's region.
    pub fn output_write_offset(&self, route: Route) -> usize {
        self.outputs[route.index()].write
    }

    /// Commits `n` produced bytes to a route's region.
    ///
    /// An advance past the region's capacity is reported, never clamped:
    /// silently dropping decoded bytes would desynchronize the routes.
    pub fn advance_output(&mut self, route: Route, n: usize) -> Result<(), OffloadError> {
        let out = &mut self.outputs[route.index()];
        let available = out.data.len() - out.write;
        if n > available {
            return Err(OffloadError::RegionOverflow {
                route,
                requested: n,
                available,
            });
        }
        out.write += n;
        Ok(())
    }

    /// Retires `rendered` bytes handed to the route's sink, shifting any
    /// residue down to the region base.
    pub fn compact_output(&mut self, route: Route, rendered: usize) {
        let out = &mut self.outputs[route.index()];
        debug_assert!(rendered <= out.write);
        let rendered = rendered.min(out.write);
        out.data.copy_within(rendered..out.write, 0);
        out.write -= rendered;
    }

    /// Discards all staged bytes (flush/standby).
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.buffering_factor_cnt = 0;
        for out in &mut self.outputs {
            out.write = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(input: usize, output: usize) -> BitstreamBuffer {
        BitstreamBuffer::new(&StreamConfig::default(), input, [output; Route::COUNT])
            .expect("allocation")
    }

    #[test]
    fn test_append_within_bound() {
        let mut buf = buffer(64, 64);
        assert!(buf.append(&[1, 2, 3, 4]));
        assert_eq!(buf.input_pending(), 4);
        assert_eq!(buf.pending_input(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_append_rejected_without_mutation() {
        let mut buf = buffer(8, 8);
        assert!(buf.append(&[1, 2, 3, 4, 5, 6]));

        // Would exceed the bound: rejected, nothing partial.
        assert!(!buf.append(&[7, 8, 9]));
        assert_eq!(buf.input_pending(), 6);
        assert_eq!(buf.pending_input(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_ring_bound_holds_for_any_append_sequence() {
        let mut buf = buffer(32, 8);
        for chunk in [5usize, 11, 16, 3, 32, 1] {
            let bytes = vec![0xabu8; chunk];
            let _ = buf.append(&bytes);
            assert!(buf.write <= buf.input_capacity());
            assert!(buf.read <= buf.write);
        }
    }

    #[test]
    fn test_compact_input_advances_until_saturated() {
        let mut buf = buffer(64, 8);
        // Default buffering factor is 4; three appends stay unsaturated.
        for _ in 0..3 {
            assert!(buf.append(&[0u8; 8]));
        }
        buf.compact_input(8);
        // Read advanced, no shift to base.
        assert_eq!(buf.read, 8);
        assert_eq!(buf.write, 24);
    }

    #[test]
    fn test_compact_input_shifts_residue_when_full() {
        let mut buf = buffer(64, 8);
        for i in 0..4u8 {
            assert!(buf.append(&[i; 8]));
        }
        buf.compact_input(20);
        // Saturated: residue moved to the base, offsets reset.
        assert_eq!(buf.read, 0);
        assert_eq!(buf.write, 12);
        assert_eq!(&buf.pending_input()[..4], &[2, 2, 2, 2]);
    }

    #[test]
    fn test_compact_zero_is_idempotent() {
        let mut buf = buffer(64, 8);
        assert!(buf.append(&[9u8; 16]));
        buf.compact_input(4);
        let (read, write) = (buf.read, buf.write);

        for _ in 0..5 {
            buf.compact_input(0);
        }
        assert_eq!((buf.read, buf.write), (read, write));
        assert_eq!(buf.pending_input(), &[9u8; 12]);
    }

    #[test]
    fn test_has_enough_to_decode_is_strict() {
        let mut buf = buffer(64, 8);
        assert!(buf.append(&[0u8; 10]));
        assert!(!buf.has_enough_to_decode(10));
        assert!(buf.has_enough_to_decode(9));
        // Partial-frame formats gate on zero: any staged byte admits.
        assert!(buf.has_enough_to_decode(0));
    }

    #[test]
    fn test_stage_and_advance_output() {
        let mut buf = buffer(64, 16);
        assert!(buf.append(&[7u8; 6]));

        let (input, spare) = buf.stage(Route::CompressedPassthrough);
        let n = input.len();
        spare[..n].copy_from_slice(input);
        buf.advance_output(Route::CompressedPassthrough, n).unwrap();

        assert_eq!(buf.output_pending(Route::CompressedPassthrough), &[7u8; 6]);
        assert_eq!(buf.output_write_offset(Route::CompressedPassthrough), 6);
        // Other regions untouched.
        assert_eq!(buf.output_write_offset(Route::StereoPcm), 0);
    }

    #[test]
    fn test_advance_output_overflow_is_reported() {
        let mut buf = buffer(64, 4);
        let err = buf.advance_output(Route::StereoPcm, 5).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::RegionOverflow {
                route: Route::StereoPcm,
                requested: 5,
                available: 4,
            }
        ));
        // The failed advance must not move the offset.
        assert_eq!(buf.output_write_offset(Route::StereoPcm), 0);
    }

    #[test]
    fn test_compact_output_shifts_residue_to_base() {
        let mut buf = buffer(64, 16);
        assert!(buf.append(&[1, 2, 3, 4, 5, 6]));
        let (input, spare) = buf.stage(Route::StereoPcm);
        let n = input.len();
        spare[..n].copy_from_slice(input);
        buf.advance_output(Route::StereoPcm, n).unwrap();

        buf.compact_output(Route::StereoPcm, 4);
        assert_eq!(buf.output_pending(Route::StereoPcm), &[5, 6]);

        buf.compact_output(Route::StereoPcm, 2);
        assert_eq!(buf.output_write_offset(Route::StereoPcm), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut buf = buffer(64, 16);
        assert!(buf.append(&[1u8; 10]));
        let (input, spare) = buf.stage(Route::MultichannelPcm);
        let n = input.len();
        spare[..n].copy_from_slice(input);
        buf.advance_output(Route::MultichannelPcm, n).unwrap();

        buf.reset();
        assert_eq!(buf.input_pending(), 0);
        for route in Route::all() {
            assert_eq!(buf.output_write_offset(route), 0);
        }
    }
}
