//! Overlap-add building blocks shared by the block-based backends

use std::f32::consts::PI;

use crate::ring_buffer::RingBuffer;
use crate::types::{finite_or_zero, StereoSample};

/// Output is divided by at least this much window weight
///
/// In steady state every backend's summed window weight is >= 1, so the
/// floor only shapes the first few samples of a stream into a fade-in
/// instead of amplifying rounding noise under a near-zero window edge.
const WEIGHT_FLOOR: f32 = 0.1;

/// Periodic Hann window sampled at half-sample offsets
///
/// No coefficient is exactly zero, and `w[i] + w[i + len/2] == 1`, so
/// 50% overlap sums to a constant (75% overlap sums to 2).
pub(crate) fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let phase = 2.0 * PI * (i as f32 + 0.5) / len as f32;
            0.5 - 0.5 * phase.cos()
        })
        .collect()
}

/// Replace non-finite input before it can poison filter or phase history
#[inline]
pub(crate) fn clean_input(frame: StereoSample) -> StereoSample {
    StereoSample::new(finite_or_zero(frame.left), finite_or_zero(frame.right))
}

/// Weighted overlap-add accumulator
///
/// Frames are added at offsets relative to the oldest incomplete output
/// sample together with their window weight; emitted samples are divided by
/// the summed weight, which makes the reconstruction exact whenever the
/// frames agree (e.g. at unity ratios).
#[derive(Debug, Default)]
pub(crate) struct OverlapAccumulator {
    sum: Vec<StereoSample>,
    weight: Vec<f32>,
}

impl OverlapAccumulator {
    pub fn prepare(&mut self, len: usize) {
        self.sum = vec![StereoSample::silence(); len];
        self.weight = vec![0.0; len];
    }

    pub fn clear(&mut self) {
        self.sum.fill(StereoSample::silence());
        self.weight.fill(0.0);
    }

    #[inline]
    pub fn add(&mut self, index: usize, value: StereoSample, weight: f32) {
        if let (Some(sum), Some(w)) = (self.sum.get_mut(index), self.weight.get_mut(index)) {
            *sum += value;
            *w += weight;
        }
    }

    /// Normalised value at `index` (not yet emitted)
    #[inline]
    pub fn normalized(&self, index: usize) -> StereoSample {
        match (self.sum.get(index), self.weight.get(index)) {
            (Some(&sum), Some(&w)) => sum * (1.0 / w.max(WEIGHT_FLOOR)),
            _ => StereoSample::silence(),
        }
    }

    /// Emit the first `count` samples, which no further frame will touch,
    /// and shift the rest down
    pub fn emit(&mut self, count: usize, mut sink: impl FnMut(StereoSample)) {
        let count = count.min(self.sum.len());
        for i in 0..count {
            sink(self.normalized(i));
        }
        let len = self.sum.len();
        self.sum.copy_within(count.., 0);
        self.weight.copy_within(count.., 0);
        self.sum[len - count..].fill(StereoSample::silence());
        self.weight[len - count..].fill(0.0);
    }
}

/// Streaming linear-interpolation resampler
///
/// Reads its buffered input at a fractional step. A step of exactly 1.0
/// returns the input unchanged.
#[derive(Debug, Default)]
pub(crate) struct FractionalResampler {
    buffer: RingBuffer<StereoSample>,
    phase: f64,
}

impl FractionalResampler {
    pub fn prepare(&mut self, capacity: usize) {
        self.buffer.prepare(capacity);
        self.phase = 0.0;
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.phase = 0.0;
    }

    #[inline]
    pub fn push(&mut self, frame: StereoSample) {
        self.buffer.push(frame);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next output frame, or `None` until two input frames straddle the read point
    #[inline]
    pub fn next(&mut self, step: f64) -> Option<StereoSample> {
        let a = self.buffer.peek(0)?;
        let b = self.buffer.peek(1)?;
        let t = self.phase as f32;
        let out = a + (b - a) * t;

        self.phase += step;
        let whole = self.phase.floor();
        self.buffer.discard(whole as usize);
        self.phase -= whole;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_overlap_sums_to_one() {
        let w = hann_window(512);
        assert!(w.iter().all(|&x| x > 0.0));
        for i in 0..256 {
            assert!((w[i] + w[i + 256] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_accumulator_normalises_by_weight() {
        let mut acc = OverlapAccumulator::default();
        acc.prepare(4);
        acc.add(0, StereoSample::mono(0.25), 0.5);
        acc.add(0, StereoSample::mono(0.25), 0.5);
        acc.add(3, StereoSample::mono(0.3), 0.6);

        let mut out = Vec::new();
        acc.emit(2, |s| out.push(s));
        assert!((out[0].left - 0.5).abs() < 1e-6);
        assert_eq!(out[1], StereoSample::silence());
        // Index 3 moved to index 1
        assert!((acc.normalized(1).left - 0.5).abs() < 1e-6);
        assert_eq!(acc.normalized(3), StereoSample::silence());
    }

    #[test]
    fn test_resampler_unity_is_identity() {
        let mut r = FractionalResampler::default();
        r.prepare(16);
        for i in 0..8 {
            r.push(StereoSample::mono(i as f32));
        }
        let out: Vec<f32> = std::iter::from_fn(|| r.next(1.0)).map(|s| s.left).collect();
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_resampler_half_step_interpolates() {
        let mut r = FractionalResampler::default();
        r.prepare(16);
        r.push(StereoSample::mono(0.0));
        r.push(StereoSample::mono(1.0));
        r.push(StereoSample::mono(2.0));
        let out: Vec<f32> = std::iter::from_fn(|| r.next(0.5)).map(|s| s.left).collect();
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
    }
}
