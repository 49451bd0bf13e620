//! Per-channel sample arrays exchanged between stages.
//!
//! Samples are stored frame-major: all channels for sample 0, then all
//! channels for sample 1, and so on. Every stage walks time sample by sample
//! and touches every channel per step, so a frame is one contiguous slice.

use serde::{Deserialize, Serialize};

/// A block of `num_samples` frames, each holding one value per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBlock {
    num_channels: usize,
    num_samples: usize,
    data: Vec<f64>,
}

impl ChannelBlock {
    /// A zero-filled block.
    pub fn zeros(num_channels: usize, num_samples: usize) -> Self {
        ChannelBlock {
            num_channels,
            num_samples,
            data: vec![0.0; num_channels * num_samples],
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// All channel values at sample `t`.
    pub fn frame(&self, t: usize) -> &[f64] {
        let start = t * self.num_channels;
        &self.data[start..start + self.num_channels]
    }

    pub fn frame_mut(&mut self, t: usize) -> &mut [f64] {
        let start = t * self.num_channels;
        &mut self.data[start..start + self.num_channels]
    }

    pub fn frames(&self) -> impl Iterator<Item = &[f64]> {
        // chunks_exact panics on 0; an empty-channel block has no frames worth visiting
        self.data.chunks_exact(self.num_channels.max(1))
    }

    /// The time series of one channel.
    pub fn channel(&self, ch: usize) -> impl Iterator<Item = f64> + '_ {
        self.data
            .iter()
            .skip(ch)
            .step_by(self.num_channels.max(1))
            .copied()
    }

    pub fn channel_to_vec(&self, ch: usize) -> Vec<f64> {
        self.channel(ch).collect()
    }

    /// Root-mean-square value of one channel over the block.
    pub fn channel_rms(&self, ch: usize) -> f64 {
        if self.num_samples == 0 {
            return 0.0;
        }
        let sum_sq: f64 = self.channel(ch).map(|x| x * x).sum();
        (sum_sq / self.num_samples as f64).sqrt()
    }

    pub fn channel_mean(&self, ch: usize) -> f64 {
        if self.num_samples == 0 {
            return 0.0;
        }
        self.channel(ch).sum::<f64>() / self.num_samples as f64
    }

    /// RMS of every channel, in channel order.
    pub fn rms_profile(&self) -> Vec<f64> {
        (0..self.num_channels).map(|ch| self.channel_rms(ch)).collect()
    }

    pub fn max_value(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min_value(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Flat frame-major view of the samples.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Add one frame at the end. `frame` must hold one value per channel.
    pub(crate) fn push_frame(&mut self, frame: &[f64]) {
        debug_assert_eq!(frame.len(), self.num_channels);
        self.data.extend_from_slice(frame);
        self.num_samples += 1;
    }

    /// Append the frames of `other` after the frames of `self`.
    ///
    /// Both blocks must carry the same channel count; callers inside the
    /// crate guarantee this.
    pub(crate) fn append(&mut self, other: &ChannelBlock) {
        debug_assert_eq!(self.num_channels, other.num_channels);
        self.data.extend_from_slice(&other.data);
        self.num_samples += other.num_samples;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_block() -> ChannelBlock {
        // 3 channels, 4 samples; value = 10 * t + ch
        let mut b = ChannelBlock::zeros(3, 4);
        for t in 0..4 {
            for (ch, v) in b.frame_mut(t).iter_mut().enumerate() {
                *v = (10 * t + ch) as f64;
            }
        }
        b
    }

    #[test]
    fn frames_are_contiguous() {
        let b = ramp_block();
        assert_eq!(b.frame(2), &[20.0, 21.0, 22.0]);
        assert_eq!(b.frames().count(), 4);
    }

    #[test]
    fn channel_iterates_over_time() {
        let b = ramp_block();
        assert_eq!(b.channel_to_vec(1), vec![1.0, 11.0, 21.0, 31.0]);
        assert!((b.channel_mean(0) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn rms_of_constant_channel() {
        let mut b = ChannelBlock::zeros(2, 8);
        for t in 0..8 {
            b.frame_mut(t)[1] = -2.0;
        }
        assert_eq!(b.channel_rms(0), 0.0);
        assert!((b.channel_rms(1) - 2.0).abs() < 1e-12);
        assert_eq!(b.rms_profile().len(), 2);
    }

    #[test]
    fn append_extends_time_axis() {
        let mut a = ramp_block();
        let b = ramp_block();
        a.append(&b);
        assert_eq!(a.num_samples(), 8);
        assert_eq!(a.frame(4), b.frame(0));
        assert_eq!(a.max_value(), 32.0);
        assert_eq!(a.min_value(), 0.0);
    }

    #[test]
    fn push_frame_adds_one_sample() {
        let mut b = ChannelBlock::zeros(3, 0);
        b.push_frame(&[1.0, 2.0, 3.0]);
        b.push_frame(&[4.0, 5.0, 6.0]);
        assert_eq!(b.num_samples(), 2);
        assert_eq!(b.channel_to_vec(2), vec![3.0, 6.0]);
    }

    #[test]
    fn empty_block_statistics() {
        let b = ChannelBlock::zeros(5, 0);
        assert!(b.is_empty());
        assert_eq!(b.channel_rms(3), 0.0);
        assert_eq!(b.channel_mean(3), 0.0);
    }
}
