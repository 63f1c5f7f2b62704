use crate::audio::Frame;

/// Mean and standard deviation of one channel over one frame.
///
/// The standard deviation is the only loudness metric the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    pub mean: f32,
    pub stddev: f32,
}

/// Per-channel mean and stddev in a single pass over the frame.
pub fn means_and_std_devs(frame: &Frame) -> Vec<ChannelStats> {
    let channels = frame.channels();
    let n = frame.samples_per_channel();
    let mut sums = vec![0.0f64; channels];
    let mut sums_sq = vec![0.0f64; channels];

    for (i, &sample) in frame.interleaved().iter().enumerate() {
        let ch = i % channels;
        let value = sample as f64;
        sums[ch] += value;
        sums_sq[ch] += value * value;
    }

    sums.iter()
        .zip(sums_sq.iter())
        .map(|(&sum, &sum_sq)| {
            if n == 0 {
                return ChannelStats {
                    mean: 0.0,
                    stddev: 0.0,
                };
            }
            let mean = sum / n as f64;
            // rounding can leave a tiny negative variance on flat channels
            let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
            ChannelStats {
                mean: mean as f32,
                stddev: variance.sqrt() as f32,
            }
        })
        .collect()
}

/// Index of the channel with the largest stddev. Ties go to the lower index.
pub fn loudest_channel(stats: &[ChannelStats]) -> usize {
    let mut best = 0;
    for (ch, s) in stats.iter().enumerate() {
        if s.stddev > stats[best].stddev {
            best = ch;
        }
    }
    best
}

/// Subtracts each channel's mean in place, rounding back to integers.
pub fn recenter(frame: &mut Frame, stats: &[ChannelStats]) {
    let n = frame.samples_per_channel();
    for (ch, s) in stats.iter().enumerate().take(frame.channels()) {
        for i in 0..n {
            let value = frame.sample(ch, i) as f32 - s.mean;
            frame.set_sample(ch, i, clamp_sample(value));
        }
    }
}

/// Recenters, then scales every channel to the loudest channel's stddev.
///
/// Amplifies the noise of quiet channels; off unless configured.
pub fn recenter_and_rescale(frame: &mut Frame, stats: &[ChannelStats]) {
    let target = stats.iter().map(|s| s.stddev).fold(0.0f32, f32::max);
    let n = frame.samples_per_channel();
    for (ch, s) in stats.iter().enumerate().take(frame.channels()) {
        let scale = if s.stddev > 0.0 { target / s.stddev } else { 1.0 };
        for i in 0..n {
            let value = (frame.sample(ch, i) as f32 - s.mean) * scale;
            frame.set_sample(ch, i, clamp_sample(value));
        }
    }
}

#[inline]
fn clamp_sample(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_channels() {
        let frame =
            Frame::from_channels(&[vec![5; 64], vec![-7; 64], vec![0; 64], vec![1200; 64]])
                .unwrap();
        let stats = means_and_std_devs(&frame);
        let expected = [5.0, -7.0, 0.0, 1200.0];
        for (s, &v) in stats.iter().zip(expected.iter()) {
            assert_eq!(s.mean, v);
            assert_eq!(s.stddev, 0.0);
        }
    }

    #[test]
    fn test_square_wave_stats() {
        let wave: Vec<i16> = (0..100).map(|i| if i % 2 == 0 { 110 } else { 90 }).collect();
        let frame = Frame::from_channels(&[wave.clone(), wave.clone(), wave.clone(), wave]).unwrap();
        let stats = means_and_std_devs(&frame);
        assert!((stats[2].mean - 100.0).abs() < 1e-4);
        assert!((stats[2].stddev - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_loudest_channel() {
        let stats = [
            ChannelStats { mean: 0.0, stddev: 3.0 },
            ChannelStats { mean: 0.0, stddev: 9.0 },
            ChannelStats { mean: 0.0, stddev: 9.0 },
            ChannelStats { mean: 0.0, stddev: 1.0 },
        ];
        assert_eq!(loudest_channel(&stats), 1);
    }

    #[test]
    fn test_recenter_removes_mean() {
        let mut frame = Frame::from_channels(&[
            vec![10, 12, 14],
            vec![-1, -1, -1],
            vec![0, 0, 3],
            vec![100, 200, 300],
        ])
        .unwrap();
        let stats = means_and_std_devs(&frame);
        recenter(&mut frame, &stats);
        assert_eq!(frame.channel(0).collect::<Vec<_>>(), vec![-2, 0, 2]);
        assert_eq!(frame.channel(1).collect::<Vec<_>>(), vec![0, 0, 0]);
        assert_eq!(frame.channel(2).collect::<Vec<_>>(), vec![-1, -1, 2]);
        assert_eq!(frame.channel(3).collect::<Vec<_>>(), vec![-100, 0, 100]);
    }

    #[test]
    fn test_rescale_matches_loudest() {
        let mut frame = Frame::from_channels(&[
            vec![-10, 10, -10, 10],
            vec![-100, 100, -100, 100],
            vec![0, 0, 0, 0],
            vec![-50, 50, -50, 50],
        ])
        .unwrap();
        let stats = means_and_std_devs(&frame);
        recenter_and_rescale(&mut frame, &stats);
        let after = means_and_std_devs(&frame);
        assert!((after[0].stddev - 100.0).abs() < 1e-3);
        assert!((after[3].stddev - 100.0).abs() < 1e-3);
        assert_eq!(after[2].stddev, 0.0);
    }
}
