//! Pairwise inter-channel delay estimation.
//!
//! A lag `L` between `ch1` and `ch2` means `ch2[t + L]` lines up with
//! `ch1[t]`, i.e. the sound reached `ch2` `L` samples after `ch1`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::audio::Frame;
use crate::config::DelayMethod;
use crate::correlation::CrossCorrelator;
use crate::error::{Error, Result};

/// Best lag for a channel pair plus its normalized correlation at that lag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayEstimate {
    pub lag: i32,
    pub confidence: f32,
}

/// Fails when the frame leaves no samples once the guard band is dropped
/// from both ends.
pub fn check_overlap(frame_len: usize, max_offset: usize) -> Result<()> {
    if frame_len <= 2 * max_offset {
        return Err(Error::config(format!(
            "frame of {} samples has no overlap for lags up to +/-{}",
            frame_len, max_offset
        )));
    }
    Ok(())
}

fn check_offset(offset: i32, max_offset: usize) -> Result<()> {
    if offset.unsigned_abs() as usize > max_offset {
        return Err(Error::config(format!(
            "offset {} outside the +/-{} search range",
            offset, max_offset
        )));
    }
    Ok(())
}

/// Mean squared difference between `ch1[t]` and `ch2[t + offset]`.
///
/// The comparison window always has `n - 2 * max_offset` samples and is
/// shifted by half the offset, so swapping the channels and negating the
/// offset compares exactly the same sample pairs.
pub fn diff_with_offset(
    frame: &Frame,
    ch1: usize,
    ch2: usize,
    offset: i32,
    max_offset: usize,
) -> Result<f64> {
    let n = frame.samples_per_channel();
    check_overlap(n, max_offset)?;
    check_offset(offset, max_offset)?;

    let half = offset.div_euclid(2) as i64;
    let start = max_offset as i64 - half;
    let end = (n - max_offset) as i64 - half;

    let mut total = 0.0f64;
    for t in start..end {
        let a = frame.sample(ch1, t as usize) as f64;
        let b = frame.sample(ch2, (t + offset as i64) as usize) as f64;
        total += (a - b) * (a - b);
    }
    Ok(total / (end - start) as f64)
}

/// Unnormalized dot product of `ch1[t]` and `ch2[t + offset]` over every
/// `t` where both indices are in range.
pub fn dot_with_offset(frame: &Frame, ch1: usize, ch2: usize, offset: i32) -> f64 {
    let n = frame.samples_per_channel() as i64;
    let offset = offset as i64;
    let start = (-offset).max(0);
    let end = n.min(n - offset);

    let mut total = 0.0f64;
    for t in start..end {
        total += frame.sample(ch1, t as usize) as f64
            * frame.sample(ch2, (t + offset) as usize) as f64;
    }
    total
}

pub fn autocorrelation(frame: &Frame, ch: usize) -> f64 {
    dot_with_offset(frame, ch, ch, 0)
}

/// Dot product at `lag` scaled into [-1, 1] by both channels' zero-lag energy.
pub fn normalized_correlation(frame: &Frame, ch1: usize, ch2: usize, lag: i32) -> f32 {
    normalize(
        dot_with_offset(frame, ch1, ch2, lag),
        autocorrelation(frame, ch1),
        autocorrelation(frame, ch2),
    )
}

fn normalize(dot: f64, energy1: f64, energy2: f64) -> f32 {
    let denom = (energy1 * energy2).sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Lags ordered by magnitude: 0, -1, 1, -2, 2, ...
///
/// Scanning in this order and only replacing on a strictly better score makes
/// ties resolve toward the smaller delay.
pub fn lags_by_magnitude(max_offset: usize) -> impl Iterator<Item = i32> {
    let max = max_offset as i32;
    std::iter::once(0).chain((1..=max).flat_map(|k| [-k, k]))
}

fn best_lag(
    max_offset: usize,
    mut score: impl FnMut(i32) -> Result<f64>,
    want: Ordering,
) -> Result<(i32, f64)> {
    let mut best_lag = 0;
    let mut best_score = score(0)?;
    for lag in lags_by_magnitude(max_offset).skip(1) {
        let s = score(lag)?;
        if s.partial_cmp(&best_score) == Some(want) {
            best_lag = lag;
            best_score = s;
        }
    }
    Ok((best_lag, best_score))
}

/// Exhaustive search for the lag with the smallest mean squared difference.
pub fn find_best_offset_ssd(
    frame: &Frame,
    ch1: usize,
    ch2: usize,
    max_offset: usize,
) -> Result<DelayEstimate> {
    let (lag, _) = best_lag(
        max_offset,
        |lag| diff_with_offset(frame, ch1, ch2, lag, max_offset),
        Ordering::Less,
    )?;
    Ok(DelayEstimate {
        lag,
        confidence: normalized_correlation(frame, ch1, ch2, lag),
    })
}

/// Search for the lag with the largest dot product.
pub fn find_best_offset_xcorr(
    frame: &Frame,
    ch1: usize,
    ch2: usize,
    max_offset: usize,
) -> Result<DelayEstimate> {
    check_overlap(frame.samples_per_channel(), max_offset)?;
    let (lag, dot) = best_lag(
        max_offset,
        |lag| Ok(dot_with_offset(frame, ch1, ch2, lag)),
        Ordering::Greater,
    )?;
    Ok(DelayEstimate {
        lag,
        confidence: normalize(dot, autocorrelation(frame, ch1), autocorrelation(frame, ch2)),
    })
}

/// Same search as [`find_best_offset_xcorr`], with every lag's dot product
/// taken from one FFT cross-correlation.
pub fn find_best_offset_xcorr_fft(
    frame: &Frame,
    ch1: usize,
    ch2: usize,
    max_offset: usize,
    correlator: &CrossCorrelator,
) -> Result<DelayEstimate> {
    check_overlap(frame.samples_per_channel(), max_offset)?;
    let series = correlator.correlate_channels(frame, ch1, ch2)?;
    let max = max_offset as i32;
    let at = |lag: i32| series[(lag + max) as usize];
    let (lag, dot) = best_lag(max_offset, |lag| Ok(at(lag)), Ordering::Greater)?;
    Ok(DelayEstimate {
        lag,
        confidence: normalize(dot, autocorrelation(frame, ch1), autocorrelation(frame, ch2)),
    })
}

/// A scored lag. Orders by score, then by lag magnitude, so the "smallest"
/// candidate is the best one under SSD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub lag: i32,
    pub score: f64,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.lag.abs().cmp(&other.lag.abs()))
            .then_with(|| self.lag.cmp(&other.lag))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fixed-capacity max-heap that keeps the `capacity` smallest candidates
/// pushed into it.
#[derive(Debug, Clone)]
pub struct BoundedMaxHeap {
    heap: BinaryHeap<Candidate>,
    capacity: usize,
}

impl BoundedMaxHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, candidate: Candidate) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Kept candidates, best first.
    pub fn into_sorted_vec(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}

/// The `n` lags with the smallest mean squared difference, best first.
pub fn find_top_n_offsets(
    frame: &Frame,
    ch1: usize,
    ch2: usize,
    max_offset: usize,
    n: usize,
) -> Result<Vec<Candidate>> {
    let mut keep = BoundedMaxHeap::new(n);
    for lag in lags_by_magnitude(max_offset) {
        let score = diff_with_offset(frame, ch1, ch2, lag, max_offset)?;
        keep.push(Candidate { lag, score });
    }
    Ok(keep.into_sorted_vec())
}

/// Average squared difference over all six channel pairs once each channel
/// `c` is read at `t + offsets[c]`. Lower is better.
pub fn diff_fourway(frame: &Frame, offsets: &[i32], max_offset: usize) -> Result<f64> {
    let n = frame.samples_per_channel();
    check_overlap(n, max_offset)?;
    if offsets.len() != frame.channels() {
        return Err(Error::config(format!(
            "{} offsets given for {} channels",
            offsets.len(),
            frame.channels()
        )));
    }
    for &offset in offsets {
        check_offset(offset, max_offset)?;
    }

    let channels = offsets.len();
    let pairs = channels * (channels - 1) / 2;
    if pairs == 0 {
        return Ok(0.0);
    }

    let mut aligned = vec![0.0f64; channels];
    let mut total = 0.0f64;
    for t in max_offset..(n - max_offset) {
        for (c, &offset) in offsets.iter().enumerate() {
            aligned[c] = frame.sample(c, (t as i64 + offset as i64) as usize) as f64;
        }
        for a in 0..channels {
            for b in (a + 1)..channels {
                let d = aligned[a] - aligned[b];
                total += d * d;
            }
        }
    }
    Ok(total / (pairs * (n - 2 * max_offset)) as f64)
}

/// A configured pairwise delay search.
pub struct DelayEstimator {
    method: DelayMethod,
    max_offset: usize,
    correlator: Option<CrossCorrelator>,
}

impl DelayEstimator {
    pub fn new(method: DelayMethod, max_offset: usize, frame_len: usize) -> Result<Self> {
        check_overlap(frame_len, max_offset)?;
        let correlator = match method {
            DelayMethod::XcorrFft => Some(CrossCorrelator::new(frame_len, max_offset)),
            DelayMethod::Ssd | DelayMethod::Xcorr => None,
        };
        Ok(Self {
            method,
            max_offset,
            correlator,
        })
    }

    pub fn max_offset(&self) -> usize {
        self.max_offset
    }

    pub fn estimate(&self, frame: &Frame, ch1: usize, ch2: usize) -> Result<DelayEstimate> {
        match (&self.method, &self.correlator) {
            (DelayMethod::Ssd, _) => find_best_offset_ssd(frame, ch1, ch2, self.max_offset),
            (DelayMethod::XcorrFft, Some(correlator)) => {
                find_best_offset_xcorr_fft(frame, ch1, ch2, self.max_offset, correlator)
            }
            _ => find_best_offset_xcorr(frame, ch1, ch2, self.max_offset),
        }
    }

    pub fn top_n(&self, frame: &Frame, ch1: usize, ch2: usize, n: usize) -> Result<Vec<Candidate>> {
        find_top_n_offsets(frame, ch1, ch2, self.max_offset, n)
    }
}
