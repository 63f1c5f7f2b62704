//! Per-frame glue: stats, delays, direction lookup, tracking, publication.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, trace};

use crate::audio::{Frame, FrameSource};
use crate::config::{Config, DelaySearch};
use crate::delay::{DelayEstimator, diff_fourway, normalized_correlation};
use crate::error::{Error, Result};
use crate::geometry::{MicArray, Vec3};
use crate::lut::DirectionLut;
use crate::report::{FrameBoard, FrameSnapshot};
use crate::stats::{self, ChannelStats};
use crate::tracker::Tracker;

/// What one frame produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub frame_number: u64,
    /// Loudest channel; every lag is measured against it.
    pub reference: usize,
    pub stats: Vec<ChannelStats>,
    pub lags: Vec<i32>,
    pub confidences: Vec<f32>,
    /// `None` when the LUT had nothing near the delay signature, or no
    /// consensus combination was physically possible.
    pub direction: Option<Vec3>,
    pub loudness: f32,
}

pub struct Pipeline {
    config: Config,
    estimator: DelayEstimator,
    lut: Arc<DirectionLut>,
    tracker: Arc<Tracker>,
    board: Arc<FrameBoard>,
}

impl Pipeline {
    /// Fails on any configuration or geometry problem, before a single
    /// frame is read.
    pub fn new(
        config: Config,
        lut: Arc<DirectionLut>,
        tracker: Arc<Tracker>,
        board: Arc<FrameBoard>,
    ) -> Result<Self> {
        config.validate()?;
        MicArray::tetrahedron(config.sensor_spacing_meters() as f64).validate()?;
        let estimator =
            DelayEstimator::new(config.delay_method, config.max_offset(), config.frame_len())?;

        info!(
            method = ?config.delay_method,
            search = ?config.delay_search,
            frame_len = config.frame_len(),
            max_offset = config.max_offset(),
            "pipeline ready"
        );
        Ok(Self {
            config,
            estimator,
            lut,
            tracker,
            board,
        })
    }

    /// The validated configuration this pipeline runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn process_frame(&self, frame: &mut Frame, frame_number: u64) -> Result<FrameOutcome> {
        self.check_frame(frame)?;

        let channel_stats = stats::means_and_std_devs(frame);
        let reference = stats::loudest_channel(&channel_stats);
        let loudness = channel_stats.iter().map(|s| s.stddev).fold(0.0f32, f32::max);

        if self.config.rescale {
            stats::recenter_and_rescale(frame, &channel_stats);
        } else if self.config.recenter {
            stats::recenter(frame, &channel_stats);
        }

        let (lags, confidences, consistent) = match self.config.delay_search {
            DelaySearch::Pairwise => {
                let (lags, confidences) = self.pairwise_lags(frame, reference)?;
                (lags, confidences, true)
            }
            DelaySearch::Consensus => self.consensus_lags(frame, reference)?,
        };

        let direction = if consistent {
            let signature = [
                (lags[0] - lags[1]) as f64,
                (lags[0] - lags[2]) as f64,
                (lags[0] - lags[3]) as f64,
            ];
            self.lut.lookup(signature).found().map(|entry| entry.direction)
        } else {
            None
        };

        match direction {
            Some(location) => self.tracker.add_point(location, loudness, frame_number),
            None => trace!(frame_number, ?lags, "no direction for frame"),
        }

        self.board.publish(FrameSnapshot {
            frame_number,
            frame: frame.clone(),
            loudness,
            lags: lags.clone(),
        });

        Ok(FrameOutcome {
            frame_number,
            reference,
            stats: channel_stats,
            lags,
            confidences,
            direction,
            loudness,
        })
    }

    /// Pulls frames until end of stream, `max_frames`, or `running` clears.
    /// Frames are numbered from 1. Returns how many were processed.
    pub fn run<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        running: &AtomicBool,
        max_frames: Option<u64>,
    ) -> Result<u64> {
        let mut processed = 0u64;
        while running.load(Ordering::Acquire) {
            if max_frames.is_some_and(|max| processed >= max) {
                debug!(processed, "frame limit reached");
                break;
            }
            let Some(mut frame) = source.next_frame()? else {
                debug!(processed, "end of stream");
                break;
            };
            processed += 1;
            let outcome = self.process_frame(&mut frame, processed)?;
            debug!(
                frame = processed,
                reference = outcome.reference,
                lags = ?outcome.lags,
                loudness = outcome.loudness,
                direction = ?outcome.direction,
                "frame processed"
            );
        }
        info!(frames = processed, sounds = self.tracker.len(), "pipeline stopped");
        Ok(processed)
    }

    fn check_frame(&self, frame: &Frame) -> Result<()> {
        if frame.channels() != self.config.channels {
            return Err(Error::Acquisition(format!(
                "frame has {} channels, expected {}",
                frame.channels(),
                self.config.channels
            )));
        }
        if frame.samples_per_channel() != self.config.frame_len() {
            return Err(Error::Acquisition(format!(
                "frame has {} samples per channel, expected {}",
                frame.samples_per_channel(),
                self.config.frame_len()
            )));
        }
        Ok(())
    }

    fn pairwise_lags(&self, frame: &Frame, reference: usize) -> Result<(Vec<i32>, Vec<f32>)> {
        let channels = frame.channels();
        let mut lags = vec![0; channels];
        let mut confidences = vec![1.0; channels];
        for ch in (0..channels).filter(|&ch| ch != reference) {
            let estimate = self.estimator.estimate(frame, reference, ch)?;
            lags[ch] = estimate.lag;
            confidences[ch] = estimate.confidence;
        }
        Ok((lags, confidences))
    }

    /// Top-N lags per pair, then the combination that best aligns all four
    /// channels at once. The flag is false when every combination spreads
    /// wider than the array allows.
    fn consensus_lags(&self, frame: &Frame, reference: usize) -> Result<(Vec<i32>, Vec<f32>, bool)> {
        let channels = frame.channels();
        let max_offset = self.estimator.max_offset();

        let mut candidates: Vec<Vec<i32>> = Vec::with_capacity(channels);
        for ch in 0..channels {
            if ch == reference {
                candidates.push(vec![0]);
            } else {
                let top = self.estimator.top_n(frame, reference, ch, self.config.top_n)?;
                candidates.push(top.into_iter().map(|c| c.lag).collect());
            }
        }
        // per-pair winners, reported when no combination survives
        let fallback: Vec<i32> = candidates.iter().map(|c| c.first().copied().unwrap_or(0)).collect();

        let mut best: Option<(f64, Vec<i32>)> = None;
        let mut combo = vec![0i32; channels];
        let mut choice = vec![0usize; channels];
        loop {
            for ch in 0..channels {
                combo[ch] = candidates[ch].get(choice[ch]).copied().unwrap_or(0);
            }
            let spread = combo.iter().max().copied().unwrap_or(0) - combo.iter().min().copied().unwrap_or(0);
            if spread as usize <= max_offset {
                let score = diff_fourway(frame, &combo, max_offset)?;
                if best.as_ref().is_none_or(|(s, _)| score < *s) {
                    best = Some((score, combo.clone()));
                }
            }
            if !advance(&mut choice, &candidates) {
                break;
            }
        }

        let Some((score, lags)) = best else {
            debug!(?fallback, "no physically possible lag combination");
            return Ok((fallback, vec![0.0; channels], false));
        };
        trace!(?lags, score, "consensus lags");
        let confidences = (0..channels)
            .map(|ch| {
                if ch == reference {
                    1.0
                } else {
                    normalized_correlation(frame, reference, ch, lags[ch])
                }
            })
            .collect();
        Ok((lags, confidences, true))
    }
}

/// Odometer step over the Cartesian product of `candidates`.
fn advance(choice: &mut [usize], candidates: &[Vec<i32>]) -> bool {
    for (digit, options) in choice.iter_mut().zip(candidates) {
        *digit += 1;
        if *digit < options.len() {
            return true;
        }
        *digit = 0;
    }
    false
}
