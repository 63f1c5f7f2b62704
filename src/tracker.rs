//! Clusters per-frame direction samples into persistent sounds.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::config::{Config, LoudnessPolicy};
use crate::geometry::{Vec3, dist, lerp};

/// A tracked sound source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trackable {
    pub location: Vec3,
    pub first_frame: u64,
    pub last_frame: u64,
    pub loudness: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    pub cluster_distance: f32,
    pub smoothing_factor: f32,
    pub timeout_frames: u64,
    pub silence_loudness: f32,
    pub loudness_policy: LoudnessPolicy,
}

impl TrackerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cluster_distance: config.cluster_distance,
            smoothing_factor: config.smoothing_factor,
            timeout_frames: config.timeout_frames(),
            silence_loudness: config.silence_loudness,
            loudness_policy: config.loudness_policy,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Set of active sounds, shared between the pipeline (writer) and the
/// reporter (evicting reader). Every operation holds the lock only for its
/// scan or copy.
#[derive(Debug)]
pub struct Tracker {
    settings: TrackerSettings,
    sounds: Mutex<Vec<Trackable>>,
}

impl Tracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            sounds: Mutex::new(Vec::new()),
        }
    }

    /// Assigns a direction sample to the nearest live sound within the
    /// cluster distance, or starts a new sound. Samples quieter than the
    /// silence threshold are ignored.
    pub fn add_point(&self, location: Vec3, loudness: f32, frame_number: u64) {
        let s = &self.settings;
        if loudness < s.silence_loudness {
            return;
        }

        let mut sounds = self.sounds.lock();
        let nearest = sounds
            .iter()
            .enumerate()
            .filter(|(_, sound)| is_live(sound, s, frame_number))
            .map(|(i, sound)| (i, dist(&location, &sound.location)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match nearest {
            Some((i, d)) if d < s.cluster_distance => {
                let sound = &mut sounds[i];
                sound.loudness = match s.loudness_policy {
                    LoudnessPolicy::Max => sound.loudness.max(loudness),
                    LoudnessPolicy::Decay => {
                        let missed = frame_number.saturating_sub(sound.last_frame.saturating_add(1));
                        decayed(sound.loudness, s.smoothing_factor, missed)
                            + s.smoothing_factor * loudness
                    }
                };
                sound.location = lerp(&sound.location, &location, s.smoothing_factor);
                sound.last_frame = sound.last_frame.max(frame_number);
                trace!(index = i, distance = d, "reinforced sound");
            }
            _ => {
                trace!(?location, loudness, frame_number, "new sound");
                sounds.push(Trackable {
                    location,
                    first_frame: frame_number,
                    last_frame: frame_number,
                    loudness,
                });
            }
        }
    }

    /// Evicts sounds that timed out as of `frame_number` (the current
    /// frame), then returns a copy of the rest.
    ///
    /// Under the decay policy the copies carry loudness decayed to
    /// `frame_number`, and sounds that have faded below the silence
    /// threshold are evicted too.
    pub fn sounds_since(&self, frame_number: u64) -> Vec<Trackable> {
        let s = &self.settings;
        let mut sounds = self.sounds.lock();
        sounds.retain(|sound| is_live(sound, s, frame_number));

        match s.loudness_policy {
            LoudnessPolicy::Max => sounds.clone(),
            LoudnessPolicy::Decay => {
                sounds.retain(|sound| {
                    current_loudness(sound, s, frame_number) >= s.silence_loudness
                });
                sounds
                    .iter()
                    .map(|sound| Trackable {
                        loudness: current_loudness(sound, s, frame_number),
                        ..sound.clone()
                    })
                    .collect()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sounds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sounds.lock().is_empty()
    }
}

fn is_live(sound: &Trackable, s: &TrackerSettings, frame_number: u64) -> bool {
    sound.last_frame.saturating_add(s.timeout_frames) >= frame_number
}

fn decayed(loudness: f32, smoothing: f32, frames: u64) -> f32 {
    loudness * (1.0 - smoothing).powi(frames.min(i32::MAX as u64) as i32)
}

fn current_loudness(sound: &Trackable, s: &TrackerSettings, frame_number: u64) -> f32 {
    decayed(
        sound.loudness,
        s.smoothing_factor,
        frame_number.saturating_sub(sound.last_frame),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(timeout_frames: u64, policy: LoudnessPolicy) -> Tracker {
        Tracker::new(TrackerSettings {
            cluster_distance: 0.4,
            smoothing_factor: 1.0 / 6.0,
            timeout_frames,
            silence_loudness: 250.0,
            loudness_policy: policy,
        })
    }

    #[test]
    fn test_same_location_clusters() {
        let t = tracker(60, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 400.0, 0);
        t.add_point([0.0, 1.0, 0.0], 400.0, 1);
        let sounds = t.sounds_since(1);
        assert_eq!(sounds.len(), 1);
        assert_eq!(sounds[0].first_frame, 0);
        assert_eq!(sounds[0].last_frame, 1);
        assert_eq!(sounds[0].location, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_location_is_smoothed() {
        let t = tracker(60, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 400.0, 0);
        t.add_point([0.3, 1.0, 0.0], 500.0, 2);
        let sounds = t.sounds_since(2);
        assert_eq!(sounds.len(), 1);
        assert!((sounds[0].location[0] - 0.05).abs() < 1e-6);
        assert_eq!(sounds[0].loudness, 500.0);
    }

    #[test]
    fn test_distant_points_make_new_sounds() {
        let t = tracker(60, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 400.0, 0);
        t.add_point([0.0, -1.0, 0.0], 400.0, 0);
        t.add_point([1.0, 0.0, 0.0], 400.0, 1);
        assert_eq!(t.sounds_since(1).len(), 3);
    }

    #[test]
    fn test_picks_nearest_cluster() {
        let t = tracker(60, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 400.0, 0);
        t.add_point([0.5, 0.85, 0.0], 400.0, 0);
        t.add_point([0.4, 0.9, 0.0], 400.0, 1);
        let sounds = t.sounds_since(1);
        assert_eq!(sounds.len(), 2);
        assert_eq!(sounds[0].last_frame, 0);
        assert_eq!(sounds[1].last_frame, 1);
    }

    #[test]
    fn test_expiry_boundary() {
        let t = tracker(60, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 400.0, 0);
        assert_eq!(t.sounds_since(60).len(), 1);
        assert!(t.sounds_since(61).is_empty());
        assert!(t.is_empty());
    }

    #[test]
    fn test_expired_sound_is_not_reinforced() {
        let t = tracker(5, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 400.0, 0);
        t.add_point([0.0, 1.0, 0.0], 400.0, 10);
        // the stale entry is left for eviction, the sample starts a new sound
        assert_eq!(t.len(), 2);
        let sounds = t.sounds_since(10);
        assert_eq!(sounds.len(), 1);
        assert_eq!(sounds[0].first_frame, 10);
    }

    #[test]
    fn test_silence_is_rejected() {
        let t = tracker(60, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 249.9, 0);
        assert!(t.is_empty());
        t.add_point([0.0, 1.0, 0.0], 400.0, 0);
        t.add_point([0.0, 1.0, 0.0], 100.0, 1);
        let sounds = t.sounds_since(1);
        assert_eq!(sounds[0].last_frame, 0);
        assert_eq!(sounds[0].loudness, 400.0);
    }

    #[test]
    fn test_decay_policy_blends_loudness() {
        let t = tracker(60, LoudnessPolicy::Decay);
        t.add_point([0.0, 1.0, 0.0], 600.0, 0);
        t.add_point([0.0, 1.0, 0.0], 600.0, 3);
        // two missed frames: 600 * (5/6)^2 + 600 / 6
        let expected = 600.0 * (5.0f32 / 6.0).powi(2) + 100.0;
        let sounds = t.sounds_since(3);
        assert!((sounds[0].loudness - expected).abs() < 1e-3);
    }

    #[test]
    fn test_decay_policy_fades_out() {
        let t = tracker(60, LoudnessPolicy::Decay);
        t.add_point([0.0, 1.0, 0.0], 320.0, 0);
        assert_eq!(t.sounds_since(0).len(), 1);
        // 320 * 5/6 is still audible, 320 * (5/6)^2 is not
        assert_eq!(t.sounds_since(1).len(), 1);
        assert!(t.sounds_since(2).is_empty());
    }

    #[test]
    fn test_unbounded_timeout_never_expires() {
        let t = tracker(u64::MAX, LoudnessPolicy::Max);
        t.add_point([0.0, 1.0, 0.0], 400.0, 5);
        t.add_point([0.0, 1.0, 0.0], 400.0, u64::MAX);
        let sounds = t.sounds_since(u64::MAX);
        assert_eq!(sounds.len(), 1);
        assert_eq!(sounds[0].last_frame, u64::MAX);
    }
}
