//! Reporting side: the latest-frame board and the periodic sound report.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::Frame;
use crate::error::{Error, Result};
use crate::tracker::{Trackable, Tracker};
use crate::visualize::render_snapshot;

/// Everything the pipeline publishes about one processed frame.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub frame_number: u64,
    pub frame: Frame,
    pub loudness: f32,
    /// Lag of every channel against the reference channel.
    pub lags: Vec<i32>,
}

/// Single-slot, copy-on-publish holder of the newest [`FrameSnapshot`].
///
/// Readers get a whole snapshot, old or new, never a mix.
#[derive(Debug, Default)]
pub struct FrameBoard {
    latest: Mutex<Option<Arc<FrameSnapshot>>>,
}

impl FrameBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: FrameSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.latest.lock() = Some(snapshot);
    }

    pub fn latest(&self) -> Option<Arc<FrameSnapshot>> {
        self.latest.lock().clone()
    }

    /// Number of the newest published frame, 0 before the first one.
    pub fn current_frame(&self) -> u64 {
        self.latest.lock().as_ref().map_or(0, |s| s.frame_number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoundEntry {
    pub location: [f32; 3],
    pub first_frame: u64,
    pub last_frame: u64,
    pub loudness: f32,
}

/// JSON body served to external clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoundReport {
    pub current_frame: u64,
    pub sounds: Vec<SoundEntry>,
}

impl SoundReport {
    /// Keeps only sounds at or above `silence_loudness`.
    pub fn new(current_frame: u64, sounds: &[Trackable], silence_loudness: f32) -> Self {
        let sounds = sounds
            .iter()
            .filter(|s| s.loudness >= silence_loudness)
            .map(|s| SoundEntry {
                location: s.location,
                first_frame: s.first_frame,
                last_frame: s.last_frame,
                loudness: s.loudness,
            })
            .collect();
        Self {
            current_frame,
            sounds,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Writes `contents` next to `path` and renames it over the target, so
/// readers never see a half-written file.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)
        .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Persistence(format!("rename to {}: {}", path.display(), e)))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ReporterOptions {
    pub interval: Duration,
    pub silence_loudness: f32,
    pub json_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
}

/// Periodically evicts stale sounds and writes the report outputs, on its
/// own thread, until the shared running flag clears.
pub struct Reporter {
    tracker: Arc<Tracker>,
    board: Arc<FrameBoard>,
    options: ReporterOptions,
}

impl Reporter {
    pub fn new(tracker: Arc<Tracker>, board: Arc<FrameBoard>, options: ReporterOptions) -> Self {
        Self {
            tracker,
            board,
            options,
        }
    }

    /// One report pass. Locks are released before any file is written.
    pub fn report_once(&self) -> Result<SoundReport> {
        let latest = self.board.latest();
        let current_frame = latest.as_ref().map_or(0, |s| s.frame_number);
        let sounds = self.tracker.sounds_since(current_frame);
        let report = SoundReport::new(current_frame, &sounds, self.options.silence_loudness);

        if let Some(path) = &self.options.json_path {
            write_atomically(path, report.to_json()?.as_bytes())?;
        }
        if let (Some(path), Some(snapshot)) = (&self.options.snapshot_path, latest.as_deref()) {
            render_snapshot(snapshot, &report.sounds, path)?;
        }
        debug!(current_frame, sounds = report.sounds.len(), "report written");
        Ok(report)
    }

    pub fn spawn(self, running: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("reporter".into())
            .spawn(move || {
                info!(interval = ?self.options.interval, "reporter started");
                while running.load(Ordering::Acquire) {
                    thread::sleep(self.options.interval);
                    if let Err(e) = self.report_once() {
                        warn!(error = %e, "report failed");
                    }
                }
                // final pass so the outputs reflect the last frame
                if let Err(e) = self.report_once() {
                    warn!(error = %e, "final report failed");
                }
                info!("reporter stopped");
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerSettings;

    fn snapshot(frame_number: u64) -> FrameSnapshot {
        FrameSnapshot {
            frame_number,
            frame: Frame::from_interleaved(vec![0; 8], 4).unwrap(),
            loudness: 0.0,
            lags: vec![0; 4],
        }
    }

    #[test]
    fn test_board_keeps_latest() {
        let board = FrameBoard::new();
        assert!(board.latest().is_none());
        assert_eq!(board.current_frame(), 0);
        board.publish(snapshot(3));
        let held = board.latest().unwrap();
        board.publish(snapshot(4));
        assert_eq!(held.frame_number, 3);
        assert_eq!(board.current_frame(), 4);
    }

    #[test]
    fn test_report_filters_quiet_sounds() {
        let sounds = vec![
            Trackable {
                location: [0.0, 1.0, 0.0],
                first_frame: 1,
                last_frame: 2,
                loudness: 300.0,
            },
            Trackable {
                location: [1.0, 0.0, 0.0],
                first_frame: 1,
                last_frame: 2,
                loudness: 100.0,
            },
        ];
        let report = SoundReport::new(2, &sounds, 250.0);
        assert_eq!(report.sounds.len(), 1);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["current_frame"], 2);
        assert_eq!(json["sounds"][0]["last_frame"], 2);
        assert_eq!(json["sounds"][0]["location"][1], 1.0);
    }

    #[test]
    fn test_report_once_evicts_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("sounds.json");
        let tracker = Arc::new(Tracker::new(TrackerSettings {
            timeout_frames: 5,
            ..TrackerSettings::default()
        }));
        let board = Arc::new(FrameBoard::new());
        tracker.add_point([0.0, 1.0, 0.0], 400.0, 0);
        tracker.add_point([1.0, 0.0, 0.0], 400.0, 8);
        board.publish(snapshot(8));

        let reporter = Reporter::new(
            tracker.clone(),
            board,
            ReporterOptions {
                interval: Duration::from_millis(10),
                silence_loudness: 250.0,
                json_path: Some(json_path.clone()),
                snapshot_path: None,
            },
        );
        let report = reporter.report_once().unwrap();
        assert_eq!(report.current_frame, 8);
        assert_eq!(report.sounds.len(), 1);
        assert_eq!(tracker.len(), 1);

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(written["sounds"][0]["first_frame"], 8);
    }

    #[test]
    fn test_reporter_thread_stops_on_flag() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("sounds.json");
        let running = Arc::new(AtomicBool::new(true));
        let reporter = Reporter::new(
            Arc::new(Tracker::new(TrackerSettings::default())),
            Arc::new(FrameBoard::new()),
            ReporterOptions {
                interval: Duration::from_millis(5),
                silence_loudness: 250.0,
                json_path: Some(json_path.clone()),
                snapshot_path: None,
            },
        );
        let handle = reporter.spawn(running.clone()).unwrap();
        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::Release);
        handle.join().unwrap();
        assert!(json_path.exists());
    }
}
