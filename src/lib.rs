//! Direction-of-arrival estimation and sound tracking for a tetrahedral
//! four-microphone array.
//!
//! Frames flow through [`stats`] and [`delay`] into a delay signature, the
//! [`lut`] turns that into a direction, and the [`tracker`] clusters
//! directions into persistent sounds. [`pipeline`] ties the steps together
//! and [`report`] exposes the result to readers on another thread.

pub mod audio;
pub mod config;
pub mod correlation;
pub mod delay;
pub mod error;
pub mod geometry;
pub mod lut;
pub mod pipeline;
pub mod report;
pub mod sphere;
pub mod stats;
pub mod tracker;
pub mod visualize;

pub use audio::{Frame, FrameSource, RawFrameSource, WavFrameSource};
pub use config::Config;
pub use error::{Error, Result};
pub use lut::{DirectionLut, LutEntry, LutKey, LutParams};
pub use pipeline::{FrameOutcome, Pipeline};
pub use report::{FrameBoard, Reporter, ReporterOptions, SoundReport};
pub use tracker::{Trackable, Tracker, TrackerSettings};
