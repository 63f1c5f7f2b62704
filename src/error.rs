use thiserror::Error;

/// Errors surfaced by the localization pipeline.
///
/// Per-frame transient conditions (silence, cluster miss, LUT miss) are not
/// errors and never show up here.
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal startup problem: bad constants, frame too short, degenerate geometry.
    #[error("configuration error: {0}")]
    Config(String),

    /// The capture source failed to deliver a frame.
    #[error("acquisition error: {0}")]
    Acquisition(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
