use std::path::PathBuf;

use spotfilter_core::FilterError;
use thiserror::Error;

use crate::io::JobKey;

/// Failures of the pipeline layer: core filter errors plus the I/O raised by
/// loaders and stores. Nothing here is retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{key}: no image for z plane {z}")]
    MissingPlane { key: JobKey, z: usize },
    #[error("{}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the job was abandoned through its cancel token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Filter(FilterError::Cancelled))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
