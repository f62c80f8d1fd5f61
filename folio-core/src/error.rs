use std::path::PathBuf;

use thiserror::Error;

pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

/// Failures surfaced by the reader. None of them are fatal to the process.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Rejected at intake: the source does not identify as a PDF.
    #[error("unsupported format: {found}, expected a PDF document")]
    UnsupportedFormat { found: String },

    /// Rejected at intake: the source exceeds the configured ceiling.
    #[error("document is too large ({size} bytes, limit is {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },

    /// The engine could not parse the byte stream. Prior state is kept.
    #[error("failed to load document {name:?}")]
    DocumentLoad {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A single page could not be extracted. Contained by the content cache.
    #[error("failed to extract page {page}")]
    Extraction {
        page: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration in {path:?}: {message}")]
    Config { path: PathBuf, message: String },
}

impl ReaderError {
    /// Intake rejections happen before any engine work and never touch state.
    pub fn is_intake(&self) -> bool {
        matches!(
            self,
            ReaderError::UnsupportedFormat { .. } | ReaderError::TooLarge { .. }
        )
    }

    /// Short message suitable for a transient notification.
    pub fn user_message(&self) -> String {
        match self {
            ReaderError::UnsupportedFormat { .. } => "Please select a valid PDF file.".to_owned(),
            ReaderError::TooLarge { limit, .. } => format!(
                "The file is too large. Maximum size is {} MB.",
                limit / (1024 * 1024)
            ),
            ReaderError::DocumentLoad { name, .. } => format!("Could not open {name}."),
            ReaderError::Extraction { page, .. } => format!("Page {page} could not be read."),
            ReaderError::Config { path, .. } => {
                format!("Ignoring invalid configuration {}.", path.display())
            }
        }
    }
}
