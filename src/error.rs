//! Error Module
//!
//! Per-file and fatal error kinds raised while ingesting a work folder.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by parsing, resolving, extracting and placing.
///
/// Only [`IngestError::MissingTemplate`] stops a run; everything else is
/// logged and the file skipped.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("filename '{file}' does not match its grammar: {reason}")]
    Parse { file: String, reason: String },
    #[error("building identifier '{0}' is not numeric")]
    InvalidIdentifier(String),
    #[error("template sheet '{0}' is missing from the workbook")]
    MissingTemplate(String),
    #[error("sheet '{sheet}' has no '{column}' column")]
    MissingColumn { sheet: String, column: String },
    #[error("could not capture frames from {video:?}: {reason}")]
    Extraction { video: PathBuf, reason: String },
    #[error("could not place image at {cell}: {reason}")]
    Placement { cell: String, reason: String },
    #[error("workbook error: {0}")]
    Workbook(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IngestError {
    /// Whether the error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::MissingTemplate(_))
    }

    /// Whether the error should be counted as a filename parse failure.
    pub fn is_parse_failure(&self) -> bool {
        matches!(
            self,
            IngestError::Parse { .. } | IngestError::InvalidIdentifier(_)
        )
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
