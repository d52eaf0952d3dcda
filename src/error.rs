use std::io;
use std::path::{Path, PathBuf};

/// Failure while turning one capture file into a throughput series.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The dissection step could not produce records for the capture.
    #[error("failed to dissect {}: {reason}", .path.display())]
    Dissection { path: PathBuf, reason: String },

    /// A record line could not be decoded.
    #[error("malformed record in {} at line {line}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: ParseRecordError,
    },

    /// Reading, writing or removing a file failed.
    #[error("filesystem error on {}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn dissection(path: &Path, reason: impl Into<String>) -> Self {
        Error::Dissection {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn filesystem(path: &Path, source: io::Error) -> Self {
        Error::Filesystem {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Error decoding a single tab-separated record line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseRecordError {
    #[error("wrong number of fields (expected {expected}, got {got})")]
    WrongNrFields { expected: usize, got: usize },

    #[error("failed to parse {field} from {value:?}")]
    BadNumber { field: &'static str, value: String },
}
