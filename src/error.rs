use std::path::PathBuf;
use thiserror::Error;

// --- Error Type for the Scanner ---
#[derive(Debug, Error)]
pub enum ScanError {
    /// Malformed or inconsistent source: duplicate feature names, shape mismatch, bad values.
    #[error("Format error: {0}")]
    Format(String),

    #[error("Source not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A chunk task failed; aborts the enclosing pass and the whole scan.
    #[error("Computation failed on chunk {chunk_index} (samples {start}..{end}): {source}")]
    Computation {
        chunk_index: usize,
        start: usize,
        end: usize,
        #[source]
        source: Box<ScanError>,
    },

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "loom")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

impl ScanError {
    /// Chunk index of a computation failure, if this is one.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            ScanError::Computation { chunk_index, .. } => Some(*chunk_index),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
