//! Streaming per-gene and per-cell statistics over chunked expression matrices.
//!
//! A scan reads a `genes x cells` matrix in sample-range chunks, three times:
//!
//! 1. raw aggregates: library sizes, expressed-cell counts, expression totals and the summed
//!    log-normalized abundance used as a z-score baseline;
//! 2. dispersion of that log-normalized abundance around its mean;
//! 3. outlier-aware statistics: per-gene maxima with z-score outliers removed, z-score cutoffs,
//!    outlier counts, and the per-cell library sizes in source order.
//!
//! Each pass is a [`reduce::parallel_reduce`] over a bounded worker pool. Results are returned
//! as an immutable [`ResultBundle`].

pub mod config;
pub mod error;
pub mod pipeline;
pub mod reduce;
pub mod remap;
pub mod scan;
pub mod source;

pub use config::{LibrarySizeFactor, ScanConfig};
pub use error::{Result, ScanError};
pub use scan::{scan, scan_path, ResultBundle};
pub use source::{load_dense, open_source, ChunkSource, DenseMatrix, MemorySource, TsvSource};

#[cfg(feature = "loom")]
pub use source::LoomSource;
