use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::{s, Array2};

use crate::error::{Result, ScanError};

/// Value the matrix format uses to flag a missing entry.
pub const MISSING_SENTINEL: f32 = -1.0;

// --- Chunk Source Interface ---

/// Read-only access to a `features x samples` matrix in contiguous sample-range slices.
///
/// Implementations are shared by every worker of a pass, so `read_chunk` must not rely on
/// mutable shared state; each call opens its own view of the underlying data.
pub trait ChunkSource: Send + Sync {
    fn feature_names(&self) -> &[String];

    fn sample_ids(&self) -> &[String];

    fn feature_count(&self) -> usize {
        self.feature_names().len()
    }

    fn sample_count(&self) -> usize {
        self.sample_ids().len()
    }

    /// Returns the `features x min(size, sample_count - start)` slice starting at sample
    /// `start`, with missing entries already mapped to NaN.
    fn read_chunk(&self, start: usize, size: usize) -> Result<Array2<f32>>;
}

#[inline]
pub fn missing_to_nan(value: f32) -> f32 {
    if value == MISSING_SENTINEL {
        f32::NAN
    } else {
        value
    }
}

/// Clamps a requested sample range to the matrix and returns its exclusive end.
pub(crate) fn chunk_end(start: usize, size: usize, sample_count: usize) -> Result<usize> {
    if start > sample_count {
        return Err(ScanError::Format(format!(
            "chunk start {} is beyond the sample count {}",
            start, sample_count
        )));
    }
    Ok(start.saturating_add(size).min(sample_count))
}

pub(crate) fn index_sample_ids(sample_count: usize) -> Vec<String> {
    (0..sample_count).map(|idx| idx.to_string()).collect()
}

/// Fails with a `Format` error naming every feature that occurs more than once.
pub fn check_unique_features(feature_names: &[String]) -> Result<()> {
    let mut counts: HashMap<&str, usize> = HashMap::with_capacity(feature_names.len());
    for name in feature_names {
        *counts.entry(name.as_str()).or_insert(0) += 1;
    }
    let mut duplicated: Vec<(&str, usize)> =
        counts.into_iter().filter(|(_, count)| *count > 1).collect();
    if duplicated.is_empty() {
        return Ok(());
    }
    duplicated.sort_unstable();
    Err(ScanError::Format(format!(
        "duplicate feature names (name, occurrences): {:?}",
        duplicated
    )))
}

// --- In-Memory Source ---

#[derive(Clone, Debug)]
pub struct MemorySource {
    matrix: Arc<Array2<f32>>,
    feature_names: Vec<String>,
    sample_ids: Vec<String>,
}

impl MemorySource {
    /// Wraps a `features x samples` matrix. Sample ids default to the column index.
    pub fn new(
        mut matrix: Array2<f32>,
        feature_names: Vec<String>,
        sample_ids: Option<Vec<String>>,
    ) -> Result<Self> {
        let (num_features, num_samples) = matrix.dim();
        if feature_names.len() != num_features {
            return Err(ScanError::Format(format!(
                "matrix has {} feature rows but {} feature names were given",
                num_features,
                feature_names.len()
            )));
        }
        let sample_ids = match sample_ids {
            Some(ids) if ids.len() != num_samples => {
                return Err(ScanError::Format(format!(
                    "matrix has {} sample columns but {} sample ids were given",
                    num_samples,
                    ids.len()
                )));
            }
            Some(ids) => ids,
            None => index_sample_ids(num_samples),
        };
        matrix.mapv_inplace(missing_to_nan);
        Ok(Self {
            matrix: Arc::new(matrix),
            feature_names,
            sample_ids,
        })
    }
}

impl ChunkSource for MemorySource {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    fn read_chunk(&self, start: usize, size: usize) -> Result<Array2<f32>> {
        let end = chunk_end(start, size, self.sample_count())?;
        Ok(self.matrix.slice(s![.., start..end]).to_owned())
    }
}

// --- Tab-Separated Dense Matrix Source ---

/// Dense text matrix: a header `label<TAB>sample ids...` followed by one
/// `feature<TAB>values...` line per feature.
///
/// Nothing is kept in memory besides the catalogs. Every `read_chunk` re-opens the file and
/// scans all of it, so one pass costs `ceil(samples / batch_size)` full reads. Prefer a large
/// `batch_size` (or a loom input) for big text matrices.
#[derive(Clone, Debug)]
pub struct TsvSource {
    path: PathBuf,
    feature_names: Vec<String>,
    sample_ids: Vec<String>,
}

fn parse_value(field: &str, line_num: usize, path: &Path) -> Result<f32> {
    let trimmed = field.trim();
    if trimmed.eq_ignore_ascii_case("nan") || trimmed.eq_ignore_ascii_case("na") {
        return Ok(f32::NAN);
    }
    trimmed.parse::<f32>().map(missing_to_nan).map_err(|e| {
        ScanError::Format(format!(
            "{} line {}: cannot parse value '{}': {}",
            path.display(),
            line_num,
            trimmed,
            e
        ))
    })
}

fn open_lines(path: &Path) -> Result<std::io::Lines<BufReader<File>>> {
    if !path.exists() {
        return Err(ScanError::NotFound(path.to_path_buf()));
    }
    Ok(BufReader::new(File::open(path)?).lines())
}

impl TsvSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening TSV matrix: {}", path.display());
        let mut lines = open_lines(&path)?;

        let header = match lines.next() {
            Some(line) => line?,
            None => return Err(ScanError::Format(format!("{} is empty", path.display()))),
        };
        let header_ids: Vec<String> = header
            .trim_end_matches('\r')
            .split('\t')
            .skip(1)
            .map(|id| id.trim().to_string())
            .collect();
        let mut expected_samples = if header_ids.is_empty() {
            None
        } else {
            Some(header_ids.len())
        };

        let mut feature_names = Vec::new();
        for (line_idx, line_result) in lines.enumerate() {
            let line_num = line_idx + 2;
            let line = line_result?;
            let trimmed_line = line.trim_end_matches('\r');
            if trimmed_line.trim().is_empty() {
                continue;
            }
            let mut fields = trimmed_line.split('\t');
            let name = fields.next().unwrap_or_default().trim();
            if name.is_empty() {
                return Err(ScanError::Format(format!(
                    "{} line {}: empty feature name",
                    path.display(),
                    line_num
                )));
            }
            let mut value_count = 0usize;
            for field in fields {
                parse_value(field, line_num, &path)?;
                value_count += 1;
            }
            match expected_samples {
                Some(expected) if expected != value_count => {
                    return Err(ScanError::Format(format!(
                        "{} line {}: feature '{}' has {} values, expected {}",
                        path.display(),
                        line_num,
                        name,
                        value_count,
                        expected
                    )));
                }
                Some(_) => {}
                None => expected_samples = Some(value_count),
            }
            feature_names.push(name.to_string());
        }

        check_unique_features(&feature_names)?;
        let sample_count = expected_samples.unwrap_or(0);
        let sample_ids = if header_ids.is_empty() {
            index_sample_ids(sample_count)
        } else {
            header_ids
        };
        info!(
            "TSV matrix {}: {} features x {} samples.",
            path.display(),
            feature_names.len(),
            sample_count
        );
        debug!(
            "Feature names (first 5): {:?}",
            feature_names.iter().take(5).collect::<Vec<_>>()
        );

        Ok(Self {
            path,
            feature_names,
            sample_ids,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for TsvSource {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    fn read_chunk(&self, start: usize, size: usize) -> Result<Array2<f32>> {
        let end = chunk_end(start, size, self.sample_count())?;
        let width = end - start;
        let mut block = Array2::<f32>::zeros((self.feature_count(), width));

        let mut lines = open_lines(&self.path)?;
        // header
        lines.next().transpose()?;

        let mut row_idx = 0usize;
        for (line_idx, line_result) in lines.enumerate() {
            let line_num = line_idx + 2;
            let line = line_result?;
            let trimmed_line = line.trim_end_matches('\r');
            if trimmed_line.trim().is_empty() {
                continue;
            }
            if row_idx >= self.feature_count() {
                return Err(ScanError::Format(format!(
                    "{} changed since it was opened: more than {} feature rows",
                    self.path.display(),
                    self.feature_count()
                )));
            }
            let mut row = block.row_mut(row_idx);
            let mut filled = 0usize;
            for (col_idx, field) in trimmed_line.split('\t').skip(1 + start).take(width).enumerate() {
                row[col_idx] = parse_value(field, line_num, &self.path)?;
                filled += 1;
            }
            if filled != width {
                return Err(ScanError::Format(format!(
                    "{} line {}: row too short for samples {}..{}",
                    self.path.display(),
                    line_num,
                    start,
                    end
                )));
            }
            row_idx += 1;
        }
        if row_idx != self.feature_count() {
            return Err(ScanError::Format(format!(
                "{} changed since it was opened: found {} feature rows, expected {}",
                self.path.display(),
                row_idx,
                self.feature_count()
            )));
        }
        Ok(block)
    }
}

// --- Loom (HDF5) Source ---

#[cfg(feature = "loom")]
pub use loom::LoomSource;

#[cfg(feature = "loom")]
mod loom {
    use super::{check_unique_features, chunk_end, index_sample_ids, missing_to_nan, ChunkSource};
    use crate::error::{Result, ScanError};
    use hdf5::types::{FixedAscii, VarLenAscii, VarLenUnicode};
    use log::info;
    use ndarray::{s, Array2};
    use std::path::{Path, PathBuf};

    const MATRIX_DATASET: &str = "matrix";
    const FEATURE_ATTR: &str = "row_attrs/Gene";
    const SAMPLE_ATTR: &str = "col_attrs/CellID";

    #[derive(Clone, Debug)]
    pub struct LoomSource {
        path: PathBuf,
        feature_names: Vec<String>,
        sample_ids: Vec<String>,
    }

    fn read_string_column(file: &hdf5::File, name: &str) -> Result<Vec<String>> {
        let dataset = file.dataset(name)?;
        if let Ok(values) = dataset.read_raw::<VarLenUnicode>() {
            return Ok(values.iter().map(|v| v.as_str().to_string()).collect());
        }
        if let Ok(values) = dataset.read_raw::<VarLenAscii>() {
            return Ok(values.iter().map(|v| v.as_str().to_string()).collect());
        }
        let values = dataset.read_raw::<FixedAscii<512>>()?;
        Ok(values.iter().map(|v| v.as_str().to_string()).collect())
    }

    impl LoomSource {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            if !path.exists() {
                return Err(ScanError::NotFound(path));
            }
            info!("Opening loom file: {}", path.display());
            let file = hdf5::File::open(&path)?;
            let shape = file.dataset(MATRIX_DATASET)?.shape();
            if shape.len() != 2 {
                return Err(ScanError::Format(format!(
                    "{}: '{}' must be 2-dimensional, found shape {:?}",
                    path.display(),
                    MATRIX_DATASET,
                    shape
                )));
            }
            let (num_features, num_samples) = (shape[0], shape[1]);

            let feature_names = read_string_column(&file, FEATURE_ATTR)?;
            if feature_names.len() != num_features {
                return Err(ScanError::Format(format!(
                    "{}: {} has {} entries but the matrix has {} rows",
                    path.display(),
                    FEATURE_ATTR,
                    feature_names.len(),
                    num_features
                )));
            }
            check_unique_features(&feature_names)?;

            let sample_ids = if file.link_exists(SAMPLE_ATTR) {
                let ids = read_string_column(&file, SAMPLE_ATTR)?;
                if ids.len() != num_samples {
                    return Err(ScanError::Format(format!(
                        "{}: {} has {} entries but the matrix has {} columns",
                        path.display(),
                        SAMPLE_ATTR,
                        ids.len(),
                        num_samples
                    )));
                }
                ids
            } else {
                index_sample_ids(num_samples)
            };
            info!(
                "Loom matrix {}: {} features x {} samples.",
                path.display(),
                num_features,
                num_samples
            );
            Ok(Self {
                path,
                feature_names,
                sample_ids,
            })
        }
    }

    impl ChunkSource for LoomSource {
        fn feature_names(&self) -> &[String] {
            &self.feature_names
        }

        fn sample_ids(&self) -> &[String] {
            &self.sample_ids
        }

        fn read_chunk(&self, start: usize, size: usize) -> Result<Array2<f32>> {
            let end = chunk_end(start, size, self.sample_count())?;
            let file = hdf5::File::open(&self.path)?;
            let dataset = file.dataset(MATRIX_DATASET)?;
            let mut block: Array2<f32> = dataset.read_slice_2d(s![.., start..end])?;
            block.mapv_inplace(missing_to_nan);
            Ok(block)
        }
    }
}

/// Opens the matrix at `path`, choosing the reader from the file extension.
pub fn open_source<P: AsRef<Path>>(path: P) -> Result<Box<dyn ChunkSource>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ScanError::NotFound(path.to_path_buf()));
    }
    let is_loom = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("loom"));
    if is_loom {
        #[cfg(feature = "loom")]
        {
            return Ok(Box::new(LoomSource::open(path)?));
        }
        #[cfg(not(feature = "loom"))]
        {
            return Err(ScanError::Format(format!(
                "{} is a loom file but loom_scan was built without the 'loom' feature",
                path.display()
            )));
        }
    }
    Ok(Box::new(TsvSource::open(path)?))
}

// --- Whole-Matrix Read ---

/// A fully loaded matrix, samples in rows and features in columns.
#[derive(Clone, Debug)]
pub struct DenseMatrix {
    pub values: Array2<f32>,
    pub feature_names: Vec<String>,
    pub sample_ids: Vec<String>,
}

/// Reads the whole matrix in one slice and transposes it to `samples x features`.
/// Only suitable for inputs that fit in memory.
pub fn load_dense(source: &dyn ChunkSource) -> Result<DenseMatrix> {
    check_unique_features(source.feature_names())?;
    let sample_count = source.sample_count();
    let block = source.read_chunk(0, sample_count)?;
    Ok(DenseMatrix {
        values: block.reversed_axes(),
        feature_names: source.feature_names().to_vec(),
        sample_ids: source.sample_ids().to_vec(),
    })
}
