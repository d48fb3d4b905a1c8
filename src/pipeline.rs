use std::collections::HashSet;

use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis, Zip};

use crate::error::{Result, ScanError};
use crate::reduce::{parallel_reduce, Chunk, ChunkPlan, CombineRule, ReduceOptions};
use crate::source::ChunkSource;

/// z-scores above this mark an entry as an outlier.
pub const OUTLIER_ZSCORE: f64 = 3.0;
/// Lowest z-score still considered when searching for the per-feature cutoff.
pub const CUTOFF_ZSCORE_FLOOR: f64 = -2.5;
/// Stand-in for entries that are excluded from the cutoff minimum.
pub const CUTOFF_SENTINEL: f64 = 10.0;

// --- Feature Mask ---

/// Boolean selection over the feature catalog, with the selected row indices cached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureMask {
    flags: Vec<bool>,
    indices: Vec<usize>,
}

impl FeatureMask {
    pub fn from_flags(flags: Vec<bool>) -> Self {
        let indices = flags
            .iter()
            .enumerate()
            .filter_map(|(idx, &keep)| if keep { Some(idx) } else { None })
            .collect();
        Self { flags, indices }
    }

    pub fn all(num_features: usize) -> Self {
        Self::from_flags(vec![true; num_features])
    }

    /// Membership of every catalog entry in `requested`.
    pub fn from_requested(catalog: &[String], requested: &[String]) -> Self {
        let requested_set: HashSet<&str> = requested.iter().map(String::as_str).collect();
        Self::from_flags(
            catalog
                .iter()
                .map(|name| requested_set.contains(name.as_str()))
                .collect(),
        )
    }

    /// `expressed >= min_cell AND expression > expressed * min_avg_exp`.
    pub fn from_thresholds(
        expressed: &Array1<f64>,
        expression: &Array1<f64>,
        min_cell: f64,
        min_avg_exp: f64,
    ) -> Self {
        Self::from_flags(
            expressed
                .iter()
                .zip(expression.iter())
                .map(|(&cells, &total)| cells >= min_cell && total > cells * min_avg_exp)
                .collect(),
        )
    }

    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Catalog length.
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn selected(&self) -> usize {
        self.indices.len()
    }

    pub fn select_rows(&self, block: &Array2<f32>) -> Array2<f32> {
        block.select(Axis(0), &self.indices)
    }

    pub fn restrict(&self, values: &Array1<f64>) -> Array1<f64> {
        values.select(Axis(0), &self.indices)
    }
}

// --- Per-Chunk Arithmetic ---

#[inline]
fn present(value: f32) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value as f64
    }
}

/// Element-wise `numerator / denominator`, 0 where the denominator is 0.
pub fn safe_divide(numerator: &Array1<f64>, denominator: &Array1<f64>) -> Array1<f64> {
    Zip::from(numerator)
        .and(denominator)
        .map_collect(|&num, &den| if den != 0.0 { num / den } else { 0.0 })
}

/// Column sums over every feature; missing entries count as 0.
pub fn library_sizes(block: &Array2<f32>) -> Array1<f64> {
    block.map_axis(Axis(0), |column| column.iter().map(|&v| present(v)).sum())
}

pub fn expressed_counts(block: &Array2<f32>) -> Array1<f64> {
    block.map_axis(Axis(1), |row| row.iter().filter(|&&v| v > 0.0).count() as f64)
}

pub fn row_totals(block: &Array2<f32>) -> Array1<f64> {
    block.map_axis(Axis(1), |row| row.iter().map(|&v| present(v)).sum())
}

/// Each entry divided by its sample's library size, 0 for empty libraries.
pub fn relative_abundance(block: &Array2<f32>, library: &Array1<f64>) -> Array2<f64> {
    let mut relative = Array2::<f64>::zeros(block.raw_dim());
    Zip::from(relative.columns_mut())
        .and(block.columns())
        .and(library)
        .for_each(|mut out_col, in_col, &lib| {
            if lib != 0.0 {
                Zip::from(&mut out_col)
                    .and(in_col)
                    .for_each(|out, &v| *out = present(v) / lib);
            }
        });
    relative
}

pub fn log_abundance(relative: &Array2<f64>, scale: f64) -> Array2<f64> {
    relative.mapv(|r| (r * scale).ln_1p())
}

/// Next reduced slot, checked against the expected length. A reduction over zero chunks
/// yields empty slots, which become zeros.
fn take_slot(
    slots: &mut impl Iterator<Item = Array1<f64>>,
    len: usize,
    name: &str,
) -> Result<Array1<f64>> {
    match slots.next() {
        Some(slot) if slot.len() == len => Ok(slot),
        Some(slot) if slot.is_empty() => Ok(Array1::zeros(len)),
        Some(slot) => Err(ScanError::Format(format!(
            "{} has {} entries, expected {}",
            name,
            slot.len(),
            len
        ))),
        None => Err(ScanError::Format(format!("reduction returned no {} slot", name))),
    }
}

// --- Pass Results ---

#[derive(Clone, Debug)]
pub struct RawAggregates {
    /// Per catalog feature.
    pub expressed: Array1<f64>,
    pub expression: Array1<f64>,
    /// Per feature of the mask the pass ran with.
    pub z_norm_sum: Array1<f64>,
}

#[derive(Clone, Debug)]
pub struct Baseline {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

#[derive(Clone, Debug)]
pub struct OutlierStats {
    pub filtered_max: Array1<f64>,
    pub zscore_cutoff: Array1<f64>,
    pub outlier_count: Array1<f64>,
    /// Per sample, in source order.
    pub library_size: Array1<f64>,
}

// --- Pipeline Stages ---

/// The three sequential scanning passes over one source.
pub struct StatsPipeline<'a> {
    source: &'a dyn ChunkSource,
    plan: ChunkPlan,
    workers: usize,
    z_library_size_factor: f64,
    show_progress: bool,
}

impl<'a> StatsPipeline<'a> {
    pub fn new(
        source: &'a dyn ChunkSource,
        batch_size: usize,
        workers: usize,
        z_library_size_factor: f64,
    ) -> Result<Self> {
        Ok(Self {
            source,
            plan: ChunkPlan::new(source.sample_count(), batch_size)?,
            workers,
            z_library_size_factor,
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    fn options(&self, label: &str) -> ReduceOptions {
        let options = ReduceOptions::new(self.workers);
        if self.show_progress {
            options.with_progress(label)
        } else {
            options
        }
    }

    fn read(&self, chunk: &Chunk) -> Result<Array2<f32>> {
        let block = self.source.read_chunk(chunk.start, chunk.len)?;
        let expected = (self.source.feature_count(), chunk.len);
        if block.dim() != expected {
            return Err(ScanError::Format(format!(
                "source returned a {:?} block for samples {}..{}, expected {:?}",
                block.dim(),
                chunk.start,
                chunk.end(),
                expected
            )));
        }
        debug!("Read chunk {} (samples {}..{})", chunk.index, chunk.start, chunk.end());
        Ok(block)
    }

    fn check_mask(&self, mask: &FeatureMask) -> Result<()> {
        if mask.len() != self.source.feature_count() {
            return Err(ScanError::Format(format!(
                "feature mask covers {} features, source has {}",
                mask.len(),
                self.source.feature_count()
            )));
        }
        Ok(())
    }

    /// Pass 1: expressed counts, expression totals and the summed log-abundance of `mask`.
    pub fn raw_aggregates(&self, mask: &FeatureMask) -> Result<RawAggregates> {
        self.check_mask(mask)?;
        info!(
            "Pass 1/3: raw aggregates over {} chunk(s), {} feature(s) in mask.",
            self.plan.len(),
            mask.selected()
        );
        let z_factor = self.z_library_size_factor;
        let mut slots = parallel_reduce(
            &self.plan,
            &[CombineRule::Sum, CombineRule::Sum, CombineRule::Sum],
            &self.options("pass 1/3"),
            |chunk| {
                let block = self.read(chunk)?;
                let library = library_sizes(&block);
                let masked = mask.select_rows(&block);
                let z_norm = log_abundance(&relative_abundance(&masked, &library), z_factor);
                Ok(vec![
                    z_norm.sum_axis(Axis(1)),
                    expressed_counts(&block),
                    row_totals(&block),
                ])
            },
        )?
        .into_iter();

        let z_norm_sum = take_slot(&mut slots, mask.selected(), "z-norm sum")?;
        let expressed = take_slot(&mut slots, self.source.feature_count(), "expressed count")?;
        let expression = take_slot(&mut slots, self.source.feature_count(), "expression")?;
        Ok(RawAggregates {
            expressed,
            expression,
            z_norm_sum,
        })
    }

    /// Pass 2: squared deviations from `mean` over entries with a positive log-abundance.
    pub fn dispersion(&self, mask: &FeatureMask, mean: &Array1<f64>) -> Result<Array1<f64>> {
        self.check_mask(mask)?;
        info!("Pass 2/3: dispersion over {} chunk(s).", self.plan.len());
        let z_factor = self.z_library_size_factor;
        let slots = parallel_reduce(
            &self.plan,
            &[CombineRule::Sum],
            &self.options("pass 2/3"),
            |chunk| {
                let block = self.read(chunk)?;
                let library = library_sizes(&block);
                let z_norm = log_abundance(&relative_abundance(&mask.select_rows(&block), &library), z_factor);
                let squares = Zip::from(z_norm.rows()).and(mean).map_collect(|row, &m| {
                    row.iter()
                        .filter(|&&z| z > 0.0)
                        .map(|&z| (z - m) * (z - m))
                        .sum::<f64>()
                });
                Ok(vec![squares])
            },
        )?;
        take_slot(&mut slots.into_iter(), mask.selected(), "sum of squares")
    }

    /// Pass 3: outlier-filtered maxima, z-score cutoffs, outlier counts and library sizes.
    pub fn outlier_stats(&self, mask: &FeatureMask, baseline: &Baseline) -> Result<OutlierStats> {
        self.check_mask(mask)?;
        info!("Pass 3/3: outlier statistics over {} chunk(s).", self.plan.len());
        let z_factor = self.z_library_size_factor;
        let slots = parallel_reduce(
            &self.plan,
            &[
                CombineRule::Max,
                CombineRule::Min,
                CombineRule::Sum,
                CombineRule::Append,
            ],
            &self.options("pass 3/3"),
            |chunk| {
                let block = self.read(chunk)?;
                let library = library_sizes(&block);
                let masked = mask.select_rows(&block);
                let relative = relative_abundance(&masked, &library);
                let z_norm = log_abundance(&relative, z_factor);

                let num_rows = masked.nrows();
                let mut filtered_max = Array1::<f64>::zeros(num_rows);
                let mut zscore_cutoff = Array1::<f64>::zeros(num_rows);
                let mut outlier_count = Array1::<f64>::zeros(num_rows);
                for row_idx in 0..num_rows {
                    let mean = baseline.mean[row_idx];
                    let std = baseline.std[row_idx];
                    let mut row_max = f64::NEG_INFINITY;
                    let mut row_min = f64::INFINITY;
                    let mut row_outliers = 0.0;
                    for col_idx in 0..masked.ncols() {
                        let zscore = if std != 0.0 {
                            (z_norm[[row_idx, col_idx]] - mean) / std
                        } else {
                            0.0
                        };
                        let is_outlier = zscore > OUTLIER_ZSCORE;
                        if is_outlier {
                            row_outliers += 1.0;
                        }
                        let kept = if is_outlier { 0.0 } else { relative[[row_idx, col_idx]] };
                        row_max = row_max.max(kept);
                        let candidate = if masked[[row_idx, col_idx]] > 0.0 && zscore >= CUTOFF_ZSCORE_FLOOR {
                            zscore
                        } else {
                            CUTOFF_SENTINEL
                        };
                        row_min = row_min.min(candidate);
                    }
                    filtered_max[row_idx] = row_max;
                    zscore_cutoff[row_idx] = row_min;
                    outlier_count[row_idx] = row_outliers;
                }
                Ok(vec![filtered_max, zscore_cutoff, outlier_count, library])
            },
        )?;

        let mut slots = slots.into_iter();
        let filtered_max = take_slot(&mut slots, mask.selected(), "filtered max")?;
        let zscore_cutoff = take_slot(&mut slots, mask.selected(), "z-score cutoff")?;
        let outlier_count = take_slot(&mut slots, mask.selected(), "outlier count")?;
        let library_size = take_slot(&mut slots, self.source.sample_count(), "library size")?;
        Ok(OutlierStats {
            filtered_max,
            zscore_cutoff,
            outlier_count,
            library_size,
        })
    }
}

/// Mean and standard deviation of the log-abundance over expressed samples.
pub fn baseline(z_norm_sum: &Array1<f64>, sum_of_squares: &Array1<f64>, expressed: &Array1<f64>) -> Baseline {
    Baseline {
        mean: safe_divide(z_norm_sum, expressed),
        std: safe_divide(sum_of_squares, expressed).mapv(f64::sqrt),
    }
}

/// Derives the feature mask after pass 1 when no fixed feature list was given.
pub fn threshold_mask(aggregates: &RawAggregates, min_cell: f64, min_avg_exp: f64) -> FeatureMask {
    let mask = FeatureMask::from_thresholds(
        &aggregates.expressed,
        &aggregates.expression,
        min_cell,
        min_avg_exp,
    );
    info!(
        "Feature filter (min_cell={}, min_avg_exp={}): {} / {} features kept.",
        min_cell,
        min_avg_exp,
        mask.selected(),
        mask.len()
    );
    if mask.selected() == 0 {
        warn!("No feature passed the expression filters; per-feature statistics will be empty.");
    }
    mask
}
