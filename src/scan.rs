use std::path::Path;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::Array1;
use statrs::statistics::{Data, Median};

use crate::config::{LibrarySizeFactor, ScanConfig};
use crate::error::{Result, ScanError};
use crate::pipeline::{baseline, safe_divide, threshold_mask, FeatureMask, StatsPipeline};
use crate::remap::{self, CatalogStats, MaskedStats, Reconciled};
use crate::source::{check_unique_features, open_source, ChunkSource};

// --- Result Bundle ---

/// Immutable output of one scan.
///
/// Catalog-wide arrays (`expressed_cells`, `expression`) follow `feature_names`. Per-target
/// arrays follow `target_features()`, i.e. the entries of `feature_names` flagged by
/// `target_mask`. Per-sample arrays follow `sample_ids`.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultBundle {
    feature_names: Vec<String>,
    sample_ids: Vec<String>,
    target_mask: Vec<bool>,
    expressed_cells: Array1<f64>,
    expression: Array1<f64>,
    z_norm_mean: Array1<f64>,
    z_norm_std: Array1<f64>,
    filtered_max: Array1<f64>,
    norm_max: Array1<f64>,
    zscore_cutoff: Array1<f64>,
    outlier_count: Array1<f64>,
    expression_rate: Array1<f64>,
    library_size: Array1<f64>,
    library_size_factor: f64,
    noise_intensity: f64,
}

impl ResultBundle {
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn target_mask(&self) -> &[bool] {
        &self.target_mask
    }

    pub fn target_features(&self) -> Vec<&str> {
        self.feature_names
            .iter()
            .zip(self.target_mask.iter())
            .filter_map(|(name, &is_target)| if is_target { Some(name.as_str()) } else { None })
            .collect()
    }

    /// Position of `name` within `target_features()`.
    pub fn target_index(&self, name: &str) -> Option<usize> {
        self.target_features().iter().position(|&t| t == name)
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names.len()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn expressed_cells(&self) -> &Array1<f64> {
        &self.expressed_cells
    }

    pub fn expression(&self) -> &Array1<f64> {
        &self.expression
    }

    pub fn z_norm_mean(&self) -> &Array1<f64> {
        &self.z_norm_mean
    }

    pub fn z_norm_std(&self) -> &Array1<f64> {
        &self.z_norm_std
    }

    /// Outlier-filtered maximum relative abundance, before the log transform.
    pub fn filtered_max(&self) -> &Array1<f64> {
        &self.filtered_max
    }

    /// `log1p(filtered_max * library_size_factor) * (1 + noise_intensity)`.
    pub fn norm_max(&self) -> &Array1<f64> {
        &self.norm_max
    }

    pub fn zscore_cutoff(&self) -> &Array1<f64> {
        &self.zscore_cutoff
    }

    pub fn outlier_count(&self) -> &Array1<f64> {
        &self.outlier_count
    }

    pub fn outlier_total(&self) -> f64 {
        self.outlier_count.sum()
    }

    pub fn expression_rate(&self) -> &Array1<f64> {
        &self.expression_rate
    }

    pub fn library_size(&self) -> &Array1<f64> {
        &self.library_size
    }

    pub fn library_size_factor(&self) -> f64 {
        self.library_size_factor
    }

    pub fn noise_intensity(&self) -> f64 {
        self.noise_intensity
    }
}

// --- Assembly ---

/// The configured factor, or the median of `library_size` (NaN for zero samples).
pub fn resolve_library_size_factor(factor: LibrarySizeFactor, library_size: &Array1<f64>) -> f64 {
    match factor {
        LibrarySizeFactor::Fixed(value) => value,
        LibrarySizeFactor::Median => Data::new(library_size.to_vec()).median(),
    }
}

pub fn normalized_max(filtered_max: &Array1<f64>, library_size_factor: f64, noise_intensity: f64) -> Array1<f64> {
    filtered_max.mapv(|m| (m * library_size_factor).ln_1p() * (1.0 + noise_intensity))
}

fn assemble(
    reconciled: Reconciled,
    sample_ids: Vec<String>,
    library_size: Array1<f64>,
    config: &ScanConfig,
) -> ResultBundle {
    let library_size_factor = resolve_library_size_factor(config.library_size_factor, &library_size);
    info!(
        "Library size factor: {} ({}).",
        library_size_factor, config.library_size_factor
    );

    let Reconciled {
        catalog,
        target_mask,
        catalog_stats,
        masked_stats,
    } = reconciled;

    let sample_count = sample_ids.len() as f64;
    let expression_rate: Array1<f64> = catalog_stats
        .expressed
        .iter()
        .zip(target_mask.iter())
        .filter_map(|(&cells, &is_target)| if is_target { Some(cells / sample_count) } else { None })
        .collect();
    let norm_max = normalized_max(&masked_stats.filtered_max, library_size_factor, config.noise_intensity);

    ResultBundle {
        feature_names: catalog,
        sample_ids,
        target_mask,
        expressed_cells: catalog_stats.expressed,
        expression: catalog_stats.expression,
        z_norm_mean: masked_stats.z_norm_mean,
        z_norm_std: masked_stats.z_norm_std,
        filtered_max: masked_stats.filtered_max,
        norm_max,
        zscore_cutoff: masked_stats.zscore_cutoff,
        outlier_count: masked_stats.outlier_count,
        expression_rate,
        library_size,
        library_size_factor,
        noise_intensity: config.noise_intensity,
    }
}

// --- Top-Level Scan ---

/// Runs the three scanning passes over `source` and assembles the result bundle.
pub fn scan(source: &dyn ChunkSource, config: &ScanConfig) -> Result<ResultBundle> {
    let scan_start = Instant::now();
    config.validate()?;

    let feature_names = source.feature_names();
    check_unique_features(feature_names)?;
    let sample_count = source.sample_count();
    if sample_count == 0 {
        return Err(ScanError::Format("matrix has no samples".to_string()));
    }
    info!(
        "Scanning {} features x {} samples with {} worker(s), batch size {}.",
        feature_names.len(),
        sample_count,
        config.workers,
        config.batch_size
    );
    debug!(
        "Sample ids (first 5): {:?}",
        source.sample_ids().iter().take(5).collect::<Vec<_>>()
    );

    let pipeline = StatsPipeline::new(
        source,
        config.batch_size,
        config.workers,
        config.z_library_size_factor,
    )?
    .with_progress(config.show_progress);

    // Pass 1 runs over the requested features only when a fixed list is given.
    let pass1_mask = match &config.target_features {
        Some(requested) => {
            let mask = FeatureMask::from_requested(feature_names, requested);
            info!(
                "Fixed feature list: {} requested, {} present in source; expression filters skipped.",
                remap::dedup_requested(requested).len(),
                mask.selected()
            );
            mask
        }
        None => FeatureMask::all(feature_names.len()),
    };
    let raw = pipeline.raw_aggregates(&pass1_mask)?;

    let (mask, z_norm_sum) = match &config.target_features {
        Some(_) => (pass1_mask, raw.z_norm_sum.clone()),
        None => {
            let mask = threshold_mask(&raw, config.min_cell, config.min_avg_exp);
            let z_norm_sum = mask.restrict(&raw.z_norm_sum);
            (mask, z_norm_sum)
        }
    };
    let expressed_masked = mask.restrict(&raw.expressed);
    let mean = safe_divide(&z_norm_sum, &expressed_masked);

    let sum_of_squares = pipeline.dispersion(&mask, &mean)?;
    let stats_baseline = baseline(&z_norm_sum, &sum_of_squares, &expressed_masked);

    let outliers = pipeline.outlier_stats(&mask, &stats_baseline)?;

    let catalog_stats = CatalogStats {
        expressed: raw.expressed,
        expression: raw.expression,
    };
    let masked_stats = MaskedStats {
        z_norm_mean: stats_baseline.mean,
        z_norm_std: stats_baseline.std,
        filtered_max: outliers.filtered_max,
        zscore_cutoff: outliers.zscore_cutoff,
        outlier_count: outliers.outlier_count,
    };
    let reconciled = match &config.target_features {
        Some(requested) => remap::reconcile(feature_names, &mask, &catalog_stats, &masked_stats, requested),
        None => remap::identity(feature_names, &mask, catalog_stats, masked_stats),
    };

    let bundle = assemble(
        reconciled,
        source.sample_ids().to_vec(),
        outliers.library_size,
        config,
    );
    if bundle.library_size_factor() == 0.0 {
        warn!("Library size factor is 0; every norm_max is 0.");
    }
    info!("Scan Time: {:.2?}", scan_start.elapsed());
    info!("Outlier Number: {:.0}", bundle.outlier_total());
    Ok(bundle)
}

/// Opens the matrix at `path` and scans it.
pub fn scan_path<P: AsRef<Path>>(path: P, config: &ScanConfig) -> Result<ResultBundle> {
    let source = open_source(path)?;
    scan(source.as_ref(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_median_factor() {
        let sizes = array![40.0, 10.0, 30.0, 20.0];
        let median = resolve_library_size_factor(LibrarySizeFactor::Median, &sizes);
        assert!((median - 25.0).abs() < 1e-9);
        assert_eq!(resolve_library_size_factor(LibrarySizeFactor::Fixed(7.0), &sizes), 7.0);
    }

    #[test]
    fn test_normalized_max() {
        let out = normalized_max(&array![0.0, 0.5], 4.0, 0.1);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 3.0f64.ln() * 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_assemble_expression_rate_follows_target_mask() {
        let reconciled = Reconciled {
            catalog: vec!["A".into(), "B".into(), "C".into()],
            target_mask: vec![true, false, true],
            catalog_stats: CatalogStats {
                expressed: array![2.0, 4.0, 1.0],
                expression: array![5.0, 9.0, 1.0],
            },
            masked_stats: MaskedStats {
                z_norm_mean: array![1.0, 2.0],
                z_norm_std: array![0.5, 0.0],
                filtered_max: array![0.25, 0.0],
                zscore_cutoff: array![-1.0, 10.0],
                outlier_count: array![1.0, 2.0],
            },
        };
        let config = ScanConfig::new(LibrarySizeFactor::Fixed(4.0));
        let bundle = assemble(reconciled, vec!["s0".into(), "s1".into(), "s2".into(), "s3".into()], array![1.0, 2.0, 3.0, 4.0], &config);
        assert_eq!(bundle.target_features(), vec!["A", "C"]);
        assert_eq!(bundle.expression_rate(), &array![0.5, 0.25]);
        assert_eq!(bundle.outlier_total(), 3.0);
        assert_eq!(bundle.target_index("C"), Some(1));
        assert_eq!(bundle.target_index("B"), None);
        assert!((bundle.norm_max()[0] - 2.0f64.ln() * 1.1).abs() < 1e-12);
    }
}
