// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use log::{debug, info};
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use loom_scan::{scan, LibrarySizeFactor, ScanConfig};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting loom_scan with args: {:?}", cli_args);

    let workers = match cli_args.workers {
        0 => num_cpus::get(),
        n => n,
    };
    info!("Scan Processes {}", workers);

    // --- 1. Assemble Scan Configuration ---
    let target_features = match &cli_args.target_features {
        Some(path) => Some(read_feature_list(path)?),
        None => None,
    };
    let config = ScanConfig {
        noise_intensity: cli_args.noise_intensity,
        target_features,
        min_cell: cli_args.min_cell,
        min_avg_exp: cli_args.min_avg_exp,
        z_library_size_factor: cli_args.z_library_size_factor,
        workers,
        batch_size: cli_args.batch_size,
        show_progress: cli_args.progress,
        ..ScanConfig::new(cli_args.library_size_factor)
    };

    // --- 2. Scan ---
    let source = loom_scan::open_source(&cli_args.input)
        .with_context(|| format!("Failed to open input matrix {}", cli_args.input.display()))?;
    let bundle = scan(source.as_ref(), &config)
        .with_context(|| format!("Scan of {} failed", cli_args.input.display()))?;

    // --- 3. Write Outputs ---
    let output_prefix_path = PathBuf::from(&cli_args.output_prefix);
    if let Some(parent) = output_prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }
    info!(
        "Writing results to files with prefix '{}'...",
        cli_args.output_prefix
    );
    output_writer::write_features(&cli_args.output_prefix, &bundle)?;
    output_writer::write_targets(&cli_args.output_prefix, &bundle)?;
    output_writer::write_samples(&cli_args.output_prefix, &bundle)?;
    output_writer::write_summary(&cli_args.output_prefix, &bundle)?;

    info!(
        "loom_scan finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

/// One feature name per line; blank lines and `#` comments are skipped.
fn read_feature_list(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .map_err(|e| anyhow!("Failed to open target feature list {}: {}", path.display(), e))?;
    let mut features = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        features.push(trimmed.to_string());
    }
    if features.is_empty() {
        return Err(anyhow!(
            "Target feature list {} contains no features.",
            path.display()
        ));
    }
    info!(
        "Read {} target features from {}.",
        features.len(),
        path.display()
    );
    debug!(
        "Target features (first 5): {:?}",
        features.iter().take(5).collect::<Vec<_>>()
    );
    Ok(features)
}

// --- Module Implementations ---

mod cli {
    use super::LibrarySizeFactor;
    use clap::Parser;
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Streaming gene/cell statistics scanner for expression matrices.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Expression matrix, genes in rows and cells in columns (.loom or .tsv).
        #[arg(short, long, required = true)]
        pub(crate) input: PathBuf,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        /// A number, or "median" to use the median cell library size.
        #[arg(short = 'l', long, default_value = "median")]
        pub(crate) library_size_factor: LibrarySizeFactor,

        #[arg(long, default_value_t = 0.1)]
        pub(crate) noise_intensity: f64,

        /// File with one gene per line; disables --min-cell and --min-avg-exp.
        #[arg(short = 'g', long)]
        pub(crate) target_features: Option<PathBuf>,

        #[arg(long, default_value_t = 10.0)]
        pub(crate) min_cell: f64,

        /// Negative values disable this filter.
        #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
        pub(crate) min_avg_exp: f64,

        #[arg(long, default_value_t = 1_000_000.0)]
        pub(crate) z_library_size_factor: f64,

        /// Worker threads per pass; 0 uses every available core.
        #[arg(short = 't', long, default_value_t = 1)]
        pub(crate) workers: usize,

        /// Cells per chunk.
        #[arg(short, long, default_value_t = 2048)]
        pub(crate) batch_size: usize,

        #[arg(long)]
        pub(crate) progress: bool,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}

mod output_writer {
    use super::{anyhow, info, BufWriter, File, Result, Write};
    use loom_scan::ResultBundle;

    fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
        let filename = format!("{}.{}", prefix, suffix);
        File::create(&filename)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", filename, e))
    }

    pub(crate) fn write_features(output_prefix: &str, bundle: &ResultBundle) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "features.tsv")?;
        info!("Writing per-feature totals to {}.features.tsv", output_prefix);

        writeln!(writer, "Feature\tIsTarget\tExpressedCells\tExpression")?;
        for (idx, name) in bundle.feature_names().iter().enumerate() {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}",
                name,
                bundle.target_mask()[idx],
                bundle.expressed_cells()[idx],
                bundle.expression()[idx]
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_targets(output_prefix: &str, bundle: &ResultBundle) -> Result<()> {
        let targets = bundle.target_features();
        let mut writer = create_output_file(output_prefix, "targets.tsv")?;
        if targets.is_empty() {
            info!("No target features; {}.targets.tsv holds the header only.", output_prefix);
        } else {
            info!("Writing target feature statistics to {}.targets.tsv", output_prefix);
        }

        writeln!(
            writer,
            "Feature\tExpressionRate\tZNormMean\tZNormStd\tFilteredMax\tNormMax\tZScoreCutoff\tOutliers"
        )?;
        for (idx, name) in targets.iter().enumerate() {
            writeln!(
                writer,
                "{}\t{:.6}\t{:.6}\t{:.6}\t{:.6e}\t{:.6}\t{:.6}\t{}",
                name,
                bundle.expression_rate()[idx],
                bundle.z_norm_mean()[idx],
                bundle.z_norm_std()[idx],
                bundle.filtered_max()[idx],
                bundle.norm_max()[idx],
                bundle.zscore_cutoff()[idx],
                bundle.outlier_count()[idx]
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_samples(output_prefix: &str, bundle: &ResultBundle) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "samples.tsv")?;
        info!("Writing library sizes to {}.samples.tsv", output_prefix);

        writeln!(writer, "SampleID\tLibrarySize")?;
        for (sample_id, library_size) in bundle.sample_ids().iter().zip(bundle.library_size().iter()) {
            writeln!(writer, "{}\t{}", sample_id, library_size)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_summary(output_prefix: &str, bundle: &ResultBundle) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "summary.tsv")?;
        info!("Writing scan summary to {}.summary.tsv", output_prefix);

        writeln!(writer, "Key\tValue")?;
        writeln!(writer, "features\t{}", bundle.feature_count())?;
        writeln!(writer, "target_features\t{}", bundle.target_features().len())?;
        writeln!(writer, "samples\t{}", bundle.sample_count())?;
        writeln!(writer, "library_size_factor\t{}", bundle.library_size_factor())?;
        writeln!(writer, "noise_intensity\t{}", bundle.noise_intensity())?;
        writeln!(writer, "outlier_total\t{}", bundle.outlier_total())?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::output_writer;
    use loom_scan::{scan, LibrarySizeFactor, MemorySource, ScanConfig};
    use ndarray::array;
    use std::fs;

    #[test]
    fn test_targets_file_is_rewritten_when_nothing_is_selected() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("run").to_string_lossy().into_owned();
        let stale = format!("{}.targets.tsv", prefix);
        fs::write(&stale, "Feature\tExpressionRate\nOLD\t1.0\n").unwrap();

        let source = MemorySource::new(
            array![[1.0, 0.0], [0.0, 1.0]],
            vec!["A".to_string(), "B".to_string()],
            None,
        )
        .unwrap();
        let config = ScanConfig {
            min_cell: 1000.0,
            ..ScanConfig::new(LibrarySizeFactor::Median)
        };
        let bundle = scan(&source, &config).unwrap();
        assert!(bundle.target_features().is_empty());

        output_writer::write_targets(&prefix, &bundle).unwrap();
        let contents = fs::read_to_string(&stale).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.starts_with("Feature\tExpressionRate\t"));
        assert!(!contents.contains("OLD"));
    }
}
