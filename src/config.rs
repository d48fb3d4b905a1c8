use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ScanError};

/// How the library-size normalization factor for `norm_max` is chosen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LibrarySizeFactor {
    /// Median of the per-sample library sizes.
    Median,
    Fixed(f64),
}

impl FromStr for LibrarySizeFactor {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("median") {
            return Ok(LibrarySizeFactor::Median);
        }
        let value = trimmed.parse::<f64>().map_err(|e| {
            ScanError::Config(format!(
                "library size factor must be a number or 'median', got '{}': {}",
                s, e
            ))
        })?;
        if !value.is_finite() {
            return Err(ScanError::Config(format!(
                "library size factor must be finite, got {}",
                value
            )));
        }
        Ok(LibrarySizeFactor::Fixed(value))
    }
}

impl fmt::Display for LibrarySizeFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibrarySizeFactor::Median => write!(f, "median"),
            LibrarySizeFactor::Fixed(v) => write!(f, "{}", v),
        }
    }
}

// --- Scan Configuration ---
#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub library_size_factor: LibrarySizeFactor,
    /// Multiplicative noise headroom applied to `norm_max`.
    pub noise_intensity: f64,
    /// Fixed feature list; when set, `min_cell` and `min_avg_exp` are ignored.
    pub target_features: Option<Vec<String>>,
    pub min_cell: f64,
    /// Minimum average expression over expressed samples. Negative disables the clause.
    pub min_avg_exp: f64,
    /// Library size used when normalizing for the z-score baseline.
    pub z_library_size_factor: f64,
    pub workers: usize,
    /// Samples per chunk. `features x batch_size` values are resident per worker.
    pub batch_size: usize,
    pub show_progress: bool,
}

impl ScanConfig {
    pub fn new(library_size_factor: LibrarySizeFactor) -> Self {
        Self {
            library_size_factor,
            noise_intensity: 0.1,
            target_features: None,
            min_cell: 10.0,
            min_avg_exp: 1.0,
            z_library_size_factor: 1_000_000.0,
            workers: 1,
            batch_size: 2048,
            show_progress: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ScanError::Config("workers must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ScanError::Config("batch size must be >= 1".to_string()));
        }
        if let LibrarySizeFactor::Fixed(v) = self.library_size_factor {
            if !v.is_finite() {
                return Err(ScanError::Config(format!(
                    "library size factor must be finite, got {}",
                    v
                )));
            }
        }
        let finite_params = [
            ("noise intensity", self.noise_intensity),
            ("min cell", self.min_cell),
            ("min average expression", self.min_avg_exp),
            ("z-score library size factor", self.z_library_size_factor),
        ];
        for (name, value) in finite_params {
            if !value.is_finite() {
                return Err(ScanError::Config(format!("{} must be finite, got {}", name, value)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_size_factor_parsing() {
        assert_eq!("median".parse::<LibrarySizeFactor>().unwrap(), LibrarySizeFactor::Median);
        assert_eq!(" MEDIAN ".parse::<LibrarySizeFactor>().unwrap(), LibrarySizeFactor::Median);
        assert_eq!(
            "10000".parse::<LibrarySizeFactor>().unwrap(),
            LibrarySizeFactor::Fixed(10000.0)
        );
        assert!(matches!(
            "mean".parse::<LibrarySizeFactor>(),
            Err(ScanError::Config(_))
        ));
        assert!("inf".parse::<LibrarySizeFactor>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ScanConfig::new(LibrarySizeFactor::Median);
        assert_eq!(config.noise_intensity, 0.1);
        assert_eq!(config.min_cell, 10.0);
        assert_eq!(config.min_avg_exp, 1.0);
        assert_eq!(config.z_library_size_factor, 1_000_000.0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.batch_size, 2048);
        assert!(config.target_features.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers_and_batch() {
        let config = ScanConfig {
            workers: 0,
            ..ScanConfig::new(LibrarySizeFactor::Median)
        };
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));

        let config = ScanConfig {
            batch_size: 0,
            ..ScanConfig::new(LibrarySizeFactor::Fixed(1e4))
        };
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));

        let config = ScanConfig {
            noise_intensity: f64::NAN,
            ..ScanConfig::new(LibrarySizeFactor::Fixed(1e4))
        };
        assert!(config.validate().is_err());
    }
}
