//! Reconciles statistics computed over the source catalog with a caller-requested catalog.

use std::collections::{HashMap, HashSet};

use log::{info, warn};
use ndarray::Array1;

use crate::pipeline::FeatureMask;

/// Statistics defined for every feature of a catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogStats {
    pub expressed: Array1<f64>,
    pub expression: Array1<f64>,
}

/// Statistics defined only for the features selected by a mask, in mask order.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskedStats {
    pub z_norm_mean: Array1<f64>,
    pub z_norm_std: Array1<f64>,
    pub filtered_max: Array1<f64>,
    pub zscore_cutoff: Array1<f64>,
    pub outlier_count: Array1<f64>,
}

impl MaskedStats {
    fn gather(&self, positions: &[Option<usize>]) -> Self {
        Self {
            z_norm_mean: gather(&self.z_norm_mean, positions),
            z_norm_std: gather(&self.z_norm_std, positions),
            filtered_max: gather(&self.filtered_max, positions),
            zscore_cutoff: gather(&self.zscore_cutoff, positions),
            outlier_count: gather(&self.outlier_count, positions),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled {
    pub catalog: Vec<String>,
    /// Marks the requested features within `catalog`.
    pub target_mask: Vec<bool>,
    pub catalog_stats: CatalogStats,
    /// Aligned with the features of `catalog` flagged by `target_mask`.
    pub masked_stats: MaskedStats,
}

/// `values[p]` for every `Some(p)`, 0 for `None`.
pub fn gather(values: &Array1<f64>, positions: &[Option<usize>]) -> Array1<f64> {
    positions
        .iter()
        .map(|pos| pos.map_or(0.0, |p| values[p]))
        .collect()
}

/// Requested names with repeats removed, first occurrence kept.
pub fn dedup_requested(requested: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(requested.len());
    requested
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

/// No fixed feature list: the catalog is kept and the target mask is the feature mask.
pub fn identity(
    catalog: &[String],
    mask: &FeatureMask,
    catalog_stats: CatalogStats,
    masked_stats: MaskedStats,
) -> Reconciled {
    Reconciled {
        catalog: catalog.to_vec(),
        target_mask: mask.flags().to_vec(),
        catalog_stats,
        masked_stats,
    }
}

/// Maps statistics from the source `catalog` (with `masked_stats` over `mask`) onto the
/// `requested` feature order.
///
/// The final catalog is the requested features, in requested order, followed by the unrequested
/// source features in source order. Requested features missing from the source get zero
/// statistics everywhere.
pub fn reconcile(
    catalog: &[String],
    mask: &FeatureMask,
    catalog_stats: &CatalogStats,
    masked_stats: &MaskedStats,
    requested: &[String],
) -> Reconciled {
    let requested = dedup_requested(requested);
    let catalog_positions: HashMap<&str, usize> = catalog
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();
    let masked_positions: HashMap<&str, usize> = mask
        .indices()
        .iter()
        .enumerate()
        .map(|(masked_idx, &catalog_idx)| (catalog[catalog_idx].as_str(), masked_idx))
        .collect();
    let requested_set: HashSet<&str> = requested.iter().map(String::as_str).collect();

    let mut final_catalog: Vec<String> = Vec::with_capacity(requested.len() + catalog.len());
    let mut catalog_gather: Vec<Option<usize>> = Vec::with_capacity(final_catalog.capacity());
    let mut masked_gather: Vec<Option<usize>> = Vec::with_capacity(requested.len());
    let mut absent: Vec<&str> = Vec::new();

    for name in &requested {
        let position = catalog_positions.get(name.as_str()).copied();
        if position.is_none() {
            absent.push(name.as_str());
        }
        final_catalog.push(name.clone());
        catalog_gather.push(position);
        masked_gather.push(masked_positions.get(name.as_str()).copied());
    }
    for (idx, name) in catalog.iter().enumerate() {
        if !requested_set.contains(name.as_str()) {
            final_catalog.push(name.clone());
            catalog_gather.push(Some(idx));
        }
    }

    if !absent.is_empty() {
        warn!(
            "{} requested feature(s) are absent from the source and get zero statistics (first 5: {:?}).",
            absent.len(),
            absent.iter().take(5).collect::<Vec<_>>()
        );
    }
    info!(
        "Remapped statistics onto {} requested feature(s); final catalog has {} features.",
        requested.len(),
        final_catalog.len()
    );

    let target_mask = (0..final_catalog.len()).map(|idx| idx < requested.len()).collect();
    Reconciled {
        catalog: final_catalog,
        target_mask,
        catalog_stats: CatalogStats {
            expressed: gather(&catalog_stats.expressed, &catalog_gather),
            expression: gather(&catalog_stats.expression, &catalog_gather),
        },
        masked_stats: masked_stats.gather(&masked_gather),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn masked(values: [f64; 2]) -> MaskedStats {
        let base = Array1::from(values.to_vec());
        MaskedStats {
            z_norm_mean: base.clone(),
            z_norm_std: &base * 2.0,
            filtered_max: &base * 3.0,
            zscore_cutoff: &base * 4.0,
            outlier_count: &base * 5.0,
        }
    }

    #[test]
    fn test_reconcile_pads_absent_features_in_requested_order() {
        let catalog = names(&["A", "B", "C"]);
        let requested = names(&["C", "B", "Z"]);
        let mask = FeatureMask::from_requested(&catalog, &requested);
        let catalog_stats = CatalogStats {
            expressed: array![1.0, 2.0, 3.0],
            expression: array![10.0, 20.0, 30.0],
        };
        // mask order is B, C
        let reconciled = reconcile(&catalog, &mask, &catalog_stats, &masked([0.2, 0.3]), &requested);

        assert_eq!(reconciled.catalog, names(&["C", "B", "Z", "A"]));
        assert_eq!(reconciled.target_mask, vec![true, true, true, false]);
        assert_eq!(reconciled.catalog_stats.expressed, array![3.0, 2.0, 0.0, 1.0]);
        assert_eq!(reconciled.catalog_stats.expression, array![30.0, 20.0, 0.0, 10.0]);
        assert_eq!(reconciled.masked_stats.z_norm_mean, array![0.3, 0.2, 0.0]);
        assert_eq!(reconciled.masked_stats.z_norm_std, array![0.6, 0.4, 0.0]);
        assert_eq!(reconciled.masked_stats.zscore_cutoff, array![1.2, 0.8, 0.0]);
        assert_eq!(reconciled.masked_stats.outlier_count, array![1.5, 1.0, 0.0]);
    }

    #[test]
    fn test_reconcile_drops_repeated_requests() {
        let catalog = names(&["A", "B"]);
        let requested = names(&["B", "B", "A"]);
        let mask = FeatureMask::from_requested(&catalog, &requested);
        let catalog_stats = CatalogStats {
            expressed: array![1.0, 2.0],
            expression: array![3.0, 4.0],
        };
        let reconciled = reconcile(&catalog, &mask, &catalog_stats, &masked([7.0, 8.0]), &requested);
        assert_eq!(reconciled.catalog, names(&["B", "A"]));
        assert_eq!(reconciled.target_mask, vec![true, true]);
        assert_eq!(reconciled.masked_stats.z_norm_mean, array![8.0, 7.0]);
    }

    #[test]
    fn test_identity_keeps_mask() {
        let catalog = names(&["A", "B", "C"]);
        let mask = FeatureMask::from_flags(vec![true, false, true]);
        let catalog_stats = CatalogStats {
            expressed: array![1.0, 2.0, 3.0],
            expression: array![1.0, 2.0, 3.0],
        };
        let reconciled = identity(&catalog, &mask, catalog_stats.clone(), masked([1.0, 3.0]));
        assert_eq!(reconciled.catalog, catalog);
        assert_eq!(reconciled.target_mask, vec![true, false, true]);
        assert_eq!(reconciled.catalog_stats, catalog_stats);
    }

    #[test]
    fn test_gather_fills_zeros() {
        let values = array![5.0, 6.0];
        assert_eq!(gather(&values, &[Some(1), None, Some(0)]), array![6.0, 0.0, 5.0]);
    }
}
