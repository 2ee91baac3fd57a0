//! Memory bank: the stored reference set of normal patch descriptors.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Configuration for memory-bank subsampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    /// Fraction of pooled descriptors kept in the bank. A speed/accuracy
    /// trade-off, not a correctness constant: smaller banks mean cheaper
    /// nearest-neighbor scans and coarser coverage of the normal
    /// manifold. At least one descriptor always survives.
    pub sampling_fraction: f64,
    /// RNG seed for reproducible subsampling.
    pub seed: u64,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            sampling_fraction: 0.1,
            seed: 42,
        }
    }
}

/// Reference set of patch descriptors pooled from normal images.
///
/// Unordered, non-empty by construction, immutable once built. A rebuild
/// produces a fresh bank; banks are never merged or mutated in place.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    vectors: Array2<f32>,
}

impl MemoryBank {
    /// Wrap an explicit descriptor matrix. Returns `None` when `vectors`
    /// has no rows, preserving the non-empty invariant.
    pub fn new(vectors: Array2<f32>) -> Option<Self> {
        if vectors.nrows() == 0 {
            None
        } else {
            Some(Self { vectors })
        }
    }

    /// Subsample `max(floor(n * sampling_fraction), 1)` descriptors
    /// uniformly without replacement from the pooled candidate set.
    ///
    /// `pooled` must be non-empty; the builder guarantees this by
    /// requiring at least one normal image, each contributing a full
    /// grid of descriptors.
    pub fn subsample(pooled: Array2<f32>, config: &BankConfig) -> Self {
        let n = pooled.nrows();
        debug_assert!(n > 0, "pooled descriptor set must be non-empty");
        let keep = ((n as f64 * config.sampling_fraction).floor() as usize).clamp(1, n);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let picked = rand::seq::index::sample(&mut rng, n, keep);
        let mut vectors = Array2::<f32>::zeros((keep, pooled.ncols()));
        for (row, idx) in picked.into_iter().enumerate() {
            vectors.row_mut(row).assign(&pooled.row(idx));
        }
        Self { vectors }
    }

    /// Number of stored descriptors.
    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    /// Always false; kept for API symmetry with collection types.
    pub fn is_empty(&self) -> bool {
        self.vectors.nrows() == 0
    }

    /// Descriptor length.
    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    /// Stored descriptor matrix, one row per reference vector.
    pub fn vectors(&self) -> &Array2<f32> {
        &self.vectors
    }
}

/// One published generation of reference state: the bank and the
/// threshold calibrated against it, stamped with a build revision.
///
/// The two travel together by construction; a rebuild replaces the whole
/// model, never one half of it.
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    /// Stored reference descriptors.
    pub bank: MemoryBank,
    /// Image-level decision threshold calibrated on the normal set.
    pub threshold: f32,
    /// Monotonically increasing build counter, starting at 1.
    pub revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn pooled(n: usize, dim: usize) -> Array2<f32> {
        Array2::from_shape_fn((n, dim), |(i, j)| (i * dim + j) as f32)
    }

    #[test]
    fn subsample_keeps_tenth() {
        let bank = MemoryBank::subsample(pooled(200, 4), &BankConfig::default());
        assert_eq!(bank.len(), 20);
        assert_eq!(bank.dim(), 4);
    }

    #[test]
    fn subsample_keeps_at_least_one() {
        let bank = MemoryBank::subsample(pooled(3, 4), &BankConfig::default());
        assert_eq!(bank.len(), 1);
    }

    #[test]
    fn subsample_rows_are_distinct_candidates() {
        // Every pooled row is unique, so a draw without replacement must
        // produce pairwise distinct bank rows.
        let bank = MemoryBank::subsample(pooled(100, 2), &BankConfig::default());
        let mut seen: Vec<Vec<u32>> = Vec::new();
        for row in bank.vectors().rows() {
            let key: Vec<u32> = row.iter().map(|v| v.to_bits()).collect();
            assert!(!seen.contains(&key), "duplicate bank row");
            seen.push(key);
        }
    }

    #[test]
    fn subsample_reproducible_by_seed() {
        let cfg = BankConfig {
            sampling_fraction: 0.2,
            seed: 7,
        };
        let a = MemoryBank::subsample(pooled(50, 3), &cfg);
        let b = MemoryBank::subsample(pooled(50, 3), &cfg);
        assert_eq!(a.vectors(), b.vectors());

        let other = MemoryBank::subsample(
            pooled(50, 3),
            &BankConfig {
                sampling_fraction: 0.2,
                seed: 8,
            },
        );
        assert_ne!(a.vectors(), other.vectors());
    }

    #[test]
    fn fraction_above_one_keeps_everything() {
        let cfg = BankConfig {
            sampling_fraction: 2.0,
            seed: 1,
        };
        let bank = MemoryBank::subsample(pooled(10, 2), &cfg);
        assert_eq!(bank.len(), 10);
    }

    #[test]
    fn new_rejects_empty_matrix() {
        assert!(MemoryBank::new(Array2::<f32>::zeros((0, 8))).is_none());
        assert!(MemoryBank::new(Array2::<f32>::zeros((1, 8))).is_some());
    }
}
