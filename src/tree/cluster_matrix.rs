use std::error::Error;
use std::fmt::{self, Display};

use anyhow::bail;
use approx::relative_eq;
use fixedbitset::FixedBitSet;
use nalgebra::DMatrix;

use crate::Result;

pub(crate) type Mat = DMatrix<f64>;

/// Relative tolerance of the symmetry check, shared by both builders.
const SYMMETRY_EPSILON: f64 = 1e-8;

/// Distance-matrix validation failures, reported before any clustering step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NotSquare { nrows: usize, ncols: usize },
    Asymmetric { row: usize, col: usize },
    NotFinite { row: usize, col: usize },
    Negative { row: usize, col: usize },
    TooFewTaxa { required: usize, actual: usize },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NotSquare { nrows, ncols } => {
                write!(f, "Distance matrix must be square, got {}x{}", nrows, ncols)
            }
            ValidationError::Asymmetric { row, col } => write!(
                f,
                "Distance matrix must be symmetric, entries ({}, {}) and ({}, {}) differ",
                row, col, col, row
            ),
            ValidationError::NotFinite { row, col } => write!(
                f,
                "Distance matrix contains a non-finite value at ({}, {})",
                row, col
            ),
            ValidationError::Negative { row, col } => write!(
                f,
                "Distances must be non-negative, found a negative value at ({}, {})",
                row, col
            ),
            ValidationError::TooFewTaxa { required, actual } => {
                write!(f, "At least {} taxa are required, got {}", required, actual)
            }
        }
    }
}

impl Error for ValidationError {}

/// Mutable clustering state for one algorithm run: the working copy of the
/// distance matrix, the set of active rows, and the divergence accumulator.
///
/// Rows are retired by clearing their active bit and are never renumbered or
/// reused, so cluster indices stay stable for the whole run.
#[derive(Debug, Clone)]
pub(crate) struct ClusterMatrix {
    distances: Mat,
    active: FixedBitSet,
    divergence: Vec<f64>,
}

impl ClusterMatrix {
    /// Clones and validates the caller's matrix: it must be square, symmetric
    /// within tolerance, finite, non-negative, and hold at least `min_taxa`
    /// rows. The caller's copy is never touched.
    pub(crate) fn validated(distances: &Mat, min_taxa: usize) -> Result<Self> {
        if distances.nrows() != distances.ncols() {
            bail!(ValidationError::NotSquare {
                nrows: distances.nrows(),
                ncols: distances.ncols(),
            });
        }
        let n = distances.nrows();
        for i in 0..n {
            for j in 0..i {
                if !relative_eq!(
                    distances[(i, j)],
                    distances[(j, i)],
                    epsilon = SYMMETRY_EPSILON,
                    max_relative = SYMMETRY_EPSILON
                ) {
                    bail!(ValidationError::Asymmetric { row: i, col: j });
                }
            }
        }
        for i in 0..n {
            for j in 0..n {
                if !distances[(i, j)].is_finite() {
                    bail!(ValidationError::NotFinite { row: i, col: j });
                }
            }
        }
        for i in 0..n {
            for j in 0..n {
                if distances[(i, j)] < 0.0 {
                    bail!(ValidationError::Negative { row: i, col: j });
                }
            }
        }
        if n < min_taxa {
            bail!(ValidationError::TooFewTaxa {
                required: min_taxa,
                actual: n,
            });
        }

        let mut active = FixedBitSet::with_capacity(n);
        active.insert_range(..);
        Ok(Self {
            distances: distances.clone(),
            active,
            divergence: vec![0.0; n],
        })
    }

    pub(crate) fn taxa(&self) -> usize {
        self.distances.nrows()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.count_ones(..)
    }

    pub(crate) fn active(&self) -> impl Iterator<Item = usize> + '_ {
        self.active.ones()
    }

    pub(crate) fn is_active(&self, i: usize) -> bool {
        self.active.contains(i)
    }

    /// Permanently retires a cluster; its row keeps its values and index.
    pub(crate) fn retire(&mut self, i: usize) {
        self.active.set(i, false);
    }

    pub(crate) fn distance(&self, i: usize, j: usize) -> f64 {
        self.distances[(i, j)]
    }

    pub(crate) fn divergence(&self, i: usize) -> f64 {
        self.divergence[i]
    }

    /// Recomputes `r_i = Σ D[i,k]` over active `k` for every active `i`.
    pub(crate) fn recompute_divergence(&mut self) {
        for i in 0..self.taxa() {
            if !self.active.contains(i) {
                continue;
            }
            self.divergence[i] = self.active.ones().map(|k| self.distances[(i, k)]).sum();
        }
    }

    /// Minimum entry of the active lower triangle; ties resolve to the first
    /// occurrence in row-major scan order.
    pub(crate) fn min_active_pair(&self) -> Option<(usize, usize)> {
        let mut min: Option<((usize, usize), f64)> = None;
        for i in 0..self.taxa() {
            if !self.active.contains(i) {
                continue;
            }
            for j in 0..i {
                if !self.active.contains(j) {
                    continue;
                }
                let dist = self.distances[(i, j)];
                if min.map_or(true, |(_, best)| dist < best) {
                    min = Some(((i, j), dist));
                }
            }
        }
        min.map(|(pair, _)| pair)
    }

    /// Minimum of `Q(i, j) = (m − 2)·D[i,j] − r_i − r_j` over the active lower
    /// triangle, with the same row-major tie-break as [Self::min_active_pair].
    /// Divergence must be current.
    pub(crate) fn min_q_pair(&self) -> Option<(usize, usize)> {
        let m = self.active_count() as f64;
        let mut min: Option<((usize, usize), f64)> = None;
        for i in 0..self.taxa() {
            if !self.active.contains(i) {
                continue;
            }
            for j in 0..i {
                if !self.active.contains(j) {
                    continue;
                }
                let q = (m - 2.0) * self.distances[(i, j)] - self.divergence[i] - self.divergence[j];
                if min.map_or(true, |(_, best)| q < best) {
                    min = Some(((i, j), q));
                }
            }
        }
        min.map(|(pair, _)| pair)
    }

    /// UPGMA update: distances from the merged cluster in slot `i` become the
    /// cluster-size-weighted mean of the rows for `i` and the retired `j`.
    pub(crate) fn merge_weighted(&mut self, i: usize, j: usize, size_i: usize, size_j: usize) {
        let total = (size_i + size_j) as f64;
        let (weight_i, weight_j) = (size_i as f64, size_j as f64);
        for k in 0..self.taxa() {
            if k == i || k == j || !self.active.contains(k) {
                continue;
            }
            let mean =
                (self.distances[(i, k)] * weight_i + self.distances[(j, k)] * weight_j) / total;
            self.distances[(i, k)] = mean;
            self.distances[(k, i)] = mean;
        }
    }

    /// NJ update: `D[i,k] ← (D[i,k] + D[j,k] − D[i,j]) / 2` for active `k`.
    pub(crate) fn merge_reduced(&mut self, i: usize, j: usize) {
        let d_ij = self.distances[(i, j)];
        for k in 0..self.taxa() {
            if k == i || k == j || !self.active.contains(k) {
                continue;
            }
            let reduced = (self.distances[(i, k)] + self.distances[(j, k)] - d_ij) / 2.0;
            self.distances[(i, k)] = reduced;
            self.distances[(k, i)] = reduced;
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use nalgebra::dmatrix;

    use super::{ClusterMatrix, ValidationError};

    #[test]
    fn validation_rejects_non_square() {
        let distances = nalgebra::DMatrix::<f64>::zeros(2, 3);
        let err = ClusterMatrix::validated(&distances, 1).unwrap_err();
        assert_matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::NotSquare { nrows: 2, ncols: 3 })
        );
    }

    #[test]
    fn validation_rejects_asymmetric() {
        let distances = dmatrix![
            0.0, 1.0;
            2.0, 0.0];
        let err = ClusterMatrix::validated(&distances, 1).unwrap_err();
        assert_matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::Asymmetric { row: 1, col: 0 })
        );
    }

    #[test]
    fn validation_accepts_asymmetry_within_tolerance() {
        let distances = dmatrix![
            0.0, 1.0 + 1e-12;
            1.0, 0.0];
        assert!(ClusterMatrix::validated(&distances, 1).is_ok());
    }

    #[test]
    fn validation_rejects_nan() {
        let distances = dmatrix![
            f64::NAN, 1.0;
            1.0, 0.0];
        let err = ClusterMatrix::validated(&distances, 1).unwrap_err();
        assert_matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::NotFinite { row: 0, col: 0 })
        );
    }

    #[test]
    fn validation_rejects_infinite() {
        let distances = dmatrix![
            0.0, f64::INFINITY;
            f64::INFINITY, 0.0];
        let err = ClusterMatrix::validated(&distances, 1).unwrap_err();
        assert_matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::NotFinite { row: 0, col: 1 })
        );
    }

    #[test]
    fn validation_rejects_negative() {
        let distances = dmatrix![
            0.0, -1.0;
            -1.0, 0.0];
        let err = ClusterMatrix::validated(&distances, 1).unwrap_err();
        assert_matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::Negative { row: 0, col: 1 })
        );
    }

    #[test]
    fn validation_rejects_too_few_taxa() {
        let distances = dmatrix![
            0.0, 1.0;
            1.0, 0.0];
        let err = ClusterMatrix::validated(&distances, 4).unwrap_err();
        assert_matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::TooFewTaxa {
                required: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn min_pair_breaks_ties_row_major() {
        let distances = dmatrix![
            0.0, 1.0, 1.0;
            1.0, 0.0, 1.0;
            1.0, 1.0, 0.0];
        let matrix = ClusterMatrix::validated(&distances, 1).unwrap();
        assert_eq!(matrix.min_active_pair(), Some((1, 0)));
    }

    #[test]
    fn min_pair_skips_retired_rows() {
        let distances = dmatrix![
            0.0, 1.0, 3.0;
            1.0, 0.0, 2.0;
            3.0, 2.0, 0.0];
        let mut matrix = ClusterMatrix::validated(&distances, 1).unwrap();
        matrix.retire(0);
        assert_eq!(matrix.min_active_pair(), Some((2, 1)));
        assert!(!matrix.is_active(0));
        assert_eq!(matrix.active_count(), 2);
    }

    #[test]
    fn min_pair_none_when_single_cluster() {
        let distances = dmatrix![
            0.0, 1.0;
            1.0, 0.0];
        let mut matrix = ClusterMatrix::validated(&distances, 1).unwrap();
        matrix.retire(1);
        assert_eq!(matrix.min_active_pair(), None);
    }

    #[test]
    fn weighted_merge_uses_cluster_sizes() {
        let distances = dmatrix![
            0.0, 2.0, 10.0;
            2.0, 0.0, 4.0;
            10.0, 4.0, 0.0];
        let mut matrix = ClusterMatrix::validated(&distances, 1).unwrap();
        matrix.retire(1);
        matrix.merge_weighted(0, 1, 3, 1);
        // (10 * 3 + 4 * 1) / 4
        assert_eq!(matrix.distance(0, 2), 8.5);
        assert_eq!(matrix.distance(2, 0), 8.5);
    }

    #[test]
    fn divergence_sums_active_rows_only() {
        let distances = dmatrix![
            0.0, 3.0, 4.0;
            3.0, 0.0, 5.0;
            4.0, 5.0, 0.0];
        let mut matrix = ClusterMatrix::validated(&distances, 1).unwrap();
        matrix.recompute_divergence();
        assert_eq!(matrix.divergence(0), 7.0);
        matrix.retire(2);
        matrix.recompute_divergence();
        assert_eq!(matrix.divergence(0), 3.0);
    }

    #[test]
    fn q_pair_prefers_divergent_rows() {
        // Wikipedia neighbour-joining example, first round picks (a, b).
        let distances = dmatrix![
            0.0, 5.0, 9.0, 9.0, 8.0;
            5.0, 0.0, 10.0, 10.0, 9.0;
            9.0, 10.0, 0.0, 8.0, 7.0;
            9.0, 10.0, 8.0, 0.0, 3.0;
            8.0, 9.0, 7.0, 3.0, 0.0];
        let mut matrix = ClusterMatrix::validated(&distances, 4).unwrap();
        matrix.recompute_divergence();
        assert_eq!(matrix.min_q_pair(), Some((1, 0)));
    }
}
