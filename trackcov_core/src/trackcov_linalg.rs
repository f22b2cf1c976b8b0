//! The "LINALG" Engine - Regularized Symmetric Matrix Algebra
//!
//! Every matrix the vertex fitter inverts is a covariance or a weight
//! matrix, and many of them are badly scaled (micron impact parameters next
//! to inverse-meter curvatures) or nearly singular (parallel tracks). This
//! module provides:
//! - Diagonal normalization before any decomposition
//! - Cholesky inversion with a Schur-complement block recursion fallback
//! - Positive-definite repair via eigenvalue clipping
//!
//! Recoveries are reported to a [`NumericsObserver`], never printed.

use nalgebra::{DMatrix, DVector, SMatrix, SymmetricEigen};
use trackcov_env::{NumericsObserver, RecoveryEvent, RecoveryKind, SilentObserver};

/// Eigenvalue floor used by [`make_positive_definite`].
pub const EIGENVALUE_FLOOR: f64 = 1.0e-13;

/// Below this magnitude the trailing Schur term is treated as zero.
pub const SCHUR_EPSILON: f64 = 1.0e-15;

// ============================================================================
// SYMMETRY & SCALING
// ============================================================================

/// Returns `0.5 * (M + Mᵀ)`.
pub fn symmetrize<const N: usize>(m: &SMatrix<f64, N, N>) -> SMatrix<f64, N, N> {
    (m + m.transpose()) * 0.5
}

/// Dynamic-size version of [`symmetrize`].
pub fn symmetrize_dyn(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Largest absolute asymmetry `max |M_ij - M_ji|`.
pub fn asymmetry(m: &DMatrix<f64>) -> f64 {
    let n = m.nrows();
    let mut worst: f64 = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            worst = worst.max((m[(i, j)] - m[(j, i)]).abs());
        }
    }
    worst
}

/// Scale factors `1/sqrt(|M_ii|)`, with 1 for an exactly zero diagonal.
pub fn diagonal_scale(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(
        m.nrows(),
        (0..m.nrows()).map(|i| {
            let d = m[(i, i)].abs();
            if d > 0.0 {
                1.0 / d.sqrt()
            } else {
                1.0
            }
        }),
    )
}

/// Computes `S M S` for the diagonal matrix `S = diag(scale)`.
pub fn scale_similarity(m: &DMatrix<f64>, scale: &DVector<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    DMatrix::from_fn(n, n, |i, j| m[(i, j)] * scale[i] * scale[j])
}

/// Returns the unit-diagonal version of `m` and the scale used to get it.
pub fn normalize_diagonal(m: &DMatrix<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let scale = diagonal_scale(m);
    (scale_similarity(m, &scale), scale)
}

// ============================================================================
// FIXED-SIZE BRIDGES
// ============================================================================

/// Copies a fixed-size square matrix into a dynamic one.
pub fn to_dynamic<const N: usize>(m: &SMatrix<f64, N, N>) -> DMatrix<f64> {
    DMatrix::from_column_slice(N, N, m.as_slice())
}

/// Copies an `N×N` dynamic matrix into a fixed-size one.
///
/// The caller guarantees the dimension.
pub fn to_fixed<const N: usize>(m: &DMatrix<f64>) -> SMatrix<f64, N, N> {
    SMatrix::<f64, N, N>::from_column_slice(m.as_slice())
}

// ============================================================================
// POSITIVE-DEFINITENESS
// ============================================================================

/// Diagonal positivity plus eigenvalue positivity of the normalized matrix.
///
/// Intended for tests and assertions, not for the hot path.
pub fn check_positive_definite(m: &DMatrix<f64>) -> bool {
    let n = m.nrows();
    if n == 0 || m.ncols() != n {
        return false;
    }
    if m.iter().any(|v| !v.is_finite()) {
        return false;
    }
    if (0..n).any(|i| m[(i, i)] <= 0.0) {
        return false;
    }
    let (normalized, _) = normalize_diagonal(m);
    let eigen = SymmetricEigen::new(symmetrize_dyn(&normalized));
    eigen.eigenvalues.iter().all(|&v| v > 0.0)
}

/// Fixed-size version of [`check_positive_definite`].
pub fn check_positive_definite_fixed<const N: usize>(m: &SMatrix<f64, N, N>) -> bool {
    check_positive_definite(&to_dynamic(m))
}

/// Repairs a unit-diagonal symmetric matrix by clipping its eigenvalues.
///
/// Eigenvalues `<= 0` are raised to [`EIGENVALUE_FLOOR`], the matrix is
/// rebuilt from the clipped spectrum and its diagonal is renormalized to 1.
pub fn make_positive_definite(m: &DMatrix<f64>) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(symmetrize_dyn(m));
    let clipped = eigen
        .eigenvalues
        .map(|v| if v <= 0.0 { EIGENVALUE_FLOOR } else { v });
    let vectors = &eigen.eigenvectors;
    let rebuilt = vectors * DMatrix::from_diagonal(&clipped) * vectors.transpose();
    let (renormalized, _) = normalize_diagonal(&rebuilt);
    symmetrize_dyn(&renormalized)
}

/// Restores positive-definiteness of an arbitrarily scaled covariance.
///
/// Normalizes the diagonal, tries Cholesky, falls back to
/// [`make_positive_definite`] and restores the original scale. Returns the
/// matrix unchanged (symmetrized) when it is already positive-definite.
pub fn repair_covariance(
    m: &DMatrix<f64>,
    observer: &dyn NumericsObserver,
    context: &str,
) -> DMatrix<f64> {
    let symmetric = symmetrize_dyn(m);
    let (normalized, scale) = normalize_diagonal(&symmetric);
    if normalized.clone().cholesky().is_some() {
        return symmetric;
    }
    observer.on_recovery(
        &RecoveryEvent::new(RecoveryKind::PositiveDefiniteRepair, context, m.nrows())
            .with_detail("eigenvalues clipped after failed Cholesky"),
    );
    let repaired = make_positive_definite(&normalized);
    let unscale = scale.map(|s| 1.0 / s);
    symmetrize_dyn(&scale_similarity(&repaired, &unscale))
}

// ============================================================================
// REGULARIZED INVERSE
// ============================================================================

/// Regularized inverse of a symmetric matrix, without observation.
pub fn regularized_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    regularized_inverse_with(m, &SilentObserver, "regularized_inverse")
}

/// Regularized inverse of a symmetric matrix.
///
/// 1. Normalize with `S = diag(1/sqrt|M_ii|)`
/// 2. Invert the normalized matrix by Cholesky, or by the Schur-complement
///    block recursion when Cholesky fails
/// 3. Repair the normalized inverse if it is not positive-definite
/// 4. Un-normalize and symmetrize
///
/// Callers symmetrize before calling.
pub fn regularized_inverse_with(
    m: &DMatrix<f64>,
    observer: &dyn NumericsObserver,
    context: &str,
) -> DMatrix<f64> {
    let n = m.nrows();
    if n == 0 {
        return DMatrix::zeros(0, 0);
    }
    let (normalized, scale) = normalize_diagonal(m);

    let mut inverse = match normalized.clone().cholesky() {
        Some(chol) => chol.inverse(),
        None => {
            observer.on_recovery(
                &RecoveryEvent::new(RecoveryKind::CholeskyFailed, context, n)
                    .with_detail("falling back to block recursion"),
            );
            block_inverse(&normalized, observer, context)
        }
    };
    inverse = symmetrize_dyn(&inverse);

    if n > 1 && (inverse.iter().any(|v| !v.is_finite()) || inverse.clone().cholesky().is_none()) {
        let cleaned = inverse.map(|v| if v.is_finite() { v } else { 0.0 });
        inverse = repair_covariance(&cleaned, observer, context);
    }

    symmetrize_dyn(&scale_similarity(&inverse, &scale))
}

/// Fixed-size wrapper around [`regularized_inverse_with`].
pub fn regularized_inverse_fixed<const N: usize>(
    m: &SMatrix<f64, N, N>,
    observer: &dyn NumericsObserver,
    context: &str,
) -> SMatrix<f64, N, N> {
    to_fixed(&regularized_inverse_with(&to_dynamic(m), observer, context))
}

/// [`block_inverse`] of `S M S` with `S = diag(1/sqrt|M_ii|)`, scaled back.
fn normalized_block_inverse(
    m: &DMatrix<f64>,
    observer: &dyn NumericsObserver,
    context: &str,
) -> DMatrix<f64> {
    let (normalized, scale) = normalize_diagonal(m);
    scale_similarity(&block_inverse(&normalized, observer, context), &scale)
}

/// Schur-complement recursion, peeling off the last row and column.
///
/// Every sub-block is renormalized before it is inverted.
/// With `M = [[Q, p], [pᵀ, q]]`:
/// - `|q| > SCHUR_EPSILON`: `A = (Q - p pᵀ/q)⁻¹`, `b = -A p / q`,
///   `c = (1 - p·b) / q`
/// - otherwise: `A = Q⁻¹ (Q - p pᵀ/α) Q⁻¹`, `b = Q⁻¹ p / α`, `c = -1/α`
///   with `α = pᵀ Q⁻¹ p`
fn block_inverse(m: &DMatrix<f64>, observer: &dyn NumericsObserver, context: &str) -> DMatrix<f64> {
    let n = m.nrows();
    match n {
        0 => DMatrix::zeros(0, 0),
        1 => {
            let v = m[(0, 0)];
            if v != 0.0 {
                DMatrix::from_element(1, 1, 1.0 / v)
            } else {
                observer.on_recovery(&RecoveryEvent::new(RecoveryKind::ZeroDeterminant, context, 1));
                DMatrix::zeros(1, 1)
            }
        }
        2 => {
            let det = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)];
            if det == 0.0 {
                observer.on_recovery(&RecoveryEvent::new(RecoveryKind::ZeroDeterminant, context, 2));
                return DMatrix::zeros(2, 2);
            }
            DMatrix::from_row_slice(
                2,
                2,
                &[
                    m[(1, 1)] / det,
                    -m[(0, 1)] / det,
                    -m[(1, 0)] / det,
                    m[(0, 0)] / det,
                ],
            )
        }
        _ => {
            let k = n - 1;
            let q_block = m.view((0, 0), (k, k)).into_owned();
            let p: DVector<f64> = m.view((0, k), (k, 1)).column(0).into_owned();
            let q = m[(k, k)];

            let (a, b, c) = if q.abs() > SCHUR_EPSILON {
                let reduced = &q_block - (&p * p.transpose()) / q;
                let a = normalized_block_inverse(&reduced, observer, context);
                let b = -(&a * &p) / q;
                let c = (1.0 - p.dot(&b)) / q;
                (a, b, c)
            } else {
                let q_inv = normalized_block_inverse(&q_block, observer, context);
                let q_inv_p = &q_inv * &p;
                let alpha = p.dot(&q_inv_p);
                if alpha == 0.0 {
                    observer.on_recovery(&RecoveryEvent::new(RecoveryKind::ZeroDeterminant, context, n));
                    (q_inv, DVector::zeros(k), 0.0)
                } else {
                    let a = &q_inv * (&q_block - (&p * p.transpose()) / alpha) * &q_inv;
                    (a, q_inv_p / alpha, -1.0 / alpha)
                }
            };

            let mut inverse = DMatrix::zeros(n, n);
            inverse.view_mut((0, 0), (k, k)).copy_from(&a);
            for i in 0..k {
                inverse[(i, k)] = b[i];
                inverse[(k, i)] = b[i];
            }
            inverse[(k, k)] = c;
            inverse
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix5};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl NumericsObserver for Counter {
        fn on_recovery(&self, _event: &RecoveryEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spd_4x4() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 1.0, 0.5, 0.2,
                1.0, 3.0, 0.3, 0.1,
                0.5, 0.3, 2.0, 0.4,
                0.2, 0.1, 0.4, 1.5,
            ],
        )
    }

    #[test]
    fn test_regularized_inverse_well_conditioned() {
        let m = spd_4x4();
        let inv = regularized_inverse(&m);
        let product = &inv * &m;
        assert_relative_eq!(product, DMatrix::identity(4, 4), epsilon = 1e-10);
        assert!(asymmetry(&inv) < 1e-14);
    }

    #[test]
    fn test_block_recursion_matches_cholesky() {
        let m = spd_4x4();
        let (normalized, _) = normalize_diagonal(&m);
        let by_blocks = block_inverse(&normalized, &SilentObserver, "test");
        let by_cholesky = normalized.clone().cholesky().map(|c| c.inverse());
        assert!(by_cholesky.is_some());
        assert_relative_eq!(by_blocks, by_cholesky.unwrap(), epsilon = 1e-10);
    }

    #[test]
    fn test_block_recursion_zero_trailing_term() {
        // Indefinite matrix with an exactly zero trailing diagonal: only the
        // q ≈ 0 branch can invert it.
        let m = DMatrix::from_row_slice(
            3,
            3,
            &[
                2.0, 0.5, 1.0,
                0.5, 1.0, 0.5,
                1.0, 0.5, 0.0,
            ],
        );
        let inv = block_inverse(&m, &SilentObserver, "test");
        assert_relative_eq!(&inv * &m, DMatrix::identity(3, 3), epsilon = 1e-10);
    }

    #[test]
    fn test_regularized_inverse_badly_scaled() {
        // Covariance with scales spanning 12 orders of magnitude: condition
        // number far above 1e10, but well conditioned after normalization.
        let sigmas = [1.0e-6, 1.0, 1.0e6];
        let corr = Matrix3::new(1.0, 0.5, 0.2, 0.5, 1.0, 0.3, 0.2, 0.3, 1.0);
        let m = DMatrix::from_fn(3, 3, |i, j| corr[(i, j)] * sigmas[i] * sigmas[j]);
        let eigen = SymmetricEigen::new(m.clone());
        let max = eigen.eigenvalues.max();
        let min = eigen.eigenvalues.min();
        assert!(max / min > 1e10);

        let inv = regularized_inverse(&m);
        assert!(inv.iter().all(|v| v.is_finite()));
        assert!(check_positive_definite(&inv));
        assert!(asymmetry(&inv) <= 1e-12 * inv.abs().max());
    }

    #[test]
    fn test_regularized_inverse_singular_is_finite_and_reported() {
        // Rank-deficient: two identical rows
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        let counter = Counter::default();
        let inv = regularized_inverse_with(&m, &counter, "test");
        assert!(inv.iter().all(|v| v.is_finite()));
        assert!(asymmetry(&inv) < 1e-12);
        assert!(check_positive_definite(&inv));
        assert!(counter.0.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_block_recursion_rescales_schur_complement() {
        // Unit diagonal, but the first Schur complement has diagonal
        // entries of order 1e-10 next to order 1.
        let r = 1.0 - 1.0e-10;
        let m = DMatrix::from_row_slice(
            4,
            4,
            &[
                1.0, 0.0, 0.2, r,
                0.0, 1.0, 0.1, 0.0,
                0.2, 0.1, 1.0, 0.0,
                r, 0.0, 0.0, 1.0,
            ],
        );
        let inv = block_inverse(&m, &SilentObserver, "test");
        assert!(inv.iter().all(|v| v.is_finite()));
        let residual = (&inv * &m - DMatrix::identity(4, 4)).abs().max();
        assert!(residual < 1e-4, "residual {}", residual);
    }

    #[test]
    fn test_block_recursion_badly_scaled_input() {
        let sigmas = [1.0e-5, 1.0, 1.0e4, 1.0e-2];
        let m = DMatrix::from_fn(4, 4, |i, j| spd_4x4()[(i, j)] * sigmas[i] * sigmas[j]);
        let inv = block_inverse(&m, &SilentObserver, "test");
        let residual = (&inv * &m - DMatrix::identity(4, 4)).abs().max();
        assert!(residual < 1e-6, "residual {}", residual);
    }

    #[test]
    fn test_make_positive_definite_clips_negative_eigenvalue() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 0.9, 0.9, 0.9, 1.0, -0.9, 0.9, -0.9, 1.0]);
        assert!(!check_positive_definite(&m));
        let fixed = make_positive_definite(&m);
        assert!(check_positive_definite(&fixed));
        for i in 0..3 {
            assert_relative_eq!(fixed[(i, i)], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_repair_covariance_keeps_scale() {
        let mut m = DMatrix::from_row_slice(2, 2, &[4.0, 4.1, 4.1, 4.0]);
        assert!(!check_positive_definite(&m));
        m = repair_covariance(&m, &SilentObserver, "test");
        assert!(check_positive_definite(&m));
        assert_relative_eq!(m[(0, 0)], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_bridges() {
        let m = Matrix5::from_fn(|i, j| if i == j { 2.0 } else { 0.1 });
        let inv = regularized_inverse_fixed(&m, &SilentObserver, "test");
        assert_relative_eq!(inv * m, Matrix5::identity(), epsilon = 1e-10);
        assert_eq!(to_fixed::<5>(&to_dynamic(&m)), m);
    }

    #[test]
    fn test_check_positive_definite_rejects_bad_diagonal() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        assert!(!check_positive_definite(&m));
    }

    proptest! {
        #[test]
        fn prop_inverse_of_random_spd(
            entries in proptest::collection::vec(-1.0f64..1.0, 16),
            ridge in 0.1f64..2.0,
        ) {
            let g = DMatrix::from_row_slice(4, 4, &entries);
            let m = &g * g.transpose() + DMatrix::identity(4, 4) * ridge;
            let inv = regularized_inverse(&m);
            let product = &inv * &m;
            for i in 0..4 {
                for j in 0..4 {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    prop_assert!((product[(i, j)] - expected).abs() < 1e-8);
                }
            }
        }
    }
}
