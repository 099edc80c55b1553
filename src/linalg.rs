//! Small-matrix helpers on top of nalgebra used by the EKF update.
//!
//! Measurement dimensions are bounded by `MAX_MEA_DIM` plus the corridor
//! rows, so everything here works on heap matrices of trivial size.

use nalgebra::{DMatrix, DVector, Matrix2};

/// Force exact symmetry: `A <- (A + A^T) / 2`.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// Gershgorin disc lower bound on the smallest eigenvalue of a symmetric
/// matrix: `min_i (M_ii - sum_{j != i} |M_ij|)`.
pub fn gershgorin_lower_bound(m: &DMatrix<f64>) -> f64 {
    let n = m.nrows();
    if n == 0 {
        return 0.0;
    }
    let mut bound = f64::INFINITY;
    for i in 0..n {
        let mut off = 0.0;
        for j in 0..n {
            if j != i {
                off += m[(i, j)].abs();
            }
        }
        let disc = m[(i, i)] - off;
        if disc < bound {
            bound = disc;
        }
    }
    bound
}

/// SVD pseudo-inverse with the usual `eps * max(r, c) * sigma_max` cutoff.
/// Returns the zero matrix of transposed shape when factorization fails.
pub fn pinv(m: &DMatrix<f64>) -> DMatrix<f64> {
    let (r, c) = m.shape();
    if r == 0 || c == 0 || m.iter().any(|x| !x.is_finite()) {
        return DMatrix::zeros(c, r);
    }
    let svd = m.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    let tol = 1e-15 * (r.max(c) as f64) * sigma_max;
    svd.pseudo_inverse(tol)
        .unwrap_or_else(|_| DMatrix::zeros(c, r))
}

/// Rank of a 2x2 normal-equation matrix via its determinant.
pub fn rank2(m: &Matrix2<f64>) -> usize {
    if m.determinant().abs() < 1e-9 {
        1
    } else {
        2
    }
}

/// 2x2 inverse with a pivot floor so degenerate geometry cannot divide by zero.
pub fn invert2x2(m: &Matrix2<f64>) -> Matrix2<f64> {
    let mut det = m.determinant();
    if det.abs() < 1e-12 {
        det = 1e-12;
    }
    Matrix2::new(m[(1, 1)] / det, -m[(0, 1)] / det, -m[(1, 0)] / det, m[(0, 0)] / det)
}

pub fn all_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

pub fn all_finite_mat(m: &DMatrix<f64>) -> bool {
    m.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetrize() {
        let mut m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 3.0]);
        symmetrize(&mut m);
        assert_eq!(m[(0, 1)], 3.0);
        assert_eq!(m[(1, 0)], 3.0);
    }

    #[test]
    fn test_gershgorin_diagonal() {
        let m = DMatrix::from_row_slice(3, 3, &[4.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 7.0]);
        assert!((gershgorin_lower_bound(&m) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_gershgorin_off_diagonal() {
        let m = DMatrix::from_row_slice(2, 2, &[3.0, -2.0, -2.0, 3.0]);
        // Discs give 3 - 2 = 1, which matches the true smallest eigenvalue here.
        assert!((gershgorin_lower_bound(&m) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pinv_invertible() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 2.0]);
        let inv = pinv(&m);
        assert!((inv[(0, 0)] - 0.25).abs() < 1e-12);
        assert!((inv[(1, 1)] - 0.5).abs() < 1e-12);
        assert!(inv[(0, 1)].abs() < 1e-12);
    }

    #[test]
    fn test_pinv_rank_deficient() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let p = pinv(&m);
        // A A+ A = A must still hold for the rank-1 case.
        let back = &m * &p * &m;
        for (a, b) in back.iter().zip(m.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rank2_and_invert() {
        let good = Matrix2::new(2.0, 0.0, 0.0, 3.0);
        let bad = Matrix2::new(1.0, 2.0, 2.0, 4.0);
        assert_eq!(rank2(&good), 2);
        assert_eq!(rank2(&bad), 1);
        let inv = invert2x2(&good);
        assert!((inv[(0, 0)] - 0.5).abs() < 1e-12);
        assert!((inv[(1, 1)] - 1.0 / 3.0).abs() < 1e-12);
    }
}
