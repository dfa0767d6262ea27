//! Least-squares helpers for the fitters.

use nalgebra::{DMatrix, DVector};

/// Singular values below this are treated as zero
const SVD_EPS: f64 = 1e-12;

/// Vandermonde matrix with columns `x^0 .. x^degree`
pub fn vandermonde(x: &[f64], degree: usize) -> DMatrix<f64> {
    DMatrix::from_fn(x.len(), degree + 1, |i, j| x[i].powi(j as i32))
}

/// Least-squares polynomial coefficients (lowest order first) for `y ≈ p(x)`.
///
/// Solved by SVD; callers should still center and scale `x` when it spans
/// large magnitudes.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Option<Vec<f64>> {
    if x.len() != y.len() || x.len() <= degree {
        return None;
    }

    let a = vandermonde(x, degree);
    let b = DVector::from_column_slice(y);
    let coeffs = a.svd(true, true).solve(&b, SVD_EPS).ok()?;

    if coeffs.iter().all(|c| c.is_finite()) {
        Some(coeffs.iter().copied().collect())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polyfit_exact_quadratic() {
        let x: Vec<f64> = (-5..=5).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v * v - 3.0 * v + 1.0).collect();
        let c = polyfit(&x, &y, 2).unwrap();
        assert!((c[0] - 1.0).abs() < 1e-9);
        assert!((c[1] + 3.0).abs() < 1e-9);
        assert!((c[2] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_polyfit_line_through_noise() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.1, 2.9, 5.1, 6.9];
        let c = polyfit(&x, &y, 1).unwrap();
        assert!((c[1] - 1.96).abs() < 1e-9);
        assert!((c[0] - 1.06).abs() < 1e-9);
    }

    #[test]
    fn test_polyfit_needs_more_points_than_degree() {
        assert!(polyfit(&[1.0, 2.0], &[1.0, 2.0], 2).is_none());
        assert!(polyfit(&[1.0, 2.0], &[1.0], 1).is_none());
    }

    #[test]
    fn test_vandermonde_shape() {
        let v = vandermonde(&[2.0, 3.0], 2);
        assert_eq!(v.shape(), (2, 3));
        assert_eq!(v[(1, 2)], 9.0);
    }
}
