use nalgebra::*;
use serde::{Serialize, Deserialize};
use std::f64::consts::PI;
use thiserror::Error;
use crate::prob::MultiNormal;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegionError {

    #[error("Dimension {0} out of range for a {1}-dimensional distribution")]
    DimOutOfRange(usize, usize),

    #[error("Projection requires two distinct dimensions (got {0} twice)")]
    SameDims(usize),

    #[error("Confidence level {0} outside (0, 1)")]
    Level(f64)

}

/// Trait shared by structures that represent a bounded region on the real plane.
pub trait Region {

    /// Verify if the point is within the closed region.
    fn contains(&self, x : f64, y : f64) -> bool;

}

/// Represents the elliptical contour of isoprobability of a multivariate normal projected
/// on a pair of dimensions. The projected distribution is bivariate normal, so the region
/// holding a fraction `level` of its mass is the ellipse of squared Mahalanobis radius
/// -2 ln(1 - level) (the chi-square quantile with two degrees of freedom).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contour {

    pub dims : (usize, usize),

    pub center : (f64, f64),

    /// Semi-axis lengths, major axis first.
    pub axes : (f64, f64),

    /// Angle between the major axis and the first projected dimension, in radians.
    pub angle : f64,

    pub level : f64

}

impl Contour {

    pub fn new(mn : &MultiNormal, dims : (usize, usize), level : f64) -> Result<Self, RegionError> {
        let p = mn.dim();
        for d in [dims.0, dims.1].iter() {
            if *d >= p {
                return Err(RegionError::DimOutOfRange(*d, p));
            }
        }
        if dims.0 == dims.1 {
            return Err(RegionError::SameDims(dims.0));
        }
        if !(level > 0.0 && level < 1.0) {
            return Err(RegionError::Level(level));
        }
        let cov = mn.cov();
        let sub = Matrix2::new(
            cov[(dims.0, dims.0)], cov[(dims.0, dims.1)],
            cov[(dims.1, dims.0)], cov[(dims.1, dims.1)]
        );
        let eigen = SymmetricEigen::new(sub);
        let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
            (0, 1)
        } else {
            (1, 0)
        };
        let radius2 = -2.0 * (1.0 - level).ln();
        let axes = (
            (eigen.eigenvalues[major].max(0.0) * radius2).sqrt(),
            (eigen.eigenvalues[minor].max(0.0) * radius2).sqrt()
        );
        let dir = eigen.eigenvectors.column(major);
        let angle = dir[1].atan2(dir[0]);
        let center = (mn.mean()[dims.0], mn.mean()[dims.1]);
        Ok(Self { dims, center, axes, angle, level })
    }

    /// Returns n points evenly spaced in angle along the ellipse boundary.
    pub fn vertices(&self, n : usize) -> Vec<(f64, f64)> {
        let (cos_a, sin_a) = (self.angle.cos(), self.angle.sin());
        (0..n).map(|i| {
            let t = 2.0 * PI * i as f64 / n as f64;
            let (u, v) = (self.axes.0 * t.cos(), self.axes.1 * t.sin());
            (self.center.0 + u * cos_a - v * sin_a, self.center.1 + u * sin_a + v * cos_a)
        }).collect()
    }

}

impl Region for Contour {

    fn contains(&self, x : f64, y : f64) -> bool {
        let (dx, dy) = (x - self.center.0, y - self.center.1);
        let (cos_a, sin_a) = (self.angle.cos(), self.angle.sin());
        let u = dx * cos_a + dy * sin_a;
        let v = -dx * sin_a + dy * cos_a;
        if self.axes.1 == 0.0 {
            return v.abs() <= 1E-12 && u.abs() <= self.axes.0;
        }
        (u / self.axes.0).powi(2) + (v / self.axes.1).powi(2) <= 1.0 + 1E-9
    }

}

#[cfg(test)]
use approx::assert_abs_diff_eq;

#[test]
fn axis_aligned_ellipse() {
    let sigma = DMatrix::from_diagonal(&DVector::from_column_slice(&[1.0, 9.0, 4.0]));
    let mn = MultiNormal::new(DVector::from_column_slice(&[1.0, 2.0, 3.0]), sigma).unwrap();
    let c = Contour::new(&mn, (0, 1), 0.95).unwrap();
    let r = (-2.0 * 0.05f64.ln()).sqrt();
    assert_abs_diff_eq!(c.axes.0, 3.0 * r, epsilon = 1E-9);
    assert_abs_diff_eq!(c.axes.1, r, epsilon = 1E-9);
    assert_abs_diff_eq!(c.angle.sin().abs(), 1.0, epsilon = 1E-9);
    assert_eq!(c.center, (1.0, 2.0));
    assert!(c.contains(1.0, 2.0));
    assert!(!c.contains(1.0, 2.0 + 3.0 * r + 0.1));
    for (x, y) in c.vertices(64) {
        assert!(c.contains(x, y));
    }
}

#[test]
fn ellipse_mass_matches_level() {
    use rand::SeedableRng;
    let sigma = DMatrix::from_row_slice(2, 2, &[1.0, 0.8, 0.8, 2.0]);
    let mn = MultiNormal::new(DVector::zeros(2), sigma).unwrap();
    let c = Contour::new(&mn, (0, 1), 0.95).unwrap();
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(9);
    let draws = mn.sample_n(&mut rng, 10_000);
    let inside = draws.row_iter().filter(|r| c.contains(r[0], r[1]) ).count();
    assert_abs_diff_eq!(inside as f64 / 10_000., 0.95, epsilon = 0.01);
}

#[test]
fn invalid_projection() {
    let mn = MultiNormal::new_homoscedastic(DVector::zeros(2), 1.0).unwrap();
    assert_eq!(Contour::new(&mn, (0, 2), 0.95).unwrap_err(), RegionError::DimOutOfRange(2, 2));
    assert_eq!(Contour::new(&mn, (1, 1), 0.95).unwrap_err(), RegionError::SameDims(1));
    assert_eq!(Contour::new(&mn, (0, 1), 1.0).unwrap_err(), RegionError::Level(1.0));
}
