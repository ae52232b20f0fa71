use nalgebra::*;
use rand::Rng;
use rand_distr::StandardNormal;
use std::fmt::{self, Display};
use thiserror::Error;

/// Relative tolerance used when checking covariance symmetry.
const SYMMETRY_TOL : f64 = 1E-8;

/// Eigenvalues above -EIGEN_TOL * max|eigenvalue| * p are taken as round-off
/// of a positive-semidefinite matrix and clamped to zero.
const EIGEN_TOL : f64 = 1E-10;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CovarianceError {

    #[error("Mean vector has {mean} entries but covariance matrix is {rows}x{cols}")]
    Shape { mean : usize, rows : usize, cols : usize },

    #[error("Mean or covariance contains non-finite entries")]
    NonFinite,

    #[error("Covariance matrix is not symmetric")]
    Asymmetric,

    #[error("Covariance matrix is not positive-semidefinite (smallest eigenvalue {0})")]
    Indefinite(f64)

}

/// Multivariate normal parametrized by μ (px1) and Σ (pxp). Alongside the covariance,
/// this structure holds a matrix square root R (Σ = R R^T) taken from the spectral
/// decomposition of Σ, which is what sampling works with. Unlike a Cholesky factor,
/// the spectral root exists for covariances that are only positive-semidefinite,
/// so near-singular hypervolumes can still be sampled.
#[derive(Debug, Clone)]
pub struct MultiNormal {

    mu : DVector<f64>,

    sigma : DMatrix<f64>,

    /// V Λ^{1/2}, with V the eigenvectors and Λ the (clamped) eigenvalues of sigma.
    root : DMatrix<f64>

}

impl MultiNormal {

    /// Builds a new multivariate distribution from a mean vector mu and positive-semidefinite
    /// covariance matrix sigma. Sigma is symmetrized as (1/2)(Σ + Σ^T) after the
    /// symmetry check, so tiny asymmetries from upstream estimation are tolerated.
    pub fn new(mu : DVector<f64>, sigma : DMatrix<f64>) -> Result<Self, CovarianceError> {
        if mu.nrows() != sigma.nrows() || sigma.nrows() != sigma.ncols() {
            return Err(CovarianceError::Shape { mean : mu.nrows(), rows : sigma.nrows(), cols : sigma.ncols() });
        }
        if !mu.iter().chain(sigma.iter()).all(|v| v.is_finite() ) {
            return Err(CovarianceError::NonFinite);
        }
        if !is_symmetric(&sigma) {
            return Err(CovarianceError::Asymmetric);
        }
        let sigma = build_symmetric(sigma);
        let root = spectral_root(&sigma)?;
        Ok(Self { mu, sigma, root })
    }

    /// Creates a non-centered multinormal with specified diagonal covariance.
    pub fn new_homoscedastic(mu : DVector<f64>, var : f64) -> Result<Self, CovarianceError> {
        let n = mu.nrows();
        let mut cov = DMatrix::zeros(n, n);
        cov.set_diagonal(&DVector::from_element(n, var));
        Self::new(mu, cov)
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mu
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.sigma
    }

    /// Number of dimensions p.
    pub fn dim(&self) -> usize {
        self.mu.nrows()
    }

    /// Fills each row of dst with an independent draw. Rows are filled in order,
    /// so a seeded generator always yields the same matrix.
    pub fn sample_into<R>(&self, rng : &mut R, mut dst : DMatrixSliceMut<'_, f64>)
    where
        R : Rng + ?Sized
    {
        assert!(
            dst.ncols() == self.dim(),
            "Error (sample_into): destination has {} columns but distribution has {} dimensions",
            dst.ncols(),
            self.dim()
        );
        let mut z = DVector::zeros(self.dim());
        let mut x = DVector::zeros(self.dim());
        for mut row in dst.row_iter_mut() {
            z.iter_mut().for_each(|zi| *zi = rng.sample(StandardNormal) );
            x.copy_from(&self.mu);

            // x = mu + R z
            x.gemv(1.0, &self.root, &z, 1.0);
            row.copy_from(&x.transpose());
        }
    }

    /// Returns n independent draws as the rows of a n x p matrix.
    pub fn sample_n<R>(&self, rng : &mut R, n : usize) -> DMatrix<f64>
    where
        R : Rng + ?Sized
    {
        let mut draws = DMatrix::zeros(n, self.dim());
        self.sample_into(rng, draws.slice_mut((0, 0), (n, self.dim())));
        draws
    }

}

impl rand_distr::Distribution<DVector<f64>> for MultiNormal {

    fn sample<R>(&self, rng : &mut R) -> DVector<f64>
    where
        R : Rng + ?Sized
    {
        let z : DVector<f64> = DVector::from_fn(self.dim(), |_, _| rng.sample(StandardNormal) );
        &self.mu + &self.root * z
    }

}

impl Display for MultiNormal {

    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiNormal(p = {})\nmean = {}cov = {}", self.dim(), self.mu.transpose(), self.sigma)
    }

}

/// Verifies if the informed matrix is square and symmetric up to a tolerance relative to its
/// largest absolute entry.
pub fn is_symmetric(m : &DMatrix<f64>) -> bool {
    if m.nrows() != m.ncols() {
        return false;
    }
    let scale = 1.0 + m.amax();
    (0..m.nrows()).all(|i| (0..i).all(|j| (m[(i, j)] - m[(j, i)]).abs() <= SYMMETRY_TOL * scale ) )
}

/// Builds a symmetric matrix from M as (1/2)*(M + M^T)
pub fn build_symmetric(m : DMatrix<f64>) -> DMatrix<f64> {
    assert!(m.nrows() == m.ncols(), "build_symmetric: Informed non-square matrix");
    let mt = m.transpose();
    (m + mt).scale(0.5)
}

/// Computes the matrix square root V Λ^{1/2} of a symmetric positive-semidefinite matrix
/// from its spectral decomposition Σ = V Λ V^T. Small negative eigenvalues (round-off) are
/// clamped to zero; clearly negative eigenvalues are reported as an error.
pub fn spectral_root(sigma : &DMatrix<f64>) -> Result<DMatrix<f64>, CovarianceError> {
    let SymmetricEigen { eigenvectors, eigenvalues } = SymmetricEigen::new(sigma.clone());
    let scale = eigenvalues.amax();
    let min_eigen = eigenvalues.min();
    if min_eigen < -EIGEN_TOL * scale * sigma.nrows() as f64 {
        return Err(CovarianceError::Indefinite(min_eigen));
    }
    let mut root = eigenvectors;
    for (mut col, lambda) in root.column_iter_mut().zip(eigenvalues.iter()) {
        col *= lambda.max(0.0).sqrt();
    }
    Ok(root)
}

#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
use rand_chacha::ChaCha8Rng;

#[test]
fn sample_moments() {
    let mu = DVector::from_column_slice(&[1.0, -2.0]);
    let sigma = DMatrix::from_row_slice(2, 2, &[2.0, 0.6, 0.6, 1.0]);
    let mn = MultiNormal::new(mu.clone(), sigma.clone()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let draws = mn.sample_n(&mut rng, 20_000);
    let centroid = draws.row_mean().transpose();
    assert!((centroid - &mu).amax() < 0.05);
    let cov = draws.clone().transpose() * &draws / 20_000. - &mu * mu.transpose();
    assert!((cov - sigma).amax() < 0.1);
}

#[test]
fn singular_covariance_samples_on_subspace() {

    // Rank-one covariance: all draws lie on the line x1 = x0.
    let sigma = DMatrix::from_element(2, 2, 1.0);
    let mn = MultiNormal::new(DVector::zeros(2), sigma).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let draws = mn.sample_n(&mut rng, 100);
    for row in draws.row_iter() {
        assert!((row[0] - row[1]).abs() < 1E-6);
    }
}

#[test]
fn indefinite_covariance_rejected() {
    let sigma = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
    let err = MultiNormal::new(DVector::zeros(2), sigma).unwrap_err();
    assert!(matches!(err, CovarianceError::Indefinite(_)));
    let asym = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
    assert_eq!(MultiNormal::new(DVector::zeros(2), asym).unwrap_err(), CovarianceError::Asymmetric);
    let shape = MultiNormal::new(DVector::zeros(3), DMatrix::identity(2, 2)).unwrap_err();
    assert_eq!(shape, CovarianceError::Shape { mean : 3, rows : 2, cols : 2 });
}

#[test]
fn marginals_match_normal_cdf() {
    use crate::approx::Empirical;
    let mn = MultiNormal::new_homoscedastic(DVector::from_column_slice(&[0.5, 3.0]), 4.0).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let draws = mn.sample_n(&mut rng, 5_000);
    let marginal : Vec<f64> = draws.column(1).iter().cloned().collect();
    let emp = Empirical::from_sample(marginal);
    let model = statrs::distribution::Normal::new(3.0, 2.0).unwrap();
    assert!(emp.analytical_ks(&model).diff < 0.03);
}
