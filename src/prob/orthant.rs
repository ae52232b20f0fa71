use nalgebra::*;
use rand::Rng;
use serde::{Serialize, Deserialize};
use statrs::function::erf::{erfc, erfc_inv};
use std::f64::consts::SQRT_2;
use thiserror::Error;
use tracing::warn;
use super::MultiNormal;

/// Number of independent random shifts of the lattice. The spread of the
/// per-shift estimates gives the integration error.
const SHIFTS : usize = 12;

/// Lattice size of the first refinement round; doubled every round.
const INITIAL_POINTS : usize = 50;

/// Multiplier over the standard error of the shift means reported as the error bound.
const ERROR_FACTOR : f64 = 3.5;

/// Uniform draws are kept inside [TINY, 1 - TINY] before applying the normal quantile.
const TINY : f64 = 1E-15;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IntegrationError {

    #[error("Covariance matrix has no Cholesky factor (not positive-definite)")]
    NotPositiveDefinite,

    #[error("Point has {0} coordinates but distribution has {1} dimensions")]
    Dimension(usize, usize),

    #[error("Integration limits contain NaN")]
    InvalidLimits,

    #[error("Integration produced a non-finite value")]
    NonFinite

}

/// Budget and accuracy of a single orthant integral.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrthantSettings {

    /// Maximum number of integrand evaluations. When the budget runs out before the
    /// tolerance is met, the integral is returned with its larger error estimate.
    pub max_evals : usize,

    /// Absolute error tolerance.
    pub abs_tol : f64

}

impl Default for OrthantSettings {

    fn default() -> Self {
        Self { max_evals : 25_000, abs_tol : 1E-3 }
    }

}

/// Value of an integral and its estimated absolute error.
#[derive(Debug, Clone, Copy)]
pub struct Integral {
    pub value : f64,
    pub error : f64,
    pub evals : usize
}

/// Rectangle probabilities P(a <= X <= b) for X ~ N(μ, Σ), following Genz (1992): the
/// integral is rewritten through the Cholesky factor of Σ as an integral over the unit
/// hypercube of dimension p - 1, which is then evaluated with a randomly shifted Richtmyer
/// lattice rule. Orthants are the special case where all lower or all upper limits are infinite.
///
/// # References
/// Genz, A. (1992). Numerical computation of multivariate normal probabilities.
/// Journal of Computational and Graphical Statistics, 1(2), 141-149.
#[derive(Debug, Clone)]
pub struct Orthant {

    mu : DVector<f64>,

    /// Lower Cholesky factor of the covariance.
    low : DMatrix<f64>,

    /// Richtmyer generator: fractional parts of the square roots of the first p - 1 primes.
    gen : Vec<f64>,

    settings : OrthantSettings

}

impl Orthant {

    pub fn new(mn : &MultiNormal, settings : OrthantSettings) -> Result<Self, IntegrationError> {
        let low = Cholesky::new(mn.cov().clone())
            .ok_or(IntegrationError::NotPositiveDefinite)?
            .unpack();
        let scale = mn.cov().diagonal().amax();
        if low.diagonal().iter().any(|d| !(*d > f64::EPSILON * scale.sqrt()) ) {
            return Err(IntegrationError::NotPositiveDefinite);
        }
        let gen = primes(mn.dim().saturating_sub(1)).iter()
            .map(|p| (*p as f64).sqrt().fract() )
            .collect();
        Ok(Self { mu : mn.mean().clone(), low, gen, settings })
    }

    pub fn settings(&self) -> &OrthantSettings {
        &self.settings
    }

    /// P(X >= x), all coordinates simultaneously.
    pub fn upper<R>(&self, x : &DVector<f64>, rng : &mut R) -> Result<Integral, IntegrationError>
    where
        R : Rng + ?Sized
    {
        let b = DVector::from_element(x.nrows(), f64::INFINITY);
        self.rectangle(x, &b, rng)
    }

    /// P(X <= x), all coordinates simultaneously.
    pub fn lower<R>(&self, x : &DVector<f64>, rng : &mut R) -> Result<Integral, IntegrationError>
    where
        R : Rng + ?Sized
    {
        let a = DVector::from_element(x.nrows(), f64::NEG_INFINITY);
        self.rectangle(&a, x, rng)
    }

    /// Two-sided extremeness of x: the smaller of the upper-orthant probability and twice
    /// the lower-orthant probability. Small values mean x sits far into a tail.
    pub fn tail_statistic<R>(&self, x : &DVector<f64>, rng : &mut R) -> Result<f64, IntegrationError>
    where
        R : Rng + ?Sized
    {
        let up = self.upper(x, rng)?;
        let low = self.lower(x, rng)?;
        Ok(up.value.min(2.0 * low.value))
    }

    /// P(a <= X <= b). Limits may be infinite.
    pub fn rectangle<R>(&self, a : &DVector<f64>, b : &DVector<f64>, rng : &mut R) -> Result<Integral, IntegrationError>
    where
        R : Rng + ?Sized
    {
        let p = self.mu.nrows();
        if a.nrows() != p || b.nrows() != p {
            return Err(IntegrationError::Dimension(a.nrows().max(b.nrows()), p));
        }
        if a.iter().chain(b.iter()).any(|v| v.is_nan() ) {
            return Err(IntegrationError::InvalidLimits);
        }
        let a : Vec<f64> = a.iter().zip(self.mu.iter()).map(|(ai, mi)| ai - mi ).collect();
        let b : Vec<f64> = b.iter().zip(self.mu.iter()).map(|(bi, mi)| bi - mi ).collect();
        if a.iter().zip(b.iter()).any(|(ai, bi)| ai >= bi ) {
            return Ok(Integral { value : 0.0, error : 0.0, evals : 0 });
        }

        let l00 = self.low[(0, 0)];
        let d0 = phi(a[0] / l00);
        let e0 = phi(b[0] / l00);
        if p == 1 || e0 - d0 <= 0.0 {
            return Ok(Integral { value : (e0 - d0).max(0.0), error : 0.0, evals : 1 });
        }

        let mut w = vec![0.0; p - 1];
        let mut y = vec![0.0; p - 1];
        let mut shift = vec![0.0; p - 1];
        let mut shift_means = [0.0; SHIFTS];
        let mut n = INITIAL_POINTS.min(self.settings.max_evals / (2 * SHIFTS)).max(1);
        let mut evals = 0;

        // Running estimate over all rounds, each round weighted by the inverse of its variance.
        let mut value = 0.0;
        let mut var = f64::INFINITY;
        loop {
            for mean in shift_means.iter_mut() {
                shift.iter_mut().for_each(|s| *s = rng.gen::<f64>() );
                let mut sum = 0.0;
                for k in 1..=n {
                    for j in 0..(p - 1) {
                        let u = (k as f64 * self.gen[j] + shift[j]).fract();
                        w[j] = (2.0 * u - 1.0).abs();
                    }
                    let f = self.integrand(&a, &b, d0, e0, &w, &mut y);
                    w.iter_mut().for_each(|wj| *wj = 1.0 - *wj );
                    let f_anti = self.integrand(&a, &b, d0, e0, &w, &mut y);
                    sum += 0.5 * (f + f_anti);
                }
                *mean = sum / n as f64;
            }
            evals += 2 * n * SHIFTS;

            let round_value = shift_means.iter().sum::<f64>() / SHIFTS as f64;
            let round_var = shift_means.iter().map(|m| (m - round_value).powi(2) ).sum::<f64>() /
                (SHIFTS * (SHIFTS - 1)) as f64;
            if !round_value.is_finite() || !round_var.is_finite() {
                return Err(IntegrationError::NonFinite);
            }
            if round_var == 0.0 || var.is_infinite() {
                value = round_value;
                var = round_var;
            } else {
                let weight = var / (var + round_var);
                value += weight * (round_value - value);
                var = var * round_var / (var + round_var);
            }
            let error = ERROR_FACTOR * var.sqrt();
            if error <= self.settings.abs_tol {
                return Ok(Integral { value : value.max(0.0).min(1.0), error, evals });
            }

            // The last round takes whatever is left of the budget.
            let left = self.settings.max_evals.saturating_sub(evals) / (2 * SHIFTS);
            if left == 0 {
                warn!(error, tol = self.settings.abs_tol, evals, dim = p, "orthant integral above tolerance");
                return Ok(Integral { value : value.max(0.0).min(1.0), error, evals });
            }
            n = (2 * n).min(left);
        }
    }

    /// Genz's transformed integrand at w in [0,1]^(p-1). The conditional limits of each
    /// coordinate are updated from the quantiles of the previous ones.
    fn integrand(&self, a : &[f64], b : &[f64], d0 : f64, e0 : f64, w : &[f64], y : &mut [f64]) -> f64 {
        let mut d = d0;
        let mut e = e0;
        let mut f = e0 - d0;
        for i in 1..a.len() {
            let u = (d + w[i-1] * (e - d)).max(TINY).min(1.0 - TINY);
            y[i-1] = phi_inv(u);
            let s : f64 = (0..i).map(|j| self.low[(i, j)] * y[j] ).sum();
            let lii = self.low[(i, i)];
            d = phi((a[i] - s) / lii);
            e = phi((b[i] - s) / lii);
            f *= (e - d).max(0.0);
            if f == 0.0 {
                break;
            }
        }
        f
    }

}

/// Standard normal CDF.
pub fn phi(x : f64) -> f64 {
    if x == f64::INFINITY {
        1.0
    } else if x == f64::NEG_INFINITY {
        0.0
    } else {
        0.5 * erfc(-x / SQRT_2)
    }
}

/// Standard normal quantile function.
pub fn phi_inv(p : f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

/// First n primes, by trial division over the primes found so far.
fn primes(n : usize) -> Vec<u64> {
    let mut found : Vec<u64> = Vec::with_capacity(n);
    let mut cand = 2;
    while found.len() < n {
        if found.iter().take_while(|p| *p * *p <= cand ).all(|p| cand % p != 0 ) {
            found.push(cand);
        }
        cand += 1;
    }
    found
}

#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
use rand_chacha::ChaCha8Rng;

#[cfg(test)]
use approx::assert_abs_diff_eq;

#[cfg(test)]
fn equicorrelated(p : usize, rho : f64) -> MultiNormal {
    let sigma = DMatrix::from_fn(p, p, |i, j| if i == j { 1.0 } else { rho } );
    MultiNormal::new(DVector::zeros(p), sigma).unwrap()
}

#[test]
fn first_primes() {
    assert_eq!(primes(6), vec![2, 3, 5, 7, 11, 13]);
}

#[test]
fn univariate_orthants_are_closed_form() {
    let mn = MultiNormal::new_homoscedastic(DVector::from_element(1, 1.0), 4.0).unwrap();
    let orth = Orthant::new(&mn, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let x = DVector::from_element(1, 1.0 + 2.0 * 1.959964);
    assert_abs_diff_eq!(orth.lower(&x, &mut rng).unwrap().value, 0.975, epsilon = 1E-6);
    assert_abs_diff_eq!(orth.upper(&x, &mut rng).unwrap().value, 0.025, epsilon = 1E-6);
}

#[test]
fn bivariate_orthant_at_center() {

    // P(X1 >= 0, X2 >= 0) = 1/4 + asin(rho) / (2 pi)
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    for rho in [-0.5, 0.0, 0.5, 0.9].iter() {
        let orth = Orthant::new(&equicorrelated(2, *rho), OrthantSettings::default()).unwrap();
        let expected = 0.25 + rho.asin() / (2.0 * std::f64::consts::PI);
        let up = orth.upper(&DVector::zeros(2), &mut rng).unwrap();
        assert_abs_diff_eq!(up.value, expected, epsilon = 2E-3);
        let low = orth.lower(&DVector::zeros(2), &mut rng).unwrap();
        assert_abs_diff_eq!(low.value, expected, epsilon = 2E-3);
    }
}

#[test]
fn trivariate_orthant_at_center() {

    // P(X >= 0) = 1/8 + 3 asin(rho) / (4 pi) for equicorrelated trivariate normals.
    let orth = Orthant::new(&equicorrelated(3, 0.5), OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let up = orth.upper(&DVector::zeros(3), &mut rng).unwrap();
    assert_abs_diff_eq!(up.value, 0.25, epsilon = 2E-3);
}

#[test]
fn independent_rectangle_factorizes() {
    let mn = MultiNormal::new_homoscedastic(DVector::zeros(3), 1.0).unwrap();
    let orth = Orthant::new(&mn, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let a = DVector::from_column_slice(&[-1.0, -0.5, 0.0]);
    let b = DVector::from_column_slice(&[1.0, 2.0, f64::INFINITY]);
    let expected = (phi(1.0) - phi(-1.0)) * (phi(2.0) - phi(-0.5)) * 0.5;
    assert_abs_diff_eq!(orth.rectangle(&a, &b, &mut rng).unwrap().value, expected, epsilon = 2E-3);
}

#[test]
fn tail_statistic_at_mean() {
    let mn = MultiNormal::new_homoscedastic(DVector::from_column_slice(&[2.0, -1.0]), 0.5).unwrap();
    let orth = Orthant::new(&mn, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let stat = orth.tail_statistic(mn.mean(), &mut rng).unwrap();
    assert_abs_diff_eq!(stat, 0.25, epsilon = 2E-3);

    // Far into the lower tail, the doubled lower orthant vanishes.
    let far = DVector::from_column_slice(&[-20.0, -20.0]);
    assert!(orth.tail_statistic(&far, &mut rng).unwrap() < 1E-100);
}

#[test]
fn singular_covariance_is_an_error() {
    let mn = MultiNormal::new(DVector::zeros(2), DMatrix::from_element(2, 2, 1.0)).unwrap();
    assert_eq!(Orthant::new(&mn, OrthantSettings::default()).unwrap_err(), IntegrationError::NotPositiveDefinite);
}

#[test]
fn dimension_mismatch_is_an_error() {
    let mn = MultiNormal::new_homoscedastic(DVector::zeros(2), 1.0).unwrap();
    let orth = Orthant::new(&mn, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(6);
    let err = orth.upper(&DVector::zeros(3), &mut rng).unwrap_err();
    assert_eq!(err, IntegrationError::Dimension(3, 2));
}

#[test]
fn exhausted_budget_returns_estimate() {

    // P(X >= 0) = 1 / (p + 1) for equicorrelated normals with rho = 1/2.
    let settings = OrthantSettings { max_evals : 3_000, abs_tol : 1E-9 };
    let orth = Orthant::new(&equicorrelated(12, 0.5), settings).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let up = orth.upper(&DVector::zeros(12), &mut rng).unwrap();
    assert!(up.error > settings.abs_tol);
    assert!(up.evals <= settings.max_evals && up.evals > settings.max_evals - 2 * SHIFTS, "{} evaluations", up.evals);
    assert_abs_diff_eq!(up.value, 1.0 / 13.0, epsilon = 1E-2);
}

#[test]
fn default_budget_covers_twelve_dimensions() {
    let orth = Orthant::new(&equicorrelated(12, 0.5), OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let up = orth.upper(&DVector::from_element(12, 0.3), &mut rng).unwrap();
    assert!(up.evals <= OrthantSettings::default().max_evals);
    assert!(up.value > 0.0 && up.value < 1.0 / 13.0);
}
