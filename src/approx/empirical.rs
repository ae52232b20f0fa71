use num_traits::AsPrimitive;
use std::cmp::Ordering;

/// Kolmogorov-Smirnov statistic: where, and by how much, an empirical CDF
/// departs the most from an analytical one.
#[derive(Debug, Clone, Copy)]
pub struct KS {
    pub val : f64,
    pub diff : f64
}

/// Empirical cumulative distribution function of a finite sample. The domain
/// is kept sorted, and cprobs[i] = (i+1) / n is the step height right after domain[i].
#[derive(Debug, Clone)]
pub struct Empirical<D>
where
    D : AsPrimitive<f64>
{
    pub domain : Vec<D>,
    pub cprobs : Vec<f64>
}

impl<D> Empirical<D>
where
    D : AsPrimitive<f64>
{

    pub fn from_sample(mut sample : Vec<D>) -> Self {
        sample.sort_by(|a, b| a.as_().partial_cmp(&b.as_()).unwrap_or(Ordering::Equal) );
        let n = sample.len() as f64;
        let cprobs = (1..=sample.len()).map(|i| i as f64 / n ).collect();
        Self { domain : sample, cprobs }
    }

    pub fn len(&self) -> usize {
        self.domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domain.is_empty()
    }

    /// Fraction of the sample with values <= x. Zero for an empty sample.
    pub fn eval(&self, x : f64) -> f64 {
        if self.domain.is_empty() {
            return 0.0;
        }
        let below = self.domain.partition_point(|d| d.as_() <= x );
        below as f64 / self.domain.len() as f64
    }

    /// Maximum absolute difference against an analytical CDF. Both sides of each
    /// step are compared.
    pub fn analytical_ks(&self, model : &impl statrs::distribution::ContinuousCDF<f64, f64>) -> KS {
        let mut max_prob_diff = 0.0;
        let mut max_val = 0.0;
        let mut prev = 0.0;
        for i in 0..self.domain.len() {
            let v : f64 = self.domain[i].as_();
            let p = model.cdf(v);
            let pdiff = (p - self.cprobs[i]).abs().max((p - prev).abs());
            if pdiff > max_prob_diff {
                max_prob_diff = pdiff;
                max_val = v;
            }
            prev = self.cprobs[i];
        }
        KS { val : max_val, diff : max_prob_diff }
    }

}

#[test]
fn ecdf_steps() {
    let emp = Empirical::from_sample(vec![0.3, 0.1, 0.2, 0.2]);
    assert_eq!(emp.domain, vec![0.1, 0.2, 0.2, 0.3]);
    assert_eq!(emp.eval(0.0), 0.0);
    assert_eq!(emp.eval(0.1), 0.25);
    assert_eq!(emp.eval(0.2), 0.75);
    assert_eq!(emp.eval(0.25), 0.75);
    assert_eq!(emp.eval(1.0), 1.0);
    assert_eq!(Empirical::<f64>::from_sample(Vec::new()).eval(1.0), 0.0);
}

#[test]
fn integer_domain() {
    let emp = Empirical::from_sample(vec![3u32, 1, 2, 5]);
    assert_eq!(emp.eval(2.5), 0.5);
}

