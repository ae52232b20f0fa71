use nalgebra::*;
use rand::Rng;
use rand::seq::index;
use rayon::prelude::*;
use crate::approx::Empirical;
use crate::hypervolume::HypervolumeDescriptor;
use crate::prob::{Orthant, OrthantSettings};
use super::*;

/// A point counts as included in the target hypervolume when its score exceeds this value.
pub const INCLUSION_THRESHOLD : f64 = 0.05;

/// Decides whether points plausibly belong to a target hypervolume, by ranking
/// their tail statistic (the smaller of the upper-orthant probability and twice the
/// lower-orthant probability under the target's normal) against the tail statistics
/// of points drawn from the target itself.
#[derive(Debug, Clone)]
pub struct InclusionTester {

    label : String,

    orthant : Orthant

}

impl InclusionTester {

    pub fn new(target : &HypervolumeDescriptor, settings : OrthantSettings) -> Result<Self, OverlapError> {
        let label = target.label().to_string();
        let orthant = Orthant::new(target.normal(), settings)
            .map_err(|source| OverlapError::Integration { label : label.clone(), source } )?;
        Ok(Self { label, orthant })
    }

    /// Tail statistic of a single point under the target's normal.
    pub fn statistic<R>(&self, point : &DVector<f64>, rng : &mut R) -> Result<f64, OverlapError>
    where
        R : Rng + ?Sized
    {
        self.orthant.tail_statistic(point, rng)
            .map_err(|source| OverlapError::Integration { label : self.label.clone(), source } )
    }

    /// Evaluates the tail statistic of every point in the target's own point set. Each point
    /// integrates with its own stream of the seeded generator, so the result does not
    /// depend on how the work is split across threads.
    pub fn null_distribution(
        &self,
        null_sample : &SampledPointSet,
        seed : u64,
        direction : Direction,
        progress : &dyn Progress,
        cancel : &CancelToken
    ) -> Result<NullDistribution, OverlapError> {
        let stats = (0..null_sample.len()).into_par_iter()
            .map(|i| -> Result<f64, OverlapError> {
                cancel.check()?;
                let mut rng = stream_rng(seed, i as u64);
                let stat = self.statistic(&null_sample.point(i), &mut rng)?;
                progress.advance(direction, 1);
                Ok(stat)
            })
            .collect::<Result<Vec<f64>, OverlapError>>()?;
        Ok(NullDistribution { label : self.label.clone(), stats })
    }

    /// Scores a single candidate point: draws ndraws points of null_sample without
    /// replacement, computes their tail statistics and returns the empirical CDF of
    /// those statistics together with the candidate's own, evaluated at the candidate.
    pub fn score<R>(
        &self,
        point : &DVector<f64>,
        null_sample : &SampledPointSet,
        ndraws : usize,
        rng : &mut R
    ) -> Result<f64, OverlapError>
    where
        R : Rng + ?Sized
    {
        if null_sample.len() < ndraws {
            return Err(OverlapError::InsufficientSample {
                label : self.label.clone(),
                drawn : null_sample.len(),
                ndraws
            });
        }
        let stat = self.statistic(point, rng)?;
        let mut nulls = Vec::with_capacity(ndraws + 1);
        for i in index::sample(rng, null_sample.len(), ndraws).iter() {
            nulls.push(self.statistic(&null_sample.point(i), rng)?);
        }
        Ok(rank_score(nulls, stat))
    }

}

/// Tail statistics of a target's own point set, computed once and resampled for
/// every candidate.
#[derive(Debug, Clone)]
pub struct NullDistribution {

    label : String,

    stats : Vec<f64>

}

impl NullDistribution {

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn stats(&self) -> &[f64] {
        &self.stats
    }

    /// Scores a candidate whose tail statistic is already known against ndraws
    /// statistics drawn without replacement from this distribution.
    pub fn score<R>(&self, stat : f64, ndraws : usize, rng : &mut R) -> Result<f64, OverlapError>
    where
        R : Rng + ?Sized
    {
        if self.stats.len() < ndraws {
            return Err(OverlapError::InsufficientSample {
                label : self.label.clone(),
                drawn : self.stats.len(),
                ndraws
            });
        }
        let mut nulls = Vec::with_capacity(ndraws + 1);
        nulls.extend(index::sample(rng, self.stats.len(), ndraws).iter().map(|i| self.stats[i] ));
        Ok(rank_score(nulls, stat))
    }

}

/// Empirical CDF of nulls ∪ {stat}, evaluated at stat. Low values mean the candidate
/// is more extreme than almost every null draw.
fn rank_score(mut nulls : Vec<f64>, stat : f64) -> f64 {
    nulls.push(stat);
    Empirical::from_sample(nulls).eval(stat)
}

#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
use rand_chacha::ChaCha8Rng;

#[cfg(test)]
fn standard(label : &str, center : f64, var : f64) -> HypervolumeDescriptor {
    HypervolumeDescriptor::new(
        label.into(),
        vec!["x".into(), "y".into()],
        DVector::from_element(2, center),
        DMatrix::from_diagonal_element(2, 2, var),
        100.0
    ).unwrap()
}

#[test]
fn rank_score_counts_ties() {
    assert_eq!(rank_score(vec![0.1, 0.2, 0.3], 0.2), 0.75);
    assert_eq!(rank_score(vec![0.1, 0.2, 0.3], 0.0), 0.25);
    assert_eq!(rank_score(Vec::new(), 0.5), 1.0);
}

#[test]
fn center_point_is_included() {
    let target = standard("target", 0.0, 1.0);
    let tester = InclusionTester::new(&target, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let null_sample = sample(&target, 1.0, &mut rng);
    let score = tester.score(target.mean(), &null_sample, 50, &mut rng).unwrap();
    assert!(score > INCLUSION_THRESHOLD);
}

#[test]
fn distant_point_is_excluded() {
    let target = standard("target", 0.0, 0.01);
    let tester = InclusionTester::new(&target, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(18);
    let null_sample = sample(&target, 1.0, &mut rng);
    let far = DVector::from_element(2, 10.0);
    let score = tester.score(&far, &null_sample, 50, &mut rng).unwrap();
    assert!(score <= INCLUSION_THRESHOLD);
}

#[test]
fn batched_nulls_match_target_sample() {
    let target = standard("target", 1.0, 2.0);
    let tester = InclusionTester::new(&target, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(19);
    let null_sample = sample(&target, 0.3, &mut rng);
    let cancel = CancelToken::new();
    let a = tester.null_distribution(&null_sample, 5, Direction::FirstInSecond, &(), &cancel).unwrap();
    let b = tester.null_distribution(&null_sample, 5, Direction::FirstInSecond, &(), &cancel).unwrap();
    assert_eq!(a.len(), 30);
    assert_eq!(a.stats(), b.stats());
    assert!(a.stats().iter().all(|s| *s >= 0.0 && *s <= 1.0 ));
    let err = a.score(0.5, 31, &mut rng).unwrap_err();
    assert!(matches!(err, OverlapError::InsufficientSample { drawn : 30, ndraws : 31, .. }));
}

#[test]
fn cancelled_null_distribution() {
    let target = standard("target", 0.0, 1.0);
    let tester = InclusionTester::new(&target, OrthantSettings::default()).unwrap();
    let null_sample = sample(&target, 0.1, &mut ChaCha8Rng::seed_from_u64(20));
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = tester.null_distribution(&null_sample, 1, Direction::SecondInFirst, &(), &cancel).unwrap_err();
    assert!(matches!(err, OverlapError::Cancelled));
}
