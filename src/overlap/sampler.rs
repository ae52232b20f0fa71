use nalgebra::*;
use rand::Rng;
use crate::hypervolume::HypervolumeDescriptor;

/// Ordered sequence of points drawn i.i.d. from a hypervolume's normal approximation,
/// stored as the rows of a matrix. Never mutated after sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledPointSet {
    points : DMatrix<f64>
}

impl SampledPointSet {

    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    /// Copies the ith point into a column vector.
    pub fn point(&self, i : usize) -> DVector<f64> {
        self.points.row(i).transpose()
    }

    /// Points as rows of a n x p matrix.
    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.points
    }

}

/// Number of points drawn for a hypervolume: round(volume * proportion), at least one.
pub fn sample_size(volume : f64, proportion : f64) -> usize {
    ((volume * proportion).round() as usize).max(1)
}

/// Draws sample_size(volume, proportion) points from the descriptor's normal.
pub fn sample<R>(descriptor : &HypervolumeDescriptor, proportion : f64, rng : &mut R) -> SampledPointSet
where
    R : Rng + ?Sized
{
    let n = sample_size(descriptor.volume(), proportion);
    SampledPointSet { points : descriptor.normal().sample_n(rng, n) }
}

#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
use rand_chacha::ChaCha8Rng;

#[cfg(test)]
fn descriptor(volume : f64) -> HypervolumeDescriptor {
    let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 0.5]);
    HypervolumeDescriptor::new("hv".into(), vec!["a".into(), "b".into()], DVector::from_column_slice(&[1.0, 1.0]), cov, volume).unwrap()
}

#[test]
fn sizes_follow_volume() {
    assert_eq!(sample_size(10.0, 0.5), 5);
    assert_eq!(sample_size(10.0, 0.26), 3);
    assert_eq!(sample_size(0.2, 1.0), 1);
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let pts = sample(&descriptor(40.0), 2.5, &mut rng);
    assert_eq!(pts.len(), 100);
    assert_eq!(pts.dim(), 2);
    assert_eq!(pts.point(3), pts.as_matrix().row(3).transpose());
}

#[test]
fn seeded_sampling_is_repeatable() {
    let d = descriptor(50.0);
    let a = sample(&d, 1.0, &mut ChaCha8Rng::seed_from_u64(42));
    let b = sample(&d, 1.0, &mut ChaCha8Rng::seed_from_u64(42));
    let c = sample(&d, 1.0, &mut ChaCha8Rng::seed_from_u64(43));
    assert_eq!(a, b);
    assert_ne!(a, c);
}
