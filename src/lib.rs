/// Parametric distributions used to summarize hypervolumes: a multivariate normal that
/// can be sampled through a stable matrix square root, and orthant probabilities
/// of that normal evaluated by quasi-Monte Carlo integration.
pub mod prob;

/// Non-parametric summaries: empirical cumulative distribution functions and
/// elliptical confidence regions over pairs of dimensions.
pub mod approx;

/// Hypervolume models as produced by upstream fitting, and the flat descriptors
/// (mean, covariance, volume, dimension names) extracted from them.
pub mod hypervolume;

/// Monte Carlo overlap estimation between two hypervolume descriptors.
pub mod overlap;

pub use hypervolume::{HypervolumeDescriptor, HypervolumeModel};

pub use overlap::{estimate_overlap, OverlapConfig, OverlapError, OverlapEstimate};
