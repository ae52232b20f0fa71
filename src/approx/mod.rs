/// Empirical cumulative distribution functions.
mod empirical;

pub use empirical::*;

/// Bounded regions of the real plane (confidence ellipses).
mod region;

pub use region::*;
